//! Token Store
//!
//! Caches the current anti-forgery token and reacquires it on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::provider::CredentialProvider;
use crate::error::CredentialError;

/// An issued anti-forgery token
///
/// Immutable once issued. A refresh always produces a new `Token` with a
/// higher generation.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    issued_at: Instant,
    ttl: Duration,
    generation: u64,
}

impl Token {
    /// Token value to send to the server
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the token was acquired
    #[must_use]
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Hard lifetime of the token
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Monotonic issue counter within one store
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time since acquisition
    #[must_use]
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Whether the TTL has passed at `now`
    #[must_use]
    pub fn is_stale_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) > self.ttl
    }

    /// Whether the TTL has passed
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Token store configuration
#[derive(Clone, Debug)]
pub struct TokenStoreConfig {
    /// TTL applied when the provider does not announce one
    pub default_ttl: Duration,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Lifetime counters for a store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenStoreStats {
    /// Successful provider fetches
    pub acquisitions: u64,
    /// Calls to [`TokenStore::invalidate`]
    pub invalidations: u64,
}

/// Owner of the current anti-forgery token
///
/// Reads take a short synchronous lock; acquisitions are serialized
/// behind an async mutex so a burst of callers triggers one provider call.
pub struct TokenStore {
    provider: Arc<dyn CredentialProvider>,
    config: TokenStoreConfig,
    current: RwLock<Option<Token>>,
    /// Generation of the most recently issued token
    generation: AtomicU64,
    acquire_lock: tokio::sync::Mutex<()>,
    acquisitions: AtomicU64,
    invalidations: AtomicU64,
}

impl TokenStore {
    /// Create a store with default configuration
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self::with_config(provider, TokenStoreConfig::default())
    }

    /// Create a store with custom configuration
    pub fn with_config(provider: Arc<dyn CredentialProvider>, config: TokenStoreConfig) -> Self {
        Self {
            provider,
            config,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            acquire_lock: tokio::sync::Mutex::new(()),
            acquisitions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Get the store configuration
    #[must_use]
    pub fn config(&self) -> &TokenStoreConfig {
        &self.config
    }

    /// Current token if present and within its TTL
    fn fresh_token(&self) -> Option<Token> {
        self.current
            .read()
            .as_ref()
            .filter(|token| !token.is_stale())
            .cloned()
    }

    /// Return a usable token
    ///
    /// The cached token is returned when it is fresh and `force_refresh` is
    /// false. Otherwise the provider is asked for a new one. If another
    /// caller completes an acquisition while this one waits for the
    /// acquisition lock, that newer token is returned without a second fetch.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the fetch fails. The cached token is
    /// left untouched in that case.
    pub async fn get(&self, force_refresh: bool) -> Result<Token, CredentialError> {
        let observed_generation = self.generation.load(Ordering::Acquire);

        if !force_refresh {
            if let Some(token) = self.fresh_token() {
                return Ok(token);
            }
        }

        let _guard = self.acquire_lock.lock().await;

        if let Some(token) = self.fresh_token() {
            if token.generation > observed_generation {
                tracing::trace!(
                    generation = token.generation,
                    "Reusing token acquired by a concurrent caller"
                );
                return Ok(token);
            }
        }

        let issued = self.provider.fetch_token().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = Token {
            value: issued.value,
            issued_at: Instant::now(),
            ttl: issued.ttl.unwrap_or(self.config.default_ttl),
            generation,
        };

        *self.current.write() = Some(token.clone());
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(generation, forced = force_refresh, "Acquired anti-forgery token");

        Ok(token)
    }

    /// Mark the current token unusable regardless of its TTL
    ///
    /// The next [`get`](Self::get) reacquires. Also clears anything the
    /// provider caches on its side.
    pub fn invalidate(&self) {
        let dropped = self.current.write().take();
        self.provider.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            generation = dropped.as_ref().map(Token::generation),
            "Invalidated anti-forgery token"
        );
    }

    /// The cached token, fresh or not
    #[must_use]
    pub fn current(&self) -> Option<Token> {
        self.current.read().clone()
    }

    /// Whether the cached token is older than `refresh_interval`
    ///
    /// Returns `false` when nothing is cached; the next `get` acquires anyway.
    #[must_use]
    pub fn needs_rotation(&self, refresh_interval: Duration) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|token| token.age() >= refresh_interval)
    }

    /// Lifetime counters
    #[must_use]
    pub fn stats(&self) -> TokenStoreStats {
        TokenStoreStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("config", &self.config)
            .field("current", &self.current.read())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::provider::IssuedToken;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Provider that issues "token-1", "token-2", ... and counts calls
    #[derive(Default)]
    struct CountingProvider {
        fetches: AtomicUsize,
        clears: AtomicUsize,
        delay: Option<Duration>,
        ttl: Option<Duration>,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn fetch_token(&self) -> Result<IssuedToken, CredentialError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            let mut token = IssuedToken::new(format!("token-{n}"));
            token.ttl = self.ttl;
            Ok(token)
        }

        fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl CredentialProvider for FailingProvider {
        async fn fetch_token(&self) -> Result<IssuedToken, CredentialError> {
            Err(CredentialError::Status(500))
        }
    }

    #[tokio::test]
    async fn test_get_caches_fresh_token() {
        let provider = Arc::new(CountingProvider::default());
        let store = TokenStore::new(provider.clone());

        let first = store.get(false).await.unwrap();
        let second = store.get(false).await.unwrap();

        assert_eq!(first.value(), "token-1");
        assert_eq!(second.value(), "token-1");
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_refresh_issues_new_token() {
        let provider = Arc::new(CountingProvider::default());
        let store = TokenStore::new(provider.clone());

        let first = store.get(false).await.unwrap();
        let second = store.get(true).await.unwrap();

        assert_ne!(first.value(), second.value());
        assert!(second.generation() > first.generation());
        assert_eq!(store.stats().acquisitions, 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reacquire() {
        let provider = Arc::new(CountingProvider::default());
        let store = TokenStore::new(provider.clone());

        store.get(false).await.unwrap();
        store.invalidate();
        assert!(store.current().is_none());

        let token = store.get(false).await.unwrap();
        assert_eq!(token.value(), "token-2");
        assert_eq!(provider.clears.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_reacquired() {
        let provider = Arc::new(CountingProvider {
            ttl: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let store = TokenStore::new(provider.clone());

        let first = store.get(false).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(first.is_stale());

        let second = store.get(false).await.unwrap();
        assert_eq!(second.value(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_rotation() {
        let provider = Arc::new(CountingProvider::default());
        let store = TokenStore::new(provider);

        assert!(!store.needs_rotation(Duration::from_secs(10)));
        store.get(false).await.unwrap();
        assert!(!store.needs_rotation(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.needs_rotation(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquisitions_are_coalesced() {
        let provider = Arc::new(CountingProvider {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let store = Arc::new(TokenStore::new(provider.clone()));

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.get(true).await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.get(true).await }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.value(), b.value());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_state() {
        let store = TokenStore::new(Arc::new(FailingProvider));
        let result = store.get(false).await;
        assert_eq!(result, Err(CredentialError::Status(500)));
        assert!(store.current().is_none());
        assert_eq!(store.stats().acquisitions, 0);
    }

    #[test]
    fn test_token_debug_redacts_value() {
        let token = Token {
            value: "super-secret".to_string(),
            issued_at: Instant::now(),
            ttl: Duration::from_secs(1),
            generation: 1,
        };
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
