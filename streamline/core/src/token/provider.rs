//! Credential Providers
//!
//! A [`CredentialProvider`] mints anti-forgery tokens. The store calls it
//! whenever the cached token is missing, stale, or force-refreshed.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::CredentialError;

/// JSON body fields checked for a token, in order
const TOKEN_FIELDS: &[&str] = &["token", "csrf_token", "csrfToken"];

/// A freshly minted token as returned by a provider
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The opaque token value
    pub value: String,
    /// Lifetime announced by the provider (store default when `None`)
    pub ttl: Option<Duration>,
}

impl IssuedToken {
    /// Create a token with the store's default TTL
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ttl: None,
        }
    }

    /// Override the TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("value", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Source of anti-forgery tokens
///
/// Both operations are expected to be idempotent and to touch nothing
/// outside the credential domain.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Mint a fresh token (performs I/O)
    async fn fetch_token(&self) -> Result<IssuedToken, CredentialError>;

    /// Drop any token the provider itself caches (cookies, memo fields)
    fn clear(&self) {}
}

/// Provider that fetches tokens from an HTTP endpoint
///
/// The token is read from the first of `token`, `csrf_token`, `csrfToken`
/// in a JSON body, falling back to a response header.
#[derive(Clone, Debug)]
pub struct HttpCredentialProvider {
    endpoint: Url,
    fallback_header: String,
    http_client: reqwest::Client,
}

impl HttpCredentialProvider {
    /// Create a provider for the given token endpoint
    #[must_use]
    pub fn new(endpoint: Url, http_client: reqwest::Client) -> Self {
        Self {
            endpoint,
            fallback_header: "x-csrf-token".to_string(),
            http_client,
        }
    }

    /// Response header consulted when the body carries no token
    #[must_use]
    pub fn with_fallback_header(mut self, header: impl Into<String>) -> Self {
        self.fallback_header = header.into().to_ascii_lowercase();
        self
    }

    /// Token endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Pull a token out of a JSON body
fn token_from_body(body: &serde_json::Value) -> Option<String> {
    let obj = body.as_object()?;
    TOKEN_FIELDS
        .iter()
        .filter_map(|field| obj.get(*field).and_then(serde_json::Value::as_str))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch_token(&self) -> Result<IssuedToken, CredentialError> {
        let response = self
            .http_client
            .get(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Status(status.as_u16()));
        }

        let header_token = response
            .headers()
            .get(self.fallback_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let text = response.text().await?;
        let body_token = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .as_ref()
            .and_then(token_from_body);

        body_token
            .or(header_token)
            .map(IssuedToken::new)
            .ok_or(CredentialError::MissingToken)
    }
}
