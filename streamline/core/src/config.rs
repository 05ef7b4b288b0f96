//! TOML Configuration File Support
//!
//! Layered configuration for a streaming client, read from
//! `$XDG_CONFIG_HOME/streamline/streamline.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`STREAMLINE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [stream]
//! endpoint = "https://app.example.com/summaries/stream"
//! method = "POST"
//! connect_timeout_ms = 10000
//! max_line_bytes = 1048576
//! data_events = ["message"]
//!
//! [stream.headers]
//! X-Requested-With = "XMLHttpRequest"
//!
//! [token]
//! endpoint = "https://app.example.com/csrf-token"
//! header = "X-CSRF-TOKEN"
//! response_header = "x-csrf-token"
//! ttl_secs = 1800
//! refresh_interval_secs = 600
//! auth_sentinel = "Invalid CSRF token"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 250
//! max_delay_ms = 10000
//! jitter = true
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::controller::{ControllerConfig, RetryConfig};
use crate::frame::{ParserConfig, DEFAULT_MAX_LINE_BYTES};
use crate::session::{
    AuthFailureDetector, SessionConfig, DEFAULT_AUTH_SENTINEL, DEFAULT_TOKEN_HEADER,
};
use crate::token::TokenStoreConfig;
use crate::transport::{HttpTransportConfig, Method};

/// Environment variable names
pub mod env {
    /// Stream endpoint URL
    pub const ENDPOINT: &str = "STREAMLINE_ENDPOINT";
    /// Token endpoint URL
    pub const TOKEN_ENDPOINT: &str = "STREAMLINE_TOKEN_ENDPOINT";
    /// Request header carrying the token
    pub const TOKEN_HEADER: &str = "STREAMLINE_TOKEN_HEADER";
    /// Retry budget
    pub const MAX_ATTEMPTS: &str = "STREAMLINE_MAX_ATTEMPTS";
    /// Backoff unit in milliseconds
    pub const BASE_DELAY_MS: &str = "STREAMLINE_BASE_DELAY_MS";
    /// In-band auth failure message
    pub const AUTH_SENTINEL: &str = "STREAMLINE_AUTH_SENTINEL";

    /// Every variable read by the loader
    pub const ALL: &[&str] = &[
        ENDPOINT,
        TOKEN_ENDPOINT,
        TOKEN_HEADER,
        MAX_ATTEMPTS,
        BASE_DELAY_MS,
        AUTH_SENTINEL,
    ];
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// A required value was not supplied by any layer
    #[error("Missing configuration: {0}")]
    Missing(&'static str),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[stream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Stream endpoint URL
    pub endpoint: Option<String>,
    /// HTTP method
    pub method: Option<Method>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Longest accepted line
    pub max_line_bytes: Option<usize>,
    /// Event types treated as data
    pub data_events: Option<Vec<String>>,
    /// Headers sent with every stream request
    pub headers: Option<HashMap<String, String>>,
}

/// `[token]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenToml {
    /// Token endpoint URL
    pub endpoint: Option<String>,
    /// Request header carrying the token
    pub header: Option<String>,
    /// Response header read when the token body has no token field
    pub response_header: Option<String>,
    /// Hard token lifetime in seconds
    pub ttl_secs: Option<u64>,
    /// Pre-emptive rotation age in seconds
    pub refresh_interval_secs: Option<u64>,
    /// In-band auth failure message
    pub auth_sentinel: Option<String>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retries after the first attempt
    pub max_attempts: Option<u32>,
    /// Backoff unit in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Randomize backoff
    pub jitter: Option<bool>,
}

/// Whole configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamlineToml {
    /// Stream settings
    pub stream: StreamToml,
    /// Token settings
    pub token: TokenToml,
    /// Retry settings
    pub retry: RetryToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct StreamlineConfig {
    /// Stream endpoint (required before a request can be built)
    pub endpoint: Option<String>,
    /// HTTP method for the stream request
    pub method: Method,
    /// Token endpoint (required before a provider can be built)
    pub token_endpoint: Option<String>,
    /// Request header carrying the token
    pub token_header: String,
    /// Response header read when the token body has no token field
    pub token_response_header: String,
    /// Hard token lifetime
    pub token_ttl: Duration,
    /// Pre-emptive rotation age
    pub refresh_interval: Duration,
    /// In-band auth failure message
    pub auth_sentinel: String,
    /// Retry budget and backoff
    pub retry: RetryConfig,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Longest accepted line
    pub max_line_bytes: usize,
    /// Event types treated as data
    pub data_events: Vec<String>,
    /// Headers sent with every stream request
    pub headers: HashMap<String, String>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Layer that supplied the endpoint
    endpoint_source: ConfigSource,
}

impl Default for StreamlineConfig {
    fn default() -> Self {
        let transport = HttpTransportConfig::default();
        Self {
            endpoint: None,
            method: Method::Post,
            token_endpoint: None,
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            token_response_header: "x-csrf-token".to_string(),
            token_ttl: TokenStoreConfig::default().default_ttl,
            refresh_interval: ControllerConfig::default().refresh_interval,
            auth_sentinel: DEFAULT_AUTH_SENTINEL.to_string(),
            retry: RetryConfig::default(),
            connect_timeout: transport.connect_timeout,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            data_events: ParserConfig::default().data_events,
            headers: HashMap::new(),
            config_file_path: None,
            endpoint_source: ConfigSource::Default,
        }
    }
}

impl StreamlineConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer that supplied the endpoint
    #[must_use]
    pub fn endpoint_source(&self) -> ConfigSource {
        self.endpoint_source
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval >= self.token_ttl {
            return Err(ConfigError::ValidationError(format!(
                "refresh interval ({}s) must be shorter than token TTL ({}s)",
                self.refresh_interval.as_secs(),
                self.token_ttl.as_secs()
            )));
        }
        if self.retry.base_delay.is_zero() {
            return Err(ConfigError::ValidationError(
                "retry base delay must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::ValidationError(
                "retry max delay must not be below the base delay".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }
        if self.token_header.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "token header must not be empty".to_string(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            parse_url("endpoint", endpoint)?;
        }
        if let Some(endpoint) = &self.token_endpoint {
            parse_url("token endpoint", endpoint)?;
        }
        Ok(())
    }

    /// Stream endpoint as a URL
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or it does not parse.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let endpoint = self.endpoint.as_deref().ok_or(ConfigError::Missing("endpoint"))?;
        parse_url("endpoint", endpoint)
    }

    /// Token endpoint as a URL
    ///
    /// # Errors
    ///
    /// Returns an error if no token endpoint is configured or it does not
    /// parse.
    pub fn token_endpoint_url(&self) -> Result<Url, ConfigError> {
        let endpoint = self
            .token_endpoint
            .as_deref()
            .ok_or(ConfigError::Missing("token endpoint"))?;
        parse_url("token endpoint", endpoint)
    }

    /// Controller settings
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            retry: self.retry.clone(),
            refresh_interval: self.refresh_interval,
        }
    }

    /// Session settings
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            token_header: self.token_header.clone(),
            auth_detector: AuthFailureDetector::new(self.auth_sentinel.clone()),
            parser: ParserConfig {
                max_line_bytes: self.max_line_bytes,
                data_events: self.data_events.clone(),
                ..ParserConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    /// Token store settings
    #[must_use]
    pub fn token_store_config(&self) -> TokenStoreConfig {
        TokenStoreConfig {
            default_ttl: self.token_ttl,
        }
    }

    /// HTTP transport settings
    #[must_use]
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            connect_timeout: self.connect_timeout,
            default_headers: self.headers.clone(),
            ..HttpTransportConfig::default()
        }
    }
}

fn parse_url(what: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::ValidationError(format!("{what} {value:?}: {e}")))
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/streamline/streamline.toml` or
/// `~/.config/streamline/streamline.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("streamline").join("streamline.toml"))
}

/// Load configuration from the default path and the environment
///
/// CLI arguments are not handled here; apply [`ConfigOverrides`] after.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<StreamlineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamlineConfig, ConfigError> {
    load_layers(path, |name| std::env::var(name).ok())
}

fn load_layers(
    path: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<StreamlineConfig, ConfigError> {
    let mut config = StreamlineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamlineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut StreamlineConfig, toml: &StreamlineToml) {
    if let Some(ref endpoint) = toml.stream.endpoint {
        config.endpoint = Some(endpoint.clone());
        config.endpoint_source = ConfigSource::File;
    }
    if let Some(method) = toml.stream.method {
        config.method = method;
    }
    if let Some(timeout) = toml.stream.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }
    if let Some(max) = toml.stream.max_line_bytes {
        config.max_line_bytes = max;
    }
    if let Some(ref events) = toml.stream.data_events {
        config.data_events = events.clone();
    }
    if let Some(ref headers) = toml.stream.headers {
        config.headers.extend(headers.clone());
    }

    if toml.token.endpoint.is_some() {
        config.token_endpoint = toml.token.endpoint.clone();
    }
    if let Some(ref header) = toml.token.header {
        config.token_header = header.clone();
    }
    if let Some(ref header) = toml.token.response_header {
        config.token_response_header = header.clone();
    }
    if let Some(ttl) = toml.token.ttl_secs {
        config.token_ttl = Duration::from_secs(ttl);
    }
    if let Some(interval) = toml.token.refresh_interval_secs {
        config.refresh_interval = Duration::from_secs(interval);
    }
    if let Some(ref sentinel) = toml.token.auth_sentinel {
        config.auth_sentinel = sentinel.clone();
    }

    if let Some(attempts) = toml.retry.max_attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(delay) = toml.retry.base_delay_ms {
        config.retry.base_delay = Duration::from_millis(delay);
    }
    if let Some(delay) = toml.retry.max_delay_ms {
        config.retry.max_delay = Duration::from_millis(delay);
    }
    if let Some(jitter) = toml.retry.jitter {
        config.retry.jitter = jitter;
    }
}

/// Apply environment variable overrides to the config
///
/// Unparseable numeric values are ignored with a warning.
fn apply_env_config(config: &mut StreamlineConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(endpoint) = lookup(env::ENDPOINT) {
        config.endpoint = Some(endpoint);
        config.endpoint_source = ConfigSource::Env;
    }
    if let Some(endpoint) = lookup(env::TOKEN_ENDPOINT) {
        config.token_endpoint = Some(endpoint);
    }
    if let Some(header) = lookup(env::TOKEN_HEADER) {
        config.token_header = header;
    }
    if let Some(attempts) = lookup(env::MAX_ATTEMPTS) {
        match attempts.parse::<u32>() {
            Ok(n) => config.retry.max_attempts = n,
            Err(_) => tracing::warn!(var = env::MAX_ATTEMPTS, value = %attempts, "Ignoring invalid value"),
        }
    }
    if let Some(delay) = lookup(env::BASE_DELAY_MS) {
        match delay.parse::<u64>() {
            Ok(ms) => config.retry.base_delay = Duration::from_millis(ms),
            Err(_) => tracing::warn!(var = env::BASE_DELAY_MS, value = %delay, "Ignoring invalid value"),
        }
    }
    if let Some(sentinel) = lookup(env::AUTH_SENTINEL) {
        config.auth_sentinel = sentinel;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Values supplied on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Stream endpoint override
    pub endpoint: Option<String>,
    /// Token endpoint override
    pub token_endpoint: Option<String>,
    /// Method override
    pub method: Option<Method>,
    /// Retry budget override
    pub max_attempts: Option<u32>,
    /// Extra headers
    pub headers: Vec<(String, String)>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set endpoint override
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set token endpoint override
    #[must_use]
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// Set method override
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set retry budget override
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut StreamlineConfig) {
        if let Some(ref endpoint) = self.endpoint {
            config.endpoint = Some(endpoint.clone());
            config.endpoint_source = ConfigSource::Cli;
        }
        if let Some(ref endpoint) = self.token_endpoint {
            config.token_endpoint = Some(endpoint.clone());
        }
        if let Some(method) = self.method {
            config.method = method;
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts;
        }
        for (name, value) in &self.headers {
            config.headers.insert(name.clone(), value.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
