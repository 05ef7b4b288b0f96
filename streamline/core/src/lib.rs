//! Streamline Core - Resilient Consumer for Server-Sent Text Streams
//!
//! This crate consumes incrementally generated text (for example an
//! AI-produced summary) from a long-lived HTTP event stream, and keeps the
//! consumer's view consistent while the stream is retried, superseded or
//! cancelled. It has no UI dependencies; the `streamline` binary is one
//! thin front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Consumer                               │
//! │        start(request) / cancel() / StreamSubscriber             │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┴─────────────────────────────────┐
//! │                 ResilientStreamController                       │
//! │      retry + backoff, token rotation, supersession gate         │
//! │  ┌──────────────┐          ┌──────────────────────────────────┐ │
//! │  │  TokenStore  │◄─token───┤          StreamSession           │ │
//! │  │ (provider)   │          │  extract deltas, detect sentinel │ │
//! │  └──────────────┘          └───────────────┬──────────────────┘ │
//! │                                            │                    │
//! │                              ┌─────────────┴───────────┐        │
//! │                              │ FrameParser (SSE)       │        │
//! │                              └─────────────┬───────────┘        │
//! │                              ┌─────────────┴───────────┐        │
//! │                              │ StreamTransport (HTTP)  │        │
//! │                              └─────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ResilientStreamController`]: the public entry point
//! - [`StreamSubscriber`]: receives deltas and the terminal outcome
//! - [`TokenStore`]: owns the anti-forgery token
//! - [`StreamTransport`]: opens a request and yields raw chunks
//! - [`FrameParser`]: incremental server-sent events decoder
//! - [`StreamSession`]: one attempt
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use streamline_core::{
//!     ControllerConfig, HttpCredentialProvider, HttpStreamTransport, HttpTransportConfig,
//!     ResilientStreamController, SharedTextBuffer, StreamRequest, TokenStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = HttpStreamTransport::new(HttpTransportConfig::default())?;
//!     let provider = HttpCredentialProvider::new(
//!         "https://app.example.com/csrf-token".parse()?,
//!         transport.client().clone(),
//!     );
//!     let tokens = Arc::new(TokenStore::new(Arc::new(provider)));
//!     let controller =
//!         ResilientStreamController::new(Arc::new(transport), tokens, ControllerConfig::default());
//!
//!     let buffer = SharedTextBuffer::new();
//!     let request = StreamRequest::new("https://app.example.com/summaries/stream".parse()?);
//!     let handle = controller.start(request, Arc::new(buffer.clone()));
//!     handle.settled().await;
//!
//!     println!("{}", buffer.text());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: error taxonomy and retry classification
//! - [`token`]: anti-forgery token store and credential providers
//! - [`transport`]: stream transport trait and HTTP implementation
//! - [`frame`]: server-sent events framing
//! - [`session`]: single streaming attempt
//! - [`controller`]: retries, rotation, supersession
//! - [`config`]: layered TOML / environment / CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod session;
pub mod token;
pub mod transport;

// Controller exports
pub use controller::{
    ChannelSubscriber, ControllerConfig, ControllerState, OperationId, ResilientStreamController,
    RetryConfig, RetryPolicy, Settlement, SharedTextBuffer, StreamSubscriber, SubscriberEvent,
    SubscriptionHandle,
};

// Error exports
pub use error::{AuthFailureKind, CredentialError, FrameError, StreamError, TransportError};

// Frame exports
pub use frame::{parse_frames, DataFrame, DataPayload, Frame, FrameParser, FrameStream, ParserConfig};

// Session exports
pub use session::{
    AuthFailureDetector, SessionConfig, SessionHandle, SessionId, SessionListener, SessionOutcome,
    SessionState, StreamSession, TextExtractor,
};

// Token exports
pub use token::{
    CredentialProvider, HttpCredentialProvider, IssuedToken, Token, TokenStore, TokenStoreConfig,
    TokenStoreStats,
};

// Transport exports
pub use transport::{
    HttpStreamTransport, HttpTransportConfig, Method, OpenedStream, RawChunkStream, StreamHandle,
    StreamRequest, StreamTransport,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, StreamlineConfig, StreamlineToml,
};
