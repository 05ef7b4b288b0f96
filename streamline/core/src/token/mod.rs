//! Anti-Forgery Token Management
//!
//! The server requires a short-lived anti-forgery token on every stream
//! request. This module owns that token:
//!
//! - [`Token`]: an issued value with its acquisition time and TTL
//! - [`CredentialProvider`]: the external service that mints tokens
//! - [`TokenStore`]: caches the current token, reacquires when stale or
//!   invalidated, and coalesces concurrent acquisitions
//!
//! # Rotation
//!
//! Tokens are replaced, never mutated. Rotation happens either reactively
//! (the controller calls [`TokenStore::invalidate`] after an auth failure)
//! or pre-emptively (the controller forces a refresh once
//! [`TokenStore::needs_rotation`] reports the token is older than the
//! refresh interval).

mod provider;
mod store;

pub use provider::{CredentialProvider, HttpCredentialProvider, IssuedToken};
pub use store::{Token, TokenStore, TokenStoreConfig, TokenStoreStats};
