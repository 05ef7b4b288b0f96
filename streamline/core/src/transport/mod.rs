//! Stream Transport Layer
//!
//! Separates "how bytes arrive" from "what the bytes mean":
//! - [`StreamTransport`]: opens one request and yields raw chunks
//! - [`HttpStreamTransport`]: reqwest-backed implementation
//!
//! Transports know nothing about frames, tokens, or retries. Cancellation
//! is best-effort here; the session and controller treat it as
//! authoritative by ignoring anything that arrives afterwards.

mod http;
mod traits;

pub use http::{HttpStreamTransport, HttpTransportConfig};
pub use traits::{Method, OpenedStream, RawChunkStream, StreamHandle, StreamRequest, StreamTransport};
