//! HTTP Stream Transport
//!
//! Opens a streamed HTTP request with reqwest and yields the response body
//! chunk by chunk (`bytes_stream`), never buffering it whole.

use std::collections::HashMap;
use std::time::Duration;

use futures::{StreamExt, TryFutureExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};

use super::traits::{
    Method, OpenedStream, RawChunkStream, StreamHandle, StreamRequest, StreamTransport,
};
use crate::error::TransportError;

/// Longest body preview kept on a non-success status
const ERROR_BODY_PREVIEW: usize = 512;

/// HTTP transport configuration
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Time allowed to establish the connection
    ///
    /// There is no read timeout: streams may stay idle between frames for
    /// as long as the server keeps the connection open.
    pub connect_timeout: Duration,
    /// Headers sent on every request
    pub default_headers: HashMap<String, String>,
    /// User-Agent header value
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            default_headers: HashMap::new(),
            user_agent: format!("streamline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// [`StreamTransport`] over HTTP(S)
#[derive(Clone, Debug)]
pub struct HttpStreamTransport {
    http_client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpStreamTransport {
    /// Create a transport with its own HTTP client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (e.g. TLS backend
    /// initialization failure).
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Create a transport that shares an existing client
    #[must_use]
    pub fn with_client(http_client: reqwest::Client, config: HttpTransportConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    /// The underlying HTTP client
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Merge default and per-request headers into a header map
    fn build_headers(&self, request: &StreamRequest) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        for (name, value) in self
            .config
            .default_headers
            .iter()
            .chain(request.extra_headers.iter())
        {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

/// Read at most a preview's worth of an error body
///
/// Stops once the limit is reached, so an error body that never ends
/// cannot stall the attempt.
async fn read_preview(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while body.len() <= ERROR_BODY_PREVIEW {
        match chunks.next().await {
            Some(Ok(chunk)) => body.extend_from_slice(&chunk),
            Some(Err(e)) => {
                tracing::trace!(error = %e, "Error body read failed");
                break;
            }
            None => break,
        }
    }
    preview(&String::from_utf8_lossy(&body))
}

/// Truncate a body preview on a char boundary
fn preview(body: &str) -> String {
    if body.len() <= ERROR_BODY_PREVIEW {
        return body.to_string();
    }
    let mut end = ERROR_BODY_PREVIEW;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

impl StreamTransport for HttpStreamTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn open(&self, request: &StreamRequest, handle: StreamHandle) -> OpenedStream {
        let headers = match self.build_headers(request) {
            Ok(headers) => headers,
            Err(e) => {
                return OpenedStream {
                    handle,
                    chunks: futures::stream::once(async move { Err(e) }).boxed(),
                };
            }
        };

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self
            .http_client
            .request(method, request.endpoint.clone())
            .headers(headers);
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let endpoint = request.endpoint.clone();
        let response = async move {
            let response = builder.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = read_preview(response).await;
                tracing::debug!(%endpoint, status = status.as_u16(), "Stream request rejected");
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            tracing::debug!(%endpoint, "Stream opened");
            Ok::<_, TransportError>(response.bytes_stream().map_err(TransportError::from))
        };

        let chunks: RawChunkStream = response.try_flatten_stream().boxed();
        OpenedStream {
            chunks: handle.guard(chunks),
            handle,
        }
    }
}
