//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so the host application
//! can plug in whatever client its platform provides. Bodies are CBOR.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use geode_sync_protocol::{BatchRequest, BatchResponse, FetchRequest, FetchResponse};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure reported by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// The request never reached the server.
    Network(String),
    /// No response within the timeout.
    Timeout,
    /// The server answered with a non-success status.
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body as text.
        body: String,
    },
}

impl From<HttpFailure> for SyncError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Network(message) => SyncError::transport_retryable(message),
            HttpFailure::Timeout => SyncError::Timeout,
            HttpFailure::Status { code, body } if code >= 500 => {
                SyncError::ServerError(format!("{code}: {body}"))
            }
            HttpFailure::Status { code, body } => SyncError::transport_fatal(format!("{code}: {body}")),
        }
    }
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, HttpFailure>;

    /// Checks if the client has connectivity.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    timeout: Duration,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: DEFAULT_TIMEOUT,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Stops all traffic until [`reconnect`](Self::reconnect).
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Allows traffic again.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: CborEncode,
        Res: CborDecode,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = request
            .encode_cbor()
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = format!("{}{}", self.base_url, endpoint);
        let response_body = self.client.post(&url, body, self.timeout).map_err(|failure| {
            let err = SyncError::from(failure);
            tracing::debug!(url, error = %err, "sync request failed");
            *self.last_error.write() = Some(err.to_string());
            err
        })?;

        *self.last_error.write() = None;

        Res::decode_cbor(&response_body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn send_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
        self.post_cbor("/sync/batch", request)
    }

    fn fetch(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        self.post_cbor("/sync/fetch", request)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}

/// Trait for CBOR encoding.
pub trait CborEncode {
    /// Encodes self to CBOR bytes.
    fn encode_cbor(&self) -> Result<Vec<u8>, String>;
}

/// Trait for CBOR decoding.
pub trait CborDecode: Sized {
    /// Decodes self from CBOR bytes.
    fn decode_cbor(bytes: &[u8]) -> Result<Self, String>;
}

impl CborEncode for BatchRequest {
    fn encode_cbor(&self) -> Result<Vec<u8>, String> {
        self.encode().map_err(|e| e.to_string())
    }
}

impl CborEncode for FetchRequest {
    fn encode_cbor(&self) -> Result<Vec<u8>, String> {
        self.encode().map_err(|e| e.to_string())
    }
}

impl CborDecode for BatchResponse {
    fn decode_cbor(bytes: &[u8]) -> Result<Self, String> {
        Self::decode(bytes).map_err(|e| e.to_string())
    }
}

impl CborDecode for FetchResponse {
    fn decode_cbor(bytes: &[u8]) -> Result<Self, String> {
        Self::decode(bytes).map_err(|e| e.to_string())
    }
}

/// A loopback HTTP client that routes requests directly to an in-process
/// server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpFailure>;

    /// Returns false to simulate lost connectivity.
    fn is_reachable(&self) -> bool {
        true
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, HttpFailure> {
        if !self.server.is_reachable() {
            return Err(HttpFailure::Network("server unreachable".into()));
        }
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        self.server.is_reachable()
    }
}
