//! Error taxonomy for the proxy
//!
//! Every failure is handled at the request or session boundary. Errors that
//! reach a client are turned into plain-text HTTP responses via
//! [`ProxyError::into_response`].

use bytes::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

use crate::forward::{full_body, ProxyBody};

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // Listener errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    // Routing errors
    #[error("no suitable backend found for request")]
    NoBackend,

    // Upstream errors
    #[error("Error: {0}")]
    Upstream(String),

    #[error("webserver doesn't support hijacking")]
    HijackUnsupported,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code a client sees for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoBackend | ProxyError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,

            ProxyError::HijackUnsupported
            | ProxyError::Config(_)
            | ProxyError::Bind { .. }
            | ProxyError::Tls(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the plain-text response sent to the client
    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(Bytes::from(self.to_string())));
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
