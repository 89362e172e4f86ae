//! HTTP forwarding to the selected backend
//!
//! Ordinary (non-upgrade) requests are replayed against the backend over a
//! pooled keep-alive client owned by the frontend, and the response is
//! streamed back unchanged.

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, RANGE};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use tower::ServiceExt;
use tower_http::decompression::Decompression;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{ProxyError, Result};

/// Boxed error carried by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type produced by every handler
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Create a body from a complete buffer
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create an empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Client IP from a `host:port` remote address.
///
/// The trailing `:port` is dropped, and brackets around an IPv6 address are
/// removed: `203.0.113.5:54321` gives `203.0.113.5`, `[::1]:9999` gives `::1`.
pub fn client_ip(remote_addr: &str) -> &str {
    let Some(idx) = remote_addr.rfind(':') else {
        return remote_addr;
    };
    let host = &remote_addr[..idx];
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Append the client IP as an `X-Forwarded-For` entry, keeping existing entries
pub fn append_forwarded_for(headers: &mut HeaderMap, remote_addr: SocketAddr) {
    let remote = remote_addr.to_string();
    match HeaderValue::from_str(client_ip(&remote)) {
        Ok(value) => {
            headers.append(X_FORWARDED_FOR, value);
        }
        Err(e) => warn!(remote = %remote, error = %e, "Cannot encode X-Forwarded-For"),
    }
}

/// Point a request at `backend`: plain HTTP scheme, backend address as
/// authority, original path and query. Any absolute-form target the client
/// sent is discarded.
pub fn rewrite_target<B>(req: &mut Request<B>, backend: &Backend) -> Result<()> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = Uri::builder()
        .scheme("http")
        .authority(backend.address.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Upstream(format!("invalid backend address {}: {}", backend.address, e)))?;

    *req.uri_mut() = uri;
    Ok(())
}

/// Whether the transport may ask the backend for gzip and decode it itself.
///
/// Only when the client expressed no encoding preference, so a client that
/// negotiates its own encoding receives the backend's bytes untouched.
fn wants_transparent_gzip<B>(req: &Request<B>) -> bool {
    req.method() != Method::HEAD
        && !req.headers().contains_key(ACCEPT_ENCODING)
        && !req.headers().contains_key(RANGE)
}

/// Shared upstream transport of one frontend
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
}

impl Forwarder {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .build(HttpConnector::new());

        Self { client }
    }

    /// Replay `req` against `backend` and stream the response back.
    ///
    /// Transport failures become [`ProxyError::Upstream`]; nothing is retried.
    pub async fn forward(&self, mut req: Request<Incoming>, backend: &Backend) -> Result<Response<ProxyBody>> {
        rewrite_target(&mut req, backend)?;

        debug!(backend = %backend.name, uri = %req.uri(), "Forwarding request");

        let response = if wants_transparent_gzip(&req) {
            Decompression::new(self.client.clone())
                .oneshot(req)
                .await
                .map(|res| res.map(|body| body.boxed_unsync()))
        } else {
            self.client
                .request(req)
                .await
                .map(|res| res.map(|body| body.map_err(BoxError::from).boxed_unsync()))
        };

        let response = response.map_err(|e| {
            warn!(backend = %backend.name, error = %e, "Upstream request failed");
            ProxyError::Upstream(e.to_string())
        })?;

        let (parts, body) = response.into_parts();
        let mut out = Response::new(body);
        *out.status_mut() = parts.status;
        *out.headers_mut() = parts.headers;
        Ok(out)
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_ipv4() {
        assert_eq!(client_ip("203.0.113.5:54321"), "203.0.113.5");
    }

    #[test]
    fn test_client_ip_ipv6_brackets_stripped() {
        assert_eq!(client_ip("[::1]:9999"), "::1");
        assert_eq!(client_ip("[2001:db8::7]:443"), "2001:db8::7");
    }

    #[test]
    fn test_client_ip_without_port() {
        assert_eq!(client_ip("localhost"), "localhost");
    }

    #[test]
    fn test_append_forwarded_for_keeps_existing_entries() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.7"));

        append_forwarded_for(&mut headers, "203.0.113.5:54321".parse().unwrap());

        let values: Vec<&str> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, ["198.51.100.7", "203.0.113.5"]);
    }

    #[test]
    fn test_append_forwarded_for_ipv6() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "[::1]:9999".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "::1");
    }

    #[test]
    fn test_rewrite_target_origin_form() {
        let backend = Backend::new("app", "10.0.0.5:8080");
        let mut req = Request::builder()
            .uri("/api/items?page=2")
            .body(())
            .unwrap();

        rewrite_target(&mut req, &backend).unwrap();
        assert_eq!(req.uri().to_string(), "http://10.0.0.5:8080/api/items?page=2");
    }

    #[test]
    fn test_rewrite_target_discards_absolute_form() {
        let backend = Backend::new("app", "10.0.0.5:8080");
        let mut req = Request::builder()
            .uri("https://public.example.com/login")
            .body(())
            .unwrap();

        rewrite_target(&mut req, &backend).unwrap();
        assert_eq!(req.uri().to_string(), "http://10.0.0.5:8080/login");
    }

    #[test]
    fn test_rewrite_target_rejects_bad_address() {
        let backend = Backend::new("broken", "not a host");
        let mut req = Request::builder().uri("/").body(()).unwrap();

        let result = rewrite_target(&mut req, &backend);
        assert!(matches!(result, Err(ProxyError::Upstream(_))));
    }

    #[test]
    fn test_transparent_gzip_only_without_client_preference() {
        let plain = Request::builder().uri("/").body(()).unwrap();
        assert!(wants_transparent_gzip(&plain));

        let negotiated = Request::builder()
            .uri("/")
            .header(ACCEPT_ENCODING, "br")
            .body(())
            .unwrap();
        assert!(!wants_transparent_gzip(&negotiated));

        let ranged = Request::builder()
            .uri("/")
            .header(RANGE, "bytes=0-10")
            .body(())
            .unwrap();
        assert!(!wants_transparent_gzip(&ranged));

        let head = Request::builder()
            .method(Method::HEAD)
            .uri("/")
            .body(())
            .unwrap();
        assert!(!wants_transparent_gzip(&head));
    }
}
