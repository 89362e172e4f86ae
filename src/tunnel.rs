//! WebSocket upgrade tunneling
//!
//! An upgrade request is replayed to the backend over a fresh connection.
//! Once the backend switches protocols, both connections are taken away from
//! the HTTP layer and bytes are relayed raw in each direction until either
//! side closes.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::backend::Backend;
use crate::error::{ProxyError, Result};
use crate::forward::{empty_body, BoxError, ProxyBody};

/// Largest chunk moved per read in either direction
pub const COPY_CHUNK_SIZE: usize = 40 * 1024;

/// Whether `req` asks to switch to the WebSocket protocol.
///
/// The first `Connection` value must be exactly `Upgrade`; the first
/// `Upgrade` value is compared case-insensitively against `websocket`.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection = req.headers().get(CONNECTION).and_then(|v| v.to_str().ok());
    if connection != Some("Upgrade") {
        return false;
    }

    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Whether the connection `req` arrived on can be taken over raw
pub fn supports_raw_takeover<B>(req: &Request<B>) -> bool {
    req.extensions().get::<OnUpgrade>().is_some()
}

/// Handles WebSocket upgrade requests
pub struct TunnelHandler;

impl TunnelHandler {
    /// Establish a tunnel between the client of `req` and `backend`.
    ///
    /// The backend is dialed before the client connection is touched, so a
    /// dead backend still gets a proper 503. If the backend does not answer
    /// `101 Switching Protocols`, its response is passed through and no tunnel
    /// is set up. Otherwise the 101 is returned and the relay runs in its own
    /// task once both sides have been handed over.
    #[instrument(skip(req, backend), fields(backend = %backend.name, uri = %req.uri()))]
    pub async fn establish(mut req: Request<Incoming>, backend: &Backend) -> Result<Response<ProxyBody>> {
        if !supports_raw_takeover(&req) {
            return Err(ProxyError::HijackUnsupported);
        }

        let stream = TcpStream::connect(&backend.address).await.map_err(|e| {
            warn!(error = %e, "Failed to connect to backend for WebSocket");
            ProxyError::Upstream(format!("couldn't connect to backend server: {}", e))
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::Upstream(format!("backend handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend connection ended: {}", e);
            }
        });

        // Replay with the target as the client sent it on the wire.
        let origin_form = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        *req.uri_mut() = origin_form;

        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut response = sender
            .send_request(req)
            .await
            .map_err(|e| ProxyError::Upstream(format!("writing WebSocket request to backend failed: {}", e)))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(status = %response.status(), "Backend declined the upgrade");
            return Ok(response.map(|body| body.map_err(BoxError::from).boxed_unsync()));
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, server)) => {
                    Self::relay(TokioIo::new(client), TokioIo::new(server)).await;
                }
                // Dropping whichever side did upgrade closes it.
                Err(e) => debug!("Upgrade failed, closing tunnel: {}", e),
            }
        });

        let (parts, _) = response.into_parts();
        let mut switching = Response::new(empty_body());
        *switching.status_mut() = parts.status;
        *switching.headers_mut() = parts.headers;
        Ok(switching)
    }

    /// Relay bytes between `client` and `server` until both directions end.
    ///
    /// Each direction runs in its own task. When one direction stops, it shuts
    /// down its destination and tells the other direction to stop reading.
    /// Returns the bytes moved client to server and server to client.
    pub async fn relay<C, S>(client: C, server: S) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let (upstream_done, upstream_stopped) = oneshot::channel::<()>();
        let (downstream_done, downstream_stopped) = oneshot::channel::<()>();

        let upstream = tokio::spawn(copy_half(
            BufReader::with_capacity(COPY_CHUNK_SIZE, client_read),
            BufWriter::with_capacity(COPY_CHUNK_SIZE, server_write),
            downstream_stopped,
            upstream_done,
            "client->backend",
        ));
        let downstream = tokio::spawn(copy_half(
            BufReader::with_capacity(COPY_CHUNK_SIZE, server_read),
            BufWriter::with_capacity(COPY_CHUNK_SIZE, client_write),
            upstream_stopped,
            downstream_done,
            "backend->client",
        ));

        let (sent, received) = tokio::join!(upstream, downstream);
        let bytes_sent = sent.unwrap_or_else(|e| {
            warn!("client->backend copy task failed: {}", e);
            0
        });
        let bytes_received = received.unwrap_or_else(|e| {
            warn!("backend->client copy task failed: {}", e);
            0
        });

        debug!(bytes_sent, bytes_received, "Tunnel closed");
        (bytes_sent, bytes_received)
    }
}

/// Copy one direction of a tunnel.
///
/// Stops on end of stream, on a read or write error, or when the opposite
/// direction has stopped. `_done` is dropped on return, which signals the
/// opposite direction in turn.
async fn copy_half<R, W>(
    mut src: R,
    mut dst: W,
    mut peer_stopped: oneshot::Receiver<()>,
    _done: oneshot::Sender<()>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            read = src.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(direction, error = %e, "Tunnel read failed");
                    break;
                }
            },
            _ = &mut peer_stopped => break,
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!(direction, error = %e, "Tunnel write failed");
            break;
        }
        if let Err(e) = dst.flush().await {
            debug!(direction, error = %e, "Tunnel flush failed");
            break;
        }
        total += n as u64;
    }

    let _ = dst.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn upgrade_request(connection: &str, upgrade: &str) -> Request<()> {
        Request::builder()
            .uri("/socket")
            .header(CONNECTION, connection)
            .header(UPGRADE, upgrade)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_detects_websocket_upgrade() {
        assert!(is_websocket_upgrade(&upgrade_request("Upgrade", "websocket")));
    }

    #[test]
    fn test_upgrade_value_is_case_insensitive() {
        assert!(is_websocket_upgrade(&upgrade_request("Upgrade", "WebSocket")));
        assert!(is_websocket_upgrade(&upgrade_request("Upgrade", "WEBSOCKET")));
    }

    #[test]
    fn test_connection_value_must_be_upgrade() {
        assert!(!is_websocket_upgrade(&upgrade_request("keep-alive", "websocket")));
        assert!(!is_websocket_upgrade(&upgrade_request("keep-alive, Upgrade", "websocket")));
    }

    #[test]
    fn test_other_protocols_are_not_tunneled() {
        assert!(!is_websocket_upgrade(&upgrade_request("Upgrade", "h2c")));
    }

    #[test]
    fn test_only_first_connection_value_counts() {
        let req = Request::builder()
            .header(CONNECTION, "close")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn test_plain_request_is_not_upgrade() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_websocket_upgrade(&req));
        assert!(!supports_raw_takeover(&req));
    }

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (server, mut server_peer) = tokio::io::duplex(1024);

        let relay = tokio::spawn(TunnelHandler::relay(client, server));

        client_peer.write_all(b"hello from client").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = server_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        server_peer.write_all(b"hello from server").await.unwrap();
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");

        drop(client_peer);

        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not terminate")
            .unwrap();
        assert_eq!(sent, 17);
        assert_eq!(received, 17);
    }

    #[tokio::test]
    async fn test_relay_ends_when_server_closes() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (server, server_peer) = tokio::io::duplex(1024);

        let relay = tokio::spawn(TunnelHandler::relay(client, server));
        drop(server_peer);

        // The client sees end of stream once the backend side is gone.
        let mut buf = vec![0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), client_peer.read(&mut buf))
            .await
            .expect("client was not closed")
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not terminate")
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_handles_chunks_larger_than_buffer() {
        let (client, mut client_peer) = tokio::io::duplex(256 * 1024);
        let (server, mut server_peer) = tokio::io::duplex(256 * 1024);

        let relay = tokio::spawn(TunnelHandler::relay(client, server));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client_peer.write_all(&payload).await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        server_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        drop(server_peer);
        let (sent, _) = tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not terminate")
            .unwrap();
        assert_eq!(sent, payload.len() as u64);
    }
}
