//! Frontend lifecycle
//!
//! A [`Frontend`] owns one listening address. Its pools are built once from
//! the configuration, every request goes through [`Frontend::handle`], and
//! [`BoundFrontend::serve`] accepts connections until the process exits.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::access_log::AccessLog;
use crate::config::{Config, FrontendConfig};
use crate::error::{ProxyError, Result};
use crate::forward::{append_forwarded_for, Forwarder, ProxyBody};
use crate::router::{request_host, Router};
use crate::tls;
use crate::tunnel::{is_websocket_upgrade, TunnelHandler};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// One configured listening endpoint with its pools and upstream transport
pub struct Frontend {
    config: FrontendConfig,
    router: Router,
    forwarder: Forwarder,
    access_log: bool,
}

impl Frontend {
    /// Build the frontend's pools from the parsed configuration
    pub fn new(config: FrontendConfig, parsed: &Config) -> Result<Self> {
        let router = Router::new(&config, parsed)?;

        Ok(Self {
            config,
            router,
            forwarder: Forwarder::new(),
            access_log: false,
        })
    }

    /// Emit one access-log line per request
    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Route a request and forward or tunnel it to the chosen backend.
    ///
    /// Never fails: errors become plain-text responses.
    pub async fn handle(&self, mut req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        if self.config.add_forwarded_for {
            append_forwarded_for(req.headers_mut(), remote_addr);
        }

        let backend = match self.router.route(&req) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(
                    frontend = %self.config.name,
                    host = %request_host(&req),
                    remote = %remote_addr,
                    "{}", e
                );
                return e.into_response();
            }
        };

        let result = if is_websocket_upgrade(&req) {
            debug!(frontend = %self.config.name, backend = %backend.name, "WebSocket upgrade");
            TunnelHandler::establish(req, &backend).await
        } else {
            self.forwarder.forward(req, &backend).await
        };

        result.unwrap_or_else(|e| {
            warn!(frontend = %self.config.name, backend = %backend.name, "Request failed: {}", e);
            e.into_response()
        })
    }

    /// Prepare TLS if enabled and open the listener
    pub async fn bind(self) -> Result<BoundFrontend> {
        let tls = if self.config.https {
            let (Some(cert), Some(key)) = (&self.config.cert_file, &self.config.key_file) else {
                return Err(ProxyError::Tls(format!(
                    "frontend {} has HTTPS enabled without certificate and key",
                    self.config.name
                )));
            };
            Some(tls::acceptor(cert, key)?)
        } else {
            None
        };

        let addr = listen_address(&self.config.bind);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;

        Ok(BoundFrontend {
            frontend: Arc::new(self),
            listener,
            tls,
        })
    }

    /// Bind and serve until the listener fails
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve().await
    }

    /// Serve HTTP/1.1 with upgrades on one accepted connection
    async fn serve_connection<I>(self: Arc<Self>, io: I, remote_addr: SocketAddr)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let service = FrontendService {
            frontend: self.clone(),
            remote_addr,
        };

        let mut builder = http1::Builder::new();
        builder.preserve_header_case(true);

        let result = if self.access_log {
            builder
                .serve_connection(io, AccessLog::new(service, remote_addr))
                .with_upgrades()
                .await
        } else {
            builder.serve_connection(io, service).with_upgrades().await
        };

        if let Err(e) = result {
            debug!(frontend = %self.config.name, remote = %remote_addr, "Connection error: {}", e);
        }
    }
}

/// A frontend with an open listener
pub struct BoundFrontend {
    frontend: Arc<Frontend>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl BoundFrontend {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Accept errors are retried with a growing delay rather than ending the
    /// frontend.
    pub async fn serve(self) -> Result<()> {
        let name = self.frontend.config.name.clone();
        info!(
            frontend = %name,
            addr = %self.listener.local_addr()?,
            https = self.tls.is_some(),
            "Frontend listening"
        );

        let mut backoff: Option<Duration> = None;
        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(e) => {
                    let delay = next_backoff(backoff);
                    error!(frontend = %name, "Accept error: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    backoff = Some(delay);
                    continue;
                }
            };

            let frontend = self.frontend.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => {
                            frontend
                                .serve_connection(TokioIo::new(stream), remote_addr)
                                .await
                        }
                        Err(e) => debug!(remote = %remote_addr, "TLS handshake failed: {}", e),
                    },
                    None => {
                        frontend
                            .serve_connection(TokioIo::new(stream), remote_addr)
                            .await
                    }
                }
            });
        }
    }
}

/// Per-connection request handler
#[derive(Clone)]
struct FrontendService {
    frontend: Arc<Frontend>,
    remote_addr: SocketAddr,
}

impl Service<Request<Incoming>> for FrontendService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let frontend = self.frontend.clone();
        let remote_addr = self.remote_addr;
        Box::pin(async move { Ok(frontend.handle(req, remote_addr).await) })
    }
}

/// A bind address with an empty host (`:8080`) listens on all interfaces
fn listen_address(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_string()
    }
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => ACCEPT_BACKOFF_MIN,
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
    }
}
