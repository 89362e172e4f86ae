//! RustLB - A multi-frontend HTTP reverse proxy and load balancer
//!
//! Provides:
//! - Round-robin backend pools, per host or frontend-wide
//! - Transparent HTTP forwarding with optional X-Forwarded-For
//! - Raw WebSocket tunneling
//! - Plain and TLS frontends running side by side
//! - Optional access logging

pub mod access_log;
pub mod backend;
pub mod config;
pub mod error;
pub mod forward;
pub mod frontend;
pub mod router;
pub mod supervisor;
pub mod tls;
pub mod tunnel;

pub use backend::{Backend, BackendPool};
pub use config::{Config, FrontendConfig};
pub use error::{ProxyError, Result};
pub use frontend::{BoundFrontend, Frontend};
pub use router::Router;
pub use supervisor::Supervisor;
