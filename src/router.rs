//! Backend selection for a frontend
//!
//! A frontend with host names routes on the exact `Host` header value, with
//! its catch-all pool as fallback. A frontend without host names always uses
//! the catch-all pool.

use hyper::header::HOST;
use hyper::Request;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::backend::{Backend, BackendPool};
use crate::config::{Config, FrontendConfig};
use crate::error::{ProxyError, Result};

/// Pools of one frontend and the rule for choosing between them
#[derive(Debug)]
pub struct Router {
    host_pools: HashMap<String, BackendPool>,
    catch_all: Option<BackendPool>,
    host_routing: bool,
}

impl Router {
    /// Build the pools for `frontend` from the parsed configuration.
    ///
    /// Host names without a host mapping get no pool, and unknown catch-all
    /// backend names are left out. Both are logged. A frontend that has no
    /// host names and no usable catch-all backend cannot route anything and
    /// is rejected.
    pub fn new(frontend: &FrontendConfig, config: &Config) -> Result<Self> {
        let mut host_pools = HashMap::new();
        for host in &frontend.hosts {
            let pool = config
                .hosts
                .get(host)
                .and_then(|backends| BackendPool::new(backends.clone()));
            match pool {
                Some(pool) => {
                    host_pools.insert(host.clone(), pool);
                }
                None => warn!(frontend = %frontend.name, host = %host, "host doesn't exist, ignoring"),
            }
        }

        let mut catch_all = Vec::new();
        for name in &frontend.backends {
            match config.backends.get(name) {
                Some(backend) => catch_all.push(backend.clone()),
                None => warn!(frontend = %frontend.name, backend = %name, "backend doesn't exist, ignoring"),
            }
        }
        let catch_all = BackendPool::new(catch_all);

        let host_routing = !frontend.hosts.is_empty();
        if !host_routing && catch_all.is_none() {
            return Err(ProxyError::Config(format!(
                "frontend {} has no usable backends",
                frontend.name
            )));
        }

        Ok(Self {
            host_pools,
            catch_all,
            host_routing,
        })
    }

    /// Select the backend for `req`
    pub fn route<B>(&self, req: &Request<B>) -> Result<Arc<Backend>> {
        self.route_host(request_host(req))
    }

    /// Select the backend for a request carrying `host`
    pub fn route_host(&self, host: &str) -> Result<Arc<Backend>> {
        if self.host_routing {
            if let Some(pool) = self.host_pools.get(host) {
                return Ok(pool.take_next());
            }
        }

        self.catch_all
            .as_ref()
            .map(BackendPool::take_next)
            .ok_or(ProxyError::NoBackend)
    }
}

/// The host a request is addressed to: its `Host` header, or the authority of
/// an absolute-form target when the header is missing
pub fn request_host<B>(req: &Request<B>) -> &str {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::parse(
            "
[backend a]
connect = 127.0.0.1:9001

[backend b]
connect = 127.0.0.1:9002

[backend c]
connect = 127.0.0.1:9003

[host h1]
backends = a

[host h2]
backends = b
",
        )
        .unwrap()
    }

    fn frontend(hosts: &[&str], backends: &[&str]) -> FrontendConfig {
        FrontendConfig {
            name: "test".to_string(),
            bind: "127.0.0.1:0".to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            backends: backends.iter().map(|b| b.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names(router: &Router, host: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| router.route_host(host).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn test_catch_all_round_robin() {
        let router = Router::new(&frontend(&[], &["a", "b"]), &config()).unwrap();

        assert_eq!(names(&router, "anything", 4), ["a", "b", "a", "b"]);
    }

    #[test]
    fn test_without_hosts_host_header_is_ignored() {
        let router = Router::new(&frontend(&[], &["c"]), &config()).unwrap();

        assert_eq!(router.route_host("h1").unwrap().name, "c");
    }

    #[test]
    fn test_host_isolation() {
        let router = Router::new(&frontend(&["h1", "h2"], &[]), &config()).unwrap();

        for host in ["h2", "h1", "h1", "h2", "h1"] {
            let expected = if host == "h1" { "a" } else { "b" };
            assert_eq!(router.route_host(host).unwrap().name, expected);
        }
    }

    #[test]
    fn test_unmapped_host_without_catch_all() {
        let router = Router::new(&frontend(&["h1"], &[]), &config()).unwrap();

        assert!(matches!(router.route_host("h3"), Err(ProxyError::NoBackend)));
        assert!(router.catch_all.is_none());
    }

    #[test]
    fn test_unmapped_host_falls_back_to_catch_all() {
        let router = Router::new(&frontend(&["h1"], &["c"]), &config()).unwrap();

        assert_eq!(router.route_host("h3").unwrap().name, "c");
        assert_eq!(router.route_host("h1").unwrap().name, "a");
    }

    #[test]
    fn test_host_match_is_exact() {
        let router = Router::new(&frontend(&["h1"], &[]), &config()).unwrap();

        assert!(router.route_host("H1").is_err());
        assert!(router.route_host("h1:80").is_err());
    }

    #[test]
    fn test_frontend_host_without_mapping_has_no_pool() {
        let router = Router::new(&frontend(&["h1", "nowhere"], &[]), &config()).unwrap();

        assert!(matches!(router.route_host("nowhere"), Err(ProxyError::NoBackend)));
    }

    #[test]
    fn test_unknown_catch_all_names_are_dropped() {
        let router = Router::new(&frontend(&[], &["missing", "b"]), &config()).unwrap();

        assert_eq!(names(&router, "", 2), ["b", "b"]);
    }

    #[test]
    fn test_frontend_without_usable_backends_is_rejected() {
        let result = Router::new(&frontend(&[], &["missing"]), &config());

        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_route_uses_host_header() {
        let router = Router::new(&frontend(&["h1", "h2"], &[]), &config()).unwrap();
        let req = Request::builder()
            .uri("/")
            .header(HOST, "h2")
            .body(())
            .unwrap();

        assert_eq!(router.route(&req).unwrap().name, "b");
    }

    #[test]
    fn test_request_host_from_absolute_target() {
        let req = Request::builder()
            .uri("http://h1/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "h1");

        let bare = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&bare), "");
    }
}
