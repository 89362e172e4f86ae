//! Configuration file loading
//!
//! The configuration is a sectioned key/value file:
//!
//! ```text
//! [backend app1]
//! connect = 127.0.0.1:3000
//!
//! [host example.com www.example.com]
//! backends = app1 app2
//!
//! [frontend public]
//! bind = 0.0.0.0:8080
//! hosts = example.com
//! backends = app1
//! add-x-forwarded-for = true
//! ```
//!
//! Keys outside any section, or in `[default]`, are fallbacks for every
//! section. Invalid sections are logged and skipped; the rest of the file
//! still loads.

use ini::{Ini, ParseOption, Properties};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{ProxyError, Result};

const DEFAULT_SECTION: &str = "default";

/// One listening endpoint as configured
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendConfig {
    pub name: String,
    pub bind: String,
    pub https: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub add_forwarded_for: bool,
    /// Host names routed through per-host pools
    pub hosts: Vec<String>,
    /// Catch-all backend names
    pub backends: Vec<String>,
}

/// Validated configuration: backends, host mappings and frontends
#[derive(Debug, Default)]
pub struct Config {
    pub backends: HashMap<String, Arc<Backend>>,
    pub hosts: HashMap<String, Vec<Arc<Backend>>>,
    pub frontends: BTreeMap<String, FrontendConfig>,
}

impl Config {
    /// Read and parse a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    ///
    /// Only a syntax error fails the whole file. Backends are extracted
    /// first, then hosts, then frontends, so sections may reference each
    /// other regardless of their order in the file.
    pub fn parse(text: &str) -> Result<Self> {
        // Paths may contain backslashes; values are taken literally.
        let options = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..Default::default()
        };
        let ini = Ini::load_from_str_opt(text, options)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        let file = ConfigFile { ini: &ini };
        let mut config = Config::default();

        for section in file.sections_with_kind("backend") {
            let Some(name) = section.names.first() else {
                warn!("backend section has no name, ignoring");
                continue;
            };
            let connect = file.get(section.props, "connect").unwrap_or("");
            if connect.is_empty() {
                warn!(backend = %name, "empty connect string for backend, ignoring");
                continue;
            }
            config
                .backends
                .insert(name.to_string(), Arc::new(Backend::new(*name, connect)));
        }

        for section in file.sections_with_kind("host") {
            if section.names.is_empty() {
                warn!("host section has no name, ignoring");
                continue;
            }
            let mut assigned = Vec::new();
            for backend_name in split_list(file.get(section.props, "backends")) {
                match config.backends.get(backend_name) {
                    Some(backend) => assigned.push(backend.clone()),
                    None => warn!(
                        host = %section.names[0],
                        backend = %backend_name,
                        "backend doesn't exist, ignoring"
                    ),
                }
            }
            if assigned.is_empty() {
                warn!(host = %section.names[0], "host has no backends, ignoring");
                continue;
            }
            for host in &section.names {
                config.hosts.insert(host.to_string(), assigned.clone());
            }
        }

        for section in file.sections_with_kind("frontend") {
            let Some(name) = section.names.first() else {
                warn!("frontend section has no name, ignoring");
                continue;
            };
            match file.frontend(section.props, name) {
                Ok(frontend) => {
                    config.frontends.insert(name.to_string(), frontend);
                }
                Err(reason) => warn!(frontend = %name, "{}, ignoring", reason),
            }
        }

        debug!(
            backends = config.backends.len(),
            hosts = config.hosts.len(),
            frontends = config.frontends.len(),
            "Configuration parsed"
        );

        Ok(config)
    }
}

/// A `[kind name...]` section split into its names, with its keys
struct SectionRef<'a> {
    names: Vec<&'a str>,
    props: &'a Properties,
}

/// Typed lookups over a loaded file, with `[default]` and sectionless keys
/// as fallbacks
struct ConfigFile<'a> {
    ini: &'a Ini,
}

impl<'a> ConfigFile<'a> {
    fn get(&self, props: &'a Properties, key: &str) -> Option<&'a str> {
        props
            .get(key)
            .or_else(|| self.ini.section(Some(DEFAULT_SECTION)).and_then(|s| s.get(key)))
            .or_else(|| self.ini.section(None::<String>).and_then(|s| s.get(key)))
    }

    fn get_bool(&self, props: &'a Properties, key: &str) -> bool {
        let Some(value) = self.get(props, key) else {
            return false;
        };
        parse_bool(value).unwrap_or_else(|| {
            warn!(key, value, "invalid boolean, assuming false");
            false
        })
    }

    fn sections_with_kind(&self, kind: &'a str) -> impl Iterator<Item = SectionRef<'a>> + 'a {
        self.ini.iter().filter_map(move |(title, props)| {
            let mut tokens = title?.split_whitespace();
            if tokens.next() != Some(kind) {
                return None;
            }
            Some(SectionRef {
                names: tokens.collect(),
                props,
            })
        })
    }

    fn frontend(&self, props: &'a Properties, name: &str) -> std::result::Result<FrontendConfig, String> {
        let bind = self.get(props, "bind").unwrap_or("");
        if bind.is_empty() {
            return Err("frontend has no bind argument".to_string());
        }

        let https = self.get_bool(props, "https");
        let (mut cert_file, mut key_file) = (None, None);
        if https {
            let key = self.get(props, "keyfile").unwrap_or("");
            if key.is_empty() {
                return Err("frontend has HTTPS enabled but no keyfile".to_string());
            }
            let cert = self.get(props, "certfile").unwrap_or("");
            if cert.is_empty() {
                return Err("frontend has HTTPS enabled but no certfile".to_string());
            }
            key_file = Some(PathBuf::from(key));
            cert_file = Some(PathBuf::from(cert));
        }

        let hosts: Vec<String> = split_list(self.get(props, "hosts"))
            .map(str::to_string)
            .collect();
        let backends: Vec<String> = split_list(self.get(props, "backends"))
            .map(str::to_string)
            .collect();
        if hosts.is_empty() && backends.is_empty() {
            return Err("frontend has neither backends nor hosts configured".to_string());
        }

        Ok(FrontendConfig {
            name: name.to_string(),
            bind: bind.to_string(),
            https,
            cert_file,
            key_file,
            add_forwarded_for: self.get_bool(props, "add-x-forwarded-for"),
            hosts,
            backends,
        })
    }
}

fn split_list(value: Option<&str>) -> impl Iterator<Item = &str> {
    value.unwrap_or("").split_whitespace()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Some(false),
        _ => None,
    }
}
