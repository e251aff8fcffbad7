//! Server configuration and per-request policy resolution.
//!
//! The file format is TOML: one `[[server]]` table per virtual server, with
//! nested `[[server.location]]` blocks overriding fields for a path prefix.
//! A [`Config`] is an explicit handle passed to the reactor at construction;
//! there is no process-global configuration state.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use http::StatusCode;
use serde::Deserialize;

use crate::{error::ConfigError, types::Method};

fn default_max_connections() -> usize {
    1024
}

fn default_poll_interval() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    75
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_body_size() -> u64 {
    1024 * 1024
}

fn default_index() -> Vec<String> {
    vec!["index.html".to_string()]
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Admission control: the reactor never holds more than this many client
    /// connections; excess accepts wait in the kernel backlog
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Poll wake interval in seconds; bounds how stale a timeout sweep can be
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds a connection may sit with no request in progress
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds between the first byte of a request and its full assembly
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(rename = "server")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `"127.0.0.1:8080"`
    pub listen: SocketAddr,

    /// Host names this server answers for; the first server on a listen
    /// address is the default when nothing matches
    #[serde(default)]
    pub server_names: Vec<String>,

    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_index")]
    pub index: Vec<String>,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,

    #[serde(default)]
    pub allow_methods: Option<Vec<AllowedMethod>>,

    /// status code (as a string key, TOML tables only key on strings) →
    /// page served for it
    #[serde(default)]
    pub error_pages: BTreeMap<String, PathBuf>,

    /// `301` target for everything under this server/location
    #[serde(default)]
    pub redirect: Option<String>,

    /// file extension → interpreter, e.g. `".php" = "/usr/bin/php-cgi"`
    #[serde(default)]
    pub cgi: BTreeMap<String, PathBuf>,

    #[serde(default, rename = "location")]
    pub locations: Vec<LocationConfig>,
}

/// A location block: overrides server-level policy for a path prefix.
/// Longest prefix wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub path: String,

    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub index: Option<Vec<String>>,

    #[serde(default)]
    pub max_body_size: Option<u64>,

    #[serde(default)]
    pub allow_methods: Option<Vec<AllowedMethod>>,

    #[serde(default)]
    pub error_pages: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub redirect: Option<String>,

    #[serde(default)]
    pub cgi: BTreeMap<String, PathBuf>,
}

/// Methods that may appear in an `allow_methods` directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AllowedMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
}

impl From<AllowedMethod> for Method {
    fn from(m: AllowedMethod) -> Self {
        match m {
            AllowedMethod::Get => Method::Get,
            AllowedMethod::Head => Method::Head,
            AllowedMethod::Post => Method::Post,
            AllowedMethod::Put => Method::Put,
            AllowedMethod::Delete => Method::Delete,
            AllowedMethod::Options => Method::Options,
        }
    }
}

/// Policy resolved for one request: the merge of the matched server block
/// and its longest-prefix location block.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_body_size: u64,
    pub root: PathBuf,
    pub index: Vec<String>,
    pub allow_methods: Vec<Method>,
    pub redirect: Option<String>,
    pub cgi: BTreeMap<String, PathBuf>,
    pub error_pages: BTreeMap<u16, PathBuf>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            root: default_root(),
            index: default_index(),
            // the original's AllowMethods default
            allow_methods: vec![Method::Get, Method::Post, Method::Delete],
            redirect: None,
            cgi: BTreeMap::new(),
            error_pages: BTreeMap::new(),
        }
    }
}

impl Policy {
    pub fn allows(&self, method: &Method) -> bool {
        self.allow_methods.contains(method)
    }

    pub fn error_page(&self, status: StatusCode) -> Option<&Path> {
        self.error_pages.get(&status.as_u16()).map(|p| p.as_path())
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        for server in &self.servers {
            for key in server
                .error_pages
                .keys()
                .chain(server.locations.iter().flat_map(|l| l.error_pages.keys()))
            {
                parse_status_key(key)?;
            }
        }
        Ok(())
    }

    /// The distinct addresses the reactor has to listen on
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for server in &self.servers {
            if !addrs.contains(&server.listen) {
                addrs.push(server.listen);
            }
        }
        addrs
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolve the policy for one request. Runs once per request cycle,
    /// right after headers complete and before any body framing decision
    /// (the body size limit depends on it).
    pub fn resolve(&self, listener: SocketAddr, host: Option<&str>, path: &str) -> Policy {
        let candidates: Vec<&ServerConfig> = self
            .servers
            .iter()
            .filter(|s| s.listen == listener)
            .collect();

        let server = match host {
            Some(host) => candidates
                .iter()
                .find(|s| s.server_names.iter().any(|n| n.eq_ignore_ascii_case(host)))
                .copied(),
            None => None,
        };
        let server = match server.or_else(|| candidates.first().copied()) {
            Some(s) => s,
            // unknown listener; fall back to global defaults
            None => return Policy::default(),
        };

        let location = server
            .locations
            .iter()
            .filter(|l| path.starts_with(&l.path))
            .max_by_key(|l| l.path.len());

        let mut policy = Policy {
            max_body_size: server.max_body_size,
            root: server.root.clone(),
            index: server.index.clone(),
            allow_methods: match &server.allow_methods {
                Some(methods) => methods.iter().map(|m| Method::from(*m)).collect(),
                None => Policy::default().allow_methods,
            },
            redirect: server.redirect.clone(),
            cgi: server.cgi.clone(),
            error_pages: status_keyed(&server.error_pages),
        };

        if let Some(location) = location {
            if let Some(root) = &location.root {
                policy.root = root.clone();
            }
            if let Some(index) = &location.index {
                policy.index = index.clone();
            }
            if let Some(max) = location.max_body_size {
                policy.max_body_size = max;
            }
            if let Some(methods) = &location.allow_methods {
                policy.allow_methods = methods.iter().map(|m| Method::from(*m)).collect();
            }
            if location.redirect.is_some() {
                policy.redirect = location.redirect.clone();
            }
            for (ext, interp) in &location.cgi {
                policy.cgi.insert(ext.clone(), interp.clone());
            }
            for (status, page) in status_keyed(&location.error_pages) {
                policy.error_pages.insert(status, page);
            }
        }

        policy
    }
}

fn parse_status_key(key: &str) -> Result<u16, ConfigError> {
    let status: u16 = key
        .parse()
        .map_err(|_| ConfigError::BadErrorPageStatus(key.to_string()))?;
    if !(100..=599).contains(&status) {
        return Err(ConfigError::BadErrorPageStatus(key.to_string()));
    }
    Ok(status)
}

fn status_keyed(pages: &BTreeMap<String, PathBuf>) -> BTreeMap<u16, PathBuf> {
    pages
        .iter()
        // validated at load time
        .filter_map(|(k, v)| k.parse().ok().map(|status| (status, v.clone())))
        .collect()
}
