use std::{net::SocketAddr, path::PathBuf};

/// Errors loading or validating a configuration file
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A config without servers has nothing to listen on
    #[error("no [[server]] blocks in config")]
    NoServers,

    #[error("max_connections must be at least 1")]
    ZeroMaxConnections,

    /// error_pages keys must be HTTP status codes
    #[error("invalid error_pages status code: {0}")]
    BadErrorPageStatus(String),
}

/// Fatal reactor failures. Anything scoped to one connection is handled by
/// tearing that connection down instead.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("could not bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("could not register socket with the poll: {0}")]
    Register(#[source] std::io::Error),

    /// The readiness poll itself failed; the loop terminates and every
    /// socket is closed
    #[error("readiness poll failed: {0}")]
    Poll(#[source] std::io::Error),
}
