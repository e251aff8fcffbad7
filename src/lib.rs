//! vigil: an HTTP/1.1 server built directly on readiness polling.
//!
//! Everything runs on one thread. The [`Reactor`] multiplexes listeners and
//! client sockets through `mio::Poll`; each connection carries a resumable
//! ingestion state machine that assembles a request
//! from arbitrarily fragmented reads, decodes fixed-length or chunked body
//! framing, and hands the result to a [`Handler`] for response generation.

mod types;
pub use types::*;

pub mod config;
pub use config::{Config, Policy};

mod assemble;
mod conn;
mod decode;
mod parse;

mod response;
pub use response::Response;

mod handler;
pub use handler::{DefaultHandler, Handler};

mod reactor;
pub use reactor::Reactor;

pub mod error;
pub use error::{ConfigError, ReactorError};

/// re-exported so consumers can use the same version we use
pub use http;
