use std::fmt;

use bytes::BytesMut;
use http::Version;

mod headers;
pub use headers::*;

mod method;
pub use method::*;

/// An HTTP request, assembled incrementally by the connection state machine.
#[derive(Clone)]
pub struct Request {
    pub method: Method,

    /// Requested entity, as it appeared on the request line
    pub target: String,

    /// The HTTP version used
    pub version: Version,

    /// Request headers
    pub headers: Headers,

    /// Decoded request body (empty until body framing completes)
    pub body: BytesMut,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Get,
            target: "/".to_string(),
            version: Version::HTTP_11,
            headers: Default::default(),
            body: Default::default(),
        }
    }
}

impl Request {
    /// The path component of the target (query string stripped)
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .field("body", &self.body.len())
            .finish()
    }
}

/// How far a parsing step got against the bytes buffered so far.
///
/// `NeedMoreInput` is the single suspension mechanism of the whole server:
/// the reactor interprets it as "retry on the next readiness event". No step
/// ever blocks or retries a read synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The step (or the whole request) is done; terminal states with an
    /// error status recorded also report `Complete` so the response can go
    /// out.
    Complete,

    /// Not enough buffered bytes to make a decision; no input was consumed
    /// past the last decision point.
    NeedMoreInput,

    /// The byte stream is unframeable (bad request line, header or chunk
    /// grammar). Status 400 has been recorded and the connection will close.
    SyntaxError,
}
