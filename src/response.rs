//! Response encoding into the outbound buffer.

use bytes::{BufMut, BytesMut};
use http::{StatusCode, Version};

use crate::types::Headers;

/// A response the handler produced; the reactor encodes it into the
/// connection's outbound buffer and takes over delivery.
#[derive(Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,

    /// Handler-side end-of-connection signal; the connection also closes
    /// when the ingestion side already gave up on reuse
    pub close: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Default::default(),
            body: Vec::new(),
            close: false,
        }
    }
}

impl Response {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// The default error page body for a status
    pub fn error_body(status: StatusCode) -> Vec<u8> {
        let reason = status.canonical_reason().unwrap_or("Error");
        format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1><hr>vigil</body></html>\n",
            code = status.as_u16(),
        )
        .into_bytes()
    }
}

/// Encode status line, headers and body. `content-length` is always
/// emitted; `connection: close` is added when the connection won't be
/// reused.
pub(crate) fn encode_into(res: &Response, close: bool, out: &mut BytesMut) {
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(res.status.as_str().as_bytes());
    out.put_slice(b" ");
    out.put_slice(res.status.canonical_reason().unwrap_or("Unknown").as_bytes());
    out.put_slice(b"\r\n");

    out.put_slice(b"server: vigil\r\n");
    for header in &res.headers {
        out.put_slice(header.name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(&header.value);
        out.put_slice(b"\r\n");
    }
    if res.headers.get("content-length").is_none() {
        out.put_slice(format!("content-length: {}\r\n", res.body.len()).as_bytes());
    }
    if close {
        out.put_slice(b"connection: close\r\n");
    } else {
        out.put_slice(b"connection: keep-alive\r\n");
    }
    out.put_slice(b"\r\n");
    out.put_slice(&res.body);
}
