//! Request assembler: turns raw buffered bytes into a structured request.
//!
//! Runs only while the framing mode is still undetermined. Nothing is
//! consumed until the whole header section (`CRLFCRLF` terminator included)
//! is buffered, so a request fragmented across any number of reads parses
//! identically to one delivered in a single block.

use bytes::Buf;
use http::StatusCode;
use pretty_hex::PrettyHex;
use tracing::{debug, trace};

use crate::{
    conn::Connection,
    parse,
    types::{Method, Progress},
};

/// Cap on request line + header section, after which we answer 431
pub(crate) const MAX_HEAD_LEN: usize = 64 * 1024;

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Advance header parsing as far as the buffered input allows.
///
/// `Complete` means the header section was consumed and
/// `conn.request` holds the structured request (possibly with a semantic
/// error status already recorded) — or the head limit was blown and a fatal
/// 431 is recorded. `SyntaxError` means the grammar rejected the bytes and a
/// fatal 400 is recorded.
pub(crate) fn advance(conn: &mut Connection) -> Progress {
    // tolerate stray blank lines before the request line, a common client
    // quirk
    while conn.input.starts_with(b"\r\n") {
        conn.input.advance(2);
    }

    let head_end = match memchr::memmem::find(&conn.input, CRLF_CRLF) {
        Some(pos) => pos + CRLF_CRLF.len(),
        None => {
            if conn.input.len() > MAX_HEAD_LEN {
                debug!(len = conn.input.len(), "request head too large");
                conn.record_fatal(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
                return Progress::Complete;
            }
            trace!(
                "incomplete head, need more data. start of buffer: {:?}",
                conn.input[..conn.input.len().min(128)].hex_dump()
            );
            return Progress::NeedMoreInput;
        }
    };

    // parse to owned values first so the input buffer isn't borrowed while
    // we record outcomes on the connection
    let (line, headers) = match parse_head(&conn.input[..head_end]) {
        Some(t) => t,
        None => {
            conn.record_fatal(StatusCode::BAD_REQUEST);
            return Progress::SyntaxError;
        }
    };

    // semantic problems don't abort parsing: the headers still have to be
    // consumed so the stream stays framed
    if !line.method.is_implemented() {
        debug!(method = %line.method, "unimplemented method");
        conn.record_semantic(StatusCode::NOT_IMPLEMENTED);
    }
    if !line.target.starts_with('/') && !(line.target == "*" && line.method == Method::Options) {
        debug!(target = %line.target, "malformed request target");
        conn.record_semantic(StatusCode::BAD_REQUEST);
    }

    conn.request.method = line.method;
    conn.request.target = line.target;
    conn.request.version = line.version;
    conn.request.headers = headers;
    conn.input.advance(head_end);

    debug!(
        method = %conn.request.method,
        target = %conn.request.target,
        headers = conn.request.headers.len(),
        "assembled request head"
    );
    Progress::Complete
}

/// Parse a complete header section (terminator included). `None` is a
/// grammar rejection.
fn parse_head(head: &[u8]) -> Option<(parse::RequestLine, crate::types::Headers)> {
    let (rest, line) = match parse::request_line(head) {
        Ok(t) => t,
        Err(err) => {
            debug!(?err, "request line didn't parse");
            return None;
        }
    };

    match parse::headers_and_crlf(rest) {
        Ok((_, headers)) => Some((line, headers)),
        Err(err) => {
            debug!(?err, "header section didn't parse");
            None
        }
    }
}
