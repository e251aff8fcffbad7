//! Body framing decisions and transfer decoding.
//!
//! Stateless algorithms over a [`Connection`]: all resumable state lives in
//! the record itself (framing mode + chunk phase), so a decode suspended by
//! a short read picks up in exactly the same place on the next readiness
//! event.

use bytes::Buf;
use http::StatusCode;
use tracing::{debug, trace};

use crate::{
    conn::{ChunkPhase, Connection, Framing},
    parse,
    types::Progress,
};

/// Decide the framing mode for the request whose headers just completed.
/// Called exactly once per request cycle, with the policy already resolved
/// (the body size limit comes from it).
pub(crate) fn decide_framing(conn: &mut Connection) {
    debug_assert_eq!(conn.framing, Framing::Undetermined);

    match conn.request.headers.content_length() {
        Some(Ok(len)) => {
            if len > max_body(conn) {
                // answer 413 right away; the body is never read since the
                // connection closes after the response anyway (see DESIGN.md
                // on the asymmetry with chunked framing)
                debug!(len, "declared content-length over limit");
                conn.exceeds_max_body = true;
                conn.record_fatal(StatusCode::PAYLOAD_TOO_LARGE);
                conn.framing = Framing::FixedLength { remaining: 0 };
            } else {
                conn.awaiting_body = len > 0;
                conn.framing = Framing::FixedLength { remaining: len };
            }
        }
        Some(Err(())) => {
            debug!("unparseable content-length value");
            conn.record_semantic(StatusCode::BAD_REQUEST);
            conn.framing = Framing::FixedLength { remaining: 0 };
        }
        None => {
            if conn.request.headers.is_chunked_transfer_encoding() {
                conn.framing = Framing::Chunked {
                    phase: ChunkPhase::ReadingSize,
                };
            } else {
                // no body expected
                conn.framing = Framing::FixedLength { remaining: 0 };
            }
        }
    }
}

fn max_body(conn: &Connection) -> u64 {
    conn.policy
        .as_ref()
        .map(|p| p.max_body_size)
        .unwrap_or(u64::MAX)
}

/// Advance body decoding as far as the buffered input allows. `Complete`
/// means the request is terminal and ready for the processor.
pub(crate) fn advance(conn: &mut Connection) -> Progress {
    match conn.framing {
        Framing::Undetermined => {
            debug_assert!(false, "decode before framing decision");
            Progress::NeedMoreInput
        }
        Framing::FixedLength { remaining } => fixed_length(conn, remaining),
        Framing::Chunked { phase } => chunked(conn, phase),
    }
}

/// Fixed-length framing: wait until the whole declared body is buffered,
/// then take it in one go.
fn fixed_length(conn: &mut Connection, remaining: u64) -> Progress {
    if (conn.input.len() as u64) < remaining {
        trace!(
            buffered = conn.input.len(),
            remaining,
            "waiting for fixed-length body"
        );
        conn.awaiting_body = true;
        return Progress::NeedMoreInput;
    }

    if remaining > 0 {
        let body = conn.input.split_to(remaining as usize);
        conn.decoded_total += remaining;
        if conn.consume_body {
            conn.request.body.unsplit(body);
        }
        conn.framing = Framing::FixedLength { remaining: 0 };
    }
    conn.awaiting_body = false;
    Progress::Complete
}

/// Chunked framing: alternate between size line, data, and trailer phases
/// until the zero-length chunk. Over-limit bodies are drained but discarded
/// so the stream stays synchronized; 413 is finalized only once the full
/// body went by.
fn chunked(conn: &mut Connection, mut phase: ChunkPhase) -> Progress {
    loop {
        match phase {
            ChunkPhase::ReadingSize => {
                let parsed = match parse::chunk_size(&conn.input) {
                    Ok((rest, size)) => Some((conn.input.len() - rest.len(), size)),
                    Err(err) if err.is_incomplete() => None,
                    Err(err) => {
                        debug!(?err, "bad chunk size line");
                        conn.record_fatal(StatusCode::BAD_REQUEST);
                        conn.framing = Framing::Chunked { phase };
                        return Progress::SyntaxError;
                    }
                };
                let (consumed, size) = match parsed {
                    Some(t) => t,
                    None => {
                        conn.framing = Framing::Chunked { phase };
                        return Progress::NeedMoreInput;
                    }
                };
                conn.input.advance(consumed);
                // the declared size alone can blow the limit; deciding here
                // means an oversized chunk is never buffered in full
                if conn.decoded_total.saturating_add(size) > max_body(conn)
                    && !conn.exceeds_max_body
                {
                    debug!(
                        decoded = conn.decoded_total,
                        chunk = size,
                        "chunked body over limit, draining the rest"
                    );
                    conn.exceeds_max_body = true;
                }
                phase = if size == 0 {
                    ChunkPhase::ReadingTrailers
                } else {
                    ChunkPhase::ReadingData { remaining: size }
                };
            }

            ChunkPhase::ReadingData { remaining } => {
                if conn.exceeds_max_body || !conn.consume_body {
                    // discarded data is consumed incrementally, so the chunk
                    // never has to fit in the input buffer
                    if remaining > 0 {
                        if conn.input.is_empty() {
                            conn.framing = Framing::Chunked { phase };
                            return Progress::NeedMoreInput;
                        }
                        let take = (conn.input.len() as u64).min(remaining);
                        conn.input.advance(take as usize);
                        conn.decoded_total = conn.decoded_total.saturating_add(take);
                        phase = ChunkPhase::ReadingData {
                            remaining: remaining - take,
                        };
                        continue;
                    }
                    if conn.input.len() < 2 {
                        conn.framing = Framing::Chunked { phase };
                        return Progress::NeedMoreInput;
                    }
                    if &conn.input[..2] != parse::CRLF {
                        debug!("chunk data not followed by CRLF");
                        conn.record_fatal(StatusCode::BAD_REQUEST);
                        conn.framing = Framing::Chunked { phase };
                        return Progress::SyntaxError;
                    }
                    conn.input.advance(2);
                    phase = ChunkPhase::ReadingSize;
                    continue;
                }

                // stored chunk: data plus its trailing CRLF must be buffered
                // in full
                let needed = match usize::try_from(remaining)
                    .ok()
                    .and_then(|n| n.checked_add(2))
                {
                    Some(needed) => needed,
                    None => {
                        // could never fit in memory, let alone under a limit
                        debug!(chunk = remaining, "chunk too large to buffer");
                        conn.record_fatal(StatusCode::PAYLOAD_TOO_LARGE);
                        conn.framing = Framing::Chunked { phase };
                        return Progress::Complete;
                    }
                };
                if conn.input.len() < needed {
                    conn.framing = Framing::Chunked { phase };
                    return Progress::NeedMoreInput;
                }
                if &conn.input[remaining as usize..needed] != parse::CRLF {
                    debug!("chunk data not followed by CRLF");
                    conn.record_fatal(StatusCode::BAD_REQUEST);
                    conn.framing = Framing::Chunked { phase };
                    return Progress::SyntaxError;
                }

                let data = conn.input.split_to(remaining as usize);
                conn.input.advance(2);
                conn.decoded_total = conn.decoded_total.saturating_add(remaining);
                conn.request.body.unsplit(data);
                phase = ChunkPhase::ReadingSize;
            }

            ChunkPhase::ReadingTrailers => {
                // a single buffered byte could still be the start of the
                // final CRLF
                if conn.input.len() < 2 {
                    conn.framing = Framing::Chunked { phase };
                    return Progress::NeedMoreInput;
                }
                // each trailer line must satisfy the header grammar; all are
                // discarded
                if let Ok((rest, ())) = parse::crlf(&conn.input) {
                    let consumed = conn.input.len() - rest.len();
                    conn.input.advance(consumed);
                    phase = ChunkPhase::Done;
                    continue;
                }
                let parsed = match parse::header_field(&conn.input) {
                    Ok((rest, _)) => Some(conn.input.len() - rest.len()),
                    Err(err) if err.is_incomplete() => None,
                    Err(err) => {
                        debug!(?err, "bad trailer line");
                        conn.record_fatal(StatusCode::BAD_REQUEST);
                        conn.framing = Framing::Chunked { phase };
                        return Progress::SyntaxError;
                    }
                };
                match parsed {
                    Some(consumed) => conn.input.advance(consumed),
                    None => {
                        conn.framing = Framing::Chunked { phase };
                        return Progress::NeedMoreInput;
                    }
                }
            }

            ChunkPhase::Done => {
                conn.framing = Framing::Chunked { phase };
                if conn.exceeds_max_body {
                    // only now that the stream is fully drained
                    conn.record_fatal(StatusCode::PAYLOAD_TOO_LARGE);
                }
                return Progress::Complete;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Policy;

    fn conn_with_policy(max_body: u64) -> Connection {
        let mut conn = Connection::new(Instant::now());
        conn.policy = Some(Policy {
            max_body_size: max_body,
            ..Policy::default()
        });
        conn
    }

    fn feed(conn: &mut Connection, bytes: &[u8]) {
        conn.bytes_received(bytes, Instant::now());
    }

    #[test]
    fn fixed_length_waits_for_the_whole_body() {
        let mut conn = conn_with_policy(1024);
        conn.framing = Framing::FixedLength { remaining: 5 };

        feed(&mut conn, b"he");
        assert_eq!(advance(&mut conn), Progress::NeedMoreInput);
        assert!(conn.awaiting_body);

        feed(&mut conn, b"llo");
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert_eq!(&conn.request.body[..], b"hello");
        assert!(!conn.awaiting_body);
        assert!(conn.input.is_empty());
    }

    #[test]
    fn wikipedia_chunked_vector() {
        let mut conn = conn_with_policy(1024);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert_eq!(&conn.request.body[..], b"Wikipedia");
        assert!(!conn.has_error());
        assert!(conn.input.is_empty());
    }

    #[test]
    fn chunked_decoding_is_fragmentation_invariant() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut conn = conn_with_policy(1024);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        let mut last = Progress::NeedMoreInput;
        for byte in raw.iter() {
            feed(&mut conn, std::slice::from_ref(byte));
            last = advance(&mut conn);
        }
        assert_eq!(last, Progress::Complete);
        assert_eq!(&conn.request.body[..], b"Wikipedia");
    }

    #[test]
    fn over_limit_chunked_body_is_drained_then_413() {
        let mut conn = conn_with_policy(6);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"4\r\nWiki\r\n5\r\npedia\r\n3\r\nxyz\r\n0\r\n\r\n");
        assert_eq!(advance(&mut conn), Progress::Complete);
        // every chunk was consumed off the input even though the limit blew
        assert!(conn.input.is_empty());
        assert!(conn.exceeds_max_body);
        assert_eq!(conn.effective_status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!conn.keep_alive);
    }

    #[test]
    fn huge_declared_chunk_size_is_drained_not_buffered() {
        let mut conn = conn_with_policy(64);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        // u64::MAX declared in one chunk-size line
        feed(&mut conn, b"ffffffffffffffff\r\nxxx");
        assert_eq!(advance(&mut conn), Progress::NeedMoreInput);
        assert!(conn.exceeds_max_body);
        // whatever data arrives is discarded, never accumulated
        assert!(conn.input.is_empty());
        assert!(conn.request.body.is_empty());
    }

    #[test]
    fn unbufferable_chunk_without_a_limit_is_413() {
        // no policy resolved, so no size limit applies; the chunk still can't
        // possibly be buffered whole
        let mut conn = Connection::new(Instant::now());
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"ffffffffffffffff\r\nxx");
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert_eq!(conn.effective_status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!conn.keep_alive);
    }

    #[test]
    fn invalid_content_length_is_semantic_400_with_no_body_expected() {
        let mut conn = conn_with_policy(1024);
        conn.request
            .headers
            .append("content-length".into(), b"banana".to_vec());
        decide_framing(&mut conn);
        assert_eq!(conn.framing, Framing::FixedLength { remaining: 0 });
        assert_eq!(conn.effective_status(), StatusCode::BAD_REQUEST);
        assert!(!conn.keep_alive);
        assert!(!conn.consume_body);
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert!(conn.request.body.is_empty());
    }

    #[test]
    fn bad_chunk_size_is_a_syntax_error() {
        let mut conn = conn_with_policy(1024);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"nope\r\n");
        assert_eq!(advance(&mut conn), Progress::SyntaxError);
        assert_eq!(conn.effective_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_chunk_crlf_is_a_syntax_error() {
        let mut conn = conn_with_policy(1024);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"4\r\nWikiXX");
        assert_eq!(advance(&mut conn), Progress::SyntaxError);
    }

    #[test]
    fn trailers_are_scanned_and_discarded() {
        let mut conn = conn_with_policy(1024);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"3\r\nabc\r\n0\r\nexpires: never\r\n\r\n");
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert_eq!(&conn.request.body[..], b"abc");
        assert!(conn.request.headers.get("expires").is_none());
    }

    #[test]
    fn declared_length_over_limit_is_immediate_413() {
        let mut conn = conn_with_policy(10);
        conn.request
            .headers
            .append("content-length".into(), b"1000".to_vec());
        decide_framing(&mut conn);
        // no body bytes buffered at all, yet the request is terminal
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert_eq!(conn.effective_status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(conn.exceeds_max_body);
    }

    #[test]
    fn content_length_within_limit_frames_fixed() {
        let mut conn = conn_with_policy(10);
        conn.request
            .headers
            .append("content-length".into(), b"5".to_vec());
        decide_framing(&mut conn);
        assert_eq!(conn.framing, Framing::FixedLength { remaining: 5 });
        assert!(conn.awaiting_body);
    }

    #[test]
    fn chunked_framing_requires_the_header() {
        let mut conn = conn_with_policy(10);
        conn.request
            .headers
            .append("transfer-encoding".into(), b"chunked".to_vec());
        decide_framing(&mut conn);
        assert_eq!(
            conn.framing,
            Framing::Chunked {
                phase: ChunkPhase::ReadingSize
            }
        );

        let mut plain = conn_with_policy(10);
        decide_framing(&mut plain);
        assert_eq!(plain.framing, Framing::FixedLength { remaining: 0 });
        assert_eq!(advance(&mut plain), Progress::Complete);
    }

    #[test]
    fn semantic_error_body_is_drained_but_discarded() {
        // fixed-length
        let mut conn = conn_with_policy(1024);
        conn.record_semantic(StatusCode::NOT_IMPLEMENTED);
        conn.framing = Framing::FixedLength { remaining: 5 };
        feed(&mut conn, b"hello");
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert!(conn.request.body.is_empty());
        assert!(conn.input.is_empty());

        // chunked
        let mut conn = conn_with_policy(1024);
        conn.record_semantic(StatusCode::NOT_IMPLEMENTED);
        conn.framing = Framing::Chunked {
            phase: ChunkPhase::ReadingSize,
        };
        feed(&mut conn, b"3\r\nabc\r\n0\r\n\r\n");
        assert_eq!(advance(&mut conn), Progress::Complete);
        assert!(conn.request.body.is_empty());
        assert!(conn.input.is_empty());
    }
}
