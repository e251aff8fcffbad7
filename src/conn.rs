//! Per-connection ingestion state.
//!
//! A [`Connection`] is owned exclusively by the reactor's connection table
//! and mutated only while handling that socket's readiness events. It holds
//! everything needed to resume parsing after an arbitrary number of short
//! reads: the unconsumed input, the request assembled so far, the body
//! framing mode and the error/timeout bookkeeping.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use http::StatusCode;

use crate::{config::Policy, types::Request};

/// How the body length of the current request is determined. Decided exactly
/// once per request cycle, right after the header section is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Headers not fully parsed yet
    Undetermined,

    /// `Content-Length` framing; `remaining == 0` also covers "no body
    /// expected"
    FixedLength { remaining: u64 },

    /// `Transfer-Encoding: chunked` framing
    Chunked { phase: ChunkPhase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkPhase {
    /// Waiting for a full hex-size line
    ReadingSize,

    /// Waiting for `remaining` data bytes plus the trailing CRLF
    ReadingData { remaining: u64 },

    /// Zero-length chunk seen; scanning (and discarding) trailer lines up to
    /// the final CRLF
    ReadingTrailers,

    Done,
}

/// Error precedence: a semantic problem (unsupported method, bad header
/// value) is recorded but parsing continues so the stream stays framed; a
/// fatal problem (syntax error, size violation, timeout) short-circuits to
/// response generation. Once fatal, nothing downgrades the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    None,
    Semantic,
    Fatal,
}

pub(crate) struct Connection {
    /// Bytes received but not yet consumed by parsing. Only ever shrinks
    /// from the front.
    pub input: BytesMut,

    /// Bytes queued for transmission
    pub output: BytesMut,

    /// The request being assembled (at most one in flight per connection)
    pub request: Request,

    pub framing: Framing,

    /// True while a fixed-length body read is incomplete across polls
    pub awaiting_body: bool,

    /// False once body bytes must be discarded instead of stored (the
    /// chunked stream is still drained to stay synchronized)
    pub consume_body: bool,

    /// Sticky once set
    pub exceeds_max_body: bool,

    /// Total decoded body bytes this request, whether stored or discarded;
    /// the size limit is enforced against this, not against what was kept
    pub decoded_total: u64,

    status: StatusCode,
    severity: Severity,

    pub keep_alive: bool,

    /// Policy resolved for the current request, available once headers are in
    pub policy: Option<Policy>,

    /// Set once per request cycle, drives the in-flight timeout
    first_byte_at: Option<Instant>,

    /// Updated on every successful read, drives the idle timeout
    last_activity: Instant,
}

impl Connection {
    pub fn new(now: Instant) -> Self {
        Self {
            input: BytesMut::new(),
            output: BytesMut::new(),
            request: Request::default(),
            framing: Framing::Undetermined,
            awaiting_body: false,
            consume_body: true,
            exceeds_max_body: false,
            decoded_total: 0,
            status: StatusCode::OK,
            severity: Severity::None,
            keep_alive: true,
            policy: None,
            first_byte_at: None,
            last_activity: now,
        }
    }

    /// Record bytes arriving from the socket
    pub fn bytes_received(&mut self, bytes: &[u8], now: Instant) {
        self.input.extend_from_slice(bytes);
        self.last_activity = now;
        if self.first_byte_at.is_none() {
            self.first_byte_at = Some(now);
        }
    }

    /// Record write progress on the socket; a response draining slowly
    /// through partial sends is not idle
    pub fn bytes_sent(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// A semantic problem: recorded (first one wins among semantic errors),
    /// never overrides a fatal status. Parsing continues; the body will be
    /// drained but not stored, and the connection won't be reused.
    pub fn record_semantic(&mut self, status: StatusCode) {
        if self.severity == Severity::None {
            self.status = status;
            self.severity = Severity::Semantic;
        }
        self.consume_body = false;
        self.keep_alive = false;
    }

    /// A fatal problem: overrides any semantic status; the first fatal status
    /// wins. The request is handed to the processor immediately.
    pub fn record_fatal(&mut self, status: StatusCode) {
        if self.severity < Severity::Fatal {
            self.status = status;
            self.severity = Severity::Fatal;
        }
        self.consume_body = false;
        self.keep_alive = false;
    }

    pub fn has_error(&self) -> bool {
        self.severity != Severity::None
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// Status the processor should answer with (200 when nothing went wrong)
    pub fn effective_status(&self) -> StatusCode {
        self.status
    }

    /// True once a byte of the current request has been read but the request
    /// hasn't been handed off yet
    pub fn request_in_flight(&self) -> bool {
        self.first_byte_at.is_some() && self.output.is_empty()
    }

    pub fn in_flight_timed_out(&self, limit: Duration, now: Instant) -> bool {
        match self.first_byte_at {
            Some(t) => self.request_in_flight() && now.duration_since(t) >= limit,
            None => false,
        }
    }

    pub fn idle_timed_out(&self, limit: Duration, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= limit
    }

    /// Reset for keep-alive reuse: same socket, same record, fresh request
    /// cycle. Everything except `last_activity` returns to its initial
    /// state.
    pub fn reset(&mut self, now: Instant) {
        self.input.clear();
        self.output.clear();
        self.request = Request::default();
        self.framing = Framing::Undetermined;
        self.awaiting_body = false;
        self.consume_body = true;
        self.exceeds_max_body = false;
        self.decoded_total = 0;
        self.status = StatusCode::OK;
        self.severity = Severity::None;
        self.keep_alive = true;
        self.policy = None;
        self.first_byte_at = None;
        self.last_activity = now;
    }
}
