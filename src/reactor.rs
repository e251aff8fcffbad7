//! The single control loop: readiness polling, admission control, timeout
//! sweeps and connection lifecycle.
//!
//! Everything runs on the calling thread. Suspension only ever happens
//! implicitly: when a parsing step reports `NeedMoreInput`, control returns
//! here to wait for the next readiness event for that socket. Connections
//! live in a stable-key table — removing one never disturbs the others.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Buf;
use http::{StatusCode, Version};
use mio::{
    event::Event,
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use tracing::{debug, info, trace, warn};

use crate::{
    assemble,
    config::Config,
    conn::{Connection, Framing},
    decode,
    error::ReactorError,
    handler::Handler,
    response,
    types::Progress,
};

const EVENT_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 64 * 1024;

struct Listener {
    socket: TcpListener,
    /// the address from the config, which per-request resolution keys on
    configured: SocketAddr,
    /// accepts were deferred because the connection limit was reached;
    /// retried on later iterations once capacity frees up
    saturated: bool,
}

struct Client {
    socket: TcpStream,
    conn: Connection,
    listener: SocketAddr,
    interest: Interest,
}

pub struct Reactor<H: Handler> {
    poll: Poll,
    config: Config,
    handler: H,
    listeners: Vec<Listener>,
    conns: HashMap<Token, Client>,
    next_token: usize,
    running: Arc<AtomicBool>,
    scratch: Box<[u8]>,
}

impl<H: Handler> Reactor<H> {
    pub fn new(config: Config, handler: H) -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Poll)?;

        let mut listeners = Vec::new();
        for (index, addr) in config.listen_addrs().into_iter().enumerate() {
            let mut socket =
                TcpListener::bind(addr).map_err(|source| ReactorError::Bind { addr, source })?;
            poll.registry()
                .register(&mut socket, Token(index), Interest::READABLE)
                .map_err(ReactorError::Register)?;
            info!(%addr, "listening");
            listeners.push(Listener {
                socket,
                configured: addr,
                saturated: false,
            });
        }

        let next_token = listeners.len();
        Ok(Self {
            poll,
            config,
            handler,
            listeners,
            conns: HashMap::new(),
            next_token,
            running: Arc::new(AtomicBool::new(true)),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    /// Shared flag driving the loop; clear it (e.g. from a signal handler)
    /// to make the current poll iteration the last
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Actual bound addresses, in config order (useful when binding port 0)
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(|l| l.socket.local_addr()).collect()
    }

    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Run until the running flag clears or the poll itself fails. All
    /// sockets are closed on the way out; in-flight responses are not
    /// completed.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while self.running.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(self.config.poll_interval())) {
                Ok(()) => {}
                // a signal landed; the loop condition decides what's next
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(?err, "readiness poll failed, shutting down");
                    self.close_all();
                    return Err(ReactorError::Poll(err));
                }
            }

            let now = Instant::now();
            for event in events.iter() {
                let token = event.token();
                if token.0 < self.listeners.len() {
                    self.accept_from(token.0);
                } else {
                    self.client_event(token, event, now);
                }
            }

            self.sweep_timeouts(Instant::now());
            self.retry_deferred_accepts();
        }

        info!("shutting down");
        self.close_all();
        Ok(())
    }

    /// Accept as long as there's capacity; at the limit the listener is left
    /// readable and the kernel backlog provides the backpressure
    fn accept_from(&mut self, index: usize) {
        loop {
            if self.conns.len() >= self.config.max_connections {
                trace!(
                    active = self.conns.len(),
                    "connection limit reached, deferring accepts"
                );
                self.listeners[index].saturated = true;
                return;
            }
            match self.listeners[index].socket.accept() {
                Ok((mut socket, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE)
                    {
                        warn!(?err, "could not register accepted socket");
                        continue;
                    }
                    debug!(%peer, ?token, "accepted connection");
                    self.conns.insert(
                        token,
                        Client {
                            socket,
                            conn: Connection::new(Instant::now()),
                            listener: self.listeners[index].configured,
                            interest: Interest::READABLE,
                        },
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.listeners[index].saturated = false;
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // fatal for that connection attempt only
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    fn retry_deferred_accepts(&mut self) {
        for index in 0..self.listeners.len() {
            if self.listeners[index].saturated && self.conns.len() < self.config.max_connections {
                self.accept_from(index);
            }
        }
    }

    fn client_event(&mut self, token: Token, event: &Event, now: Instant) {
        // read errors and hang-ups tear the connection down regardless of
        // parse state
        if event.is_error() || event.is_read_closed() {
            debug!(?token, "peer error/hang-up");
            self.teardown(token);
            return;
        }
        if event.is_readable() {
            self.client_readable(token, now);
        }
        if event.is_writable() && self.conns.contains_key(&token) {
            self.client_writable(token, now);
        }
    }

    fn client_readable(&mut self, token: Token, now: Instant) {
        let Some(client) = self.conns.get_mut(&token) else {
            return;
        };

        loop {
            match client.socket.read(&mut self.scratch) {
                Ok(0) => {
                    debug!(?token, "peer closed");
                    self.teardown(token);
                    return;
                }
                Ok(n) => client.conn.bytes_received(&self.scratch[..n], now),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?token, ?err, "recv failed");
                    self.teardown(token);
                    return;
                }
            }
        }

        // a request that's been in flight too long beats further parsing
        if client
            .conn
            .in_flight_timed_out(self.config.request_timeout(), now)
        {
            debug!(?token, "in-flight timeout");
            client.conn.record_fatal(StatusCode::REQUEST_TIMEOUT);
            self.finalize(token, now);
            return;
        }

        self.drive(token, now);
    }

    /// Advance the ingestion state machine as far as the buffered input
    /// allows; hand off to the processor once the request is terminal
    fn drive(&mut self, token: Token, now: Instant) {
        loop {
            let Some(client) = self.conns.get_mut(&token) else {
                return;
            };
            match client.conn.framing {
                Framing::Undetermined => match assemble::advance(&mut client.conn) {
                    Progress::NeedMoreInput => return,
                    Progress::SyntaxError => {
                        self.finalize(token, now);
                        return;
                    }
                    Progress::Complete => {
                        if client.conn.is_fatal() {
                            // head limit blown; nothing was parsed, answer
                            // immediately
                            self.finalize(token, now);
                            return;
                        }
                        let host = client.conn.request.headers.host().map(str::to_string);
                        let path = client.conn.request.path().to_string();
                        let policy =
                            self.config
                                .resolve(client.listener, host.as_deref(), &path);
                        client.conn.policy = Some(policy);
                        decode::decide_framing(&mut client.conn);
                        // next iteration runs the decoder against whatever
                        // is already buffered
                    }
                },
                _ => match decode::advance(&mut client.conn) {
                    Progress::NeedMoreInput => return,
                    Progress::SyntaxError | Progress::Complete => {
                        self.finalize(token, now);
                        return;
                    }
                },
            }
        }
    }

    /// The request is terminal (complete, or cut short by an error): let the
    /// processor fill the outbound buffer, then switch to write interest
    fn finalize(&mut self, token: Token, now: Instant) {
        let Some(client) = self.conns.get_mut(&token) else {
            return;
        };
        let conn = &mut client.conn;

        if conn.request.headers.connection_close() {
            conn.keep_alive = false;
        }
        if conn.request.version == Version::HTTP_10 && !conn.request.headers.connection_keep_alive()
        {
            conn.keep_alive = false;
        }

        let status = conn.effective_status();
        let policy = match conn.policy.take() {
            Some(policy) => policy,
            // errored out before headers completed; resolve with defaults
            None => self.config.resolve(client.listener, None, "/"),
        };

        let response = self.handler.handle(&conn.request, status, &policy);
        let close = response.close || !conn.keep_alive;
        conn.keep_alive = !close;

        info!(
            status = response.status.as_u16(),
            method = %conn.request.method,
            target = %conn.request.target,
            close,
            "request"
        );
        response::encode_into(&response, close, &mut conn.output);

        self.set_interest(token, Interest::WRITABLE);
        self.client_writable(token, now);
    }

    fn client_writable(&mut self, token: Token, now: Instant) {
        let Some(client) = self.conns.get_mut(&token) else {
            return;
        };

        while !client.conn.output.is_empty() {
            match client.socket.write(&client.conn.output) {
                Ok(0) => {
                    self.teardown(token);
                    return;
                }
                Ok(n) => {
                    client.conn.output.advance(n);
                    client.conn.bytes_sent(now);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?token, ?err, "send failed");
                    self.teardown(token);
                    return;
                }
            }
        }

        if client.conn.keep_alive {
            // same socket, same record: ready for the next request
            trace!(?token, "response sent, resetting for keep-alive");
            client.conn.reset(now);
            self.set_interest(token, Interest::READABLE);
        } else {
            debug!(?token, "response sent, closing");
            self.teardown(token);
        }
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let idle = self.config.idle_timeout();
        let request = self.config.request_timeout();

        let mut idle_deaths = Vec::new();
        let mut late_requests = Vec::new();
        for (token, client) in &self.conns {
            let conn = &client.conn;
            if !conn.output.is_empty() {
                // a writer making no progress eventually goes too
                if conn.idle_timed_out(idle, now) {
                    idle_deaths.push(*token);
                }
            } else if conn.in_flight_timed_out(request, now) {
                late_requests.push(*token);
            } else if !conn.request_in_flight() && conn.idle_timed_out(idle, now) {
                idle_deaths.push(*token);
            }
        }

        // no request was in flight: nobody is owed a response
        for token in idle_deaths {
            debug!(?token, "idle timeout");
            self.teardown(token);
        }
        for token in late_requests {
            debug!(?token, "in-flight timeout");
            if let Some(client) = self.conns.get_mut(&token) {
                client.conn.record_fatal(StatusCode::REQUEST_TIMEOUT);
            }
            self.finalize(token, now);
        }
    }

    fn set_interest(&mut self, token: Token, interest: Interest) {
        let Some(client) = self.conns.get_mut(&token) else {
            return;
        };
        if client.interest == interest {
            return;
        }
        match self
            .poll
            .registry()
            .reregister(&mut client.socket, token, interest)
        {
            Ok(()) => client.interest = interest,
            Err(err) => {
                warn!(?token, ?err, "reregister failed");
                self.teardown(token);
            }
        }
    }

    fn teardown(&mut self, token: Token) {
        if let Some(mut client) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut client.socket);
            debug!(?token, active = self.conns.len(), "connection destroyed");
        }
    }

    fn close_all(&mut self) {
        for (_, mut client) in self.conns.drain() {
            let _ = self.poll.registry().deregister(&mut client.socket);
        }
        for listener in &mut self.listeners {
            let _ = self.poll.registry().deregister(&mut listener.socket);
        }
    }
}
