//! End-to-end tests: a real reactor on a loopback port, driven by plain
//! blocking client sockets.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use pretty_assertions::assert_eq;
use vigil::{Config, DefaultHandler, Reactor};

struct TestServer {
    addr: SocketAddr,
    running: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<thread::JoinHandle<Result<(), vigil::ReactorError>>>,
}

impl TestServer {
    fn start(max_connections: usize) -> Self {
        let toml = format!(
            r#"
                max_connections = {max_connections}
                poll_interval_secs = 1
                idle_timeout_secs = 3
                request_timeout_secs = 2

                [[server]]
                listen = "127.0.0.1:0"
                max_body_size = 64
                allow_methods = ["GET", "POST", "DELETE"]
            "#
        );
        let config = Config::from_str(&toml).unwrap();
        let mut reactor = Reactor::new(config, DefaultHandler).unwrap();
        let addr = reactor.local_addrs().unwrap()[0];
        let running = reactor.running_flag();
        let handle = thread::spawn(move || reactor.run());
        Self {
            addr,
            running,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // the reactor notices on its next wake interval
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Read one response: head, then exactly content-length body bytes
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).expect("read response head");
        assert!(n > 0, "connection closed before a full response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().unwrap())
        })
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("read response body");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    (head, body)
}

fn status_of(head: &str) -> u16 {
    head.split_whitespace().nth(1).unwrap().parse().unwrap()
}

#[test]
fn echoes_a_fixed_length_body_split_across_writes() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    stream
        .write_all(b"POST /echo HTTP/1.1\r\nhost: t\r\ncontent-length: 5\r\n\r\nhe")
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"llo").unwrap();

    let (head, body) = read_response(&mut stream);
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"hello");
}

#[test]
fn keep_alive_serves_a_second_independent_request() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    stream
        .write_all(b"POST /a HTTP/1.1\r\nhost: t\r\ncontent-length: 3\r\n\r\nabc")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"abc");
    assert!(head.to_ascii_lowercase().contains("connection: keep-alive"));

    // no residue from the first request may leak into the second
    stream
        .write_all(b"POST /b HTTP/1.1\r\nhost: t\r\ncontent-length: 2\r\n\r\nxy")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"xy");
}

#[test]
fn decodes_a_chunked_body() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    stream
        .write_all(
            b"POST /chunked HTTP/1.1\r\nhost: t\r\ntransfer-encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"Wikipedia");
}

#[test]
fn over_limit_content_length_is_413_without_body_bytes() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    // declares far more than max_body_size = 64, sends nothing
    stream
        .write_all(b"POST /big HTTP/1.1\r\nhost: t\r\ncontent-length: 100000\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream);
    assert_eq!(status_of(&head), 413);
    assert!(head.to_ascii_lowercase().contains("connection: close"));

    // and the connection is done
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn over_limit_chunked_body_is_drained_then_413() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    let mut request =
        b"POST /big HTTP/1.1\r\nhost: t\r\ntransfer-encoding: chunked\r\n\r\n".to_vec();
    // 3 chunks of 40 bytes: 120 decoded bytes > 64 allowed
    for _ in 0..3 {
        request.extend_from_slice(b"28\r\n");
        request.extend_from_slice(&[b'x'; 40]);
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"0\r\n\r\n");
    stream.write_all(&request).unwrap();

    let (head, _) = read_response(&mut stream);
    assert_eq!(status_of(&head), 413);
}

#[test]
fn huge_declared_chunk_size_does_not_kill_the_server() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    // a chunk claiming u64::MAX bytes; the few that follow get discarded and
    // the stalled request times out
    stream
        .write_all(
            b"POST /big HTTP/1.1\r\nhost: t\r\ntransfer-encoding: chunked\r\n\r\n\
              ffffffffffffffff\r\nxxxx",
        )
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert_eq!(status_of(&head), 408);

    // the reactor is still alive and serving
    let mut fresh = server.connect();
    fresh
        .write_all(b"POST /ok HTTP/1.1\r\nhost: t\r\ncontent-length: 2\r\n\r\nhi")
        .unwrap();
    let (head, body) = read_response(&mut fresh);
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"hi");
}

#[test]
fn garbage_is_400_and_closes() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    stream.write_all(b"GARBAGE\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert_eq!(status_of(&head), 400);
    assert!(head.to_ascii_lowercase().contains("connection: close"));
}

#[test]
fn unimplemented_method_is_501_but_parses() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    stream
        .write_all(b"BREW /pot HTTP/1.1\r\nhost: t\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert_eq!(status_of(&head), 501);
}

#[test]
fn stalled_request_gets_408() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    // a first byte arrived but the request never completes
    stream.write_all(b"GET / HT").unwrap();

    let (head, _) = read_response(&mut stream);
    assert_eq!(status_of(&head), 408);
    assert!(head.to_ascii_lowercase().contains("connection: close"));
}

#[test]
fn idle_connection_is_closed_silently() {
    let server = TestServer::start(8);
    let mut stream = server.connect();

    // no request in flight: no response is owed
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).expect("EOF after idle timeout");
    assert_eq!(n, 0);
}

#[test]
fn accepts_beyond_the_limit_are_deferred_not_rejected() {
    let server = TestServer::start(1);

    // occupies the single slot
    let holder = server.connect();
    thread::sleep(Duration::from_millis(300));

    // sits in the kernel backlog; connect still succeeds
    let mut waiting = server.connect();
    waiting
        .write_all(b"POST /q HTTP/1.1\r\nhost: t\r\ncontent-length: 2\r\n\r\nok")
        .unwrap();
    thread::sleep(Duration::from_millis(300));

    // freeing the slot lets the deferred accept through
    drop(holder);

    let (head, body) = read_response(&mut waiting);
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"ok");
}
