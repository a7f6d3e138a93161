use event_driven_server::{EventLoop, FsContentProvider, ServerConfig, ShutdownToken};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A server running on an ephemeral port against a throwaway document root
struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownToken,
    handle: Option<JoinHandle<()>>,
    root: PathBuf,
}

impl TestServer {
    fn start(name: &str, max_connections: usize, idle_timeout: Duration) -> Self {
        let root = std::env::temp_dir().join(format!("eds-test-{}-{}", std::process::id(), name));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("index.html"), b"hello world").unwrap();
        fs::write(root.join("notes.txt"), b"some plain text notes\n").unwrap();

        let mut config = ServerConfig::new()
            .with_address("127.0.0.1", 0)
            .with_document_root(&root)
            .with_max_connections(max_connections);
        config.poll_timeout = Duration::from_millis(50);
        config.idle_timeout = idle_timeout;

        let shutdown = ShutdownToken::new();
        let token = shutdown.clone();

        // The loop reports its bound address once the listener is up
        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            let provider = FsContentProvider::new(config.document_root.clone());
            let mut event_loop = EventLoop::new(config, Box::new(provider)).unwrap();
            tx.send(event_loop.local_addr().unwrap()).unwrap();
            event_loop.run(&token).unwrap();
        });
        let addr = rx.recv().unwrap();

        Self {
            addr,
            shutdown,
            handle: Some(handle),
            root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one response: headers up to the blank line, then exactly
/// Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8(buf[..header_end].to_vec()).unwrap();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                Some(value.trim().parse::<usize>().unwrap())
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);

    (head, body)
}

#[test]
fn test_serves_default_document() {
    let server = TestServer::start("root", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 11"));
    assert!(head.contains("Content-Type: text/html"));
    assert_eq!(body, b"hello world");
}

#[test]
fn test_serves_named_file_with_exact_length() {
    let server = TestServer::start("named", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    stream
        .write_all(b"GET /notes.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: text/plain"));
    assert!(head.contains(&format!("Content-Length: {}", b"some plain text notes\n".len())));
    assert_eq!(body, b"some plain text notes\n");

    // Close was requested, so the server hangs up after the response
    let mut tmp = [0u8; 16];
    assert_eq!(stream.read(&mut tmp).unwrap(), 0);
}

#[test]
fn test_missing_file_is_not_found() {
    let server = TestServer::start("missing", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    stream
        .write_all(b"GET /nope.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(body.is_empty());
}

#[test]
fn test_traversal_is_forbidden() {
    let server = TestServer::start("traversal", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    stream
        .write_all(b"GET /../index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[test]
fn test_post_is_method_not_allowed() {
    let server = TestServer::start("post", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[test]
fn test_keep_alive_serves_second_request() {
    let server = TestServer::start("keepalive", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(body, b"hello world");

    // Same socket, no re-accept
    stream
        .write_all(b"GET /notes.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"some plain text notes\n");
}

#[test]
fn test_split_delivery_matches_single_delivery() {
    let server = TestServer::start("split", 16, Duration::from_secs(10));

    let mut whole = server.connect();
    whole.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (whole_head, whole_body) = read_response(&mut whole);

    let mut split = server.connect();
    split.write_all(b"GET / HT").unwrap();
    thread::sleep(Duration::from_millis(100));
    split.write_all(b"TP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (split_head, split_body) = read_response(&mut split);

    assert_eq!(whole_head, split_head);
    assert_eq!(whole_body, split_body);
    assert_eq!(split_body, b"hello world");
}

#[test]
fn test_capacity_backpressure_replies_503() {
    let server = TestServer::start("capacity", 1, Duration::from_secs(10));

    // Occupy the single slot; a served response proves it is registered
    let mut first = server.connect();
    first.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

    // The next connection is turned away with the fixed payload and closed
    let mut second = server.connect();
    let (head, body) = read_response(&mut second);
    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"Server is at capacity");

    let mut tmp = [0u8; 16];
    assert_eq!(second.read(&mut tmp).unwrap(), 0);

    // The occupant is still being served
    first.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_idle_connection_expires() {
    let server = TestServer::start("idle", 16, Duration::from_millis(300));
    let mut stream = server.connect();

    // Send nothing; the sweep should close the connection
    let mut tmp = [0u8; 16];
    assert_eq!(stream.read(&mut tmp).unwrap(), 0);
}

#[test]
fn test_oversized_request_is_rejected() {
    // Fill the 4096-byte receive buffer exactly, with no terminator in sight
    let server = TestServer::start("oversized", 16, Duration::from_secs(10));
    let mut stream = server.connect();

    let request_line = b"GET / HTTP/1.1\r\n";
    let filler = format!("X-Filler: {}\r\n", "y".repeat(4096 - request_line.len() - 12));
    stream.write_all(request_line).unwrap();
    stream.write_all(filler.as_bytes()).unwrap();

    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 414 URI Too Long\r\n"));

    let mut tmp = [0u8; 16];
    assert_eq!(stream.read(&mut tmp).unwrap(), 0);
}
