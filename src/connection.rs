use crate::buffer::RecvBuffer;
use crate::content::ContentProvider;
use crate::http::{HttpError, HttpHandler, INTERNAL_ERROR};
use log::{debug, error};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Represents the current state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Currently receiving request bytes
    ReadRequest,
    /// Request complete, generating the response
    Process,
    /// Sending response bytes back to the client
    WriteResponse,
    /// Terminal; the event loop deregisters and drops the connection
    Close,
}

/// One client connection and its request/response state machine.
///
/// The connection exclusively owns its socket, receive buffer and pending
/// response. It is created on accept and dropped when it reaches `Close`.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: ConnectionState,
    recv_buf: RecvBuffer,
    response: Vec<u8>,
    bytes_sent: usize,
    keep_alive: bool,
    request_error: Option<HttpError>,
    last_activity: Instant,
}

impl Connection {
    /// Create a new connection from an accepted, non-blocking TcpStream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, buffer_capacity: usize) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer_addr,
            state: ConnectionState::ReadRequest,
            recv_buf: RecvBuffer::new(buffer_capacity),
            response: Vec::new(),
            bytes_sent: 0,
            keep_alive: false,
            request_error: None,
            last_activity: Instant::now(),
        })
    }

    /// Drive the state machine for one readiness notification.
    ///
    /// Keeps stepping while transitions happen, so all currently available
    /// data and socket capacity is drained before returning. Required under
    /// edge triggering: parking early could strand bytes in the kernel with
    /// no further notification.
    pub fn process_events(&mut self, handler: &HttpHandler, provider: &dyn ContentProvider) {
        self.last_activity = Instant::now();

        loop {
            let before = self.state;
            match self.state {
                ConnectionState::ReadRequest => self.handle_read(),
                ConnectionState::Process => self.handle_process(handler, provider),
                ConnectionState::WriteResponse => self.handle_write(),
                ConnectionState::Close => return,
            }
            if self.state == before {
                // Parked on WouldBlock; wait for the next readiness edge
                return;
            }
        }
    }

    /// Receive at the buffer's write cursor until the terminator arrives,
    /// the buffer fills, or the socket has nothing more to give.
    fn handle_read(&mut self) {
        loop {
            if self.recv_buf.is_full() {
                // Capacity reached without a terminator: a defined failure,
                // not an overflow
                self.request_error = Some(HttpError::UriTooLong);
                self.state = ConnectionState::Process;
                return;
            }

            match self.recv_buf.read_from(&mut self.stream) {
                Ok(0) => {
                    // Peer closed
                    self.state = ConnectionState::Close;
                    return;
                }
                Ok(_) => {
                    if self.recv_buf.has_terminator() {
                        self.state = ConnectionState::Process;
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("recv from {} failed: {}", self.peer_addr, e);
                    self.state = ConnectionState::Close;
                    return;
                }
            }
        }
    }

    /// Run the protocol handler over the accumulated bytes and serialize
    /// the outcome into the send buffer.
    fn handle_process(&mut self, handler: &HttpHandler, provider: &dyn ContentProvider) {
        let result = match self.request_error.take() {
            Some(err) => Err(err),
            None => handler.handle(self.recv_buf.filled(), provider),
        };

        let response = result.unwrap_or_else(|err| {
            debug!("request from {} failed: {}", self.peer_addr, err);
            handler.error_response(err)
        });

        self.keep_alive = response.keep_alive;
        self.response.clear();
        self.bytes_sent = 0;

        if let Err(e) = response.serialize(&mut self.response) {
            // Fall back to the fixed minimal reply rather than attempting
            // further dynamic construction
            error!("serializing response for {} failed: {}", self.peer_addr, e);
            self.response.clear();
            self.response.extend_from_slice(INTERNAL_ERROR);
            self.keep_alive = false;
        }

        self.state = ConnectionState::WriteResponse;
    }

    /// Send the remaining unsent response bytes.
    fn handle_write(&mut self) {
        while self.bytes_sent < self.response.len() {
            match self.stream.write(&self.response[self.bytes_sent..]) {
                Ok(0) => {
                    self.state = ConnectionState::Close;
                    return;
                }
                Ok(n) => self.bytes_sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("send to {} failed: {}", self.peer_addr, e);
                    self.state = ConnectionState::Close;
                    return;
                }
            }
        }

        // Response fully drained
        if self.keep_alive {
            self.reset();
        } else {
            self.state = ConnectionState::Close;
        }
    }

    /// Reset per-request state so the next request can reuse the socket
    fn reset(&mut self) {
        self.recv_buf.clear();
        self.response.clear();
        self.bytes_sent = 0;
        self.keep_alive = false;
        self.request_error = None;
        self.state = ConnectionState::ReadRequest;
    }

    /// Check whether the connection has been idle longer than the timeout
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Get the connection's peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the current state of the connection
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
