use crate::http::SERVICE_UNAVAILABLE;
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

/// Outcome of a single acceptance attempt
pub enum AcceptOutcome {
    /// An admitted, non-blocking stream ready for registration
    Admitted(TcpStream, SocketAddr),
    /// This attempt produced nothing; keep draining the queue
    Skipped,
    /// The accept queue is drained for now
    Drained,
}

/// The Acceptor owns the listening socket and turns read readiness into
/// admitted connections, applying the capacity backpressure policy before
/// anything is registered with the event loop.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    /// Bind the listening socket with address reuse and the given backlog
    pub fn bind<A: ToSocketAddrs>(addr: A, backlog: i32) -> io::Result<Self> {
        let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "No socket addresses found")
        })?;

        let domain = if socket_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(socket_addr))?;
        socket.listen(backlog)?;

        Ok(Self {
            listener: socket.into(),
        })
    }

    /// Get the local address this acceptor is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Attempt to accept one pending connection.
    ///
    /// Callers loop on this until `Drained`, which is required under edge
    /// triggering: several connections can be pending behind one readiness
    /// notification.
    ///
    /// Policy:
    /// - at capacity: the peer gets the fixed 503 payload and is closed
    ///   without ever reaching the state machine;
    /// - out of descriptors: transient, logged and skipped;
    /// - would-block / interrupted / aborted-before-accept: silently ignored;
    /// - anything else is fatal and propagates to process shutdown.
    pub fn accept_next(
        &self,
        open_connections: usize,
        max_connections: usize,
    ) -> io::Result<AcceptOutcome> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                if open_connections >= max_connections {
                    Self::reject_at_capacity(stream, peer_addr);
                    return Ok(AcceptOutcome::Skipped);
                }

                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("failed to make socket for {} non-blocking: {}", peer_addr, e);
                    return Ok(AcceptOutcome::Skipped);
                }

                Ok(AcceptOutcome::Admitted(stream, peer_addr))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(AcceptOutcome::Drained),
            Err(ref e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::ConnectionAborted =>
            {
                Ok(AcceptOutcome::Skipped)
            }
            Err(ref e)
                if e.raw_os_error() == Some(libc::EMFILE)
                    || e.raw_os_error() == Some(libc::ENFILE) =>
            {
                warn!("descriptor limit reached, cannot accept more clients");
                Ok(AcceptOutcome::Drained)
            }
            Err(e) => Err(e),
        }
    }

    fn reject_at_capacity(mut stream: TcpStream, peer_addr: SocketAddr) {
        debug!("rejecting {}: server is at capacity", peer_addr);
        // Best effort; the socket closes either way
        let _ = stream.write_all(SERVICE_UNAVAILABLE);
    }
}

impl AsRawFd for Acceptor {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}
