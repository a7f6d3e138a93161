use crate::acceptor::{AcceptOutcome, Acceptor};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionState};
use crate::content::ContentProvider;
use crate::error::ServerResult;
use crate::http::HttpHandler;
use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Interest mask for the listening socket
const LISTENER_INTEREST: u32 = EPOLLIN as u32;

/// Interest mask for client connections: edge-triggered read/write
/// readiness plus peer half-close
const CONNECTION_INTEREST: u32 = (EPOLLIN | EPOLLOUT | EPOLLET | EPOLLRDHUP) as u32;

/// Event bits treated uniformly as an immediate close signal, overriding
/// anything else reported in the same notification
const CLOSE_BITS: u32 = (EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32;

/// Cooperative shutdown flag, shared between the event loop and signal
/// handlers. Passed into `run` explicitly rather than living in a global.
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown; the event loop notices within one poll timeout
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Thin wrapper around an epoll instance
pub struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    max_events: usize,
}

impl Poller {
    /// Create a new poller. Failure here is process-fatal; readiness
    /// notification cannot be recovered mid-run.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll_fd,
            events: Vec::with_capacity(max_events),
            max_events,
        })
    }

    /// Register a descriptor with the given interest mask
    pub fn register(&mut self, fd: RawFd, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };

        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Remove a descriptor from the interest set
    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Wait for readiness, returning (descriptor, event bits) pairs.
    /// An interrupted wait is not an error, just an empty round.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<(RawFd, u32)>> {
        self.events.clear();
        self.events
            .resize(self.max_events, libc::epoll_event { events: 0, u64: 0 });

        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.max_events as i32,
                timeout.as_millis() as i32,
            )
        };

        if num_events < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        Ok(self.events[..num_events as usize]
            .iter()
            .map(|event| (event.u64 as RawFd, event.events))
            .collect())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// The reactor: owns the descriptor registration table and turns readiness
/// notifications into dispatch calls on the acceptor or a connection.
///
/// A ready descriptor resolves to its handler by table lookup; the listening
/// descriptor is the one tagged entry that is not a connection.
pub struct EventLoop {
    poller: Poller,
    acceptor: Acceptor,
    connections: HashMap<RawFd, Connection>,
    handler: HttpHandler,
    provider: Box<dyn ContentProvider + Send>,
    config: ServerConfig,
}

impl EventLoop {
    /// Bind the listener, create the poller and register the listening
    /// descriptor. Any failure here is fatal to startup.
    pub fn new(
        config: ServerConfig,
        provider: Box<dyn ContentProvider + Send>,
    ) -> ServerResult<Self> {
        let mut poller = Poller::new(config.max_events)?;
        let acceptor = Acceptor::bind(config.socket_address(), config.backlog)?;
        poller.register(acceptor.as_raw_fd(), LISTENER_INTEREST)?;

        let handler = HttpHandler::new(&config.index_file);

        info!("listening on {}", acceptor.local_addr()?);

        Ok(Self {
            poller,
            acceptor,
            connections: HashMap::new(),
            handler,
            provider,
            config,
        })
    }

    /// Get the address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Run until the shutdown token is triggered.
    ///
    /// The wait timeout bounds how long a shutdown request or an idle
    /// connection can go unnoticed.
    pub fn run(&mut self, shutdown: &ShutdownToken) -> ServerResult<()> {
        while !shutdown.is_triggered() {
            self.poll_once()?;
        }

        info!(
            "shutdown requested, closing {} open connection(s)",
            self.connections.len()
        );
        self.close_all();
        Ok(())
    }

    /// Wait for readiness once and dispatch every ready descriptor exactly
    /// once, then expire idle connections.
    pub fn poll_once(&mut self) -> ServerResult<()> {
        let events = self.poller.wait(self.config.poll_timeout)?;

        for (fd, event_bits) in events {
            if fd == self.acceptor.as_raw_fd() {
                self.accept_ready()?;
            } else {
                self.dispatch(fd, event_bits);
            }
        }

        self.sweep_idle();
        Ok(())
    }

    /// Accept pending connections until the queue is drained
    fn accept_ready(&mut self) -> ServerResult<()> {
        loop {
            let outcome = self
                .acceptor
                .accept_next(self.connections.len(), self.config.max_connections)?;

            match outcome {
                AcceptOutcome::Admitted(stream, peer_addr) => {
                    let fd = stream.as_raw_fd();
                    let conn = match Connection::new(stream, peer_addr, self.config.recv_buffer_size)
                    {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("failed to set up socket for {}: {}", peer_addr, e);
                            continue;
                        }
                    };

                    if let Err(e) = self.poller.register(fd, CONNECTION_INTEREST) {
                        warn!("failed to register {}: {}", peer_addr, e);
                        continue;
                    }

                    debug!("new connection from {} on fd {}", peer_addr, fd);
                    self.connections.insert(fd, conn);
                }
                AcceptOutcome::Skipped => continue,
                AcceptOutcome::Drained => return Ok(()),
            }
        }
    }

    /// Dispatch one readiness notification to the connection owning the
    /// descriptor
    fn dispatch(&mut self, fd: RawFd, event_bits: u32) {
        // Error and hangup bits override anything else in the notification
        if event_bits & CLOSE_BITS != 0 {
            self.close_connection(fd);
            return;
        }

        let Some(conn) = self.connections.get_mut(&fd) else {
            // Stale notification for a descriptor closed earlier this round
            return;
        };

        conn.process_events(&self.handler, self.provider.as_ref());

        if conn.state() == ConnectionState::Close {
            self.close_connection(fd);
        }
    }

    /// Deregister the descriptor and release all connection resources
    fn close_connection(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            if let Err(e) = self.poller.deregister(fd) {
                warn!("failed to deregister fd {}: {}", fd, e);
            }
            debug!("closed connection from {} on fd {}", conn.peer_addr(), fd);
            // Dropping the connection closes the socket and frees its buffers
        }
    }

    /// Expire connections whose last activity is older than the idle timeout
    fn sweep_idle(&mut self) {
        let timeout = self.config.idle_timeout;
        let expired: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_idle(timeout))
            .map(|(fd, _)| *fd)
            .collect();

        for fd in expired {
            debug!("connection on fd {} timed out", fd);
            self.close_connection(fd);
        }
    }

    fn close_all(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.close_connection(fd);
        }
    }
}
