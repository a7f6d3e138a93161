pub mod acceptor;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod content;
pub mod error;
pub mod event_loop;
pub mod http;

/// Re-exports of common components for easier access
pub use acceptor::{AcceptOutcome, Acceptor};
pub use buffer::RecvBuffer;
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionState};
pub use content::{Content, ContentError, ContentProvider, FsContentProvider};
pub use error::{ServerError, ServerResult};
pub use event_loop::{EventLoop, Poller, ShutdownToken};
pub use http::{Body, HttpError, HttpHandler, Request, Response, Status};
