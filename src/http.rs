use crate::content::{content_type, ContentError, ContentProvider};
use bytes::Bytes;
use log::debug;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Longest accepted request method, in bytes
const MAX_METHOD_LEN: usize = 8;
/// Longest accepted request path, in bytes
const MAX_PATH_LEN: usize = 256;
/// Longest accepted version token, in bytes
const MAX_VERSION_LEN: usize = 16;

/// Advisory keep-alive parameters sent back to clients
const KEEP_ALIVE_TIMEOUT_SECS: u64 = 10;
const KEEP_ALIVE_MAX_REQUESTS: u32 = 100;

/// Fixed reply for connections rejected at capacity, written without
/// allocating a connection.
pub const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain\r\n\
Content-Length: 21\r\n\
Connection: close\r\n\
\r\n\
Server is at capacity";

/// Fixed minimal reply used when response serialization itself fails
pub const INTERNAL_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\
\r\n";

/// HTTP status codes the server can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    UriTooLong = 414,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    VersionNotSupported = 505,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Get the reason phrase for this status code
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::UriTooLong => "URI Too Long",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
            Status::VersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

/// Protocol-level failures, each mapped to a fixed response status
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    #[error("failed to parse request")]
    Malformed,
    #[error("http method not supported")]
    MethodNotSupported,
    #[error("http version not supported")]
    VersionNotSupported,
    #[error("request line too long")]
    UriTooLong,
    #[error("forbidden file path")]
    Forbidden,
    #[error("file not found")]
    NotFound,
    #[error("reading of file failed")]
    ReadFailed,
}

impl HttpError {
    pub fn status(self) -> Status {
        match self {
            HttpError::Malformed => Status::BadRequest,
            HttpError::Forbidden => Status::Forbidden,
            HttpError::NotFound => Status::NotFound,
            HttpError::MethodNotSupported => Status::MethodNotAllowed,
            HttpError::UriTooLong => Status::UriTooLong,
            HttpError::VersionNotSupported => Status::VersionNotSupported,
            HttpError::ReadFailed => Status::InternalServerError,
        }
    }
}

impl From<ContentError> for HttpError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::NotFound => HttpError::NotFound,
            ContentError::Forbidden => HttpError::Forbidden,
            ContentError::ReadError => HttpError::ReadFailed,
        }
    }
}

/// A parsed request line. Borrows from the receive buffer, so it is only
/// valid until the buffer is reused.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub version: &'a str,
}

/// Parse the space-delimited `method path version` triple from the first
/// line of the request.
pub fn parse_request_line(buf: &[u8]) -> Result<Request<'_>, HttpError> {
    let line_end = buf
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(HttpError::Malformed)?;
    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| HttpError::Malformed)?;

    let mut parts = line.split(' ');
    let method = parts.next().ok_or(HttpError::Malformed)?;
    let path = parts.next().ok_or(HttpError::Malformed)?;
    let version = parts.next().ok_or(HttpError::Malformed)?;
    if method.is_empty() || path.is_empty() || version.is_empty() || parts.next().is_some() {
        return Err(HttpError::Malformed);
    }

    if method.len() > MAX_METHOD_LEN || path.len() > MAX_PATH_LEN || version.len() > MAX_VERSION_LEN
    {
        return Err(HttpError::UriTooLong);
    }

    Ok(Request {
        method,
        path,
        version,
    })
}

/// Negotiate connection reuse from the request's `Connection` header.
/// Defaults to keep-alive unless the client explicitly asked to close.
fn wants_keep_alive(raw: &[u8]) -> bool {
    for line in raw.split(|&b| b == b'\n') {
        let line = match std::str::from_utf8(line) {
            Ok(l) => l.trim_end_matches('\r'),
            Err(_) => continue,
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("connection") {
                return !value.trim().eq_ignore_ascii_case("close");
            }
        }
    }
    true
}

/// The body of a response: inline bytes, or a handle to provider content
/// plus its byte length.
pub enum Body {
    Inline(Bytes),
    Content {
        reader: Box<dyn Read + Send>,
        len: u64,
    },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Inline(bytes) => bytes.len() as u64,
            Body::Content { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response descriptor, owned by the connection until fully transmitted
pub struct Response {
    pub status: Status,
    pub content_type: &'static str,
    pub keep_alive: bool,
    pub body: Body,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("keep_alive", &self.keep_alive)
            .field("body", &self.body)
            .finish()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Inline(bytes) => f.debug_tuple("Inline").field(bytes).finish(),
            Body::Content { len, .. } => {
                f.debug_struct("Content").field("len", len).finish()
            }
        }
    }
}

impl Response {
    pub fn content_length(&self) -> u64 {
        self.body.len()
    }

    /// Serialize status line, headers and body into one contiguous buffer.
    ///
    /// Consumes the response; a `Content` body handle is drained here and
    /// released on return, whether serialization succeeds or fails.
    pub fn serialize(self, out: &mut Vec<u8>) -> io::Result<()> {
        write!(
            out,
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             X-Content-Type-Options: nosniff\r\n\
             X-Frame-Options: DENY\r\n",
            self.status.code(),
            self.status.reason(),
            self.content_type,
            self.content_length(),
        )?;

        if self.keep_alive {
            write!(
                out,
                "Connection: keep-alive\r\nKeep-Alive: timeout={}, max={}\r\n",
                KEEP_ALIVE_TIMEOUT_SECS, KEEP_ALIVE_MAX_REQUESTS
            )?;
        } else {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");

        match self.body {
            Body::Inline(bytes) => out.extend_from_slice(&bytes),
            Body::Content { reader, len } => {
                let copied = io::copy(&mut reader.take(len), out)?;
                if copied < len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "content shorter than its advertised length",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Stateless transform from raw request bytes and content access to a
/// response descriptor. Holds no I/O state of its own.
pub struct HttpHandler {
    default_document: String,
}

impl HttpHandler {
    pub fn new(default_document: &str) -> Self {
        Self {
            default_document: default_document.to_string(),
        }
    }

    /// Process one accumulated request.
    ///
    /// Every step short-circuits on failure; the caller maps the error to
    /// its response through `error_response`.
    pub fn handle(
        &self,
        raw: &[u8],
        provider: &dyn ContentProvider,
    ) -> Result<Response, HttpError> {
        let request = parse_request_line(raw)?;

        if request.method != "GET" {
            return Err(HttpError::MethodNotSupported);
        }
        if request.version != "HTTP/1.1" && request.version != "HTTP/1.0" {
            return Err(HttpError::VersionNotSupported);
        }

        // Rejected before resolution, whether or not the file would exist
        if request.path.contains("..") {
            return Err(HttpError::Forbidden);
        }

        let document = if request.path == "/" {
            self.default_document.as_str()
        } else {
            request.path.trim_start_matches('/')
        };

        let keep_alive = wants_keep_alive(raw);
        let content = provider.resolve(document)?;

        debug!(
            "{} {} {} -> 200 OK",
            request.method, request.path, request.version
        );

        Ok(Response {
            status: Status::Ok,
            content_type: content_type(document),
            keep_alive,
            body: Body::Content {
                reader: content.reader,
                len: content.len,
            },
        })
    }

    /// Build the mapped error response for a protocol failure.
    /// Error replies always close the connection.
    pub fn error_response(&self, err: HttpError) -> Response {
        Response {
            status: err.status(),
            content_type: "text/html",
            keep_alive: false,
            body: Body::Inline(Bytes::new()),
        }
    }
}
