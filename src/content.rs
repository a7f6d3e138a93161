use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// A map of file extensions to content types
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("json", "application/json"),
    ("txt", "text/plain"),
];

/// Get the content type for a file based on its extension.
///
/// Files without an extension, or with an extension the table does not
/// cover, are served as a generic binary type.
pub fn content_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    CONTENT_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, t)| *t)
        .unwrap_or("application/octet-stream")
}

/// Why a content lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentError {
    NotFound,
    Forbidden,
    ReadError,
}

/// An opened piece of content: its byte length plus a readable handle.
///
/// The handle is owned by whoever holds the `Content` and is released when
/// it is dropped, on success and error paths alike.
pub struct Content {
    pub len: u64,
    pub reader: Box<dyn Read + Send>,
}

/// Resolves validated, traversal-free relative paths to readable content
pub trait ContentProvider {
    fn resolve(&self, path: &str) -> Result<Content, ContentError>;
}

/// Content provider backed by a directory on the local filesystem
pub struct FsContentProvider {
    root: PathBuf,
}

impl FsContentProvider {
    /// Create a provider serving files under the given root directory
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl ContentProvider for FsContentProvider {
    fn resolve(&self, path: &str) -> Result<Content, ContentError> {
        let full_path = self.root.join(path.trim_start_matches('/'));

        let file = File::open(&full_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ContentError::NotFound,
            io::ErrorKind::PermissionDenied => ContentError::Forbidden,
            _ => ContentError::ReadError,
        })?;

        let metadata = file.metadata().map_err(|_| ContentError::ReadError)?;
        if metadata.is_dir() {
            return Err(ContentError::Forbidden);
        }

        Ok(Content {
            len: metadata.len(),
            reader: Box::new(file),
        })
    }
}
