use crate::error::ServerResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // Network configuration
    pub listen_address: String,
    pub port: u16,
    pub backlog: i32,

    // Connection settings
    pub max_connections: usize,
    pub recv_buffer_size: usize,
    pub idle_timeout: Duration,

    // Event loop settings
    pub max_events: usize,
    pub poll_timeout: Duration,

    // Content settings
    pub document_root: PathBuf,
    pub index_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 9034,
            backlog: 128,

            max_connections: 1024,
            recv_buffer_size: 4096,
            idle_timeout: Duration::from_secs(10),

            max_events: 128,
            poll_timeout: Duration::from_secs(1),

            document_root: PathBuf::from("public"),
            index_file: "index.html".to_string(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address and port to listen on
    pub fn with_address(mut self, address: &str, port: u16) -> Self {
        self.listen_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the directory served files are resolved against
    pub fn with_document_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.document_root = root.into();
        self
    }

    /// Set the maximum number of simultaneously open connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Get the full address string (address:port)
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_json_file<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
