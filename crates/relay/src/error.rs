// Error types for the relay
//
// Each subsystem has its own error enum so callers can decide locally whether
// a failure aborts the subsystem or is logged and skipped. Only `Config` and
// `Connect` ever escape `Relay::run`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Top-level relay error
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Streaming subscription could not be established
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no cache directory configured and no user cache directory available")]
    NoCacheDir,

    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("keepAlive must be between 1 and 2147483647 seconds, got {value}")]
    InvalidKeepAlive { value: u64 },

    #[error("invalid endpoint URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Errors establishing the streaming subscription
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("handshake with {url} timed out after {timeout:?}")]
    HandshakeTimeout { url: String, timeout: Duration },

    #[error("websocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("invalid request header {name}")]
    InvalidHeader { name: &'static str },

    #[error("proxy {proxy} refused the tunnel: {reason}")]
    Proxy { proxy: String, reason: String },

    #[error("failed to talk to proxy {proxy}: {source}")]
    ProxyIo {
        proxy: String,
        #[source]
        source: std::io::Error,
    },
}

/// Checkpoint store errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Notification sink errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no notification utility found (tried {tried})")]
    NoBackend { tried: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Status { program: String, status: String },

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Gap-fill fetch errors (abort the fetch, never the process)
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("line longer than {limit} bytes in poll response")]
    LineTooLong { limit: usize },
}
