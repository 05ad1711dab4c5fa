//! Error types for the request layer.
//!
//! Every failure a caller can observe from `RequestManager::request` is a
//! `NetError`. The type is `Clone` because one outcome is shared by every
//! caller that asked for the same URL while the first exchange was running.

use crate::network::TransportError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for the request layer.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    // Contract errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Offline { url: String, message: String },

    // Network errors
    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    /// A transient server failure (408 / 5xx) that outlived its retry budget,
    /// or a non-2xx seen before a custom processor took over.
    #[error("{url}: {message}")]
    Response {
        url: String,
        status: u16,
        message: String,
    },

    // Authentication errors
    #[error("{url}: {message}")]
    OneTimePassword { url: String, message: String },

    #[error("{message}")]
    Unauthorized { server: String, message: String },

    // Response body errors
    #[error("{url}: {message}")]
    ServerBody { url: String, message: String },

    #[error("{url}: {message}")]
    Request {
        url: String,
        status: u16,
        message: String,
    },

    #[error("{url}: request was dropped before it completed")]
    Abandoned { url: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },
}

/// Result type alias for request-layer operations.
pub type Result<T> = std::result::Result<T, NetError>;

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Io {
            message: err.to_string(),
            path: None,
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl NetError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        NetError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(Arc::new(err)),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        NetError::Config {
            message: message.into(),
        }
    }

    /// Wrap a transport failure with the URL it was issued for.
    pub fn transport(url: impl Into<String>, source: TransportError) -> Self {
        NetError::Transport {
            url: url.into(),
            source,
        }
    }

    /// HTTP status attached to this error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            NetError::Response { status, .. } | NetError::Request { status, .. } => Some(*status),
            NetError::OneTimePassword { .. } | NetError::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    /// Check if this error is a one-time-password challenge.
    pub fn is_one_time_password(&self) -> bool {
        matches!(self, NetError::OneTimePassword { .. })
    }

    /// Check if this error came from the network rather than the server.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Transport { .. })
            || matches!(self, NetError::Response { status, .. } if *status == 408 || *status >= 500)
    }
}
