//! Error types for bamrange

use crate::io::bam::error::BamDecodeError;
use thiserror::Error;

/// Result type alias for bamrange operations
pub type Result<T> = std::result::Result<T, BamError>;

/// Error types that can occur while reading indexed BAM data
///
/// Failures fall into two families: corrupt or truncated data
/// ([`is_format_error`](BamError::is_format_error)) and failures of the
/// byte-range fetch layer ([`is_fetch_error`](BamError::is_fetch_error)).
#[derive(Debug, Error)]
pub enum BamError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed container data (bad magic, truncated header/index, bad block)
    #[error("Invalid {context}: {message}")]
    Format {
        /// Which structure was being decoded ("BGZF block", "BAI index", ...)
        context: &'static str,
        /// Error message
        message: String,
    },

    /// Alignment record or header field could not be decoded
    #[error("BAM decode error: {0}")]
    Decode(#[from] BamDecodeError),

    /// Byte-range fetch failed
    #[error("Fetch failed for {path}: {message}")]
    Fetch {
        /// Resource that was being read
        path: String,
        /// Error message
        message: String,
    },

    /// Invalid query arguments
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// HTTP error
    #[cfg(feature = "network")]
    #[error("HTTP error {status}: {url}")]
    Http {
        /// HTTP status code
        status: u16,
        /// URL that failed
        url: String,
    },

    /// Network timeout
    #[cfg(feature = "network")]
    #[error("Network timeout after {seconds}s: {url}")]
    Timeout {
        /// Timeout duration in seconds
        seconds: u64,
        /// URL that timed out
        url: String,
    },
}

impl BamError {
    pub(crate) fn format(context: &'static str, message: impl Into<String>) -> Self {
        BamError::Format {
            context,
            message: message.into(),
        }
    }

    pub(crate) fn fetch(path: &str, message: impl Into<String>) -> Self {
        BamError::Fetch {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// True when the data itself is corrupt or truncated.
    pub fn is_format_error(&self) -> bool {
        matches!(self, BamError::Format { .. } | BamError::Decode(_))
    }

    /// True when the failure came from reading bytes (file, network).
    pub fn is_fetch_error(&self) -> bool {
        match self {
            BamError::Io(_) | BamError::Fetch { .. } => true,
            #[cfg(feature = "network")]
            BamError::Http { .. } | BamError::Timeout { .. } => true,
            _ => false,
        }
    }
}
