//! Error types for Silt operations
//!
//! Every failure surfaced by the engine is a SiltError variant carrying
//! enough context (paths, offsets, sizes) to diagnose it without a debugger.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Silt error types with detailed context
#[derive(Debug, Clone)]
pub enum SiltError {
    /// Invalid key or configuration value. The caller's operation fails
    /// with no state change.
    Config {
        /// Human-readable description of what was rejected
        message: String,
    },

    /// A value could not be encoded. Fails the specific write; other
    /// batched writes proceed.
    Serialization {
        /// Description of the encoding failure
        message: String,
    },

    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A record read requested more bytes than the file holds
    ShortRead {
        /// File being read
        path: PathBuf,
        /// Byte offset of the record start
        offset: u64,
        /// Bytes the record metadata claimed
        wanted: u32,
        /// Bytes actually available from the offset
        available: u64,
    },

    /// Malformed record, WAL entry, or index document
    Corruption {
        /// Description of what failed to decode
        reason: String,
    },

    /// Operation arrived in a state that cannot serve it
    /// (engine closing/closed, or re-entrant compaction)
    Lifecycle {
        /// The operation that was rejected
        operation: &'static str,
        /// The state that rejected it
        state: &'static str,
    },
}

impl SiltError {
    /// Build an Io variant from a path, a short description, and the
    /// underlying error.
    pub fn io_at(path: &Path, what: &str, err: io::Error) -> Self {
        SiltError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Build a Corruption variant.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        SiltError::Corruption { reason: reason.into() }
    }
}

impl fmt::Display for SiltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiltError::Config { message } => {
                write!(f, "Configuration error: {}", message)
            }

            SiltError::Serialization { message } => {
                write!(f, "Serialization error: {}", message)
            }

            SiltError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            SiltError::ShortRead { path, offset, wanted, available } => {
                write!(
                    f,
                    "Short read in {} at offset {}: wanted {} bytes, only {} available",
                    path.display(),
                    offset,
                    wanted,
                    available
                )
            }

            SiltError::Corruption { reason } => {
                write!(f, "Corrupt data: {}", reason)
            }

            SiltError::Lifecycle { operation, state } => {
                write!(f, "Cannot {} while {}", operation, state)
            }
        }
    }
}

impl Error for SiltError {}

/// Convert std::io::Error to SiltError::Io without path context
impl From<io::Error> for SiltError {
    fn from(err: io::Error) -> Self {
        SiltError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Silt operations
pub type SiltResult<T> = Result<T, SiltError>;
