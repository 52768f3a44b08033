//! Error types for scp-sync.
//!
//! Every failure a caller can observe falls into one of a few kinds:
//! - the path is not owned by any live connection
//! - the connection handshake failed
//! - a remote tool exited nonzero or complained on stderr
//! - a computed remote path would escape the mapped root
//!
//! Callers are expected to turn these into status messages; none of them
//! should take the process down.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by connections, mappings and transfers.
#[derive(Error, Debug)]
pub enum ScpError {
    /// No registered mapping owns this path.
    #[error("No SCP connection for {}", path.display())]
    NotConnected { path: PathBuf },

    /// Handshake probe failed; the connection was never registered.
    #[error("SCP: {0}")]
    Connection(String),

    /// Remote command returned nonzero, or wrote to stderr without stdout.
    #[error("Remote command failed: {0}")]
    Command(String),

    /// The remote path would escape the mapped root.
    #[error("Invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Mapping file or settings could not be read.
    #[error("Invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// External tool could not be started at all.
    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Aggregate failure of an archive based transfer.
    #[error("Bulk transfer of {} failed: {reason}", dir.display())]
    Bulk { dir: PathBuf, reason: String },

    /// Local I/O errors (temp files, archive building, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used when mapping errors to user-visible messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConnected,
    Connection,
    Command,
    InvalidPath,
    Local,
}

impl ScpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Command(_) | Self::Bulk { .. } => ErrorKind::Command,
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::Config { .. } | Self::Spawn { .. } | Self::Io(_) => ErrorKind::Local,
        }
    }

    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_connected(path: impl Into<PathBuf>) -> Self {
        Self::NotConnected { path: path.into() }
    }
}

pub type Result<T, E = ScpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ScpError::not_connected("/work/site").to_string(),
            "No SCP connection for /work/site"
        );
        assert_eq!(
            ScpError::invalid_path("/etc/passwd", "outside of mapped root").to_string(),
            "Invalid path /etc/passwd: outside of mapped root"
        );
        assert_eq!(
            ScpError::Command("permission denied".into()).to_string(),
            "Remote command failed: permission denied"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(ScpError::not_connected("/x").kind(), ErrorKind::NotConnected);
        assert_eq!(
            ScpError::Connection("connection failed!".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            ScpError::Bulk {
                dir: "/x".into(),
                reason: "boom".into()
            }
            .kind(),
            ErrorKind::Command
        );
        let io = std::io::Error::other("disk full");
        assert_eq!(ScpError::from(io).kind(), ErrorKind::Local);
    }
}
