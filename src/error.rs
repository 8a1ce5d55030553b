//! Per-document failure taxonomy.
//!
//! A [`SyncError`] never escapes a mapping's cycle: the orchestrator turns it
//! into a `failed` report entry and moves on to the next document.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{}: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state store: {0}")]
    State(String),

    #[error("unsafe document name: {0}")]
    UnsafePath(String),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn local(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Local {
            path: path.into(),
            source,
        }
    }

    pub fn state(err: anyhow::Error) -> Self {
        SyncError::State(format!("{:#}", err))
    }

    /// Transient remote failures and local I/O that may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Local { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, SyncError::Remote(RemoteError::VersionConflict { .. }))
    }
}

/// I/O failures caused by a file being briefly locked or busy.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_local_errors() {
        let busy = SyncError::local("a.md", io::Error::new(io::ErrorKind::WouldBlock, "locked"));
        assert!(busy.is_retryable());

        let denied = SyncError::local(
            "a.md",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!denied.is_retryable());
        assert_eq!(denied.to_string(), "a.md: denied");
    }

    #[test]
    fn remote_errors_keep_their_classification() {
        let err: SyncError = RemoteError::Timeout.into();
        assert!(err.is_retryable());

        let err: SyncError = RemoteError::VersionConflict {
            id: "p".into(),
            expected: Some("1".into()),
            actual: Some("2".into()),
        }
        .into();
        assert!(!err.is_retryable());
        assert!(err.is_version_conflict());
    }
}
