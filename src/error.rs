use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RefreshError>;

/// Errors raised by the refresh engine.
///
/// `NotFound`, `Corruption`, `Ledger`, `Config` and a root-level `Permission`
/// abort a run. Everything else is per-file: it is written to the ledger and
/// counted in the summary.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("permission denied: {path}")]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger {path} is corrupt: {detail}")]
    Corruption { path: PathBuf, detail: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {waited_ms}ms waiting for {path}")]
    Timeout { path: PathBuf, waited_ms: u64 },

    #[error("cannot write ledger {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RefreshError {
    /// Map an io error on `path`, keeping NotFound / PermissionDenied distinct.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => RefreshError::NotFound(path),
            io::ErrorKind::PermissionDenied => RefreshError::Permission { path, source },
            _ => RefreshError::Io { path, source },
        }
    }

    /// Short stable tag, used in the ledger `lastError` and the failure log.
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshError::NotFound(_) => "NOT_FOUND",
            RefreshError::Permission { .. } => "PERMISSION",
            RefreshError::Corruption { .. } => "CORRUPTION",
            RefreshError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            RefreshError::Io { .. } => "IO",
            RefreshError::Timeout { .. } => "TIMEOUT",
            RefreshError::Ledger { .. } => "LEDGER",
            RefreshError::Config(_) => "CONFIG",
        }
    }

    /// Errors after which the run cannot continue safely.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RefreshError::Corruption { .. } | RefreshError::Ledger { .. } | RefreshError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_io_keeps_not_found_and_permission_apart() {
        let nf = RefreshError::from_io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(nf, RefreshError::NotFound(_)));

        let pd = RefreshError::from_io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(pd.kind(), "PERMISSION");

        let other = RefreshError::from_io("/x", io::Error::other("disk on fire"));
        assert_eq!(other.kind(), "IO");
        assert!(!other.is_fatal());
    }

    #[test]
    fn ledger_errors_are_fatal() {
        let e = RefreshError::Ledger {
            path: PathBuf::from("/l.json"),
            source: io::Error::other("full"),
        };
        assert!(e.is_fatal());
        assert!(e.to_string().contains("/l.json"));
    }
}
