use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which file a parse failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Canonical,
    Legacy,
    Recovered,
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileRole::Canonical => "canonical",
            FileRole::Legacy => "legacy",
            FileRole::Recovered => "recovered",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to parse {role} log at {path}: {source}")]
    Parse {
        role: FileRole,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize records for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to resolve directory for task '{task_id}': {source}")]
    DirectoryResolution {
        task_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config at {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl StoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn parse(role: FileRole, path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            role,
            path: path.into(),
            source,
        }
    }

    /// True when history exists on disk but could not be parsed.
    ///
    /// Callers use this to tell a corrupted log apart from every other failure
    /// and decide whether to alert the user.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// Why an advisory lock could not be taken or given back.
///
/// Never fatal to a store operation; see [`crate::lock::LockState`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock at {path} still held after {attempts} attempts")]
    Contended { path: PathBuf, attempts: u32 },

    #[error("I/O error while {operation} lock at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock at {path} was taken over by another owner")]
    Compromised { path: PathBuf },
}

impl LockError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
