use std::io;

use thiserror::Error;

/// Errors of checksummed state files and the durable queue.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Stored data fails its checksum and no good copy exists.
    #[error("Persist {path} corrupt: {message}")]
    PersistCorrupt { path: String, message: String },

    /// Storage is not usable: permissions, full disk, missing directory.
    #[error("Persist {path} unavailable: {source}")]
    PersistCritical {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Queue closed")]
    Closed,

    #[error("Queue entry id={id} not found")]
    NotFound { id: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn corrupt(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PersistCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn critical(path: impl Into<String>, source: io::Error) -> Self {
        Self::PersistCritical {
            path: path.into(),
            source,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::PersistCritical { .. })
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::PersistCorrupt { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
