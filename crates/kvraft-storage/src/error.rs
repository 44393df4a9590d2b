//! # error
//!
//! what: every way persistence or the mvcc engine can fail

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Damage that recovery must not paper over
    #[error("corrupt data in {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("entry applied out of order: expected index {expected}, got {got}")]
    OutOfOrderApply { expected: u64, got: u64 },

    #[error("revision {requested} has been compacted (history starts after {compacted})")]
    Compacted { requested: u64, compacted: u64 },

    #[error("revision {requested} is ahead of the current revision {current}")]
    FutureRevision { requested: u64, current: u64 },

    #[error("refusing to persist term {attempted} over stored term {stored}")]
    TermRegression { stored: u64, attempted: u64 },
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
