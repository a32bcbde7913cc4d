use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("key not found")]
    KeyNotFound,
    #[error("version {0} no longer exists")]
    VersionNoLongerExist(u64),
    #[error("out of free chunks during write or compaction")]
    WriteAmplificationFull,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to open storage pool: {0}")]
    PoolOpen(String),
    #[error("pool geometry mismatch: {0}")]
    PoolSizeMismatch(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected internal find result")]
    Unknown,
}

impl DbError {
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Outcome of a trie descent, before translation into a caller-visible error.
///
/// `RootNotFound` covers both an evicted version and a version that was never
/// written; the facade maps it to [`DbError::VersionNoLongerExist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    Success,
    KeyNotFound,
    /// The walk ended inside a node's compressed path fragment.
    KeyEndsEarly,
    /// The key diverges from the stored path fragment.
    PathMismatch,
    RootNotFound,
    VersionEvicted,
}

impl FindResult {
    pub fn is_success(self) -> bool {
        matches!(self, FindResult::Success)
    }
}

pub(crate) fn find_result_to_db_error(result: FindResult, version: u64) -> DbError {
    match result {
        FindResult::Success => DbError::Unknown,
        FindResult::KeyNotFound | FindResult::KeyEndsEarly | FindResult::PathMismatch => {
            DbError::KeyNotFound
        }
        FindResult::RootNotFound | FindResult::VersionEvicted => {
            DbError::VersionNoLongerExist(version)
        }
    }
}
