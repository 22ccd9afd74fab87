//! Error taxonomy for the tree core (spec §7 / SPEC_FULL §10).
//!
//! Every fallible core operation returns [`TreeError`]. I/O and consistency
//! failures latch the owning [`crate::treesystem::TreeSystem`] into a
//! "critical stop" state (see [`crate::treesystem::CriticalStop`]); once
//! latched, every subsequent call returns the same wrapped error.

use std::sync::Arc;

use crate::key::Key;

/// Error surfaced by a [`crate::store::Store`] implementation.
#[derive(Debug, thiserror::Error, Clone)]
pub enum StoreError {
    #[error("store I/O failure: {0}")]
    Io(String),
    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("area {0} not found")]
    MissingArea(u64),
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum TreeError {
    #[error("position {position} out of bounds for key {key:?} (size {size})")]
    OutOfBounds {
        key: Key,
        position: u64,
        size: u64,
    },

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: Key, reason: &'static str },

    #[error("read-only violation during {operation}")]
    ReadOnly { operation: &'static str },

    #[error("copyFrom source aliases its own destination")]
    SelfAliasedCopy,

    #[error("non-sequential version: expected base {expected}, found latest {found}")]
    NonSequentialVersion { expected: u64, found: u64 },

    #[error("consistency violation: {detail}")]
    ConsistencyViolation { detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("tree system is latched in a critical-stop state: {0}")]
    CriticalStop(Arc<TreeError>),
}

impl TreeError {
    pub fn out_of_bounds(key: Key, position: u64, size: u64) -> Self {
        TreeError::OutOfBounds { key, position, size }
    }

    pub fn invalid_key(key: Key, reason: &'static str) -> Self {
        TreeError::InvalidKey { key, reason }
    }

    pub fn read_only(operation: &'static str) -> Self {
        TreeError::ReadOnly { operation }
    }

    pub fn consistency(detail: impl Into<String>) -> Self {
        TreeError::ConsistencyViolation { detail: detail.into() }
    }

    /// True for failures that should latch the owning tree system's
    /// critical-stop flag (spec §7: I/O failure, OOM, consistency assertion).
    pub fn latches_critical_stop(&self) -> bool {
        matches!(self, TreeError::Store(_) | TreeError::ConsistencyViolation { .. })
    }
}

pub type TreeResult<T> = Result<T, TreeError>;
