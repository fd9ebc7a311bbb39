use fileset::MergeError;
use thiserror::Error;

use crate::compaction::CompactorState;

/// Errors surfaced by the engine.
///
/// Per-partition failures of a merge pass ([`Io`](EngineError::Io),
/// [`OutOfMemory`](EngineError::OutOfMemory)) are collected into the
/// [`MergeReport`](crate::MergeReport); everything else fails the whole
/// pass.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0:#}")]
    Io(#[from] anyhow::Error),

    /// Duplicate or out-of-order keys. Indicates corruption; never retried.
    #[error("row order violated: {0}")]
    OrderViolation(#[source] MergeError),

    #[error("out of memory reserving a block buffer of {rows} rows")]
    OutOfMemory { rows: usize },

    /// The live snapshot moved past the one a staged snapshot was built on.
    #[error("commit conflict: staged against commit {expected}, live snapshot is at {found}")]
    CommitConflict { expected: i64, found: i64 },

    #[error("partition {fid} already holds {count} last-runs (limit {limit})")]
    TooManyLastRuns { fid: i64, count: usize, limit: usize },

    #[error("compactor for partition {fid} is {found:?}, expected {expected:?}")]
    InvalidState {
        fid: i64,
        expected: CompactorState,
        found: CompactorState,
    },

    #[error("merge pass cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    /// `true` when the error means on-disk data can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::OrderViolation(_))
    }

    /// `true` for the errors a merge pass records against one partition
    /// before moving on to the next.
    #[must_use]
    pub fn is_partition_local(&self) -> bool {
        matches!(self, EngineError::Io(_) | EngineError::OutOfMemory { .. })
    }
}

impl From<MergeError> for EngineError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Block(inner) => EngineError::Io(inner),
            other => EngineError::OrderViolation(other),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.into())
    }
}
