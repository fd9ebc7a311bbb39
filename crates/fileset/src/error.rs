use row::RowKey;
use thiserror::Error;

/// Errors produced while merging fragments.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Reading or decoding a block failed. Transient from the merge's
    /// point of view: the inputs may be fine on a retry.
    #[error("block read failed: {0:#}")]
    Block(#[from] anyhow::Error),

    /// Two fragments presented the same key. Never resolved by picking
    /// one; the merge run must stop.
    #[error("duplicate row key {key} in fragments {first} and {second}")]
    DuplicateKey {
        key: RowKey,
        first: usize,
        second: usize,
    },

    /// The emitted sequence stopped being strictly increasing, which means
    /// a fragment is not sorted (or the comparator is broken).
    #[error("row order violated by fragment {fragment}: {next} emitted after {prev}")]
    OutOfOrder {
        fragment: usize,
        prev: RowKey,
        next: RowKey,
    },
}

impl MergeError {
    /// `true` for ordering violations, which indicate data corruption.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MergeError::DuplicateKey { .. } | MergeError::OutOfOrder { .. }
        )
    }
}
