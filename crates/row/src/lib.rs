//! # Row - keys, rows and row groups
//!
//! Leaf types shared by the [`fileset`] codec and the merge [`engine`].
//!
//! A row is identified by a [`RowKey`]:
//!
//! ```text
//! (container_id, entity_id, ts, version)
//! ```
//!
//! Keys are ordered field by field in exactly that order. Within one merge
//! no two source rows may compare equal; the storage layer guarantees
//! `(container_id, entity_id, ts)` is unique upstream, so an equal pair is
//! treated as corruption by the merger rather than resolved.
//!
//! [`fileset`]: ../fileset/index.html
//! [`engine`]: ../engine/index.html

use std::cmp::Ordering;
use std::fmt;

/// Composite row key. Immutable once read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    /// Super table / container the entity belongs to.
    pub container_id: i64,
    /// Entity (child table) id.
    pub entity_id: i64,
    /// Row timestamp.
    pub ts: i64,
    /// Version ordinal for rows sharing a timestamp.
    pub version: i64,
}

impl RowKey {
    pub const MIN: RowKey = RowKey {
        container_id: i64::MIN,
        entity_id: i64::MIN,
        ts: i64::MIN,
        version: i64::MIN,
    };

    pub const MAX: RowKey = RowKey {
        container_id: i64::MAX,
        entity_id: i64::MAX,
        ts: i64::MAX,
        version: i64::MAX,
    };

    /// Key with version ordinal 0.
    pub fn new(container_id: i64, entity_id: i64, ts: i64) -> Self {
        Self {
            container_id,
            entity_id,
            ts,
            version: 0,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}#{})",
            self.container_id, self.entity_id, self.ts, self.version
        )
    }
}

/// A single row: key plus an opaque payload handed through by the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: RowKey,
    pub payload: Vec<u8>,
}

impl Row {
    pub fn new(key: RowKey, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }

    /// Approximate in-memory footprint, used for buffer accounting.
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<RowKey>() + self.payload.len()
    }
}

/// Total order over rows: container id, entity id, then `(ts, version)`.
pub fn compare_rows(a: &Row, b: &Row) -> Ordering {
    compare_keys(&a.key, &b.key)
}

/// Same order as [`compare_rows`], on bare keys.
pub fn compare_keys(a: &RowKey, b: &RowKey) -> Ordering {
    a.container_id
        .cmp(&b.container_id)
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .then_with(|| a.ts.cmp(&b.ts))
        .then_with(|| a.version.cmp(&b.version))
}

/// One row group as loaded from (or written to) a fragment file.
///
/// Rows are in strictly increasing key order and share one container id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    rows: Vec<Row>,
}

impl Block {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Wraps already-sorted rows. Use [`Block::check_sorted`] when the
    /// source is untrusted.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn first_key(&self) -> Option<RowKey> {
        self.rows.first().map(|r| r.key)
    }

    pub fn last_key(&self) -> Option<RowKey> {
        self.rows.last().map(|r| r.key)
    }

    /// Container id of the block (taken from the first row).
    pub fn container_id(&self) -> Option<i64> {
        self.rows.first().map(|r| r.key.container_id)
    }

    /// `Some(entity_id)` if every row belongs to the same entity.
    pub fn single_entity(&self) -> Option<i64> {
        let first = self.rows.first()?.key.entity_id;
        self.rows
            .iter()
            .all(|r| r.key.entity_id == first)
            .then_some(first)
    }

    /// Returns the first adjacent pair that is not strictly increasing.
    pub fn check_sorted(&self) -> Result<(), (RowKey, RowKey)> {
        for pair in self.rows.windows(2) {
            if compare_rows(&pair[0], &pair[1]) != Ordering::Less {
                return Err((pair[0].key, pair[1].key));
            }
        }
        Ok(())
    }

    pub fn approx_size(&self) -> usize {
        self.rows.iter().map(Row::approx_size).sum()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Reserves room for `additional` rows without aborting on allocation
    /// failure.
    pub fn try_reserve(
        &mut self,
        additional: usize,
    ) -> Result<(), std::collections::TryReserveError> {
        self.rows.try_reserve(additional)
    }
}
