//! Tournament merge over the fragments of one partition.
//!
//! Each fragment is wrapped in a [`FragmentIterator`] that hides the block
//! structure and exposes one current row. The [`TournamentMerger`] keeps the
//! non-exhausted iterators in an ordered tree keyed by
//! `(current key, iterator id)`, so both "take the minimum" and "re-key the
//! iterator that just advanced" are a delete plus an insert.
//!
//! Keys are unique across fragments. Equal keys are a [`MergeError::DuplicateKey`],
//! and any emitted key that does not strictly exceed the previous one is a
//! [`MergeError::OutOfOrder`]. Both are corruption and end the merge.

use anyhow::{anyhow, Result};
use row::{Block, Row, RowKey};
use std::collections::BTreeSet;

use crate::MergeError;

/// Anything that can hand out the blocks of one fragment in order.
pub trait BlockSource {
    /// Returns the next block, or `None` once the fragment is exhausted.
    fn next_block(&mut self) -> Result<Option<Block>>;
}

/// In-memory fragment, used for freshly written runs and in tests.
impl BlockSource for std::vec::IntoIter<Block> {
    fn next_block(&mut self) -> Result<Option<Block>> {
        Ok(self.next())
    }
}

/// Row cursor over one fragment.
///
/// Holds the currently loaded block in memory and crosses block boundaries
/// on [`advance`](FragmentIterator::advance), pulling from the underlying
/// [`BlockSource`] (which may do I/O). Empty blocks are skipped.
pub struct FragmentIterator {
    source: Box<dyn BlockSource + Send>,
    rows: std::vec::IntoIter<Row>,
    current: Option<Row>,
    exhausted: bool,
}

impl FragmentIterator {
    /// Wraps `source` and loads its first row.
    pub fn new(source: Box<dyn BlockSource + Send>) -> Result<Self> {
        let mut it = Self {
            source,
            rows: Vec::new().into_iter(),
            current: None,
            exhausted: false,
        };
        it.advance()?;
        Ok(it)
    }

    /// The current row; `None` once the iterator is exhausted.
    pub fn current_row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn current_key(&self) -> Option<RowKey> {
        self.current.as_ref().map(|r| r.key)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Moves to the next row, reading the next block if the current one is
    /// used up. Returns `false` (and marks the iterator exhausted) when no
    /// rows remain. Block-read errors are returned as is.
    pub fn advance(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        loop {
            if let Some(row) = self.rows.next() {
                self.current = Some(row);
                return Ok(true);
            }
            match self.source.next_block()? {
                Some(block) => self.rows = block.into_rows().into_iter(),
                None => {
                    self.current = None;
                    self.exhausted = true;
                    return Ok(false);
                }
            }
        }
    }

    fn take_current(&mut self) -> Option<Row> {
        self.current.take()
    }
}

/// Produces one strictly increasing row sequence from N fragments.
pub struct TournamentMerger {
    iters: Vec<FragmentIterator>,
    /// Non-exhausted iterators other than the winner, keyed by current row.
    tree: BTreeSet<(RowKey, usize)>,
    /// Iterator whose row was returned by the previous `next` call.
    winner: Option<usize>,
    last_key: Option<RowKey>,
    emitted: u64,
}

impl TournamentMerger {
    /// Builds the tree from every iterator that still has a row.
    pub fn new(iters: Vec<FragmentIterator>) -> Self {
        let tree = iters
            .iter()
            .enumerate()
            .filter_map(|(i, it)| it.current_key().map(|k| (k, i)))
            .collect();
        Self {
            iters,
            tree,
            winner: None,
            last_key: None,
            emitted: 0,
        }
    }

    /// Convenience: wraps each source in a [`FragmentIterator`] first.
    pub fn from_sources(sources: Vec<Box<dyn BlockSource + Send>>) -> Result<Self, MergeError> {
        let iters = sources
            .into_iter()
            .map(FragmentIterator::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(iters))
    }

    /// Returns the next row in global key order, or `None` when every
    /// fragment is exhausted.
    ///
    /// 1. Advance last call's winner. If its new key is still below the tree
    ///    minimum it simply stays the winner; otherwise it goes back in the tree.
    /// 2. With no winner, pop the tree minimum.
    /// 3. Hand out the winner's row.
    pub fn next(&mut self) -> Result<Option<Row>, MergeError> {
        if let Some(w) = self.winner {
            if self.iters[w].advance()? {
                let key = self.winner_key(w)?;
                match self.tree.first() {
                    Some(&(min, other)) if key == min => {
                        return Err(MergeError::DuplicateKey {
                            key,
                            first: other,
                            second: w,
                        });
                    }
                    Some(&(min, _)) if key > min => {
                        self.tree.insert((key, w));
                        self.winner = None;
                    }
                    _ => {}
                }
            } else {
                self.winner = None;
            }
        }

        if self.winner.is_none() {
            let Some((key, w)) = self.tree.pop_first() else {
                return Ok(None);
            };
            if let Some(&(next, other)) = self.tree.first() {
                if next == key {
                    return Err(MergeError::DuplicateKey {
                        key,
                        first: w,
                        second: other,
                    });
                }
            }
            self.winner = Some(w);
        }

        let Some(w) = self.winner else {
            return Ok(None);
        };
        let row = self.iters[w]
            .take_current()
            .ok_or_else(|| anyhow!("fragment {} selected without a current row", w))?;

        if let Some(prev) = self.last_key {
            if row.key <= prev {
                return Err(MergeError::OutOfOrder {
                    fragment: w,
                    prev,
                    next: row.key,
                });
            }
        }
        self.last_key = Some(row.key);
        self.emitted += 1;
        Ok(Some(row))
    }

    /// Rows returned so far.
    #[must_use]
    pub fn rows_emitted(&self) -> u64 {
        self.emitted
    }

    /// Number of fragments feeding this merger.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.iters.len()
    }

    /// Drains the merger into a `Vec`. Useful for tests and small partitions.
    pub fn collect_all(&mut self) -> Result<Vec<Row>, MergeError> {
        let mut out = Vec::new();
        while let Some(row) = self.next()? {
            out.push(row);
        }
        Ok(out)
    }

    fn winner_key(&self, w: usize) -> Result<RowKey, MergeError> {
        self.iters[w]
            .current_key()
            .ok_or_else(|| MergeError::Block(anyhow!("fragment {} advanced without a row", w)))
    }
}
