/// Read path: snapshots and partition scans.
///
/// A scan runs the same [`TournamentMerger`] the compactor uses over the
/// partition's base region and last-runs, against whatever snapshot was
/// live when it started. Commits that land during the scan do not affect
/// it, and the snapshot `Arc` keeps its files from being purged.
use anyhow::Context;
use fileset::{BlockSource, FileKind, FragmentReader, TournamentMerger};
use row::Row;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::{FileSet, FsSnapshot};
use crate::{Engine, EngineError};

/// Opens the base region followed by every last-run of `set`, oldest first.
pub(crate) fn open_fragment_readers(dir: &Path, set: &FileSet) -> anyhow::Result<Vec<FragmentReader>> {
    let head = set.path_of(dir, FileKind::Head, set.head);
    let data = set.path_of(dir, FileKind::Data, set.data);
    let (base, _meta) = FragmentReader::open_base(&head, &data)
        .with_context(|| format!("failed to open base region of partition {}", set.fid))?;

    let mut readers = Vec::with_capacity(set.last.len() + 1);
    readers.push(base);
    for last in &set.last {
        let path = set.path_of(dir, FileKind::Last, *last);
        readers.push(
            FragmentReader::open_last(&path)
                .with_context(|| format!("failed to open last-run {}", path.display()))?,
        );
    }
    Ok(readers)
}

/// Builds a merger over already opened fragments.
pub(crate) fn merger_over(readers: Vec<FragmentReader>) -> Result<TournamentMerger, EngineError> {
    let sources: Vec<Box<dyn BlockSource + Send>> = readers
        .into_iter()
        .map(|r| Box::new(r) as Box<dyn BlockSource + Send>)
        .collect();
    Ok(TournamentMerger::from_sources(sources)?)
}

impl Engine {
    /// The live snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<FsSnapshot> {
        self.catalog.current()
    }

    /// Returns every row of partition `fid` in key order, read from the live
    /// snapshot. An unknown partition yields no rows.
    ///
    /// # Errors
    ///
    /// [`EngineError::Io`] on unreadable files, [`EngineError::OrderViolation`]
    /// if the fragments overlap or are unsorted.
    pub fn scan_partition(&self, fid: i64) -> Result<Vec<Row>, EngineError> {
        self.scan_partition_in(&self.snapshot(), fid)
    }

    /// Like [`scan_partition`](Self::scan_partition), against a snapshot the
    /// caller already holds.
    pub fn scan_partition_in(&self, snapshot: &FsSnapshot, fid: i64) -> Result<Vec<Row>, EngineError> {
        let set = match snapshot.get(fid) {
            Some(set) => Arc::clone(set),
            None => return Ok(Vec::new()),
        };
        let readers = open_fragment_readers(&self.dir, &set)?;
        let mut merger = merger_over(readers)?;
        Ok(merger.collect_all()?)
    }

    /// Number of rows in partition `fid`, summed from block indexes.
    pub fn partition_row_count(&self, fid: i64) -> Result<u64, EngineError> {
        let snapshot = self.snapshot();
        match snapshot.get(fid) {
            Some(set) => Ok(open_fragment_readers(&self.dir, set)?
                .iter()
                .map(FragmentReader::row_count)
                .sum()),
            None => Ok(0),
        }
    }
}
