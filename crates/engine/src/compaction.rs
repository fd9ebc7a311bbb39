/// Partition compaction: folds a file set's base region and last-runs into
/// a single consolidated last-run.
///
/// # Lifecycle
///
/// ```text
/// Idle --start--> Started --stream--> Streaming --finalize--> Finalized --close--> Closed
///   \               |                   |                       |
///    `------------- abort (any error) --+-----------------------' --> Aborted
/// ```
///
/// `start` opens every fragment of the old file set and the output files,
/// all named with the pass's commit id. `stream` drains a
/// [`TournamentMerger`](fileset::TournamentMerger) over the fragments into
/// the new last-run, one block at a time. `finalize` seals the new files,
/// writes the new head and registers the new file set in the staged
/// snapshot. A finalized compactor is only `close`d once the snapshot is
/// committed; if it is not, `abort` deletes everything it wrote. Dropping
/// a compactor that was not closed aborts it.
///
/// # New file set
///
/// ```text
/// head  new, empty base index, header covers every row
/// data  new, empty
/// sma   carried forward by reference
/// last  exactly one, holding every row of the old base and last-runs
/// ```
use fileset::{
    file_path, write_head_file, BlockFileWriter, FileKind, FragmentKind, HeadMeta,
    TournamentMerger,
};
use row::RowKey;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::buffer::BlockBuffer;
use crate::catalog::{FileRef, FileSet, FsSnapshot};
use crate::read::{merger_over, open_fragment_readers};
use crate::EngineError;

/// Rows streamed between two looks at the cancel flag.
const CANCEL_CHECK_ROWS: u64 = 1024;

/// Where a [`PartitionCompactor`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorState {
    Idle,
    Started,
    Streaming,
    Finalized,
    Closed,
    Aborted,
}

/// Compacts one partition. See the module docs for the lifecycle.
pub struct PartitionCompactor {
    dir: PathBuf,
    fid: i64,
    block_rows: usize,
    state: CompactorState,
    commit_id: i64,
    old: Option<Arc<FileSet>>,
    merger: Option<TournamentMerger>,
    last_writer: Option<BlockFileWriter>,
    data_writer: Option<BlockFileWriter>,
    rows_written: u64,
    key_range: Option<(RowKey, RowKey)>,
    cancel: Option<Arc<AtomicBool>>,
    /// Output files already renamed into place.
    written: Vec<PathBuf>,
}

impl std::fmt::Debug for PartitionCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionCompactor")
            .field("fid", &self.fid)
            .field("state", &self.state)
            .field("commit_id", &self.commit_id)
            .field("rows_written", &self.rows_written)
            .finish()
    }
}

impl PartitionCompactor {
    #[must_use]
    pub fn new(dir: PathBuf, fid: i64, block_rows: usize) -> Self {
        Self {
            dir,
            fid,
            block_rows,
            state: CompactorState::Idle,
            commit_id: 0,
            old: None,
            merger: None,
            last_writer: None,
            data_writer: None,
            rows_written: 0,
            key_range: None,
            cancel: None,
            written: Vec::new(),
        }
    }

    /// Makes `stream` give up with [`EngineError::Cancelled`] once `flag`
    /// is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn fid(&self) -> i64 {
        self.fid
    }

    #[must_use]
    pub fn state(&self) -> CompactorState {
        self.state
    }

    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn expect_state(&self, expected: CompactorState) -> Result<(), EngineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                fid: self.fid,
                expected,
                found: self.state,
            })
        }
    }

    /// Opens the fragments of `old` and the output files for `commit_id`.
    pub fn start(&mut self, old: Arc<FileSet>, commit_id: i64) -> Result<(), EngineError> {
        self.expect_state(CompactorState::Idle)?;
        if old.fid != self.fid {
            return Err(EngineError::InvalidInput(format!(
                "compactor for partition {} handed file set of partition {}",
                self.fid, old.fid
            )));
        }
        self.commit_id = commit_id;
        self.state = CompactorState::Started;

        let opened = (|| -> Result<(), EngineError> {
            let readers = open_fragment_readers(&self.dir, &old)?;
            debug!(
                fid = self.fid,
                fragments = readers.len(),
                commit_id,
                "compaction started"
            );
            self.merger = Some(merger_over(readers)?);
            self.last_writer = Some(BlockFileWriter::create(
                &file_path(&self.dir, self.fid, commit_id, FileKind::Last),
                FragmentKind::Last,
            )?);
            self.data_writer = Some(BlockFileWriter::create(
                &file_path(&self.dir, self.fid, commit_id, FileKind::Data),
                FragmentKind::Data,
            )?);
            Ok(())
        })();
        self.old = Some(old);
        opened.map_err(|e| self.fail(e))
    }

    /// Drains the merged row stream into the new last-run. Returns the
    /// number of rows written.
    pub fn stream(&mut self) -> Result<u64, EngineError> {
        self.expect_state(CompactorState::Started)?;
        self.state = CompactorState::Streaming;
        self.drain().map_err(|e| self.fail(e))?;
        Ok(self.rows_written)
    }

    fn drain(&mut self) -> Result<(), EngineError> {
        let (merger, writer) = match (self.merger.as_mut(), self.last_writer.as_mut()) {
            (Some(m), Some(w)) => (m, w),
            _ => {
                return Err(EngineError::InvalidInput(format!(
                    "compactor for partition {} has no open fragments",
                    self.fid
                )))
            }
        };
        let cancel = self.cancel.as_deref();
        let mut buffer = BlockBuffer::new(self.block_rows);
        loop {
            if self.rows_written % CANCEL_CHECK_ROWS == 0
                && cancel.map_or(false, |flag| flag.load(Ordering::SeqCst))
            {
                debug!(fid = self.fid, rows = self.rows_written, "compaction cancelled");
                return Err(EngineError::Cancelled);
            }
            let row = match merger.next()? {
                Some(row) => row,
                None => break,
            };
            let key = row.key;
            buffer.push(row, writer)?;
            self.rows_written += 1;
            self.key_range = Some(match self.key_range {
                Some((min, _)) => (min, key),
                None => (key, key),
            });
        }
        buffer.flush(writer)?;
        Ok(())
    }

    /// Seals the output files, writes the new head and registers the new
    /// file set in `staged`.
    pub fn finalize(&mut self, staged: &mut FsSnapshot) -> Result<Arc<FileSet>, EngineError> {
        self.expect_state(CompactorState::Streaming)?;
        let set = self.seal().map_err(|e| self.fail(e))?;
        self.state = CompactorState::Finalized;
        info!(
            fid = self.fid,
            commit_id = self.commit_id,
            rows = self.rows_written,
            "partition compacted"
        );
        Ok(staged.upsert(set))
    }

    fn seal(&mut self) -> Result<FileSet, EngineError> {
        // Old read handles are released here.
        self.merger = None;

        let old = match &self.old {
            Some(old) => Arc::clone(old),
            None => {
                return Err(EngineError::InvalidInput(format!(
                    "compactor for partition {} lost its input file set",
                    self.fid
                )))
            }
        };
        let (last_writer, data_writer) = match (self.last_writer.take(), self.data_writer.take()) {
            (Some(l), Some(d)) => (l, d),
            _ => {
                return Err(EngineError::InvalidInput(format!(
                    "compactor for partition {} has no output files",
                    self.fid
                )))
            }
        };

        let data = match data_writer.finish(self.commit_id) {
            Ok(summary) => summary,
            Err(e) => {
                last_writer.abandon();
                return Err(e.into());
            }
        };
        self.written.push(data.path.clone());
        let last = last_writer.finish(self.commit_id)?;
        self.written.push(last.path.clone());

        let head_path = file_path(&self.dir, self.fid, self.commit_id, FileKind::Head);
        let meta = HeadMeta {
            commit_id: self.commit_id,
            row_count: self.rows_written,
            key_range: self.key_range,
            block_count: 0,
        };
        let head_size = write_head_file(&head_path, &meta, &data.index)?;
        self.written.push(head_path);

        Ok(FileSet {
            fid: self.fid,
            head: FileRef {
                commit_id: self.commit_id,
                size: head_size,
            },
            data: FileRef {
                commit_id: self.commit_id,
                size: data.size,
            },
            sma: old.sma,
            last: vec![FileRef {
                commit_id: self.commit_id,
                size: last.size,
            }],
        })
    }

    /// Marks a finalized compaction as published.
    pub fn close(&mut self) -> Result<(), EngineError> {
        self.expect_state(CompactorState::Finalized)?;
        self.state = CompactorState::Closed;
        self.old = None;
        self.written.clear();
        Ok(())
    }

    /// Stops the compaction and deletes every file it produced. A no-op
    /// once closed or aborted.
    pub fn abort(&mut self) {
        if matches!(
            self.state,
            CompactorState::Closed | CompactorState::Aborted
        ) {
            return;
        }
        self.merger = None;
        if let Some(w) = self.last_writer.take() {
            w.abandon();
        }
        if let Some(w) = self.data_writer.take() {
            w.abandon();
        }
        for path in self.written.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove compaction output");
                }
            }
        }
        if self.state != CompactorState::Idle {
            debug!(fid = self.fid, from = ?self.state, "compaction aborted");
        }
        self.state = CompactorState::Aborted;
    }

    fn fail(&mut self, e: EngineError) -> EngineError {
        self.abort();
        e
    }

    /// Runs `start`, `stream` and `finalize` back to back.
    pub fn run(
        &mut self,
        old: Arc<FileSet>,
        commit_id: i64,
        staged: &mut FsSnapshot,
    ) -> Result<Arc<FileSet>, EngineError> {
        self.start(old, commit_id)?;
        self.stream()?;
        self.finalize(staged)
    }
}

impl Drop for PartitionCompactor {
    fn drop(&mut self) {
        self.abort();
    }
}
