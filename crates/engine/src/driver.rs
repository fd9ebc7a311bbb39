/// The merge pass: compacts every partition that has piled up too many
/// last-runs and publishes the result as one snapshot commit.
///
/// # Pass outline
///
/// 1. Select partitions with `last_count() >= max_last` from the snapshot.
///    None selected means nothing happens: no commit id is consumed and no
///    file is written.
/// 2. Allocate one commit id for the whole pass.
/// 3. Compact each candidate into a working copy of the snapshot. I/O and
///    allocation failures are recorded against the partition and the pass
///    moves on; an ordering violation aborts the pass.
/// 4. Stage and commit the working copy. On a conflict nothing is
///    published and every file the pass wrote is deleted.
/// 5. Purge files of superseded file sets that no reader still holds.
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::{FileSet, FsSnapshot};
use crate::compaction::PartitionCompactor;
use crate::{Engine, EngineError};

/// A partition the pass had to skip, and why.
#[derive(Debug)]
pub struct PartitionFailure {
    pub fid: i64,
    pub error: EngineError,
}

/// Outcome of one [`Engine::run_merge_pass`].
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Partitions whose new file set was committed.
    pub partitions_compacted: usize,
    /// Rows written into new last-runs.
    pub rows_written: u64,
    /// Partitions left unchanged because compacting them failed.
    pub errors: Vec<PartitionFailure>,
    /// The commit that published the pass, `None` if nothing was committed.
    pub commit_id: Option<i64>,
}

impl MergeReport {
    /// `true` when the pass found nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.partitions_compacted == 0 && self.errors.is_empty() && self.commit_id.is_none()
    }
}

impl Engine {
    /// Runs one merge pass against the live snapshot.
    ///
    /// Passes are serialized: a second caller blocks until the first one
    /// returns.
    ///
    /// # Errors
    ///
    /// [`EngineError::OrderViolation`] if any partition's fragments overlap
    /// or are unsorted, [`EngineError::CommitConflict`] if the snapshot
    /// moved underneath the pass, [`EngineError::Cancelled`] after
    /// [`cancel_merge`](Self::cancel_merge), or [`EngineError::Io`] if
    /// staging or committing fails. In every error case the live snapshot
    /// is unchanged and the pass's files are gone.
    pub fn run_merge_pass(&self) -> Result<MergeReport, EngineError> {
        let _pass = self.merge_lock.lock();
        let base = self.catalog.current();
        let report = self.merge_pass_locked(&base);
        self.cancel.store(false, Ordering::SeqCst);
        drop(base);
        self.release_after_merge(&report);
        report
    }

    /// Runs one merge pass derived from `base` instead of the live
    /// snapshot. If `base` is no longer live the commit is refused with
    /// [`EngineError::CommitConflict`].
    pub fn run_merge_pass_on(&self, base: &FsSnapshot) -> Result<MergeReport, EngineError> {
        let _pass = self.merge_lock.lock();
        let report = self.merge_pass_locked(base);
        self.cancel.store(false, Ordering::SeqCst);
        self.release_after_merge(&report);
        report
    }

    /// Deletes files a committed pass superseded, as far as no reader still
    /// holds them.
    fn release_after_merge(&self, report: &Result<MergeReport, EngineError>) {
        if !matches!(report, Ok(MergeReport { commit_id: Some(_), .. })) {
            return;
        }
        match self.catalog.purge_obsolete() {
            Ok(removed) => debug!(removed, "files released after merge"),
            Err(e) => warn!(error = %e, "failed to purge obsolete files"),
        }
    }

    /// Asks the running merge pass, or the next one if none is running, to
    /// stop. The flag is checked between partitions, before the commit and
    /// every 1024 rows streamed within a partition. A cancelled pass
    /// publishes nothing.
    pub fn cancel_merge(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn merge_pass_locked(&self, base: &FsSnapshot) -> Result<MergeReport, EngineError> {
        let max_last = self.config.max_last;
        let candidates: Vec<Arc<FileSet>> = base
            .file_sets()
            .filter(|set| set.last_count() >= max_last)
            .cloned()
            .collect();

        let mut report = MergeReport::default();
        if candidates.is_empty() {
            debug!(
                commit_id = base.commit_id(),
                max_last, "merge pass: no partition over threshold"
            );
            return Ok(report);
        }

        let commit_id = self.commit_ids.next();
        info!(
            commit_id,
            candidates = candidates.len(),
            base_commit_id = base.commit_id(),
            "merge pass started"
        );

        let mut staged = base.clone();
        staged.set_commit_id(commit_id);
        let mut done: Vec<PartitionCompactor> = Vec::new();

        for set in candidates {
            if let Err(e) = self.check_cancelled() {
                abort_all(&mut done);
                info!(commit_id, "merge pass cancelled");
                return Err(e);
            }
            let fid = set.fid;
            let mut compactor = PartitionCompactor::new(self.dir.clone(), fid, self.config.block_rows)
                .with_cancel(Arc::clone(&self.cancel));
            match compactor.run(set, commit_id, &mut staged) {
                Ok(_) => {
                    report.partitions_compacted += 1;
                    report.rows_written += compactor.rows_written();
                    done.push(compactor);
                }
                Err(EngineError::Cancelled) => {
                    abort_all(&mut done);
                    info!(commit_id, fid, "merge pass cancelled mid-partition");
                    return Err(EngineError::Cancelled);
                }
                Err(e) if e.is_partition_local() => {
                    warn!(fid, error = %e, "partition compaction failed, leaving it unchanged");
                    report.errors.push(PartitionFailure { fid, error: e });
                }
                Err(e) => {
                    error!(fid, error = %e, "merge pass aborted");
                    abort_all(&mut done);
                    return Err(e);
                }
            }
        }

        if done.is_empty() {
            warn!(
                commit_id,
                failed = report.errors.len(),
                "merge pass compacted nothing"
            );
            return Ok(report);
        }

        if let Err(e) = self.check_cancelled() {
            abort_all(&mut done);
            info!(commit_id, "merge pass cancelled before commit");
            return Err(e);
        }

        let staged = match self.catalog.stage(staged, base.commit_id()) {
            Ok(staged) => staged,
            Err(e) => {
                abort_all(&mut done);
                return Err(e.into());
            }
        };
        if let Err(e) = self.catalog.commit(staged) {
            abort_all(&mut done);
            return Err(e);
        }
        for compactor in &mut done {
            compactor.close()?;
        }
        report.commit_id = Some(commit_id);

        info!(
            commit_id,
            partitions = report.partitions_compacted,
            rows = report.rows_written,
            failed = report.errors.len(),
            "merge pass committed"
        );
        Ok(report)
    }
}

fn abort_all(done: &mut Vec<PartitionCompactor>) {
    for compactor in done.iter_mut() {
        compactor.abort();
    }
    done.clear();
}

/// Background thread that runs a merge pass every `interval`.
///
/// Stops on [`MergeWorker::stop`], when dropped, or after a fatal error.
#[derive(Debug)]
pub struct MergeWorker {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Spawns the worker for `engine`.
    pub fn spawn(engine: Arc<Engine>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("riptide-merge".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match engine.run_merge_pass() {
                    Ok(report) if report.is_noop() => {}
                    Ok(report) => debug!(commit_id = ?report.commit_id, "background merge pass done"),
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "background merge stopped");
                        break;
                    }
                    Err(e) => warn!(error = %e, "background merge pass failed"),
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signals the worker and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("merge worker panicked");
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
