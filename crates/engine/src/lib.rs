//! # Engine - RiptideTS Storage Engine
//!
//! Owns the data directory of a columnar time-series store: the live
//! [`FsSnapshot`] of every partition's files, the write path that adds
//! sorted last-runs, and the merge pass that folds them back together.
//!
//! ## Architecture
//!
//! ```text
//! Ingestion (sorted rows)
//!   |
//!   v
//! ┌─────────────────────────────────────────────────────┐
//! │                      ENGINE                         │
//! │                                                     │
//! │ write.rs → new last-run → stage → commit            │
//! │              |                                      │
//! │              |  (last-runs >= max_last?)            │
//! │              |            yes                       │
//! │              v                                      │
//! │ driver.rs → PartitionCompactor per partition        │
//! │              → one consolidated last-run each       │
//! │              → stage → commit (one commit id)       │
//! │                                                     │
//! │ read.rs → snapshot → TournamentMerger → rows        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                 |
//! |----------------|---------------------------------------------------------|
//! | [`lib.rs`]     | `Engine` struct, `open()`, accessors, `Debug`            |
//! | [`catalog`]    | `FsSnapshot`, `CURRENT` text format, two-phase commit    |
//! | [`compaction`] | `PartitionCompactor` state machine                       |
//! | [`driver`]     | `run_merge_pass()`, `MergeReport`, `MergeWorker`         |
//! | [`write`]      | `flush_last_run()`, `create_partition_with_base()`       |
//! | [`read`]       | `snapshot()`, `scan_partition()`                         |
//! | [`recovery`]   | Leftover cleanup and commit id recovery on open          |
//!
//! ## Crash Safety
//!
//! Data files are written to `.tmp` siblings and renamed into place, but
//! only `CURRENT` decides what is live. A snapshot is staged to
//! `CURRENT.{commit_id}.t` and published by renaming it over `CURRENT`;
//! on open, everything `CURRENT` does not reference is deleted.
mod buffer;
pub mod catalog;
mod commit;
pub mod compaction;
mod driver;
mod error;
mod read;
pub mod recovery;
mod write;

pub use catalog::{Catalog, FileRef, FileSet, FsSnapshot, StagedSnapshot};
pub use commit::CommitIdAllocator;
pub use compaction::{CompactorState, PartitionCompactor};
pub use config::EngineConfig;
pub use driver::{MergeReport, MergeWorker, PartitionFailure};
pub use error::EngineError;
pub use recovery::RecoveryStats;

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

/// The storage engine for one data directory.
///
/// All operations take `&self`; share it across threads behind an `Arc`.
/// Writes are serialized among themselves, merge passes among themselves,
/// and the two only meet at the catalog commit, where a write that lost
/// the race is rebuilt on the new snapshot.
pub struct Engine {
    pub(crate) dir: PathBuf,
    pub(crate) config: EngineConfig,
    pub(crate) catalog: Catalog,
    pub(crate) commit_ids: CommitIdAllocator,
    /// Held for the duration of a merge pass.
    pub(crate) merge_lock: Mutex<()>,
    /// Held for the duration of a write.
    pub(crate) write_lock: Mutex<()>,
    pub(crate) cancel: Arc<AtomicBool>,
    recovery: RecoveryStats,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.catalog.current();
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("commit_id", &live.commit_id())
            .field("last_allocated_commit_id", &self.commit_ids.current())
            .field("partitions", &live.len())
            .field("retired_file_sets", &self.catalog.retired_count())
            .finish()
    }
}

impl Engine {
    /// Opens (or initializes) the data directory at `dir`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Validate `config` and create `dir` if needed.
    /// 2. Load `CURRENT`, or start from an empty snapshot at commit 0.
    /// 3. Delete staged catalogs, temp files and unreferenced file set
    ///    members left by unfinished commits.
    /// 4. Resume the commit id allocator above every commit id seen.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] for an invalid config, [`EngineError::Io`] if
    /// the directory or catalog cannot be read.
    pub fn open<P: AsRef<Path>>(dir: P, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let catalog = Catalog::load(&dir)?;
        let live = catalog.current();
        let recovery = recovery::cleanup_orphans(&dir, &live)?;
        let commit_ids = CommitIdAllocator::new(recovery.max_commit_id);

        info!(
            dir = %dir.display(),
            commit_id = live.commit_id(),
            partitions = live.len(),
            next_commit_id = recovery.max_commit_id + 1,
            "engine opened"
        );
        drop(live);

        Ok(Self {
            dir,
            config,
            catalog,
            commit_ids,
            merge_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
            recovery,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// What recovery cleaned up when this engine was opened.
    #[must_use]
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    /// The most recently allocated commit id (possibly not yet committed).
    #[must_use]
    pub fn last_commit_id(&self) -> i64 {
        self.commit_ids.current()
    }

    /// Deletes superseded files no reader holds any more. Returns the
    /// number of files removed.
    pub fn purge_obsolete(&self) -> Result<usize, EngineError> {
        Ok(self.catalog.purge_obsolete()?)
    }
}

#[cfg(test)]
mod tests;
