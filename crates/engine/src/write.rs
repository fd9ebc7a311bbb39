/// Write path: `flush_last_run()` and `create_partition_with_base()`.
///
/// Ingestion hands the engine already sorted rows. Each call writes its
/// files under a fresh commit id and publishes them through the same
/// two-phase commit the merge pass uses. If a merge commits in between, the
/// update is rebuilt on top of the new live snapshot and retried.
use fileset::{
    file_path, write_head_file, write_sma_file, BlockFileWriter, FileKind, FragmentKind,
    FragmentSummary, HeadMeta,
};
use row::Row;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::buffer::BlockBuffer;
use crate::catalog::{FileRef, FileSet, FsSnapshot};
use crate::{Engine, EngineError};

/// How many times a write is rebuilt after losing a commit race.
const MAX_COMMIT_ATTEMPTS: usize = 8;

/// Rows must be non-empty and strictly increasing.
fn validate_rows(rows: &[Row]) -> Result<(), EngineError> {
    if rows.is_empty() {
        return Err(EngineError::InvalidInput("no rows to write".to_string()));
    }
    for pair in rows.windows(2) {
        if pair[0].key >= pair[1].key {
            return Err(EngineError::InvalidInput(format!(
                "rows not strictly increasing: {} followed by {}",
                pair[0].key, pair[1].key
            )));
        }
    }
    Ok(())
}

/// Writes `rows` into a new block file at `path`.
fn write_rows(
    path: &Path,
    kind: FragmentKind,
    rows: Vec<Row>,
    block_rows: usize,
    commit_id: i64,
) -> Result<FragmentSummary, EngineError> {
    let mut writer = BlockFileWriter::create(path, kind)?;
    let mut buffer = BlockBuffer::new(block_rows);
    let pushed = rows
        .into_iter()
        .try_for_each(|row| buffer.push(row, &mut writer))
        .and_then(|()| buffer.flush(&mut writer));
    if let Err(e) = pushed {
        writer.abandon();
        return Err(e);
    }
    Ok(writer.finish(commit_id)?)
}

fn remove_files(paths: &mut Vec<PathBuf>) {
    for path in paths.drain(..) {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove unpublished file");
            }
        }
    }
}

impl Engine {
    /// Persists a sorted batch of rows as a new last-run of partition
    /// `fid` and publishes it. A partition that does not exist yet is
    /// created with an empty base region.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidInput`] for empty or unsorted rows,
    /// [`EngineError::TooManyLastRuns`] once the partition reached
    /// `max_last_files` (a merge pass has to run first),
    /// [`EngineError::CommitConflict`] if every retry lost its commit race,
    /// and [`EngineError::Io`] on file errors. Nothing is published on
    /// error.
    pub fn flush_last_run(&self, fid: i64, rows: Vec<Row>) -> Result<FileRef, EngineError> {
        validate_rows(&rows)?;
        let _writer = self.write_lock.lock();
        let limit = self.config.max_last_files;
        self.check_last_limit(fid, limit)?;

        let commit_id = self.commit_ids.next();
        let row_count = rows.len() as u64;
        let key_range = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => Some((first.key, last.key)),
            _ => None,
        };

        let last_path = file_path(&self.dir, fid, commit_id, FileKind::Last);
        let summary = write_rows(
            &last_path,
            FragmentKind::Last,
            rows,
            self.config.block_rows,
            commit_id,
        )?;
        let last = FileRef {
            commit_id,
            size: summary.size,
        };
        let mut written = vec![last_path];
        let mut empty_base: Option<(FileRef, FileRef, FileRef)> = None;

        let result = self.commit_partition_update(fid, commit_id, |existing| match existing {
            Some(set) => {
                if set.last_count() >= limit {
                    return Err(EngineError::TooManyLastRuns {
                        fid,
                        count: set.last_count(),
                        limit,
                    });
                }
                let mut next = FileSet::clone(set);
                next.last.push(last);
                Ok(next)
            }
            None => {
                let (head, data, sma) = match empty_base {
                    Some(base) => base,
                    None => {
                        let meta = HeadMeta {
                            commit_id,
                            row_count,
                            key_range,
                            block_count: 0,
                        };
                        let base = self.write_base_files(fid, commit_id, &meta, None, &mut written)?;
                        empty_base = Some(base);
                        base
                    }
                };
                Ok(FileSet {
                    fid,
                    head,
                    data,
                    sma,
                    last: vec![last],
                })
            }
        });

        match result {
            Ok(set) => {
                info!(
                    fid,
                    commit_id,
                    rows = row_count,
                    last_runs = set.last_count(),
                    "last-run flushed"
                );
                self.purge_after_write();
                Ok(last)
            }
            Err(e) => {
                remove_files(&mut written);
                Err(e)
            }
        }
    }

    /// Creates partition `fid` with `rows` as its base region and no
    /// last-runs.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidInput`] if the partition already exists or the
    /// rows are empty or unsorted; otherwise as
    /// [`flush_last_run`](Self::flush_last_run).
    pub fn create_partition_with_base(
        &self,
        fid: i64,
        rows: Vec<Row>,
    ) -> Result<Arc<FileSet>, EngineError> {
        validate_rows(&rows)?;
        let _writer = self.write_lock.lock();
        if self.snapshot().get(fid).is_some() {
            return Err(EngineError::InvalidInput(format!(
                "partition {} already exists",
                fid
            )));
        }

        let commit_id = self.commit_ids.next();
        let meta = HeadMeta {
            commit_id,
            row_count: rows.len() as u64,
            key_range: rows.first().zip(rows.last()).map(|(a, b)| (a.key, b.key)),
            block_count: 0,
        };
        let mut written = Vec::new();
        let (head, data, sma) =
            match self.write_base_files(fid, commit_id, &meta, Some(rows), &mut written) {
                Ok(files) => files,
                Err(e) => {
                    remove_files(&mut written);
                    return Err(e);
                }
            };

        let result = self.commit_partition_update(fid, commit_id, |existing| match existing {
            Some(_) => Err(EngineError::InvalidInput(format!(
                "partition {} already exists",
                fid
            ))),
            None => Ok(FileSet {
                fid,
                head,
                data,
                sma,
                last: Vec::new(),
            }),
        });
        match result {
            Ok(set) => {
                info!(fid, commit_id, rows = meta.row_count, "partition created");
                Ok(set)
            }
            Err(e) => {
                remove_files(&mut written);
                Err(e)
            }
        }
    }

    fn check_last_limit(&self, fid: i64, limit: usize) -> Result<(), EngineError> {
        match self.snapshot().get(fid) {
            Some(set) if set.last_count() >= limit => Err(EngineError::TooManyLastRuns {
                fid,
                count: set.last_count(),
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Writes the data, head and sma files of a base region. `rows` of
    /// `None` writes an empty base. Each path is appended to `written` as
    /// soon as the file exists.
    fn write_base_files(
        &self,
        fid: i64,
        commit_id: i64,
        meta: &HeadMeta,
        rows: Option<Vec<Row>>,
        written: &mut Vec<PathBuf>,
    ) -> Result<(FileRef, FileRef, FileRef), EngineError> {
        let data_path = file_path(&self.dir, fid, commit_id, FileKind::Data);
        let data = match rows {
            Some(rows) => write_rows(
                &data_path,
                FragmentKind::Data,
                rows,
                self.config.block_rows,
                commit_id,
            )?,
            None => BlockFileWriter::create(&data_path, FragmentKind::Data)?.finish(commit_id)?,
        };
        written.push(data_path);

        let head_path = file_path(&self.dir, fid, commit_id, FileKind::Head);
        let meta = HeadMeta {
            block_count: u32::try_from(data.index.len())
                .map_err(|_| EngineError::InvalidInput("too many base blocks".to_string()))?,
            ..*meta
        };
        let head_size = write_head_file(&head_path, &meta, &data.index)?;
        written.push(head_path);

        let sma_path = file_path(&self.dir, fid, commit_id, FileKind::Sma);
        let sma_size = write_sma_file(&sma_path, commit_id)?;
        written.push(sma_path);

        let file = |size| FileRef { commit_id, size };
        Ok((file(head_size), file(data.size), file(sma_size)))
    }

    /// Stages and commits the file set `build` derives from the live
    /// version of partition `fid`, rebuilding it on a lost commit race.
    fn commit_partition_update<F>(
        &self,
        fid: i64,
        commit_id: i64,
        mut build: F,
    ) -> Result<Arc<FileSet>, EngineError>
    where
        F: FnMut(Option<&Arc<FileSet>>) -> Result<FileSet, EngineError>,
    {
        let mut last_conflict = None;
        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let base = self.catalog.current();
            // A merge may have published a newer commit since `commit_id`
            // was allocated; the snapshot version must still move forward.
            let version = if commit_id > base.commit_id() {
                commit_id
            } else {
                self.commit_ids.next()
            };

            let set = build(base.get(fid))?;
            let mut next = FsSnapshot::clone(&base);
            next.set_commit_id(version);
            let set = next.upsert(set);

            let staged = self.catalog.stage(next, base.commit_id())?;
            match self.catalog.commit(staged) {
                Ok(_) => return Ok(set),
                Err(e @ EngineError::CommitConflict { .. }) => {
                    debug!(fid, attempt, error = %e, "write lost commit race, rebasing");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| {
            EngineError::InvalidInput("commit retry budget is zero".to_string())
        }))
    }

    fn purge_after_write(&self) {
        if let Err(e) = self.catalog.purge_obsolete() {
            warn!(error = %e, "failed to purge obsolete files");
        }
    }
}
