//! # Catalog - the file system snapshot and its two-phase commit
//!
//! The set of live partitions is described by an immutable [`FsSnapshot`]:
//! one [`FileSet`] per partition plus the commit id that produced it. New
//! snapshots are built off to the side and published in two phases:
//!
//! 1. [`Catalog::stage`] writes the candidate snapshot to
//!    `CURRENT.{commit_id}.t` and fsyncs it. Nothing is visible yet.
//! 2. [`Catalog::commit`] takes the exclusive lock, checks that the live
//!    snapshot is still the one the candidate was built on, renames the
//!    staged file over `CURRENT` and swaps the in-memory snapshot.
//!
//! A crash anywhere before the rename leaves `CURRENT` untouched; recovery
//! deletes the staged file.
//!
//! ## File format
//!
//! ```text
//! # RiptideTS file set catalog
//! commit:12
//! F:1 head=12/92 data=12/24 sma=3/12 last=12/4410
//! F:2 head=5/92 data=5/24 sma=5/12 last=5/880,9/1024
//! ```
//!
//! Every file reference is `<commit_id>/<size>`. Lines starting with `#`
//! are comments; empty lines are ignored.
//!
//! Readers hold an `Arc<FsSnapshot>`. Superseded file sets are parked on a
//! retired list and their files are only deleted by
//! [`Catalog::purge_obsolete`] once no snapshot references them any more.

use anyhow::{bail, ensure, Context, Result};
use fileset::{file_name, file_path, sync_parent_dir, FileKind};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::EngineError;

/// Name of the live catalog file within the data directory.
pub const CATALOG_FILENAME: &str = "CURRENT";

/// Suffix of staged (phase one) catalog files: `CURRENT.{commit_id}.t`.
pub const STAGED_SUFFIX: &str = ".t";

const HEADER: &str = "# RiptideTS file set catalog";

/// `CURRENT.{commit_id}.t`.
#[must_use]
pub fn staged_file_name(commit_id: i64) -> String {
    format!("{}.{}{}", CATALOG_FILENAME, commit_id, STAGED_SUFFIX)
}

/// Parses a staged catalog name back into its commit id.
pub fn parse_staged_file_name(name: &str) -> Option<i64> {
    name.strip_prefix(CATALOG_FILENAME)?
        .strip_prefix('.')?
        .strip_suffix(STAGED_SUFFIX)?
        .parse()
        .ok()
}

/// One physical file of a file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef {
    /// Commit that wrote the file; part of its name.
    pub commit_id: i64,
    pub size: u64,
}

impl std::fmt::Display for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.commit_id, self.size)
    }
}

/// The files of one time partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    pub fid: i64,
    pub head: FileRef,
    pub data: FileRef,
    pub sma: FileRef,
    /// Last-runs, oldest first.
    pub last: Vec<FileRef>,
}

impl FileSet {
    #[must_use]
    pub fn last_count(&self) -> usize {
        self.last.len()
    }

    /// Every member file, base files first.
    #[must_use]
    pub fn files(&self) -> Vec<(FileKind, FileRef)> {
        let mut out = vec![
            (FileKind::Head, self.head),
            (FileKind::Data, self.data),
            (FileKind::Sma, self.sma),
        ];
        out.extend(self.last.iter().map(|r| (FileKind::Last, *r)));
        out
    }

    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.files()
            .into_iter()
            .map(|(kind, r)| file_name(self.fid, r.commit_id, kind))
            .collect()
    }

    #[must_use]
    pub fn path_of(&self, dir: &Path, kind: FileKind, file: FileRef) -> PathBuf {
        file_path(dir, self.fid, file.commit_id, kind)
    }

    /// Total bytes on disk across all member files.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|(_, r)| r.size).sum()
    }
}

/// Immutable description of every live partition at one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsSnapshot {
    commit_id: i64,
    sets: BTreeMap<i64, Arc<FileSet>>,
}

impl FsSnapshot {
    #[must_use]
    pub fn new(commit_id: i64) -> Self {
        Self {
            commit_id,
            sets: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn commit_id(&self) -> i64 {
        self.commit_id
    }

    pub(crate) fn set_commit_id(&mut self, commit_id: i64) {
        self.commit_id = commit_id;
    }

    pub fn get(&self, fid: i64) -> Option<&Arc<FileSet>> {
        self.sets.get(&fid)
    }

    /// File sets in partition order.
    pub fn file_sets(&self) -> impl Iterator<Item = &Arc<FileSet>> {
        self.sets.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Inserts or replaces the file set for `set.fid`.
    pub fn upsert(&mut self, set: FileSet) -> Arc<FileSet> {
        let set = Arc::new(set);
        self.sets.insert(set.fid, Arc::clone(&set));
        set
    }

    /// Names of every file referenced by this snapshot.
    #[must_use]
    pub fn referenced_files(&self) -> HashSet<String> {
        self.sets.values().flat_map(|s| s.file_names()).collect()
    }

    /// Renders the catalog text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER);
        out.push('\n');
        out.push_str(&format!("commit:{}\n", self.commit_id));
        for set in self.sets.values() {
            let last: Vec<String> = set.last.iter().map(FileRef::to_string).collect();
            out.push_str(&format!(
                "F:{} head={} data={} sma={} last={}\n",
                set.fid,
                set.head,
                set.data,
                set.sma,
                last.join(",")
            ));
        }
        out
    }

    /// Parses the catalog text format.
    ///
    /// # Errors
    ///
    /// Fails on a missing or repeated `commit:` line, on a malformed file
    /// set line, or when a partition appears twice.
    pub fn decode(text: &str) -> Result<Self> {
        let mut commit_id: Option<i64> = None;
        let mut sets = BTreeMap::new();

        for (line_num, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(id) = trimmed.strip_prefix("commit:") {
                ensure!(
                    commit_id.is_none(),
                    "catalog line {}: repeated commit line",
                    line_num + 1
                );
                commit_id = Some(id.parse().with_context(|| {
                    format!("catalog line {}: bad commit id '{}'", line_num + 1, id)
                })?);
            } else if trimmed.starts_with("F:") {
                let set = parse_file_set(trimmed)
                    .with_context(|| format!("catalog line {}: '{}'", line_num + 1, trimmed))?;
                let fid = set.fid;
                if sets.insert(fid, Arc::new(set)).is_some() {
                    bail!("catalog line {}: partition {} listed twice", line_num + 1, fid);
                }
            } else {
                bail!("catalog line {}: unrecognised entry '{}'", line_num + 1, trimmed);
            }
        }

        let commit_id = match commit_id {
            Some(id) => id,
            None => bail!("catalog has no commit line"),
        };
        Ok(Self { commit_id, sets })
    }
}

fn parse_file_ref(s: &str) -> Result<FileRef> {
    let (commit, size) = match s.split_once('/') {
        Some(parts) => parts,
        None => bail!("file reference '{}' is not <commit>/<size>", s),
    };
    Ok(FileRef {
        commit_id: commit.parse().with_context(|| format!("bad commit id in '{}'", s))?,
        size: size.parse().with_context(|| format!("bad size in '{}'", s))?,
    })
}

fn parse_file_set(line: &str) -> Result<FileSet> {
    let mut tokens = line.split_whitespace();
    let fid_token = tokens.next().unwrap_or_default();
    let fid: i64 = fid_token
        .strip_prefix("F:")
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("bad partition id '{}'", fid_token))?;

    let (mut head, mut data, mut sma) = (None, None, None);
    let mut last = Vec::new();
    for token in tokens {
        let (field, value) = match token.split_once('=') {
            Some(kv) => kv,
            None => bail!("expected <field>=<value>, got '{}'", token),
        };
        match field {
            "head" => head = Some(parse_file_ref(value)?),
            "data" => data = Some(parse_file_ref(value)?),
            "sma" => sma = Some(parse_file_ref(value)?),
            "last" => {
                last = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(parse_file_ref)
                    .collect::<Result<_>>()?;
            }
            other => bail!("unknown field '{}'", other),
        }
    }

    match (head, data, sma) {
        (Some(head), Some(data), Some(sma)) => Ok(FileSet {
            fid,
            head,
            data,
            sma,
            last,
        }),
        _ => bail!("partition {} is missing its head, data or sma file", fid),
    }
}

/// A snapshot written by phase one and waiting for [`Catalog::commit`].
#[derive(Debug)]
#[must_use = "a staged snapshot must be committed or discarded"]
pub struct StagedSnapshot {
    path: PathBuf,
    base_commit_id: i64,
    snapshot: FsSnapshot,
}

impl StagedSnapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn base_commit_id(&self) -> i64 {
        self.base_commit_id
    }

    pub fn snapshot(&self) -> &FsSnapshot {
        &self.snapshot
    }
}

/// Owner of the live snapshot and the on-disk `CURRENT` file.
pub struct Catalog {
    dir: PathBuf,
    live: RwLock<Arc<FsSnapshot>>,
    /// File sets replaced by a commit whose files may still be in use.
    retired: Mutex<Vec<Arc<FileSet>>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.current();
        f.debug_struct("Catalog")
            .field("dir", &self.dir)
            .field("commit_id", &live.commit_id())
            .field("partitions", &live.len())
            .field("retired", &self.retired.lock().len())
            .finish()
    }
}

impl Catalog {
    /// Loads `dir/CURRENT`, or starts from an empty snapshot at commit 0 if
    /// there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog exists but cannot be read or parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CATALOG_FILENAME);
        let snapshot = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read catalog at {}", path.display()))?;
            FsSnapshot::decode(&text)
                .with_context(|| format!("failed to parse catalog at {}", path.display()))?
        } else {
            FsSnapshot::new(0)
        };
        debug!(
            commit_id = snapshot.commit_id(),
            partitions = snapshot.len(),
            "catalog loaded"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            live: RwLock::new(Arc::new(snapshot)),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The live snapshot. Holding the `Arc` keeps every file it references
    /// on disk.
    #[must_use]
    pub fn current(&self) -> Arc<FsSnapshot> {
        Arc::clone(&self.live.read())
    }

    /// Phase one: writes `snapshot` to `CURRENT.{commit_id}.t` and fsyncs
    /// it. `base_commit_id` is the commit of the live snapshot `snapshot`
    /// was derived from.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot's commit id does not move past its base, or on
    /// I/O error (the partial staged file is removed).
    pub fn stage(&self, snapshot: FsSnapshot, base_commit_id: i64) -> Result<StagedSnapshot> {
        ensure!(
            snapshot.commit_id() > base_commit_id,
            "staged commit {} does not advance past {}",
            snapshot.commit_id(),
            base_commit_id
        );
        let path = self.dir.join(staged_file_name(snapshot.commit_id()));
        let written = (|| -> Result<()> {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            f.write_all(snapshot.encode().as_bytes())?;
            f.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        debug!(
            commit_id = snapshot.commit_id(),
            base_commit_id,
            path = %path.display(),
            "snapshot staged"
        );
        Ok(StagedSnapshot {
            path,
            base_commit_id,
            snapshot,
        })
    }

    /// Phase two: publishes a staged snapshot.
    ///
    /// Under the exclusive lock, the live snapshot must still be at
    /// `staged.base_commit_id()`. On success `CURRENT` is replaced, the new
    /// snapshot becomes visible and every file set it no longer shares with
    /// the previous one is retired. On any failure the staged file is
    /// removed and the live snapshot is untouched.
    ///
    /// # Errors
    ///
    /// [`EngineError::CommitConflict`] if another commit got in first,
    /// [`EngineError::Io`] if the rename fails.
    pub fn commit(&self, staged: StagedSnapshot) -> Result<Arc<FsSnapshot>, EngineError> {
        let mut live = self.live.write();
        if live.commit_id() != staged.base_commit_id {
            let found = live.commit_id();
            drop(live);
            let _ = fs::remove_file(&staged.path);
            warn!(
                expected = staged.base_commit_id,
                found,
                commit_id = staged.snapshot.commit_id(),
                "staged snapshot is stale, commit refused"
            );
            return Err(EngineError::CommitConflict {
                expected: staged.base_commit_id,
                found,
            });
        }

        let current = self.dir.join(CATALOG_FILENAME);
        if let Err(e) = fs::rename(&staged.path, &current) {
            let _ = fs::remove_file(&staged.path);
            return Err(EngineError::Io(anyhow::Error::new(e).context(format!(
                "failed to rename {} to {}",
                staged.path.display(),
                current.display()
            ))));
        }
        sync_parent_dir(&current);

        let next = Arc::new(staged.snapshot);
        {
            let mut retired = self.retired.lock();
            for old in live.file_sets() {
                match next.get(old.fid) {
                    Some(kept) if Arc::ptr_eq(kept, old) => {}
                    _ => retired.push(Arc::clone(old)),
                }
            }
        }
        *live = Arc::clone(&next);
        drop(live);

        info!(
            commit_id = next.commit_id(),
            partitions = next.len(),
            "snapshot committed"
        );
        Ok(next)
    }

    /// Throws a staged snapshot away without publishing it.
    pub fn discard(&self, staged: StagedSnapshot) {
        if let Err(e) = fs::remove_file(&staged.path) {
            warn!(path = %staged.path.display(), error = %e, "failed to remove staged snapshot");
        }
    }

    /// Deletes the files of retired file sets that no reader holds. A file
    /// is kept while the live snapshot or any still-held retired set
    /// references it, since consecutive file sets of a partition share
    /// their unchanged files. Returns the number of files removed.
    pub fn purge_obsolete(&self) -> Result<usize> {
        let mut protected = self.current().referenced_files();
        let mut retired = self.retired.lock();

        // One count belongs to the retired list itself.
        let (held, released): (Vec<_>, Vec<_>) = std::mem::take(&mut *retired)
            .into_iter()
            .partition(|set| Arc::strong_count(set) > 1);
        for set in &held {
            protected.extend(set.file_names());
        }
        *retired = held;

        let mut pending = released.into_iter();
        let mut removed = 0usize;
        while let Some(set) = pending.next() {
            for name in set.file_names() {
                if protected.contains(&name) {
                    continue;
                }
                let path = self.dir.join(&name);
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        retired.push(set);
                        retired.extend(pending);
                        return Err(anyhow::Error::new(e)
                            .context(format!("failed to delete {}", path.display())));
                    }
                }
            }
        }

        if removed > 0 {
            sync_parent_dir(&self.dir.join(CATALOG_FILENAME));
            debug!(removed, "obsolete files purged");
        }
        Ok(removed)
    }

    /// Number of superseded file sets still waiting to be purged.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }
}
