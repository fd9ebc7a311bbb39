/// Cold-start recovery.
///
/// `CURRENT` is the only source of truth. Anything else in the data
/// directory that it does not reference is debris from a write or merge
/// that never reached phase two, and is deleted:
///
/// - staged catalogs (`CURRENT.{commit_id}.t`)
/// - temp files (`*.tmp`) from interrupted atomic writes
/// - file set members (`f{fid}ver{commit}.*`) no partition references
///
/// The commit id allocator resumes above every commit id seen, including
/// the ones on deleted debris.
use anyhow::{Context, Result};
use fileset::parse_file_name;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::catalog::{parse_staged_file_name, FsSnapshot, CATALOG_FILENAME};

/// What [`cleanup_orphans`] found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub staged_removed: usize,
    pub tmp_removed: usize,
    pub orphans_removed: usize,
    /// Largest commit id seen in the catalog or in any file name.
    pub max_commit_id: i64,
}

/// Deletes every file in `dir` that `live` does not account for.
///
/// # Errors
///
/// Fails only if the directory cannot be listed; individual delete failures
/// are logged and skipped.
pub fn cleanup_orphans(dir: &Path, live: &FsSnapshot) -> Result<RecoveryStats> {
    let referenced = live.referenced_files();
    let mut stats = RecoveryStats {
        max_commit_id: live.commit_id(),
        ..RecoveryStats::default()
    };

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if name == CATALOG_FILENAME {
            continue;
        }

        let counter = if let Some(commit_id) = parse_staged_file_name(&name) {
            stats.max_commit_id = stats.max_commit_id.max(commit_id);
            &mut stats.staged_removed
        } else if name.ends_with(".tmp") {
            &mut stats.tmp_removed
        } else if let Some((_, commit_id, _)) = parse_file_name(&name) {
            stats.max_commit_id = stats.max_commit_id.max(commit_id);
            if referenced.contains(&name) {
                continue;
            }
            &mut stats.orphans_removed
        } else {
            continue;
        };

        match fs::remove_file(&path) {
            Ok(()) => *counter += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover file"),
        }
    }

    for name in &referenced {
        if !dir.join(name).exists() {
            warn!(file = %name, "catalog references a missing file");
        }
    }

    if stats.staged_removed + stats.tmp_removed + stats.orphans_removed > 0 {
        info!(
            staged = stats.staged_removed,
            tmp = stats.tmp_removed,
            orphans = stats.orphans_removed,
            "removed leftovers of unfinished commits"
        );
    }
    Ok(stats)
}
