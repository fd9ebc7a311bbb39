//! # FileSet - partition files and the fragment merge
//!
//! A time partition ("file set") is stored as a handful of immutable files,
//! all named after the partition id `fid` and the `commit_id` that wrote
//! them:
//!
//! ```text
//! f{fid}ver{commit_id}.head   base block index + file set header metadata
//! f{fid}ver{commit_id}.data   base region blocks
//! f{fid}ver{commit_id}.sma    auxiliary index (opaque, carried forward)
//! f{fid}ver{commit_id}.last   one sorted last-run (a partition has 1..K)
//! ```
//!
//! ## Data / last file layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ BLOCK SECTION (sorted row groups)                             │
//! │                                                               │
//! │ crc32 (u32) | body_len (u32) | body                           │
//! │ body: container_id | flags | [entity_id] | row_count | rows   │
//! │                                                               │
//! │ ... repeated for each block ...                               │
//! ├───────────────────────────────────────────────────────────────┤
//! │ LAST-BLOCK INDEX (last files only)                            │
//! │                                                               │
//! │ offset (u64) | len (u32) | row_count (u32)                    │
//! │ min_key (4 x i64) | max_key (4 x i64) | crc32 (u32)           │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 24 bytes)                                 │
//! │                                                               │
//! │ commit_id (i64) | index_offset (u64) | block_count (u32)      │
//! │ magic (u32) "DAT1" or "LST1"                                  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The base region's index lives in the head file instead, together with
//! the file set's record count, key range and commit id.
//!
//! All integers are little-endian. Every file is written to a `.tmp`
//! sibling, fsynced and renamed into place.
//!
//! ## Merge
//!
//! [`TournamentMerger`] turns the base region plus all last-runs of a
//! partition into one strictly increasing row stream; see [`merge`].

mod error;
mod format;
pub mod merge;
mod reader;
mod writer;

pub use error::MergeError;
pub use format::{
    BlockInfo, FragmentFooter, FragmentKind, HeadMeta, BLOCK_INFO_BYTES, DATA_MAGIC,
    FRAGMENT_FOOTER_BYTES, HEAD_MAGIC, LAST_MAGIC, SMA_MAGIC,
};
pub use merge::{BlockSource, FragmentIterator, TournamentMerger};
pub use reader::{read_head_file, FragmentReader};
pub use writer::{
    sync_parent_dir, tmp_path_for, write_atomic, write_head_file, write_sma_file,
    BlockFileWriter, FragmentSummary,
};

use std::path::{Path, PathBuf};

/// File extension of each member of a file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Head,
    Data,
    Sma,
    Last,
}

impl FileKind {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Head => "head",
            FileKind::Data => "data",
            FileKind::Sma => "sma",
            FileKind::Last => "last",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "head" => Some(FileKind::Head),
            "data" => Some(FileKind::Data),
            "sma" => Some(FileKind::Sma),
            "last" => Some(FileKind::Last),
            _ => None,
        }
    }
}

/// `f{fid}ver{commit_id}.{ext}`.
#[must_use]
pub fn file_name(fid: i64, commit_id: i64, kind: FileKind) -> String {
    format!("f{}ver{}.{}", fid, commit_id, kind.extension())
}

#[must_use]
pub fn file_path(dir: &Path, fid: i64, commit_id: i64, kind: FileKind) -> PathBuf {
    dir.join(file_name(fid, commit_id, kind))
}

/// Parses a name produced by [`file_name`] back into `(fid, commit_id, kind)`.
pub fn parse_file_name(name: &str) -> Option<(i64, i64, FileKind)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let kind = FileKind::from_extension(ext)?;
    let rest = stem.strip_prefix('f')?;
    let (fid, commit) = rest.split_once("ver")?;
    Some((fid.parse().ok()?, commit.parse().ok()?, kind))
}

#[cfg(test)]
mod tests;
