use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use row::{Block, RowKey};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::format::{
    encode_head_meta, write_block_info, write_fragment_footer, BlockInfo, FragmentFooter,
    FragmentKind, HeadMeta, HEAD_MAGIC, SMA_MAGIC,
};

/// Block flag: every row shares the entity id stored in the block header.
pub(crate) const FLAG_SINGLE_ENTITY: u8 = 1;

/// Result of finishing a [`BlockFileWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSummary {
    pub path: PathBuf,
    /// Final file size in bytes.
    pub size: u64,
    pub row_count: u64,
    pub key_range: Option<(RowKey, RowKey)>,
    /// Block index of the file. For data files this is what goes into the
    /// head file.
    pub index: Vec<BlockInfo>,
}

/// Streams blocks into a new data or last-run file.
///
/// Everything is written to `<path>.tmp`; [`finish`](BlockFileWriter::finish)
/// fsyncs and renames it into place, so a crash mid-write leaves only a
/// temp file that recovery deletes. Blocks must arrive in strictly
/// increasing key order across the whole file.
pub struct BlockFileWriter {
    kind: FragmentKind,
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    index: Vec<BlockInfo>,
    row_count: u64,
    key_range: Option<(RowKey, RowKey)>,
    /// Reusable buffer for encoding block bodies.
    body_buf: Vec<u8>,
}

impl BlockFileWriter {
    /// Creates the temp file backing a new fragment at `path`.
    pub fn create(path: &Path, kind: FragmentKind) -> Result<Self> {
        let tmp_path = tmp_path_for(path);
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;

        Ok(Self {
            kind,
            path: path.to_path_buf(),
            tmp_path,
            file: BufWriter::new(raw_file),
            offset: 0,
            index: Vec::new(),
            row_count: 0,
            key_range: None,
            body_buf: Vec::with_capacity(4096),
        })
    }

    /// Encodes and appends one block, returning its index entry.
    ///
    /// # Block layout
    ///
    /// ```text
    /// crc32 (u32) | body_len (u32) | body
    /// body: container_id (i64) | flags (u8) | [entity_id (i64)] | row_count (u32)
    ///       rows: [entity_id (i64)] | ts (i64) | version (i64) | payload_len (u32) | payload
    /// ```
    ///
    /// The block-level `entity_id` is present only for single-entity blocks;
    /// the per-row one only for multi-entity blocks. The CRC covers the body.
    pub fn append_block(&mut self, block: &Block) -> Result<BlockInfo> {
        let (min_key, max_key) = match (block.first_key(), block.last_key()) {
            (Some(a), Some(b)) => (a, b),
            _ => bail!("refusing to write an empty block"),
        };
        if let Err((a, b)) = block.check_sorted() {
            bail!("block rows out of order: {} then {}", a, b);
        }
        if let Some((_, prev_max)) = self.key_range {
            ensure!(
                min_key > prev_max,
                "block starting at {} does not follow previous block ending at {}",
                min_key,
                prev_max
            );
        }
        let container_id = min_key.container_id;
        ensure!(
            max_key.container_id == container_id,
            "block mixes containers {} and {}",
            container_id,
            max_key.container_id
        );
        let row_count = u32::try_from(block.len()).context("block has too many rows")?;

        self.body_buf.clear();
        encode_block_body(&mut self.body_buf, block, container_id, row_count)?;

        let body_len = u32::try_from(self.body_buf.len()).context("block body exceeds 4 GiB")?;
        let mut hasher = Crc32::new();
        hasher.update(&self.body_buf);
        let crc = hasher.finalize();

        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_u32::<LittleEndian>(body_len)?;
        self.file.write_all(&self.body_buf)?;

        let info = BlockInfo {
            offset: self.offset,
            len: body_len + 8,
            row_count,
            min_key,
            max_key,
            crc,
        };
        self.offset += u64::from(info.len);
        self.row_count += u64::from(row_count);
        self.key_range = Some(match self.key_range {
            Some((lo, _)) => (lo, max_key),
            None => (min_key, max_key),
        });
        self.index.push(info);
        Ok(info)
    }

    /// Number of blocks appended so far.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the index (last-runs only) and footer, syncs, and renames the
    /// temp file into place.
    ///
    /// # Errors
    ///
    /// Returns an error for a last-run with no blocks (an empty last-run is
    /// never useful and indicates a logic bug upstream) or on I/O failure.
    /// The temp file is removed on every error.
    pub fn finish(self, commit_id: i64) -> Result<FragmentSummary> {
        if self.kind == FragmentKind::Last && self.index.is_empty() {
            self.abandon();
            bail!("refusing to write an empty last-run (no blocks)");
        }

        let tmp_path = self.tmp_path.clone();
        self.seal(commit_id).map_err(|e| {
            if let Err(rm) = fs::remove_file(&tmp_path) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %tmp_path.display(), error = %rm, "failed to remove temp file");
                }
            }
            e
        })
    }

    fn seal(mut self, commit_id: i64) -> Result<FragmentSummary> {
        let index_offset = self.offset;
        if self.kind == FragmentKind::Last {
            for info in &self.index {
                write_block_info(&mut self.file, info)?;
            }
        }
        let block_count = u32::try_from(self.index.len()).context("too many blocks")?;
        write_fragment_footer(
            &mut self.file,
            &FragmentFooter {
                kind: self.kind,
                commit_id,
                index_offset,
                block_count,
            },
        )?;

        self.file.flush()?;
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                self.tmp_path.display(),
                self.path.display()
            )
        })?;
        sync_parent_dir(&self.path);

        debug!(
            path = %self.path.display(),
            size,
            rows = self.row_count,
            blocks = block_count,
            "fragment written"
        );

        Ok(FragmentSummary {
            path: self.path,
            size,
            row_count: self.row_count,
            key_range: self.key_range,
            index: self.index,
        })
    }

    /// Drops the writer and deletes its temp file.
    pub fn abandon(self) {
        let tmp = self.tmp_path.clone();
        drop(self.file);
        let _ = fs::remove_file(tmp);
    }
}

fn encode_block_body(
    buf: &mut Vec<u8>,
    block: &Block,
    container_id: i64,
    row_count: u32,
) -> std::io::Result<()> {
    let single = block.single_entity();
    buf.write_i64::<LittleEndian>(container_id)?;
    match single {
        Some(entity_id) => {
            buf.write_u8(FLAG_SINGLE_ENTITY)?;
            buf.write_i64::<LittleEndian>(entity_id)?;
        }
        None => buf.write_u8(0)?,
    }
    buf.write_u32::<LittleEndian>(row_count)?;

    for row in block.rows() {
        if single.is_none() {
            buf.write_i64::<LittleEndian>(row.key.entity_id)?;
        }
        buf.write_i64::<LittleEndian>(row.key.ts)?;
        buf.write_i64::<LittleEndian>(row.key.version)?;
        let payload_len = u32::try_from(row.payload.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "payload exceeds 4 GiB")
        })?;
        buf.write_u32::<LittleEndian>(payload_len)?;
        buf.extend_from_slice(&row.payload);
    }
    Ok(())
}

/// Writes a head file: the base block index followed by the file set's
/// header metadata. Atomic (temp file + rename). Returns the file size.
///
/// ```text
/// [INDEX]   repeated block-index entries (84 bytes each)
/// [TRAILER] commit_id | row_count | min_key | max_key | block_count | crc32 | magic "HED1"
/// ```
pub fn write_head_file(path: &Path, meta: &HeadMeta, index: &[BlockInfo]) -> Result<u64> {
    ensure!(
        meta.block_count as usize == index.len(),
        "head metadata claims {} blocks but index has {}",
        meta.block_count,
        index.len()
    );

    let mut buf = Vec::with_capacity(index.len() * 84 + 96);
    for info in index {
        write_block_info(&mut buf, info)?;
    }
    encode_head_meta(&mut buf, meta)?;
    let mut hasher = Crc32::new();
    hasher.update(&buf);
    buf.write_u32::<LittleEndian>(hasher.finalize())?;
    buf.write_u32::<LittleEndian>(HEAD_MAGIC)?;

    write_atomic(path, &buf)?;
    Ok(buf.len() as u64)
}

/// Writes an empty auxiliary (sma) file stamped with `commit_id`.
pub fn write_sma_file(path: &Path, commit_id: i64) -> Result<u64> {
    let mut buf = Vec::with_capacity(12);
    buf.write_u32::<LittleEndian>(SMA_MAGIC)?;
    buf.write_i64::<LittleEndian>(commit_id)?;
    write_atomic(path, &buf)?;
    Ok(buf.len() as u64)
}

/// Writes `bytes` to `path` via `path.tmp` + fsync + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = tmp_path_for(path);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        f.write_all(bytes)?;
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    sync_parent_dir(path);
    Ok(())
}

/// `<path>.tmp`, keeping the original extension visible.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Fsync the parent directory so a rename is durable. On ext4/XFS a crash
/// after rename but before dir sync can lose the entry; elsewhere this may
/// be a no-op.
pub fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
