use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use row::{Block, Row, RowKey};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::format::{
    decode_head_meta, read_block_info, read_fragment_footer, BlockInfo, FragmentKind, HeadMeta,
    BLOCK_INFO_BYTES, FRAGMENT_FOOTER_BYTES, HEAD_MAGIC, HEAD_TRAILER_BYTES,
};
use crate::merge::BlockSource;
use crate::writer::FLAG_SINGLE_ENTITY;

/// Maximum block body we'll allocate during reads (256 MiB). Prevents OOM on corrupt files.
const MAX_BLOCK_BYTES: u32 = 256 * 1024 * 1024;
/// Maximum payload size we'll allocate during reads (10 MiB). Prevents OOM on corrupt files.
const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Sequential block reader over one fragment.
///
/// On open the fragment's whole block index is loaded into memory: for a
/// last-run it comes from the file's own index section, for the base region
/// from the head file. Blocks are then read lazily, one per
/// [`next_block`](BlockSource::next_block) call, and verified against
/// their CRC and index entry.
pub struct FragmentReader {
    path: PathBuf,
    kind: FragmentKind,
    commit_id: i64,
    index: Vec<BlockInfo>,
    file: BufReader<File>,
    /// Position of the next block to hand out.
    cursor: usize,
}

impl std::fmt::Debug for FragmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentReader")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("commit_id", &self.commit_id)
            .field("blocks", &self.index.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl FragmentReader {
    /// Opens a last-run file and loads its last-block index.
    ///
    /// # Errors
    ///
    /// Fails if the footer is missing or not a last-run footer, if the
    /// index section does not exactly fill the space before the footer, or
    /// on any I/O error.
    pub fn open_last<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut f =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let filesize = f.metadata()?.len();
        let footer = read_fragment_footer(&mut f)?;
        ensure!(
            footer.kind == FragmentKind::Last,
            "{} is not a last-run file",
            path.display()
        );

        let index_bytes = u64::from(footer.block_count) * BLOCK_INFO_BYTES;
        ensure!(
            footer.index_offset + index_bytes == filesize - FRAGMENT_FOOTER_BYTES,
            "corrupt last-block index in {}",
            path.display()
        );

        f.seek(SeekFrom::Start(footer.index_offset))?;
        let mut rdr = BufReader::new(f);
        let mut index = Vec::with_capacity(footer.block_count as usize);
        for _ in 0..footer.block_count {
            index.push(read_block_info(&mut rdr)?);
        }
        check_index(&index, footer.index_offset)?;

        Ok(Self {
            path,
            kind: FragmentKind::Last,
            commit_id: footer.commit_id,
            index,
            file: rdr,
            cursor: 0,
        })
    }

    /// Opens the base region of a file set: the block index from the head
    /// file and the blocks from the data file.
    pub fn open_base<P1: AsRef<Path>, P2: AsRef<Path>>(
        head_path: P1,
        data_path: P2,
    ) -> Result<(Self, HeadMeta)> {
        let (meta, index) = read_head_file(head_path)?;

        let path = data_path.as_ref().to_path_buf();
        let mut f =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let footer = read_fragment_footer(&mut f)?;
        ensure!(
            footer.kind == FragmentKind::Data,
            "{} is not a data file",
            path.display()
        );
        ensure!(
            footer.block_count == meta.block_count,
            "head lists {} blocks but {} holds {}",
            meta.block_count,
            path.display(),
            footer.block_count
        );
        check_index(&index, footer.index_offset)?;
        f.seek(SeekFrom::Start(0))?;

        Ok((
            Self {
                path,
                kind: FragmentKind::Data,
                commit_id: footer.commit_id,
                index,
                file: BufReader::new(f),
                cursor: 0,
            },
            meta,
        ))
    }

    /// Reads and verifies block `i` of the index.
    pub fn read_block(&mut self, i: usize) -> Result<Block> {
        let info = match self.index.get(i) {
            Some(info) => *info,
            None => bail!("block {} out of range ({} blocks)", i, self.index.len()),
        };

        self.file.seek(SeekFrom::Start(info.offset))?;
        let stored_crc = self.file.read_u32::<LittleEndian>()?;
        let body_len = self.file.read_u32::<LittleEndian>()?;
        if body_len > MAX_BLOCK_BYTES || body_len + 8 != info.len {
            bail!(
                "corrupt block at offset {} in {}: body_len {} does not match index",
                info.offset,
                self.path.display(),
                body_len
            );
        }
        let mut body = vec![0u8; body_len as usize];
        self.file.read_exact(&mut body)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let actual_crc = hasher.finalize();
        if actual_crc != stored_crc || stored_crc != info.crc {
            bail!(
                "CRC32 mismatch at offset {} in {}: expected {:#010x}, got {:#010x} (data corruption)",
                info.offset,
                self.path.display(),
                info.crc,
                actual_crc
            );
        }

        let block = decode_block_body(&body)?;
        ensure!(
            block.len() == info.row_count as usize
                && block.first_key() == Some(info.min_key)
                && block.last_key() == Some(info.max_key),
            "block at offset {} in {} disagrees with its index entry",
            info.offset,
            self.path.display()
        );
        Ok(block)
    }

    #[must_use]
    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    #[must_use]
    pub fn commit_id(&self) -> i64 {
        self.commit_id
    }

    pub fn index(&self) -> &[BlockInfo] {
        &self.index
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Total rows across all blocks, from the index.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.index.iter().map(|b| u64::from(b.row_count)).sum()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockSource for FragmentReader {
    fn next_block(&mut self) -> Result<Option<Block>> {
        if self.cursor >= self.index.len() {
            return Ok(None);
        }
        let block = self.read_block(self.cursor)?;
        self.cursor += 1;
        Ok(Some(block))
    }
}

/// Reads and verifies a head file, returning its metadata and the base
/// block index.
pub fn read_head_file<P: AsRef<Path>>(path: P) -> Result<(HeadMeta, Vec<BlockInfo>)> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let len = bytes.len() as u64;
    ensure!(
        len >= HEAD_TRAILER_BYTES,
        "head file {} too small ({} bytes)",
        path.display(),
        len
    );

    let crc_pos = bytes.len() - 8;
    let mut tail = &bytes[crc_pos..];
    let stored_crc = tail.read_u32::<LittleEndian>()?;
    let magic = tail.read_u32::<LittleEndian>()?;
    ensure!(magic == HEAD_MAGIC, "bad head magic {:#x} in {}", magic, path.display());

    let mut hasher = Crc32::new();
    hasher.update(&bytes[..crc_pos]);
    ensure!(
        hasher.finalize() == stored_crc,
        "CRC32 mismatch in head file {} (data corruption)",
        path.display()
    );

    let meta_pos = (len - HEAD_TRAILER_BYTES) as usize;
    let meta = decode_head_meta(&mut &bytes[meta_pos..crc_pos])?;
    ensure!(
        meta_pos as u64 == u64::from(meta.block_count) * BLOCK_INFO_BYTES,
        "head file {} lists {} blocks but holds {} index bytes",
        path.display(),
        meta.block_count,
        meta_pos
    );

    let mut idx_bytes = &bytes[..meta_pos];
    let mut index = Vec::with_capacity(meta.block_count as usize);
    for _ in 0..meta.block_count {
        index.push(read_block_info(&mut idx_bytes)?);
    }
    // The head records every row of the file set at its commit, base included.
    let rows: u64 = index.iter().map(|b| u64::from(b.row_count)).sum();
    ensure!(
        rows <= meta.row_count,
        "head file {} row count {} is below its base index total {}",
        path.display(),
        meta.row_count,
        rows
    );
    Ok((meta, index))
}

/// Index entries must be non-overlapping, ordered, and inside the block area.
fn check_index(index: &[BlockInfo], blocks_end: u64) -> Result<()> {
    let mut expected_offset = 0u64;
    let mut prev_max: Option<RowKey> = None;
    for info in index {
        ensure!(
            info.offset == expected_offset,
            "block index gap at offset {} (expected {})",
            info.offset,
            expected_offset
        );
        ensure!(info.min_key <= info.max_key, "block index entry with inverted key range");
        if let Some(prev) = prev_max {
            ensure!(
                info.min_key > prev,
                "block index not sorted: {} after {}",
                info.min_key,
                prev
            );
        }
        prev_max = Some(info.max_key);
        expected_offset += u64::from(info.len);
    }
    ensure!(
        expected_offset == blocks_end,
        "block index covers {} bytes but block area is {}",
        expected_offset,
        blocks_end
    );
    Ok(())
}

fn decode_block_body(body: &[u8]) -> Result<Block> {
    let mut br = body;
    let container_id = br.read_i64::<LittleEndian>()?;
    let flags = br.read_u8()?;
    let block_entity = if flags & FLAG_SINGLE_ENTITY != 0 {
        Some(br.read_i64::<LittleEndian>()?)
    } else {
        None
    };
    let row_count = br.read_u32::<LittleEndian>()? as usize;

    // Each row takes at least 20 bytes; reject counts the body cannot hold.
    ensure!(row_count <= body.len() / 20 + 1, "corrupt block: row_count {}", row_count);

    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let entity_id = match block_entity {
            Some(e) => e,
            None => br.read_i64::<LittleEndian>()?,
        };
        let ts = br.read_i64::<LittleEndian>()?;
        let version = br.read_i64::<LittleEndian>()?;
        let payload_len = br.read_u32::<LittleEndian>()? as usize;
        if payload_len > MAX_PAYLOAD_BYTES || payload_len > br.len() {
            bail!("corrupt block: payload_len {} exceeds remaining body", payload_len);
        }
        let (payload, rest) = br.split_at(payload_len);
        br = rest;
        rows.push(Row::new(
            RowKey {
                container_id,
                entity_id,
                ts,
                version,
            },
            payload.to_vec(),
        ));
    }
    ensure!(br.is_empty(), "corrupt block: {} trailing bytes", br.len());
    Ok(Block::from_rows(rows))
}
