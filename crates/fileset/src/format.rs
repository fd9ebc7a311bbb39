//! Binary format constants and footer/header read/write helpers.
//!
//! ## Fragment footer (24 bytes), shared by data and last files
//!
//! ```text
//! [commit_id: i64 LE][index_offset: u64 LE][block_count: u32 LE][magic: u32 LE]
//! ```
//!
//! ## Head metadata trailer (92 bytes)
//!
//! ```text
//! [commit_id: i64][row_count: u64][min_key: 4 x i64][max_key: 4 x i64]
//! [block_count: u32][crc32: u32][magic: u32 = "HED1"]
//! ```
//!
//! The head CRC covers every byte of the file before the CRC field.

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use row::RowKey;
use std::io::{Read, Seek, SeekFrom, Write};

/// Magic number identifying base data files (ASCII "DAT1").
pub const DATA_MAGIC: u32 = 0x4441_5431;

/// Magic number identifying last-run files (ASCII "LST1").
pub const LAST_MAGIC: u32 = 0x4c53_5431;

/// Magic number identifying head files (ASCII "HED1").
pub const HEAD_MAGIC: u32 = 0x4845_4431;

/// Magic number identifying auxiliary (sma) files (ASCII "SMA1").
pub const SMA_MAGIC: u32 = 0x534d_4131;

/// 8 (`commit_id`) + 8 (`index_offset`) + 4 (`block_count`) + 4 (`magic`).
pub const FRAGMENT_FOOTER_BYTES: u64 = 8 + 8 + 4 + 4;

/// Encoded size of a [`RowKey`].
pub const KEY_BYTES: u64 = 4 * 8;

/// 8 + 8 + key + key + 4 + 4 + 4.
pub const HEAD_TRAILER_BYTES: u64 = 8 + 8 + KEY_BYTES + KEY_BYTES + 4 + 4 + 4;

/// Block-index entry: offset + len + row_count + min/max key + crc.
pub const BLOCK_INFO_BYTES: u64 = 8 + 4 + 4 + KEY_BYTES + KEY_BYTES + 4;

/// Sma file: magic + commit id.
pub const SMA_BYTES: u64 = 4 + 8;

/// Which kind of block file a fragment lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Base region: blocks only, the block index lives in the head file.
    Data,
    /// Last-run: blocks followed by their own last-block index.
    Last,
}

impl FragmentKind {
    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            FragmentKind::Data => DATA_MAGIC,
            FragmentKind::Last => LAST_MAGIC,
        }
    }

    pub fn from_magic(magic: u32) -> Result<Self> {
        match magic {
            DATA_MAGIC => Ok(FragmentKind::Data),
            LAST_MAGIC => Ok(FragmentKind::Last),
            other => bail!("unknown fragment magic: {:#x}", other),
        }
    }
}

/// Location and summary of one block inside a data or last file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block's CRC prefix.
    pub offset: u64,
    /// Total encoded length, CRC prefix included.
    pub len: u32,
    pub row_count: u32,
    pub min_key: RowKey,
    pub max_key: RowKey,
    /// CRC32 of the block body, duplicated from the block prefix.
    pub crc: u32,
}

/// Parsed fragment footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentFooter {
    pub kind: FragmentKind,
    pub commit_id: i64,
    pub index_offset: u64,
    pub block_count: u32,
}

/// Header metadata of a file set, stored as the trailer of the head file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadMeta {
    pub commit_id: i64,
    /// Rows in the file set as of `commit_id` (base plus the last-runs
    /// written by that commit).
    pub row_count: u64,
    /// `(min, max)` key over the same rows, `None` when there are none.
    pub key_range: Option<(RowKey, RowKey)>,
    /// Entries in the base block index.
    pub block_count: u32,
}

pub fn write_key<W: Write>(w: &mut W, key: &RowKey) -> std::io::Result<()> {
    w.write_i64::<LittleEndian>(key.container_id)?;
    w.write_i64::<LittleEndian>(key.entity_id)?;
    w.write_i64::<LittleEndian>(key.ts)?;
    w.write_i64::<LittleEndian>(key.version)?;
    Ok(())
}

pub fn read_key<R: Read>(r: &mut R) -> std::io::Result<RowKey> {
    Ok(RowKey {
        container_id: r.read_i64::<LittleEndian>()?,
        entity_id: r.read_i64::<LittleEndian>()?,
        ts: r.read_i64::<LittleEndian>()?,
        version: r.read_i64::<LittleEndian>()?,
    })
}

pub fn write_block_info<W: Write>(w: &mut W, info: &BlockInfo) -> std::io::Result<()> {
    w.write_u64::<LittleEndian>(info.offset)?;
    w.write_u32::<LittleEndian>(info.len)?;
    w.write_u32::<LittleEndian>(info.row_count)?;
    write_key(w, &info.min_key)?;
    write_key(w, &info.max_key)?;
    w.write_u32::<LittleEndian>(info.crc)?;
    Ok(())
}

pub fn read_block_info<R: Read>(r: &mut R) -> std::io::Result<BlockInfo> {
    Ok(BlockInfo {
        offset: r.read_u64::<LittleEndian>()?,
        len: r.read_u32::<LittleEndian>()?,
        row_count: r.read_u32::<LittleEndian>()?,
        min_key: read_key(r)?,
        max_key: read_key(r)?,
        crc: r.read_u32::<LittleEndian>()?,
    })
}

pub fn write_fragment_footer<W: Write>(w: &mut W, footer: &FragmentFooter) -> std::io::Result<()> {
    w.write_i64::<LittleEndian>(footer.commit_id)?;
    w.write_u64::<LittleEndian>(footer.index_offset)?;
    w.write_u32::<LittleEndian>(footer.block_count)?;
    w.write_u32::<LittleEndian>(footer.kind.magic())?;
    Ok(())
}

/// Reads the fragment footer from the last 24 bytes of `r`.
pub fn read_fragment_footer<R: Read + Seek>(r: &mut R) -> Result<FragmentFooter> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FRAGMENT_FOOTER_BYTES {
        bail!("file too small for fragment footer ({} bytes)", filesize);
    }
    r.seek(SeekFrom::End(-(FRAGMENT_FOOTER_BYTES as i64)))?;
    let commit_id = r.read_i64::<LittleEndian>()?;
    let index_offset = r.read_u64::<LittleEndian>()?;
    let block_count = r.read_u32::<LittleEndian>()?;
    let kind = FragmentKind::from_magic(r.read_u32::<LittleEndian>()?)?;

    if index_offset > filesize - FRAGMENT_FOOTER_BYTES {
        bail!("invalid index_offset {} (file is {} bytes)", index_offset, filesize);
    }

    Ok(FragmentFooter {
        kind,
        commit_id,
        index_offset,
        block_count,
    })
}

/// Encodes the head trailer into `buf` (without the CRC/magic suffix).
pub fn encode_head_meta(buf: &mut Vec<u8>, meta: &HeadMeta) -> std::io::Result<()> {
    let (min_key, max_key) = meta.key_range.unwrap_or((RowKey::MAX, RowKey::MIN));
    buf.write_i64::<LittleEndian>(meta.commit_id)?;
    buf.write_u64::<LittleEndian>(meta.row_count)?;
    write_key(buf, &min_key)?;
    write_key(buf, &max_key)?;
    buf.write_u32::<LittleEndian>(meta.block_count)?;
    Ok(())
}

pub fn decode_head_meta<R: Read>(r: &mut R) -> std::io::Result<HeadMeta> {
    let commit_id = r.read_i64::<LittleEndian>()?;
    let row_count = r.read_u64::<LittleEndian>()?;
    let min_key = read_key(r)?;
    let max_key = read_key(r)?;
    let block_count = r.read_u32::<LittleEndian>()?;
    let key_range = (row_count > 0).then_some((min_key, max_key));
    Ok(HeadMeta {
        commit_id,
        row_count,
        key_range,
        block_count,
    })
}
