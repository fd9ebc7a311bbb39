use anyhow::Result;
use row::{Block, Row, RowKey};
use std::path::{Path, PathBuf};

use crate::{BlockFileWriter, FragmentKind, FragmentSummary};

pub fn make_row(c: i64, e: i64, ts: i64) -> Row {
    Row::new(RowKey::new(c, e, ts), format!("{}-{}-{}", c, e, ts).into_bytes())
}

pub fn make_key(c: i64, e: i64, ts: i64) -> RowKey {
    RowKey::new(c, e, ts)
}

pub fn make_block(rows: &[(i64, i64, i64)]) -> Block {
    Block::from_rows(rows.iter().map(|&(c, e, ts)| make_row(c, e, ts)).collect())
}

/// Writes `blocks` as a last-run file and returns its summary.
pub fn write_last(dir: &Path, name: &str, blocks: &[Block]) -> Result<FragmentSummary> {
    let path: PathBuf = dir.join(name);
    let mut w = BlockFileWriter::create(&path, FragmentKind::Last)?;
    for b in blocks {
        w.append_block(b)?;
    }
    w.finish(7)
}

pub fn keys_of(rows: &[Row]) -> Vec<RowKey> {
    rows.iter().map(|r| r.key).collect()
}
