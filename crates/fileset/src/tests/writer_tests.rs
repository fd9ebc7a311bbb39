use super::helpers::*;
use crate::*;
use anyhow::Result;
use row::{Block, Row, RowKey};
use std::fs;
use tempfile::tempdir;

#[test]
fn finish_renames_tmp_into_place() -> Result<()> {
    let dir = tempdir()?;
    let summary = write_last(dir.path(), "a.last", &[make_block(&[(1, 1, 1), (1, 1, 2)])])?;

    assert!(summary.path.exists());
    assert!(!tmp_path_for(&summary.path).exists());
    assert_eq!(summary.size, fs::metadata(&summary.path)?.len());
    assert_eq!(summary.row_count, 2);
    assert_eq!(summary.key_range, Some((make_key(1, 1, 1), make_key(1, 1, 2))));
    Ok(())
}

#[test]
fn empty_last_run_is_refused_and_cleaned_up() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty.last");
    let w = BlockFileWriter::create(&path, FragmentKind::Last)?;
    assert!(w.finish(1).is_err());
    assert!(!path.exists());
    assert!(!tmp_path_for(&path).exists());
    Ok(())
}

#[test]
fn failed_finish_removes_the_temp_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("blocked.last");
    let mut w = BlockFileWriter::create(&path, FragmentKind::Last)?;
    w.append_block(&make_block(&[(1, 1, 1)]))?;
    assert!(tmp_path_for(&path).exists());

    // A non-empty directory in the way makes the final rename fail.
    fs::create_dir(&path)?;
    fs::write(path.join("occupant"), b"x")?;
    assert!(w.finish(1).is_err());
    assert!(!tmp_path_for(&path).exists());
    assert!(path.is_dir());
    Ok(())
}

#[test]
fn empty_data_file_is_allowed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("x.data");
    let w = BlockFileWriter::create(&path, FragmentKind::Data)?;
    let summary = w.finish(3)?;
    assert_eq!(summary.row_count, 0);
    assert_eq!(summary.size, FRAGMENT_FOOTER_BYTES);
    Ok(())
}

#[test]
fn blocks_must_increase_across_the_file() -> Result<()> {
    let dir = tempdir()?;
    let mut w = BlockFileWriter::create(&dir.path().join("a.last"), FragmentKind::Last)?;
    w.append_block(&make_block(&[(1, 1, 10), (1, 1, 20)]))?;
    assert!(w.append_block(&make_block(&[(1, 1, 20), (1, 1, 30)])).is_err());
    assert!(w.append_block(&make_block(&[(1, 1, 5)])).is_err());
    w.append_block(&make_block(&[(1, 2, 0)]))?;
    assert_eq!(w.block_count(), 2);
    w.abandon();
    Ok(())
}

#[test]
fn unsorted_or_mixed_container_block_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let mut w = BlockFileWriter::create(&dir.path().join("a.last"), FragmentKind::Last)?;
    assert!(w.append_block(&make_block(&[(1, 1, 2), (1, 1, 1)])).is_err());
    assert!(w.append_block(&make_block(&[(1, 1, 1), (2, 1, 1)])).is_err());
    assert!(w.append_block(&Block::new()).is_err());
    assert_eq!(w.block_count(), 0);
    w.abandon();
    Ok(())
}

#[test]
fn abandon_removes_tmp_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("a.last");
    let mut w = BlockFileWriter::create(&path, FragmentKind::Last)?;
    w.append_block(&make_block(&[(1, 1, 1)]))?;
    assert!(tmp_path_for(&path).exists());
    w.abandon();
    assert!(!tmp_path_for(&path).exists());
    assert!(!path.exists());
    Ok(())
}

#[test]
fn head_file_round_trips_metadata() -> Result<()> {
    let dir = tempdir()?;
    let mut w = BlockFileWriter::create(&dir.path().join("b.data"), FragmentKind::Data)?;
    w.append_block(&make_block(&[(1, 1, 100), (1, 1, 300)]))?;
    w.append_block(&make_block(&[(1, 2, 5), (1, 3, 5)]))?;
    let data = w.finish(4)?;

    let meta = HeadMeta {
        commit_id: 4,
        row_count: data.row_count,
        key_range: data.key_range,
        block_count: data.index.len() as u32,
    };
    let head_path = dir.path().join("b.head");
    let size = write_head_file(&head_path, &meta, &data.index)?;
    assert_eq!(size, fs::metadata(&head_path)?.len());

    let (read_meta, index) = read_head_file(&head_path)?;
    assert_eq!(read_meta, meta);
    assert_eq!(index, data.index);
    Ok(())
}

#[test]
fn head_metadata_must_match_index_length() -> Result<()> {
    let dir = tempdir()?;
    let meta = HeadMeta {
        commit_id: 1,
        row_count: 0,
        key_range: None,
        block_count: 2,
    };
    assert!(write_head_file(&dir.path().join("x.head"), &meta, &[]).is_err());
    Ok(())
}

#[test]
fn sma_file_has_fixed_size() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("x.sma");
    assert_eq!(write_sma_file(&path, 9)?, 12);
    assert_eq!(fs::read(&path)?.len(), 12);
    Ok(())
}

#[test]
fn file_names_round_trip() {
    let name = file_name(-3, 42, FileKind::Last);
    assert_eq!(name, "f-3ver42.last");
    assert_eq!(parse_file_name(&name), Some((-3, 42, FileKind::Last)));
    assert_eq!(parse_file_name("f1ver2.head"), Some((1, 2, FileKind::Head)));
    assert_eq!(parse_file_name("f1ver2.last.tmp"), None);
    assert_eq!(parse_file_name("CURRENT"), None);
    assert_eq!(parse_file_name("g1ver2.data"), None);
}

#[test]
fn large_payloads_survive() -> Result<()> {
    let dir = tempdir()?;
    let big = Row::new(RowKey::new(1, 1, 1), vec![0xab; 256 * 1024]);
    let summary = write_last(dir.path(), "big.last", &[Block::from_rows(vec![big.clone()])])?;
    let mut r = FragmentReader::open_last(&summary.path)?;
    assert_eq!(r.read_block(0)?.rows(), &[big]);
    Ok(())
}
