use crate::*;
use row::{Row, RowKey};
use std::fs;
use std::path::Path;

pub fn make_row(c: i64, e: i64, ts: i64) -> Row {
    Row::new(RowKey::new(c, e, ts), format!("{}-{}-{}", c, e, ts).into_bytes())
}

pub fn make_key(c: i64, e: i64, ts: i64) -> RowKey {
    RowKey::new(c, e, ts)
}

pub fn rows(keys: &[(i64, i64, i64)]) -> Vec<Row> {
    keys.iter().map(|&(c, e, ts)| make_row(c, e, ts)).collect()
}

pub fn keys_of(rows: &[Row]) -> Vec<RowKey> {
    rows.iter().map(|r| r.key).collect()
}

/// Small blocks so a handful of rows already spans several of them.
pub fn test_config(max_last: usize) -> EngineConfig {
    EngineConfig {
        max_last,
        max_last_files: 8,
        block_rows: 3,
    }
}

pub fn open(dir: &Path, config: EngineConfig) -> Engine {
    Engine::open(dir, config).expect("open engine")
}

/// Flushes each batch as its own last-run of `fid`.
pub fn seed(engine: &Engine, fid: i64, batches: &[&[(i64, i64, i64)]]) {
    for batch in batches {
        engine
            .flush_last_run(fid, rows(batch))
            .expect("flush last-run");
    }
}

/// Sorted names of every file in `dir`.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

pub fn files_with_commit(dir: &Path, commit_id: i64) -> Vec<String> {
    let marker = format!("ver{}.", commit_id);
    list_files(dir)
        .into_iter()
        .filter(|n| n.contains(&marker))
        .collect()
}

pub fn catalog_bytes(dir: &Path) -> Vec<u8> {
    fs::read(dir.join(catalog::CATALOG_FILENAME)).unwrap()
}
