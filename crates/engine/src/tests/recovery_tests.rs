use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn reopen_restores_snapshot_and_rows() -> Result<()> {
    let dir = tempdir()?;
    let (snap, rows_before) = {
        let engine = open(dir.path(), test_config(2));
        seed(&engine, 1, &[&[(1, 1, 1), (1, 2, 1)], &[(1, 1, 5)]]);
        engine.run_merge_pass()?;
        seed(&engine, 1, &[&[(1, 3, 0)]]);
        (engine.snapshot(), engine.scan_partition(1)?)
    };

    let engine = open(dir.path(), test_config(2));
    assert_eq!(*engine.snapshot(), *snap);
    assert_eq!(engine.scan_partition(1)?, rows_before);
    assert_eq!(engine.recovery_stats().orphans_removed, 0);
    Ok(())
}

#[test]
fn commit_ids_keep_increasing_across_restarts() -> Result<()> {
    let dir = tempdir()?;
    let last = {
        let engine = open(dir.path(), test_config(2));
        seed(&engine, 1, &[&[(1, 1, 1)], &[(1, 1, 2)]]);
        engine.run_merge_pass()?;
        engine.last_commit_id()
    };

    let engine = open(dir.path(), test_config(2));
    assert_eq!(engine.last_commit_id(), last);
    let written = engine.flush_last_run(1, rows(&[(1, 1, 3)]))?;
    assert_eq!(written.commit_id, last + 1);
    Ok(())
}

#[test]
fn crash_after_staging_leaves_previous_snapshot_live() -> Result<()> {
    let dir = tempdir()?;
    let (before, commit_id) = {
        let engine = open(dir.path(), test_config(2));
        seed(&engine, 1, &[&[(1, 1, 1)], &[(1, 1, 2)]]);
        let before = engine.snapshot();

        // Run phase one by hand and stop short of phase two.
        let commit_id = engine.commit_ids.next();
        let mut staged = FsSnapshot::clone(&before);
        staged.set_commit_id(commit_id);
        let mut compactor = PartitionCompactor::new(dir.path().to_path_buf(), 1, 3);
        compactor.run(Arc::clone(before.get(1).unwrap()), commit_id, &mut staged)?;
        let staged = engine.catalog().stage(staged, before.commit_id())?;
        assert!(staged.path().exists());

        // Nothing gets a chance to clean up.
        std::mem::forget(compactor);
        std::mem::forget(staged);
        (FsSnapshot::clone(&before), commit_id)
    };
    assert_eq!(files_with_commit(dir.path(), commit_id).len(), 3);

    let engine = open(dir.path(), test_config(2));
    assert_eq!(*engine.snapshot(), before);
    let stats = engine.recovery_stats();
    assert_eq!(stats.staged_removed, 1);
    assert_eq!(stats.orphans_removed, 3);
    assert!(files_with_commit(dir.path(), commit_id).is_empty());
    assert!(!dir
        .path()
        .join(catalog::staged_file_name(commit_id))
        .exists());
    assert!(engine.last_commit_id() >= commit_id, "ids of debris are not reused");

    // The merge can simply be rerun.
    let report = engine.run_merge_pass()?;
    assert!(report.commit_id.unwrap() > commit_id);
    assert_eq!(engine.scan_partition(1)?.len(), 2);
    Ok(())
}

#[test]
fn temp_files_are_removed_and_foreign_files_kept() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path(), test_config(2));
        seed(&engine, 1, &[&[(1, 1, 1)]]);
    }
    fs::write(dir.path().join("f1ver40.last.tmp"), b"partial")?;
    fs::write(dir.path().join("CURRENT.tmp"), b"partial")?;
    fs::write(dir.path().join("notes.txt"), b"keep me")?;

    let engine = open(dir.path(), test_config(2));
    assert_eq!(engine.recovery_stats().tmp_removed, 2);
    let files = list_files(dir.path());
    assert!(files.contains(&"notes.txt".to_string()));
    assert!(!files.iter().any(|f| f.ends_with(".tmp")));
    assert_eq!(engine.scan_partition(1)?.len(), 1);
    Ok(())
}

#[test]
fn unreferenced_file_set_members_are_orphans() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path(), test_config(2));
        seed(&engine, 1, &[&[(1, 1, 1)]]);
    }
    fs::write(dir.path().join("f7ver55.last"), b"stray")?;
    fs::write(dir.path().join("f1ver56.head"), b"stray")?;

    let engine = open(dir.path(), test_config(2));
    let stats = engine.recovery_stats();
    assert_eq!(stats.orphans_removed, 2);
    assert_eq!(stats.max_commit_id, 56);
    assert!(!dir.path().join("f7ver55.last").exists());
    assert_eq!(engine.flush_last_run(1, rows(&[(1, 1, 2)]))?.commit_id, 57);
    Ok(())
}

#[test]
fn corrupt_catalog_fails_open() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("CURRENT"), "commit:1\nF:1 head=oops\n")?;
    let err = Engine::open(dir.path(), test_config(2)).unwrap_err();
    assert!(matches!(err, EngineError::Io(_)), "{}", err);
    Ok(())
}

#[test]
fn invalid_config_fails_open() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        max_last: 0,
        ..test_config(2)
    };
    assert!(matches!(
        Engine::open(dir.path(), config),
        Err(EngineError::Config(_))
    ));
}

#[test]
fn open_creates_missing_directory() -> Result<()> {
    let dir = tempdir()?;
    let nested = dir.path().join("a").join("b");
    let engine = open(&nested, test_config(2));
    assert!(nested.is_dir());
    assert!(engine.snapshot().is_empty());
    Ok(())
}
