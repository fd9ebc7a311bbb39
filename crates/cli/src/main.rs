///! # CLI - RiptideTS Interactive Shell
///!
///! A REPL-style shell over the RiptideTS storage engine. Rows are buffered
///! per partition with `PUT`, written out as sorted last-runs with `FLUSH`,
///! and folded back together with `MERGE`. Reads commands from stdin and
///! prints results to stdout, so it can be scripted by piping commands in.
///!
///! ## Commands
///!
///! ```text
///! PUT fid container entity ts payload   Buffer a row for partition fid
///! FLUSH [fid]                           Write buffered rows as last-runs
///! MERGE                                 Run one merge pass
///! SCAN fid                              Print every row of a partition
///! PARTITIONS                            List partitions and their last-runs
///! STATS                                 Print engine debug info
///! EXIT / QUIT                           Shut down
///! ```
///!
///! ## Configuration
///!
///! ```text
///! RIPTIDE_DATA_DIR        data directory                     (default: "data")
///! RIPTIDE_MAX_LAST        last-runs that make a merge candidate (default: 4)
///! RIPTIDE_MAX_LAST_FILES  last-runs a partition may hold     (default: 16)
///! RIPTIDE_BLOCK_ROWS      rows per written block             (default: 4096)
///! RUST_LOG                log filter, logs go to stderr       (default: "warn")
///! ```
///!
///! ## Example
///!
///! ```text
///! $ cargo run -p cli
///! RiptideTS started (dir=data, commit=0, partitions=0, max_last=4)
///! > PUT 1 1 1 100 hello
///! OK (1 buffered)
///! > FLUSH
///! OK (1 rows in 1 partitions)
///! > SCAN 1
///! (1, 1, 100#0) -> hello
///! (1 rows)
///! > EXIT
///! bye
///! ```

use anyhow::Result;
use config::EngineConfig;
use engine::Engine;
use row::{Row, RowKey};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Engine plus the rows buffered by `PUT` but not flushed yet.
struct Shell {
    engine: Engine,
    /// Per partition, sorted and deduplicated by key. A repeated key keeps
    /// the latest payload.
    pending: BTreeMap<i64, BTreeMap<RowKey, Vec<u8>>>,
}

/// Whether the REPL should keep reading.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

impl Shell {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            pending: BTreeMap::new(),
        }
    }

    fn pending_rows(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    /// Flushes the buffer of `fid`, or of every partition. Returns
    /// `(rows, partitions)` written. A partition that fails keeps its rows
    /// buffered.
    fn flush(&mut self, only: Option<i64>) -> Result<(usize, usize)> {
        let fids: Vec<i64> = match only {
            Some(fid) => vec![fid],
            None => self.pending.keys().copied().collect(),
        };
        let (mut rows_written, mut partitions) = (0, 0);
        for fid in fids {
            let buffered = match self.pending.remove(&fid) {
                Some(rows) if !rows.is_empty() => rows,
                _ => continue,
            };
            let rows: Vec<Row> = buffered
                .iter()
                .map(|(key, payload)| Row::new(*key, payload.clone()))
                .collect();
            let n = rows.len();
            if let Err(e) = self.engine.flush_last_run(fid, rows) {
                self.pending.insert(fid, buffered);
                return Err(e.into());
            }
            rows_written += n;
            partitions += 1;
        }
        Ok((rows_written, partitions))
    }

    fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let mut parts = line.split_whitespace();
        let cmd = match parts.next() {
            Some(cmd) => cmd,
            None => return Ok(Flow::Continue),
        };
        match cmd.to_uppercase().as_str() {
            "PUT" => {
                let nums: Vec<Option<i64>> =
                    parts.by_ref().take(4).map(|p| p.parse().ok()).collect();
                let payload: String = parts.collect::<Vec<&str>>().join(" ");
                match nums.as_slice() {
                    [Some(fid), Some(c), Some(e), Some(ts)] if !payload.is_empty() => {
                        self.pending
                            .entry(*fid)
                            .or_default()
                            .insert(RowKey::new(*c, *e, *ts), payload.into_bytes());
                        writeln!(out, "OK ({} buffered)", self.pending_rows())?;
                    }
                    _ => writeln!(out, "ERR usage: PUT fid container entity ts payload")?,
                }
            }
            "FLUSH" => {
                let only = match parts.next().map(str::parse::<i64>) {
                    None => None,
                    Some(Ok(fid)) => Some(fid),
                    Some(Err(_)) => {
                        writeln!(out, "ERR usage: FLUSH [fid]")?;
                        return Ok(Flow::Continue);
                    }
                };
                match self.flush(only) {
                    Ok((rows, partitions)) => {
                        writeln!(out, "OK ({} rows in {} partitions)", rows, partitions)?
                    }
                    Err(e) => writeln!(out, "ERR flush failed: {:#}", e)?,
                }
            }
            "MERGE" => match self.engine.run_merge_pass() {
                Ok(report) => {
                    let commit = report
                        .commit_id
                        .map_or_else(|| "none".to_string(), |c| c.to_string());
                    writeln!(
                        out,
                        "OK (compacted={}, rows={}, failed={}, commit={})",
                        report.partitions_compacted,
                        report.rows_written,
                        report.errors.len(),
                        commit
                    )?;
                    for failure in &report.errors {
                        writeln!(out, "  partition {}: {}", failure.fid, failure.error)?;
                    }
                }
                Err(e) => writeln!(out, "ERR merge failed: {}", e)?,
            },
            "SCAN" => match parts.next().map(str::parse::<i64>) {
                Some(Ok(fid)) => match self.engine.scan_partition(fid) {
                    Ok(rows) if rows.is_empty() => writeln!(out, "(empty)")?,
                    Ok(rows) => {
                        for row in &rows {
                            writeln!(out, "{} -> {}", row.key, String::from_utf8_lossy(&row.payload))?;
                        }
                        writeln!(out, "({} rows)", rows.len())?;
                    }
                    Err(e) => writeln!(out, "ERR scan failed: {}", e)?,
                },
                _ => writeln!(out, "ERR usage: SCAN fid")?,
            },
            "PARTITIONS" => {
                let snapshot = self.engine.snapshot();
                if snapshot.is_empty() {
                    writeln!(out, "(empty)")?;
                }
                for set in snapshot.file_sets() {
                    writeln!(
                        out,
                        "F:{} last-runs={} bytes={}",
                        set.fid,
                        set.last_count(),
                        set.total_size()
                    )?;
                }
                writeln!(out, "(commit {})", snapshot.commit_id())?;
            }
            "STATS" => {
                writeln!(out, "{:?}", self.engine)?;
                writeln!(out, "pending_rows: {}", self.pending_rows())?;
            }
            "EXIT" | "QUIT" => {
                writeln!(out, "bye")?;
                return Ok(Flow::Exit);
            }
            other => writeln!(out, "unknown command: {}", other)?,
        }
        Ok(Flow::Continue)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let data_dir = env_or("RIPTIDE_DATA_DIR", "data");
    let config = EngineConfig::from_env()?;
    let max_last = config.max_last;
    let engine = Engine::open(&data_dir, config)?;
    let snapshot = engine.snapshot();

    println!(
        "RiptideTS started (dir={}, commit={}, partitions={}, max_last={})",
        data_dir,
        snapshot.commit_id(),
        snapshot.len(),
        max_last
    );
    drop(snapshot);
    println!("Commands: PUT fid container entity ts payload | FLUSH [fid] | SCAN fid");
    println!("          MERGE | PARTITIONS | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let mut shell = Shell::new(engine);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if shell.execute(&line, &mut stdout)? == Flow::Exit {
            break;
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    let unflushed = shell.pending_rows();
    if unflushed > 0 {
        warn!(rows = unflushed, "exiting with unflushed rows");
    }
    info!("shell closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(dir: &std::path::Path, max_last: usize) -> Shell {
        let config = EngineConfig {
            max_last,
            ..EngineConfig::default()
        };
        Shell::new(Engine::open(dir, config).unwrap())
    }

    fn run(shell: &mut Shell, script: &str) -> String {
        let mut out = Vec::new();
        for line in script.lines() {
            if shell.execute(line, &mut out).unwrap() == Flow::Exit {
                break;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn put_buffers_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = shell(dir.path(), 2);
        let out = run(&mut sh, "PUT 1 1 1 5 a\nPUT 1 1 1 3 b\nSCAN 1\n");
        assert!(out.contains("OK (2 buffered)"));
        assert!(out.contains("(empty)"));

        let out = run(&mut sh, "FLUSH\nSCAN 1\n");
        assert!(out.contains("OK (2 rows in 1 partitions)"));
        let b = out.find("(1, 1, 3#0) -> b").unwrap();
        let a = out.find("(1, 1, 5#0) -> a").unwrap();
        assert!(b < a);
    }

    #[test]
    fn repeated_key_keeps_latest_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = shell(dir.path(), 2);
        let out = run(&mut sh, "PUT 1 1 1 5 old\nPUT 1 1 1 5 new value\nFLUSH\nSCAN 1\n");
        assert!(out.contains("(1, 1, 5#0) -> new value"));
        assert!(out.contains("(1 rows)"));
    }

    #[test]
    fn merge_reports_and_folds_last_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = shell(dir.path(), 2);
        let out = run(
            &mut sh,
            "MERGE\nPUT 1 1 1 1 x\nFLUSH\nPUT 1 1 1 2 y\nFLUSH 1\nMERGE\nPARTITIONS\n",
        );
        assert!(out.contains("OK (compacted=0, rows=0, failed=0, commit=none)"));
        assert!(out.contains("OK (compacted=1, rows=2, failed=0, commit=3)"));
        assert!(out.contains("F:1 last-runs=1"));
    }

    #[test]
    fn bad_input_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = shell(dir.path(), 2);
        let out = run(&mut sh, "PUT 1 x 1 1 p\nPUT 1 1 1\nSCAN\nFLUSH abc\nFROB\n\nEXIT\nSTATS\n");
        assert_eq!(out.matches("ERR usage").count(), 4);
        assert!(out.contains("unknown command: FROB"));
        assert!(out.ends_with("bye\n"));
    }
}
