use super::helpers::*;
use crate::*;
use anyhow::Result;
use row::{Block, RowKey};
use tempfile::tempdir;

fn source(blocks: Vec<Block>) -> Box<dyn BlockSource + Send> {
    Box::new(blocks.into_iter())
}

fn merger(fragments: Vec<Vec<Block>>) -> TournamentMerger {
    TournamentMerger::from_sources(fragments.into_iter().map(source).collect())
        .expect("in-memory sources never fail")
}

/// Deterministic xorshift so the shuffles are reproducible.
fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

// -------------------- FragmentIterator --------------------

#[test]
fn iterator_crosses_block_boundaries() -> Result<()> {
    let mut it = FragmentIterator::new(source(vec![
        make_block(&[(1, 1, 1), (1, 1, 2)]),
        Block::new(),
        make_block(&[(1, 1, 3)]),
    ]))?;

    let mut keys = Vec::new();
    while let Some(k) = it.current_key() {
        keys.push(k);
        it.advance()?;
    }
    assert_eq!(
        keys,
        vec![make_key(1, 1, 1), make_key(1, 1, 2), make_key(1, 1, 3)]
    );
    assert!(it.is_exhausted());
    assert!(!it.advance()?);
    assert!(it.current_row().is_none());
    Ok(())
}

#[test]
fn iterator_over_empty_fragment_starts_exhausted() -> Result<()> {
    let it = FragmentIterator::new(source(vec![]))?;
    assert!(it.is_exhausted());
    assert!(it.current_key().is_none());
    Ok(())
}

// -------------------- Ordering --------------------

#[test]
fn base_and_two_last_runs_interleave() -> Result<()> {
    let mut m = merger(vec![
        vec![make_block(&[(1, 1, 100), (1, 1, 300)])],
        vec![make_block(&[(1, 1, 200)])],
        vec![make_block(&[(1, 2, 150)])],
    ]);
    let rows = m.collect_all()?;
    assert_eq!(
        keys_of(&rows),
        vec![
            make_key(1, 1, 100),
            make_key(1, 1, 200),
            make_key(1, 1, 300),
            make_key(1, 2, 150),
        ]
    );
    assert_eq!(m.rows_emitted(), 4);
    assert!(m.next()?.is_none());
    Ok(())
}

#[test]
fn payload_travels_with_its_row() -> Result<()> {
    let mut m = merger(vec![
        vec![make_block(&[(1, 1, 2)])],
        vec![make_block(&[(1, 1, 1)])],
    ]);
    let rows = m.collect_all()?;
    assert_eq!(rows[0], make_row(1, 1, 1));
    assert_eq!(rows[1], make_row(1, 1, 2));
    Ok(())
}

#[test]
fn winner_keeps_running_while_below_tree_minimum() -> Result<()> {
    // Fragment 0 emits a long streak before fragment 1 takes over.
    let mut m = merger(vec![
        vec![
            make_block(&[(1, 1, 1), (1, 1, 2), (1, 1, 3)]),
            make_block(&[(1, 1, 4)]),
        ],
        vec![make_block(&[(1, 1, 5), (1, 1, 6)])],
    ]);
    let ts: Vec<i64> = m.collect_all()?.iter().map(|r| r.key.ts).collect();
    assert_eq!(ts, vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[test]
fn containers_and_entities_order_before_timestamps() -> Result<()> {
    let mut m = merger(vec![
        vec![make_block(&[(2, 1, 1)])],
        vec![make_block(&[(1, 9, 999)])],
        vec![make_block(&[(1, 3, 5), (1, 3, 7)])],
    ]);
    let rows = m.collect_all()?;
    assert_eq!(
        keys_of(&rows),
        vec![
            make_key(1, 3, 5),
            make_key(1, 3, 7),
            make_key(1, 9, 999),
            make_key(2, 1, 1)
        ]
    );
    Ok(())
}

#[test]
fn no_fragments_means_done_immediately() -> Result<()> {
    let mut m = merger(vec![]);
    assert!(m.next()?.is_none());
    let mut m = merger(vec![vec![], vec![Block::new()]]);
    assert!(m.next()?.is_none());
    assert_eq!(m.fragment_count(), 2);
    Ok(())
}

#[test]
fn shuffled_fragments_merge_strictly_increasing_and_complete() -> Result<()> {
    const N_FRAGMENTS: usize = 6;
    const N_ROWS: i64 = 3000;

    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let mut fragments: Vec<Vec<RowKey>> = vec![Vec::new(); N_FRAGMENTS];
    for i in 0..N_ROWS {
        let key = RowKey::new(i / 1000, (i / 10) % 100, i % 10);
        let slot = (xorshift(&mut state) % N_FRAGMENTS as u64) as usize;
        fragments[slot].push(key);
    }

    // Split each fragment into blocks of up to 7 rows, never spanning containers.
    let inputs: Vec<Vec<Block>> = fragments
        .iter()
        .map(|keys| {
            let mut blocks: Vec<Block> = Vec::new();
            let mut cur = Block::new();
            for k in keys {
                if cur.len() == 7 || cur.container_id().map_or(false, |c| c != k.container_id) {
                    blocks.push(std::mem::take(&mut cur));
                }
                cur.push(make_row(k.container_id, k.entity_id, k.ts));
            }
            if !cur.is_empty() {
                blocks.push(cur);
            }
            blocks
        })
        .collect();

    let mut m = merger(inputs);
    let rows = m.collect_all()?;
    assert_eq!(rows.len() as i64, N_ROWS);
    for pair in rows.windows(2) {
        assert!(pair[0].key < pair[1].key, "{} !< {}", pair[0].key, pair[1].key);
    }
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn duplicate_key_across_fragments_is_fatal() {
    let mut m = merger(vec![
        vec![make_block(&[(2, 5, 999), (2, 5, 1000)])],
        vec![make_block(&[(2, 5, 1000)])],
    ]);
    assert_eq!(m.next().unwrap().unwrap().key, make_key(2, 5, 999));
    let err = m.next().unwrap_err();
    assert!(err.is_corruption());
    assert!(
        matches!(err, MergeError::DuplicateKey { key, .. } if key == make_key(2, 5, 1000)),
        "{}",
        err
    );
}

#[test]
fn duplicate_first_rows_are_fatal() {
    let mut m = merger(vec![
        vec![make_block(&[(2, 5, 1000)])],
        vec![make_block(&[(2, 5, 1000)])],
    ]);
    assert!(matches!(m.next(), Err(MergeError::DuplicateKey { .. })));
}

#[test]
fn unsorted_fragment_is_reported_out_of_order() {
    // A single fragment whose second block jumps backwards.
    let mut m = merger(vec![vec![
        make_block(&[(1, 1, 10)]),
        make_block(&[(1, 1, 5)]),
    ]]);
    assert!(m.next().unwrap().is_some());
    let err = m.next().unwrap_err();
    assert!(
        matches!(err, MergeError::OutOfOrder { prev, next, .. }
            if prev == make_key(1, 1, 10) && next == make_key(1, 1, 5))
    );
    assert!(err.is_corruption());
}

#[test]
fn block_errors_propagate_and_are_not_corruption() {
    struct Failing;
    impl BlockSource for Failing {
        fn next_block(&mut self) -> Result<Option<Block>> {
            anyhow::bail!("disk on fire")
        }
    }

    let err = TournamentMerger::from_sources(vec![Box::new(Failing)])
        .err()
        .expect("open must fail");
    assert!(!err.is_corruption());
    assert!(err.to_string().contains("disk on fire"));
}

// -------------------- File-backed --------------------

#[test]
fn merge_over_files_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let a = write_last(
        dir.path(),
        "a.last",
        &[make_block(&[(1, 1, 1), (1, 1, 3)]), make_block(&[(1, 2, 1)])],
    )?;
    let b = write_last(dir.path(), "b.last", &[make_block(&[(1, 1, 2), (1, 3, 0)])])?;

    let sources: Vec<Box<dyn BlockSource + Send>> = vec![
        Box::new(FragmentReader::open_last(&a.path)?),
        Box::new(FragmentReader::open_last(&b.path)?),
    ];
    let mut m = TournamentMerger::from_sources(sources)?;
    let rows = m.collect_all()?;
    assert_eq!(
        keys_of(&rows),
        vec![
            make_key(1, 1, 1),
            make_key(1, 1, 2),
            make_key(1, 1, 3),
            make_key(1, 2, 1),
            make_key(1, 3, 0)
        ]
    );
    Ok(())
}
