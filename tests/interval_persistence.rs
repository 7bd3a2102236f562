//! External interval-tree mode: block summaries live in one process-wide
//! tree persisted to a snapshot file instead of inline interval blocks.

use facetdb::{Db, DbOptions, ReadOptions, SecondaryHit};
use tempfile::TempDir;

fn tree_options() -> DbOptions {
    DbOptions {
        primary_key: "id".to_string(),
        secondary_key: "age".to_string(),
        memtable_shards: 4,
        block_size: 512,
        interval_tree_file_name: Some("intervals.snap".into()),
        interval_sync_threshold: 4,
        ..Default::default()
    }
}

fn record(id: u32, age: u32) -> String {
    format!(r#"{{"id":{id},"age":{age},"name":"u{id}"}}"#)
}

fn ids(hits: &[SecondaryHit]) -> Vec<u32> {
    hits.iter()
        .map(|h| std::str::from_utf8(&h.primary_key).unwrap().parse().unwrap())
        .collect()
}

#[test]
fn tree_mode_serves_point_and_range_lookups() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), tree_options())?;

    for i in 0..40u32 {
        db.put(record(i, (i % 8) + 10))?;
    }
    db.flush()?;
    for i in 40..80u32 {
        db.put(record(i, (i % 8) + 10))?;
    }
    db.flush()?;
    assert_eq!(db.metrics().live_files, 2);

    // age 12 <=> id % 8 == 2, freshest first.
    let hits = db.get_secondary("12", 3, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![74, 66, 58]);

    let hits = db.range_secondary("10", "11", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    let want: Vec<u32> = (0..80).filter(|i| i % 8 <= 1).collect();
    assert_eq!(got, want);
    Ok(())
}

#[test]
fn snapshot_file_survives_restart() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), tree_options())?;
        for i in 0..60u32 {
            db.put(record(i, (i % 6) + 20))?;
        }
        db.flush()?;
        for i in 60..120u32 {
            db.put(record(i, (i % 6) + 20))?;
        }
        db.flush()?;
    }
    assert!(
        dir.path().join("intervals.snap").exists(),
        "flushes past the sync threshold must have written the snapshot"
    );

    let db = Db::open(dir.path(), tree_options())?;
    let hits = db.get_secondary("23", 4, ReadOptions::default())?;
    // age 23 <=> id % 6 == 3.
    assert_eq!(ids(&hits), vec![117, 111, 105, 99]);

    let all = db.get_secondary("23", 1000, ReadOptions::default())?;
    assert_eq!(all.len(), 20);
    Ok(())
}

#[test]
fn compaction_retires_old_intervals() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), tree_options())?;

    for i in 0..30u32 {
        db.put(record(i, 30))?;
    }
    db.flush()?;
    for i in 0..15u32 {
        db.put(record(i, 40))?;
    }
    db.flush()?;

    db.compact()?;
    assert_eq!(db.metrics().live_files, 1);

    let hits = db.get_secondary("30", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, (15..30).collect::<Vec<u32>>());

    let hits = db.get_secondary("40", 100, ReadOptions::default())?;
    assert_eq!(hits.len(), 15);
    Ok(())
}

#[test]
fn updates_across_runs_resolve_to_live_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), tree_options())?;

    for i in 0..20u32 {
        db.put(record(i, 30))?;
    }
    db.flush()?;
    // A newer run moves half the records to age 50; stale block summaries
    // for age 30 still reference them.
    for i in 0..10u32 {
        db.put(record(i, 50))?;
    }
    db.flush()?;

    let hits = db.get_secondary("30", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, (10..20).collect::<Vec<u32>>());

    let hits = db.get_secondary("50", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, (0..10).collect::<Vec<u32>>());
    Ok(())
}
