use facetdb::{Db, DbOptions, ReadOptions, SecondaryHit};
use tempfile::TempDir;

fn options() -> DbOptions {
    DbOptions {
        primary_key: "id".to_string(),
        secondary_key: "age".to_string(),
        memtable_shards: 4,
        block_size: 1024,
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
fn point_lookup_finds_matching_records() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..10u32 {
        db.put(record(i, (i % 5) + 10))?;
    }

    let hits = db.get_secondary("10", 100, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![5, 0]);
    assert!(hits[0].seqno > hits[1].seqno);

    assert!(db
        .get_secondary("42", 100, ReadOptions::default())?
        .is_empty());
    Ok(())
}

#[test]
fn update_moves_record_between_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..10u32 {
        db.put(record(i, (i % 5) + 10))?;
    }
    db.put(record(0, 99))?;

    let hits = db.get_secondary("10", 100, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![5]);

    let hits = db.get_secondary("99", 100, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![0]);
    assert_eq!(
        db.get_primary("0", ReadOptions::default())?.as_deref(),
        Some(record(0, 99).as_bytes())
    );
    Ok(())
}

#[test]
fn flushed_runs_serve_top_k_by_freshness() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..1000u32 {
        db.put(record(i, (i % 50) + 10))?;
    }
    db.flush()?;
    assert!(db.metrics().live_files > 0);

    let hits = db.get_secondary("30", 5, ReadOptions::default())?;
    // 20 records carry age 30 (id % 50 == 20); the five freshest win.
    assert_eq!(ids(&hits), vec![970, 920, 870, 820, 770]);
    let seqnos: Vec<u64> = hits.iter().map(|h| h.seqno).collect();
    assert!(seqnos.windows(2).all(|w| w[0] > w[1]));

    let all = db.get_secondary("30", 1000, ReadOptions::default())?;
    assert_eq!(all.len(), 20);
    Ok(())
}

#[test]
fn lookups_join_memtable_and_runs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..10u32 {
        db.put(record(i, 30))?;
    }
    db.flush()?;
    // Rewrites in the memtable: two records leave age 30, one joins.
    db.put(record(3, 77))?;
    db.put(record(4, 77))?;
    db.put(record(100, 30))?;

    let hits = db.get_secondary("30", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, vec![0, 1, 2, 5, 6, 7, 8, 9, 100]);

    let hits = db.get_secondary("77", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, vec![3, 4]);
    Ok(())
}

#[test]
fn deleted_records_drop_out_after_compaction() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..10u32 {
        db.put(record(i, 30))?;
    }
    db.flush()?;
    for i in (0..10u32).step_by(2) {
        db.delete(i.to_string())?;
    }
    db.compact()?;

    let hits = db.get_secondary("30", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, vec![1, 3, 5, 7, 9]);
    assert_eq!(db.get_primary("2", ReadOptions::default())?, None);
    assert_eq!(db.metrics().live_files, 1);
    Ok(())
}

#[test]
fn deletions_shadow_without_compaction() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    db.put(record(1, 30))?;
    db.flush()?;
    let snap = db.create_snapshot();
    db.delete("1")?;

    assert!(db
        .get_secondary("30", 10, ReadOptions::default())?
        .is_empty());
    let pinned = db.get_secondary("30", 10, ReadOptions { snapshot: Some(snap) })?;
    assert_eq!(ids(&pinned), vec![1]);

    db.release_snapshot(snap);
    Ok(())
}

#[test]
fn range_lookup_returns_only_the_band() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..50u32 {
        db.put(record(i, i + 10))?;
    }
    db.flush()?;

    let hits = db.range_secondary("20", "29", 10, ReadOptions::default())?;
    assert_eq!(hits.len(), 10);
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, (10..20).collect::<Vec<u32>>());

    // Capped below the band population: the freshest win.
    let hits = db.range_secondary("20", "29", 3, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![19, 18, 17]);
    Ok(())
}

#[test]
fn range_lookup_spans_memtable_and_runs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..25u32 {
        db.put(record(i, i + 10))?;
    }
    db.flush()?;
    for i in 25..50u32 {
        db.put(record(i, i + 10))?;
    }

    let hits = db.range_secondary("30", "39", 100, ReadOptions::default())?;
    let mut got = ids(&hits);
    got.sort();
    assert_eq!(got, (20..30).collect::<Vec<u32>>());
    Ok(())
}

#[test]
fn k_bounds_are_respected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    for i in 0..4u32 {
        db.put(record(i, 30))?;
    }

    assert!(db.get_secondary("30", 0, ReadOptions::default())?.is_empty());
    let hits = db.get_secondary("30", 100, ReadOptions::default())?;
    assert_eq!(hits.len(), 4);
    Ok(())
}

#[test]
fn records_without_secondary_attribute_are_storable() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    db.put(r#"{"id":1,"name":"no-age"}"#)?;
    db.put(record(2, 30))?;
    db.flush()?;

    assert!(db.get_primary("1", ReadOptions::default())?.is_some());
    let hits = db.range_secondary("", "\u{10ffff}", 100, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![2]);
    Ok(())
}

#[test]
fn put_without_primary_key_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    let err = db.put(r#"{"age":30}"#).unwrap_err();
    assert!(err.to_string().contains("invalid argument"));
    let err = db.put("not json").unwrap_err();
    assert!(err.to_string().contains("invalid argument"));

    let err = db
        .range_secondary("9", "1", 10, ReadOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("malformed range"));
    Ok(())
}

#[test]
fn snapshots_pin_secondary_views() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    db.put(record(1, 30))?;
    let snap = db.create_snapshot();
    db.put(record(1, 40))?;

    let now = db.get_secondary("30", 10, ReadOptions::default())?;
    assert!(now.is_empty());
    let pinned = db.get_secondary("30", 10, ReadOptions { snapshot: Some(snap) })?;
    assert_eq!(ids(&pinned), vec![1]);
    let pinned_forty =
        db.get_secondary("40", 10, ReadOptions { snapshot: Some(snap) })?;
    assert!(pinned_forty.is_empty());

    db.release_snapshot(snap);
    Ok(())
}

#[test]
fn reopen_recovers_runs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), options())?;
        for i in 0..10u32 {
            db.put(record(i, (i % 5) + 10))?;
        }
        db.flush()?;
    }

    let db = Db::open(dir.path(), options())?;
    let hits = db.get_secondary("10", 100, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![5, 0]);

    // New writes keep ascending above the recovered seqnos.
    db.put(record(0, 10))?;
    let hits = db.get_secondary("10", 100, ReadOptions::default())?;
    assert_eq!(ids(&hits), vec![0, 5]);
    Ok(())
}

#[test]
fn disabled_secondary_index_still_stores_records() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(
        dir.path(),
        DbOptions {
            secondary_key: String::new(),
            ..options()
        },
    )?;

    db.put(record(1, 30))?;
    assert!(db.get_primary("1", ReadOptions::default())?.is_some());
    assert!(db.get_secondary("30", 10, ReadOptions::default()).is_err());
    Ok(())
}
