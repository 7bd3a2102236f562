//! In-memory write buffers.
//!
//! A `MemTableManager` owns one mutable memtable plus a queue of immutable
//! ones awaiting flush. Each memtable pairs the primary skip-list map with a
//! secondary inverted index over the configured secondary attribute, so a
//! secondary lookup can join inverted-list entries back against the MVCC
//! primary map of the same buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::db::{LookupResult, Op, OpKind};
use crate::extract::extract_attribute;
use crate::internal_key::{InternalKey, KeyKind};
use crate::query::{CandidateSink, SinkControl};

mod secondary;

pub(crate) use secondary::MemSecondaryIndex;

#[derive(Debug)]
pub(crate) struct MemTableManager {
    shard_count: usize,
    secondary_attribute: Option<Arc<str>>,
    mutable: RwLock<Arc<MemTable>>,
    immutables: Mutex<VecDeque<Arc<MemTable>>>,
}

#[derive(Debug)]
pub(crate) struct MemTable {
    shards: Vec<MemTableShard>,
    secondary: MemSecondaryIndex,
    secondary_attribute: Option<Arc<str>>,
    approximate_bytes: AtomicU64,
}

#[derive(Debug)]
struct MemTableShard {
    map: SkipMap<InternalKey, Bytes>,
}

impl MemTableManager {
    pub fn new(shards: usize, secondary_attribute: Option<Arc<str>>) -> Self {
        let shard_count = shards.max(1);
        Self {
            shard_count,
            secondary_attribute: secondary_attribute.clone(),
            mutable: RwLock::new(Arc::new(MemTable::new(shard_count, secondary_attribute))),
            immutables: Mutex::new(VecDeque::new()),
        }
    }

    /// Freezes the mutable memtable and queues it for flush.
    pub fn rotate_memtable(&self) -> Arc<MemTable> {
        let mut guard = self.mutable.write();
        let old = std::mem::replace(
            &mut *guard,
            Arc::new(MemTable::new(
                self.shard_count,
                self.secondary_attribute.clone(),
            )),
        );
        self.immutables.lock().push_front(old.clone());
        old
    }

    pub fn oldest_immutable(&self) -> Option<Arc<MemTable>> {
        self.immutables.lock().back().cloned()
    }

    pub fn drop_oldest_immutable(&self, flushed: &Arc<MemTable>) -> bool {
        let mut guard = self.immutables.lock();
        match guard.back() {
            Some(mem) if Arc::ptr_eq(mem, flushed) => {
                guard.pop_back();
                true
            }
            _ => false,
        }
    }

    pub fn mutable_approximate_bytes(&self) -> u64 {
        self.mutable.read().approximate_bytes()
    }

    pub fn apply_batch(&self, seqno_base: u64, ops: &[Op]) {
        if ops.is_empty() {
            return;
        }
        let table = self.mutable.read().clone();
        table.apply_batch(self.shard_count, seqno_base, ops);
    }

    /// Returns:
    /// - `None` if the key is not buffered in memory
    /// - `Some(LookupResult { value: None, .. })` for a tombstone
    /// - `Some(LookupResult { value: Some(..), .. })` for a live value
    pub fn get(&self, key: &[u8], snapshot_seqno: u64) -> Option<LookupResult> {
        let mut candidate: Option<(u64, Option<Bytes>)> = None;

        let mutable = self.mutable.read().clone();
        if let Some((seqno, v)) = mutable.get(key, snapshot_seqno) {
            candidate = Some((seqno, v));
        }

        for mem in self.immutables.lock().iter() {
            if let Some((seqno, v)) = mem.get(key, snapshot_seqno) {
                match &candidate {
                    Some((best_seq, _)) if *best_seq >= seqno => {}
                    _ => candidate = Some((seqno, v)),
                }
            }
        }

        candidate.map(|(seqno, value)| LookupResult { seqno, value })
    }

    /// Runs the secondary point walk over the mutable then each immutable
    /// memtable, newest buffers first.
    pub fn secondary_point_lookup(
        &self,
        value: &str,
        snapshot_seqno: u64,
        sink: &mut dyn CandidateSink,
    ) -> anyhow::Result<()> {
        let mutable = self.mutable.read().clone();
        mutable.secondary_point_lookup(value, snapshot_seqno, sink)?;
        for mem in self.immutables.lock().iter() {
            mem.secondary_point_lookup(value, snapshot_seqno, sink)?;
        }
        Ok(())
    }

    pub fn secondary_range_lookup(
        &self,
        lo: &str,
        hi: &str,
        snapshot_seqno: u64,
        sink: &mut dyn CandidateSink,
    ) -> anyhow::Result<()> {
        let mutable = self.mutable.read().clone();
        mutable.secondary_range_lookup(lo, hi, snapshot_seqno, sink)?;
        for mem in self.immutables.lock().iter() {
            mem.secondary_range_lookup(lo, hi, snapshot_seqno, sink)?;
        }
        Ok(())
    }
}

impl MemTable {
    fn new(shard_count: usize, secondary_attribute: Option<Arc<str>>) -> Self {
        Self {
            shards: (0..shard_count)
                .map(|_| MemTableShard {
                    map: SkipMap::new(),
                })
                .collect(),
            secondary: MemSecondaryIndex::new(),
            secondary_attribute,
            approximate_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn approximate_bytes(&self) -> u64 {
        self.approximate_bytes.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn to_sorted_entries(&self) -> Vec<(InternalKey, Bytes)> {
        let mut out: Vec<(InternalKey, Bytes)> = Vec::new();
        for shard in &self.shards {
            for entry in shard.map.iter() {
                out.push((entry.key().clone(), entry.value().clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn apply_batch(&self, shard_count: usize, seqno_base: u64, ops: &[Op]) {
        // Fast path: small foreground batches are latency-sensitive.
        if ops.len() <= 64 {
            for (idx, op) in ops.iter().enumerate() {
                self.apply_one(shard_count, seqno_base + idx as u64, op);
            }
            return;
        }

        let mut per_shard: Vec<Vec<(InternalKey, Bytes)>> =
            (0..shard_count).map(|_| Vec::new()).collect();
        for (idx, op) in ops.iter().enumerate() {
            let seqno = seqno_base + idx as u64;
            let shard = shard_for_key(shard_count, op.key.as_ref());
            let (kind, value) = match op.kind {
                OpKind::Put => (KeyKind::Put, op.value.clone()),
                OpKind::Del => (KeyKind::Del, Bytes::new()),
            };
            per_shard[shard].push((InternalKey::new(op.key.clone(), seqno, kind), value));
        }

        let approx = &self.approximate_bytes;
        self.shards
            .par_iter()
            .enumerate()
            .for_each(|(shard_idx, shard)| {
                for (key, value) in &per_shard[shard_idx] {
                    let bytes = key.user_key.len() as u64 + value.len() as u64 + 16;
                    shard.map.insert(key.clone(), value.clone());
                    approx.fetch_add(bytes, AtomicOrdering::Relaxed);
                }
            });

        // Inverted-list appends must observe write order, so the secondary
        // pass stays sequential.
        for op in ops {
            self.index_secondary(op);
        }
    }

    fn apply_one(&self, shard_count: usize, seqno: u64, op: &Op) {
        let shard = shard_for_key(shard_count, op.key.as_ref());
        let (kind, value) = match op.kind {
            OpKind::Put => (KeyKind::Put, op.value.clone()),
            OpKind::Del => (KeyKind::Del, Bytes::new()),
        };
        let key = InternalKey::new(op.key.clone(), seqno, kind);
        let bytes = key.user_key.len() as u64 + value.len() as u64 + 16;
        self.shards[shard].map.insert(key, value);
        self.approximate_bytes
            .fetch_add(bytes, AtomicOrdering::Relaxed);
        self.index_secondary(op);
    }

    /// Appends the primary key to the inverted list for the op's secondary
    /// value. Tombstones and records the extractor rejects leave no trace.
    fn index_secondary(&self, op: &Op) {
        if op.kind == OpKind::Del {
            return;
        }
        let Some(attr) = self.secondary_attribute.as_deref() else {
            return;
        };
        let Ok(sec_value) = extract_attribute(op.value.as_ref(), attr) else {
            return;
        };
        self.secondary.add(sec_value, op.key.clone());
    }

    fn get(&self, user_key: &[u8], snapshot_seqno: u64) -> Option<(u64, Option<Bytes>)> {
        let shard = shard_for_key(self.shards.len(), user_key);
        let start = InternalKey::seek_to(user_key);
        let end = InternalKey::new(Bytes::copy_from_slice(user_key), 0, KeyKind::Del);
        for entry in self.shards[shard].map.range(start..=end) {
            let ikey = entry.key();
            if ikey.seqno > snapshot_seqno {
                continue;
            }
            return match ikey.kind {
                KeyKind::Put => Some((ikey.seqno, Some(entry.value().clone()))),
                KeyKind::Del => Some((ikey.seqno, None)),
                KeyKind::Seek => unreachable!("seek keys are never stored"),
            };
        }
        None
    }

    fn secondary_point_lookup(
        &self,
        value: &str,
        snapshot_seqno: u64,
        sink: &mut dyn CandidateSink,
    ) -> anyhow::Result<()> {
        let Some(keys) = self.secondary.bucket(value) else {
            return Ok(());
        };
        self.walk_bucket(value, &keys, snapshot_seqno, sink)
    }

    fn secondary_range_lookup(
        &self,
        lo: &str,
        hi: &str,
        snapshot_seqno: u64,
        sink: &mut dyn CandidateSink,
    ) -> anyhow::Result<()> {
        for (bucket_value, keys) in self.secondary.buckets_in_range(lo, hi) {
            self.walk_bucket(&bucket_value, &keys, snapshot_seqno, sink)?;
        }
        Ok(())
    }

    /// Newest-first walk of one inverted list.
    ///
    /// The list is append-only and may hold stale entries from superseded
    /// writes; a candidate only survives if this buffer's own live version
    /// still carries the bucket's secondary value.
    fn walk_bucket(
        &self,
        bucket_value: &str,
        keys: &[Bytes],
        snapshot_seqno: u64,
        sink: &mut dyn CandidateSink,
    ) -> anyhow::Result<()> {
        let attr = self
            .secondary_attribute
            .as_deref()
            .expect("secondary lookup without a secondary attribute");

        for pkey in keys.iter().rev() {
            let Some((seqno, value)) = self.get(pkey.as_ref(), snapshot_seqno) else {
                // A miss ends the walk for this bucket; the rest of the list
                // is older writes.
                break;
            };
            let Some(payload) = value else {
                break;
            };
            match extract_attribute(payload.as_ref(), attr) {
                Ok(current) if current == bucket_value => {}
                _ => continue,
            }
            if sink.offer(pkey, seqno, &payload)? == SinkControl::StopSource {
                break;
            }
        }
        Ok(())
    }
}

fn shard_for_key(shard_count: usize, user_key: &[u8]) -> usize {
    use std::hash::Hasher;
    let mut hasher = ahash::AHasher::default();
    hasher.write(user_key);
    (hasher.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::CollectingSink;

    fn record(id: u32, age: u32) -> Bytes {
        Bytes::from(format!(r#"{{"id":{id},"age":{age},"name":"u{id}"}}"#))
    }

    fn manager() -> MemTableManager {
        MemTableManager::new(4, Some(Arc::from("age")))
    }

    fn put_op(id: u32, age: u32) -> Op {
        Op::put(Bytes::from(id.to_string()), record(id, age))
    }

    #[test]
    fn get_resolves_newest_visible_version() {
        let mgr = manager();
        mgr.apply_batch(1, &[put_op(1, 10)]);
        mgr.apply_batch(2, &[put_op(1, 20)]);

        let latest = mgr.get(b"1", u64::MAX).unwrap();
        assert_eq!(latest.seqno, 2);
        let pinned = mgr.get(b"1", 1).unwrap();
        assert_eq!(pinned.seqno, 1);
        assert!(mgr.get(b"2", u64::MAX).is_none());
    }

    #[test]
    fn tombstone_shadows_older_puts() {
        let mgr = manager();
        mgr.apply_batch(1, &[put_op(1, 10)]);
        mgr.apply_batch(2, &[Op::delete(Bytes::from("1"))]);

        let result = mgr.get(b"1", u64::MAX).unwrap();
        assert_eq!(result.seqno, 2);
        assert!(result.value.is_none());
    }

    #[test]
    fn point_lookup_walks_newest_first() {
        let mgr = manager();
        let ops: Vec<Op> = (0..6).map(|i| put_op(i, (i % 3) * 10)).collect();
        mgr.apply_batch(1, &ops);

        let mut sink = CollectingSink::new();
        mgr.secondary_point_lookup("0", u64::MAX, &mut sink)
            .unwrap();
        let keys: Vec<&[u8]> = sink.hits.iter().map(|(k, _, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![&b"3"[..], &b"0"[..]]);
    }

    #[test]
    fn stale_inverted_entries_are_confirmed_away() {
        let mgr = manager();
        mgr.apply_batch(1, &[put_op(1, 10)]);
        // Same record, new age: the "10" bucket keeps a stale entry for id 1.
        mgr.apply_batch(2, &[put_op(1, 99)]);

        let mut sink = CollectingSink::new();
        mgr.secondary_point_lookup("10", u64::MAX, &mut sink)
            .unwrap();
        assert!(sink.hits.is_empty());

        let mut sink = CollectingSink::new();
        mgr.secondary_point_lookup("99", u64::MAX, &mut sink)
            .unwrap();
        assert_eq!(sink.hits.len(), 1);
        assert_eq!(sink.hits[0].1, 2);
    }

    #[test]
    fn deletion_stops_the_bucket_walk() {
        let mgr = manager();
        mgr.apply_batch(1, &[put_op(1, 10)]);
        mgr.apply_batch(2, &[Op::delete(Bytes::from("1"))]);

        let mut sink = CollectingSink::new();
        mgr.secondary_point_lookup("10", u64::MAX, &mut sink)
            .unwrap();
        assert!(sink.hits.is_empty());
    }

    #[test]
    fn range_lookup_visits_buckets_in_band() {
        let mgr = manager();
        let ops: Vec<Op> = (0..8).map(|i| put_op(i, 10 + i)).collect();
        mgr.apply_batch(1, &ops);

        let mut sink = CollectingSink::new();
        mgr.secondary_range_lookup("12", "14", u64::MAX, &mut sink)
            .unwrap();
        let mut keys: Vec<&[u8]> = sink.hits.iter().map(|(k, _, _)| k.as_ref()).collect();
        keys.sort();
        assert_eq!(keys, vec![&b"2"[..], &b"3"[..], &b"4"[..]]);
    }

    #[test]
    fn records_without_the_attribute_stay_out_of_the_index() {
        let mgr = manager();
        mgr.apply_batch(1, &[Op::put(Bytes::from("1"), Bytes::from(r#"{"id":1}"#))]);
        assert!(mgr.get(b"1", u64::MAX).is_some());

        let mut sink = CollectingSink::new();
        mgr.secondary_range_lookup("", "\u{10ffff}", u64::MAX, &mut sink)
            .unwrap();
        assert!(sink.hits.is_empty());
    }

    #[test]
    fn immutables_are_searched_after_the_mutable() {
        let mgr = manager();
        mgr.apply_batch(1, &[put_op(1, 10)]);
        mgr.rotate_memtable();
        mgr.apply_batch(2, &[put_op(2, 10)]);

        let mut sink = CollectingSink::new();
        mgr.secondary_point_lookup("10", u64::MAX, &mut sink)
            .unwrap();
        let keys: Vec<&[u8]> = sink.hits.iter().map(|(k, _, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![&b"2"[..], &b"1"[..]]);
    }
}
