//! Inverted secondary map of one memtable.
//!
//! `secondary_value → primary keys ever written with that value`, outer map
//! lexicographically ordered so range lookups can walk a contiguous band.
//! Buckets are append-only: an update that changes a record's secondary
//! value leaves the old entry in place, and the lookup path re-extracts and
//! confirms against the live version instead. The whole structure dies with
//! its memtable.

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::ops::Bound;

#[derive(Debug, Default)]
pub(crate) struct MemSecondaryIndex {
    buckets: SkipMap<String, Bucket>,
}

#[derive(Debug, Default)]
struct Bucket {
    keys: RwLock<Vec<Bytes>>,
}

impl MemSecondaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `primary_key` to the bucket for `value`, creating the bucket
    /// on first use. Duplicates are expected under update traffic.
    pub fn add(&self, value: String, primary_key: Bytes) {
        let entry = self.buckets.get_or_insert_with(value, Bucket::default);
        entry.value().keys.write().push(primary_key);
    }

    /// Snapshot of one bucket's keys in insertion order.
    pub fn bucket(&self, value: &str) -> Option<Vec<Bytes>> {
        self.buckets
            .get(value)
            .map(|entry| entry.value().keys.read().clone())
    }

    /// Snapshots every bucket with `lo <= value <= hi`, ascending.
    pub fn buckets_in_range(&self, lo: &str, hi: &str) -> Vec<(String, Vec<Bytes>)> {
        if lo > hi {
            return Vec::new();
        }
        self.buckets
            .range::<str, _>((Bound::Included(lo), Bound::Included(hi)))
            .map(|entry| (entry.key().clone(), entry.value().keys.read().clone()))
            .collect()
    }
}
