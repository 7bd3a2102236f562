//! Top-K assembly for secondary lookups.
//!
//! Every source (memtables, then sorted runs) funnels raw candidates into
//! one [`ConfirmingSink`]. The sink re-resolves each primary key to its live
//! version at the read snapshot, re-extracts the secondary attribute from
//! that version, and only then lets the candidate compete for a slot in the
//! bounded freshest-K accumulator. Dedup by primary key and the live-version
//! check make the result independent of the order sources are visited in;
//! visiting fresh sources first only buys early exits.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use bytes::Bytes;

use crate::extract::extract_attribute;

/// One secondary-lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryHit {
    pub primary_key: Bytes,
    pub payload: Bytes,
    pub seqno: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkControl {
    Continue,
    /// The current source cannot contribute further candidates.
    StopSource,
}

/// Receives `(primary_key, seqno, payload)` candidates from a scan.
pub(crate) trait CandidateSink {
    fn offer(&mut self, primary_key: &Bytes, seqno: u64, payload: &Bytes)
        -> anyhow::Result<SinkControl>;
}

/// Resolves a primary key to its freshest visible `(seqno, payload)` across
/// the whole store, or `None` when deleted or absent at the snapshot.
pub(crate) trait PrimaryStore {
    fn live_version(
        &self,
        primary_key: &[u8],
        snapshot_seqno: u64,
    ) -> anyhow::Result<Option<(u64, Bytes)>>;
}

/// What a confirmed secondary value must satisfy.
#[derive(Debug, Clone)]
pub(crate) enum ValueMatch {
    Exact(String),
    /// Inclusive band `[lo, hi]`.
    Band(String, String),
}

impl ValueMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            ValueMatch::Exact(want) => value == want,
            ValueMatch::Band(lo, hi) => lo.as_str() <= value && value <= hi.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RankedHit {
    seqno: u64,
    primary_key: Bytes,
    payload: Bytes,
}

impl Ord for RankedHit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Heap minimum = stalest candidate; ties evict the bytewise-largest
        // primary key first so output ties stay key-ascending.
        self.seqno
            .cmp(&other.seqno)
            .then_with(|| other.primary_key.cmp(&self.primary_key))
    }
}

impl PartialOrd for RankedHit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded freshest-K set, deduplicated by primary key.
#[derive(Debug)]
pub(crate) struct TopKAccumulator {
    k: usize,
    heap: BinaryHeap<Reverse<RankedHit>>,
    seen: HashSet<Bytes>,
}

impl TopKAccumulator {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(1024)),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, primary_key: &[u8]) -> bool {
        self.seen.contains(primary_key)
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Lowest admitted seqno, once full.
    pub fn min_seqno(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(hit)| hit.seqno)
    }

    /// No further candidate with `max_seqno` at most `bound` can displace
    /// anything once the set is full.
    pub fn saturated_above(&self, bound: u64) -> bool {
        self.is_full() && self.min_seqno().map(|min| min >= bound).unwrap_or(true)
    }

    pub fn admit(&mut self, primary_key: Bytes, seqno: u64, payload: Bytes) {
        if self.k == 0 || self.seen.contains(&primary_key) {
            return;
        }
        let hit = RankedHit {
            seqno,
            primary_key,
            payload,
        };
        if self.heap.len() < self.k {
            self.seen.insert(hit.primary_key.clone());
            self.heap.push(Reverse(hit));
            return;
        }
        let evict = match self.heap.peek() {
            Some(Reverse(min)) => min < &hit,
            None => false,
        };
        if evict {
            if let Some(Reverse(old)) = self.heap.pop() {
                self.seen.remove(&old.primary_key);
            }
            self.seen.insert(hit.primary_key.clone());
            self.heap.push(Reverse(hit));
        }
    }

    /// Drains into seqno-descending order (primary-key ascending on ties).
    pub fn into_sorted_hits(self) -> Vec<SecondaryHit> {
        let mut hits: Vec<SecondaryHit> = self
            .heap
            .into_iter()
            .map(|Reverse(hit)| SecondaryHit {
                primary_key: hit.primary_key,
                payload: hit.payload,
                seqno: hit.seqno,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.seqno
                .cmp(&a.seqno)
                .then_with(|| a.primary_key.cmp(&b.primary_key))
        });
        hits
    }
}

/// The sink every secondary scan feeds.
///
/// Scans hand over whatever their source stored; admission is decided
/// against the record's live version only.
pub(crate) struct ConfirmingSink<'a> {
    store: &'a dyn PrimaryStore,
    snapshot_seqno: u64,
    attribute: &'a str,
    matcher: ValueMatch,
    pub acc: TopKAccumulator,
}

impl<'a> ConfirmingSink<'a> {
    pub fn new(
        store: &'a dyn PrimaryStore,
        snapshot_seqno: u64,
        attribute: &'a str,
        matcher: ValueMatch,
        k: usize,
    ) -> Self {
        Self {
            store,
            snapshot_seqno,
            attribute,
            matcher,
            acc: TopKAccumulator::new(k),
        }
    }

    pub fn into_hits(self) -> Vec<SecondaryHit> {
        self.acc.into_sorted_hits()
    }
}

impl CandidateSink for ConfirmingSink<'_> {
    fn offer(
        &mut self,
        primary_key: &Bytes,
        _seqno: u64,
        _payload: &Bytes,
    ) -> anyhow::Result<SinkControl> {
        if self.acc.contains(primary_key) {
            return Ok(SinkControl::Continue);
        }
        let Some((live_seqno, live_payload)) = self
            .store
            .live_version(primary_key.as_ref(), self.snapshot_seqno)?
        else {
            return Ok(SinkControl::Continue);
        };
        // A candidate whose live version no longer carries a matching
        // secondary value is a stale inverted entry; skip it silently.
        match extract_attribute(live_payload.as_ref(), self.attribute) {
            Ok(current) if self.matcher.matches(&current) => {}
            _ => return Ok(SinkControl::Continue),
        }
        self.acc
            .admit(primary_key.clone(), live_seqno, live_payload);
        Ok(SinkControl::Continue)
    }
}

/// Test sink that records every offered candidate verbatim.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CollectingSink {
    pub hits: Vec<(Bytes, u64, Bytes)>,
}

#[cfg(test)]
impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl CandidateSink for CollectingSink {
    fn offer(
        &mut self,
        primary_key: &Bytes,
        seqno: u64,
        payload: &Bytes,
    ) -> anyhow::Result<SinkControl> {
        self.hits.push((primary_key.clone(), seqno, payload.clone()));
        Ok(SinkControl::Continue)
    }
}
