//! Snapshot bookkeeping.
//!
//! A snapshot pins the sequence number current at creation; reads resolved
//! against it see exactly the writes at or below that seqno. Compaction
//! asks for the retention floor, the lowest seqno any open snapshot still
//! pins, and must keep every record version visible there. Pins are
//! refcounted per seqno, so a burst of snapshots taken at the same moment
//! costs one floor entry and the floor query stays a single map lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub u64);

#[derive(Debug, Default)]
struct Pins {
    /// Snapshot handle → the seqno it pinned.
    by_id: HashMap<u64, u64>,
    /// Pinned seqno → open handles pinning it.
    by_seqno: BTreeMap<u64, usize>,
}

#[derive(Debug)]
pub struct SnapshotTracker {
    latest_seqno: AtomicU64,
    next_id: AtomicU64,
    pins: Mutex<Pins>,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self {
            latest_seqno: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            pins: Mutex::new(Pins::default()),
        }
    }

    /// Publishes a newly acknowledged write.
    pub fn advance(&self, seqno: u64) {
        self.latest_seqno.fetch_max(seqno, Ordering::Release);
    }

    pub fn latest(&self) -> u64 {
        self.latest_seqno.load(Ordering::Acquire)
    }

    /// Pins the current seqno and hands back a handle for it.
    pub fn pin(&self) -> SnapshotId {
        let mut pins = self.pins.lock();
        let seqno = self.latest();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        pins.by_id.insert(id, seqno);
        *pins.by_seqno.entry(seqno).or_insert(0) += 1;
        SnapshotId(id)
    }

    /// Unpins a handle. Releasing twice is a no-op.
    pub fn release(&self, id: SnapshotId) {
        let mut pins = self.pins.lock();
        let Some(seqno) = pins.by_id.remove(&id.0) else {
            return;
        };
        if let Some(count) = pins.by_seqno.get_mut(&seqno) {
            *count -= 1;
            if *count == 0 {
                pins.by_seqno.remove(&seqno);
            }
        }
    }

    /// Resolves a read to a seqno: the handle's pinned seqno, or the
    /// current latest when no snapshot is given.
    pub fn resolve_read_seqno(&self, id: Option<SnapshotId>) -> anyhow::Result<u64> {
        match id {
            None => Ok(self.latest()),
            Some(id) => self
                .pins
                .lock()
                .by_id
                .get(&id.0)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown or released snapshot {}", id.0)),
        }
    }

    /// Lowest seqno any open snapshot still pins; `latest` when none are.
    pub fn retention_floor(&self) -> u64 {
        self.pins
            .lock()
            .by_seqno
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.latest())
    }
}

impl Default for SnapshotTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_hold_the_retention_floor() {
        let tracker = SnapshotTracker::new();
        tracker.advance(10);
        assert_eq!(tracker.retention_floor(), 10);

        let snap = tracker.pin();
        tracker.advance(20);
        assert_eq!(tracker.retention_floor(), 10);
        assert_eq!(tracker.resolve_read_seqno(Some(snap)).unwrap(), 10);
        assert_eq!(tracker.resolve_read_seqno(None).unwrap(), 20);

        tracker.release(snap);
        assert_eq!(tracker.retention_floor(), 20);
        assert!(tracker.resolve_read_seqno(Some(snap)).is_err());
    }

    #[test]
    fn shared_seqno_pins_are_refcounted() {
        let tracker = SnapshotTracker::new();
        tracker.advance(5);
        let first = tracker.pin();
        let second = tracker.pin();
        tracker.advance(9);

        tracker.release(first);
        assert_eq!(
            tracker.retention_floor(),
            5,
            "the second handle still pins 5"
        );
        tracker.release(second);
        assert_eq!(tracker.retention_floor(), 9);
    }

    #[test]
    fn double_release_is_harmless() {
        let tracker = SnapshotTracker::new();
        tracker.advance(3);
        let snap = tracker.pin();
        let other = tracker.pin();
        tracker.release(snap);
        tracker.release(snap);
        assert_eq!(
            tracker.retention_floor(),
            3,
            "releasing twice must not steal the other handle's pin"
        );
        tracker.release(other);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let tracker = SnapshotTracker::new();
        tracker.advance(8);
        tracker.advance(2);
        assert_eq!(tracker.latest(), 8);
    }
}
