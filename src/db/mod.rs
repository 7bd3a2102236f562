//! Database handle.
//!
//! Records are opaque JSON objects; the engine extracts the primary key
//! itself on `put` and, when configured, maintains the secondary index as a
//! side effect of every write. Reads are snapshot-consistent: each lookup
//! resolves to a sequence number first and sees exactly the writes at or
//! below it.

mod options;
pub(crate) mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::extract::extract_attribute;
use crate::memtable::MemTableManager;
use crate::query::{ConfirmingSink, PrimaryStore, SecondaryHit, ValueMatch};
use crate::version::VersionSet;

pub use options::{DbOptions, ReadOptions};
pub use snapshot::SnapshotId;

pub type Value = bytes::Bytes;

#[derive(Debug, Clone)]
pub(crate) struct LookupResult {
    pub seqno: u64,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Put,
    Del,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Op {
    pub kind: OpKind,
    pub key: bytes::Bytes,
    pub value: bytes::Bytes,
}

impl Op {
    pub fn put(key: impl Into<bytes::Bytes>, value: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Del,
            key: key.into(),
            value: bytes::Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DbMetrics {
    pub latest_seqno: u64,
    pub live_files: usize,
    pub reader_cache: crate::cache::CacheStats,
}

/// Database handle. Cloning shares the same store.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    dir: PathBuf,
    options: DbOptions,
    memtables: Arc<MemTableManager>,
    versions: Arc<VersionSet>,
    snapshots: Arc<snapshot::SnapshotTracker>,
    next_seqno: AtomicU64,
    /// Writes and memtable rotation serialize here; reads never take it.
    write_lock: Mutex<()>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> anyhow::Result<Self> {
        if options.primary_key.is_empty() {
            anyhow::bail!("invalid argument: primary_key attribute is not configured");
        }

        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("create dir {dir:?}"))?;

        let snapshots = Arc::new(snapshot::SnapshotTracker::new());
        let versions = Arc::new(
            VersionSet::recover(&dir, &options, snapshots.clone()).context("recover versionset")?,
        );
        let persisted = versions.max_persisted_seqno();
        snapshots.advance(persisted);

        let secondary_attribute: Option<Arc<str>> = (!options.secondary_key.is_empty())
            .then(|| Arc::from(options.secondary_key.as_str()));
        let memtables = Arc::new(MemTableManager::new(
            options.memtable_shards,
            secondary_attribute,
        ));

        Ok(Self {
            inner: Arc::new(DbInner {
                dir,
                options,
                memtables,
                versions,
                snapshots,
                next_seqno: AtomicU64::new(persisted + 1),
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    /// Stores a record. The primary key is extracted from the payload; a
    /// record without the primary-key attribute is rejected.
    pub fn put(&self, payload: impl Into<Value>) -> anyhow::Result<()> {
        let payload = payload.into();
        let primary_key = extract_attribute(payload.as_ref(), &self.inner.options.primary_key)
            .map_err(|e| anyhow::anyhow!("invalid argument: {e}"))?;
        self.write(Op::put(bytes::Bytes::from(primary_key), payload))
    }

    /// Writes a tombstone for `primary_key`.
    pub fn delete(&self, primary_key: impl Into<Value>) -> anyhow::Result<()> {
        self.write(Op::delete(primary_key.into()))
    }

    fn write(&self, op: Op) -> anyhow::Result<()> {
        let _guard = self.inner.write_lock.lock();
        let seqno = self.inner.next_seqno.fetch_add(1, Ordering::Relaxed);
        self.inner.memtables.apply_batch(seqno, &[op]);
        self.inner.snapshots.advance(seqno);

        if self.inner.memtables.mutable_approximate_bytes() >= self.inner.options.memtable_bytes {
            self.inner.memtables.rotate_memtable();
            self.flush_immutables()?;
        }
        Ok(())
    }

    /// Rotates the mutable memtable and flushes every frozen one to L0.
    pub fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.inner.write_lock.lock();
        if self.inner.memtables.mutable_approximate_bytes() > 0 {
            self.inner.memtables.rotate_memtable();
        }
        self.flush_immutables()
    }

    fn flush_immutables(&self) -> anyhow::Result<()> {
        while let Some(mem) = self.inner.memtables.oldest_immutable() {
            let entries = mem.to_sorted_entries();
            self.inner.versions.flush_memtable(&entries)?;
            self.inner.memtables.drop_oldest_immutable(&mem);
        }
        Ok(())
    }

    /// Flushes, then merges every run into one; shadowed versions and
    /// tombstones not pinned by a snapshot are dropped, and the retired
    /// files' intervals leave the process-wide tree.
    pub fn compact(&self) -> anyhow::Result<()> {
        self.flush()?;
        self.inner.versions.compact()
    }

    pub fn create_snapshot(&self) -> SnapshotId {
        self.inner.snapshots.pin()
    }

    pub fn release_snapshot(&self, snapshot: SnapshotId) {
        self.inner.snapshots.release(snapshot);
    }

    pub fn get_primary(
        &self,
        primary_key: impl AsRef<[u8]>,
        opts: ReadOptions,
    ) -> anyhow::Result<Option<Value>> {
        let snapshot = self.resolve_snapshot(opts)?;
        Ok(self
            .live_version(primary_key.as_ref(), snapshot)?
            .map(|(_, payload)| payload))
    }

    /// Up to `k` records whose live version carries secondary value `value`,
    /// freshest first.
    pub fn get_secondary(
        &self,
        value: &str,
        k: usize,
        opts: ReadOptions,
    ) -> anyhow::Result<Vec<SecondaryHit>> {
        let attr = self.secondary_attribute()?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let snapshot = self.resolve_snapshot(opts)?;

        let mut sink = ConfirmingSink::new(
            self,
            snapshot,
            attr,
            ValueMatch::Exact(value.to_string()),
            k,
        );
        self.inner
            .memtables
            .secondary_point_lookup(value, snapshot, &mut sink)?;
        self.inner
            .versions
            .secondary_point_lookup(value, &mut sink)?;
        Ok(sink.into_hits())
    }

    /// Range variant over the inclusive secondary band `[lo, hi]`.
    pub fn range_secondary(
        &self,
        lo: &str,
        hi: &str,
        k: usize,
        opts: ReadOptions,
    ) -> anyhow::Result<Vec<SecondaryHit>> {
        let attr = self.secondary_attribute()?;
        if lo > hi {
            anyhow::bail!("invalid argument: malformed range [{lo}, {hi}]");
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let snapshot = self.resolve_snapshot(opts)?;

        let mut sink = ConfirmingSink::new(
            self,
            snapshot,
            attr,
            ValueMatch::Band(lo.to_string(), hi.to_string()),
            k,
        );
        self.inner
            .memtables
            .secondary_range_lookup(lo, hi, snapshot, &mut sink)?;
        self.inner
            .versions
            .secondary_range_lookup(lo, hi, &mut sink)?;
        Ok(sink.into_hits())
    }

    pub fn metrics(&self) -> DbMetrics {
        DbMetrics {
            latest_seqno: self.inner.snapshots.latest(),
            live_files: self.inner.versions.file_count(),
            reader_cache: self.inner.versions.reader_cache_stats(),
        }
    }

    fn secondary_attribute(&self) -> anyhow::Result<&str> {
        if self.inner.options.secondary_key.is_empty() {
            anyhow::bail!("invalid argument: secondary indexing is disabled");
        }
        Ok(&self.inner.options.secondary_key)
    }

    fn resolve_snapshot(&self, opts: ReadOptions) -> anyhow::Result<u64> {
        self.inner.snapshots.resolve_read_seqno(opts.snapshot)
    }
}

impl PrimaryStore for Db {
    fn live_version(
        &self,
        primary_key: &[u8],
        snapshot_seqno: u64,
    ) -> anyhow::Result<Option<(u64, Value)>> {
        let mem = self.inner.memtables.get(primary_key, snapshot_seqno);
        let sst = self
            .inner
            .versions
            .get(primary_key, snapshot_seqno)
            .context("sst get")?;

        let chosen = match (mem, sst) {
            (Some(a), Some(b)) => {
                if a.seqno >= b.seqno {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        Ok(chosen.and_then(|r| r.value.map(|payload| (r.seqno, payload))))
    }
}
