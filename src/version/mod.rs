//! Sorted-run registry.
//!
//! Flushed memtables land in L0, newest first; compaction merges every live
//! run into a single L1 run with disjoint keys. The version set owns the
//! reader cache, the process-wide interval tree (external mode), and the
//! file-level pruning that keeps secondary lookups from opening files whose
//! secondary range cannot intersect the query band.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::cache::ReaderCache;
use crate::db::snapshot::SnapshotTracker;
use crate::db::{DbOptions, LookupResult};
use crate::internal_key::{InternalKey, KeyKind};
use crate::interval::IntervalTree;
use crate::query::ConfirmingSink;
use crate::sst::{file_id_from_path, sst_path, IntervalSink, SstBuilder, SstProperties, SstReader};

#[derive(Debug, Clone)]
pub(crate) struct FileMeta {
    pub file_id: u64,
    pub props: SstProperties,
}

impl FileMeta {
    fn key_range_contains(&self, user_key: &[u8]) -> bool {
        self.props.smallest_user_key.as_ref() <= user_key
            && user_key <= self.props.largest_user_key.as_ref()
    }
}

#[derive(Debug, Default)]
struct Levels {
    /// Newest first.
    l0: Vec<FileMeta>,
    /// Disjoint user-key ranges, produced by compaction.
    l1: Vec<FileMeta>,
}

impl Levels {
    fn iter_newest_first(&self) -> impl Iterator<Item = &FileMeta> {
        self.l0.iter().chain(self.l1.iter())
    }
}

pub(crate) struct VersionSet {
    dir: PathBuf,
    options: DbOptions,
    snapshots: Arc<SnapshotTracker>,
    next_file_id: AtomicU64,
    levels: RwLock<Levels>,
    readers: ReaderCache<SstReader>,
    interval_tree: Option<IntervalTree>,
}

impl VersionSet {
    /// Recovers the level state by scanning the directory for sorted runs.
    /// Runs re-register in L0 (file-id descending); the level a file held
    /// before shutdown only ever affected compaction scheduling.
    pub fn recover(
        dir: &Path,
        options: &DbOptions,
        snapshots: Arc<SnapshotTracker>,
    ) -> anyhow::Result<Self> {
        let interval_tree = options.interval_tree_file_name.as_ref().map(|name| {
            let path = if name.is_absolute() {
                name.clone()
            } else {
                dir.join(name)
            };
            let tree = IntervalTree::with_sync_file(&path, true);
            tree.set_sync_threshold(options.interval_sync_threshold);
            tree
        });
        let inline = interval_tree.is_none();

        let mut files = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {dir:?}"))? {
                let path = entry?.path();
                let Some(file_id) = file_id_from_path(&path) else {
                    continue;
                };
                let reader = SstReader::open(&path, inline)
                    .with_context(|| format!("open sst {}", path.display()))?;
                files.push(FileMeta {
                    file_id,
                    props: reader.properties().clone(),
                });
            }
        }
        files.sort_by(|a, b| b.file_id.cmp(&a.file_id));
        let next_file_id = files.first().map(|f| f.file_id + 1).unwrap_or(1);

        Ok(Self {
            dir: dir.to_path_buf(),
            options: options.clone(),
            snapshots,
            next_file_id: AtomicU64::new(next_file_id),
            levels: RwLock::new(Levels {
                l0: files,
                l1: Vec::new(),
            }),
            readers: ReaderCache::new(options.reader_cache_entries),
            interval_tree,
        })
    }

    pub fn interval_tree(&self) -> Option<&IntervalTree> {
        self.interval_tree.as_ref()
    }

    fn inline_mode(&self) -> bool {
        self.interval_tree.is_none()
    }

    /// Highest seqno persisted in any run; seeds the write counter on open.
    pub fn max_persisted_seqno(&self) -> u64 {
        self.levels
            .read()
            .iter_newest_first()
            .map(|f| f.props.max_seqno)
            .max()
            .unwrap_or(0)
    }

    pub fn file_count(&self) -> usize {
        let guard = self.levels.read();
        guard.l0.len() + guard.l1.len()
    }

    /// Writes a new L0 run from sorted memtable entries.
    pub fn flush_memtable(&self, entries: &[(InternalKey, Bytes)]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let props = self.build_sst(file_id, entries)?;
        tracing::info!(
            file_id,
            entries = entries.len(),
            max_seqno = props.max_seqno,
            "Flushed memtable to L0"
        );
        self.levels.write().l0.insert(0, FileMeta { file_id, props });
        Ok(())
    }

    fn build_sst(
        &self,
        file_id: u64,
        entries: &[(InternalKey, Bytes)],
    ) -> anyhow::Result<SstProperties> {
        let secondary_attribute = (!self.options.secondary_key.is_empty())
            .then(|| self.options.secondary_key.clone());
        let sink = match &self.interval_tree {
            Some(tree) => IntervalSink::Tree(tree.clone()),
            None => IntervalSink::Inline,
        };
        let mut builder = SstBuilder::create(
            &self.dir,
            file_id,
            self.options.block_size,
            secondary_attribute,
            self.options.filter_fp_rate,
            sink,
        )?;
        for (key, value) in entries {
            builder.add(key, value.as_ref())?;
        }
        Ok(builder.finish()?)
    }

    fn reader(&self, file_id: u64) -> anyhow::Result<Arc<SstReader>> {
        let path = sst_path(&self.dir, file_id);
        self.readers.get_or_open(file_id, || {
            SstReader::open(&path, self.inline_mode())
                .with_context(|| format!("open sst {}", path.display()))
        })
    }

    /// Freshest version of `user_key` across all runs, visible at the
    /// snapshot.
    pub fn get(&self, user_key: &[u8], snapshot_seqno: u64) -> anyhow::Result<Option<LookupResult>> {
        let files: Vec<FileMeta> = {
            let guard = self.levels.read();
            guard.iter_newest_first().cloned().collect()
        };

        let mut best: Option<LookupResult> = None;
        for file in files {
            if !file.key_range_contains(user_key) {
                continue;
            }
            if let Some(found) = &best {
                if found.seqno >= file.props.max_seqno {
                    continue;
                }
            }
            let reader = self.reader(file.file_id)?;
            if let Some((seqno, value)) = reader.get(user_key, snapshot_seqno)? {
                match &best {
                    Some(found) if found.seqno >= seqno => {}
                    _ => best = Some(LookupResult { seqno, value }),
                }
            }
        }
        Ok(best)
    }

    pub fn secondary_point_lookup(
        &self,
        value: &str,
        sink: &mut ConfirmingSink<'_>,
    ) -> anyhow::Result<()> {
        if self.inline_mode() {
            self.secondary_scan_inline(value, value, sink)
        } else {
            self.secondary_scan_tree(value, value, sink)
        }
    }

    pub fn secondary_range_lookup(
        &self,
        lo: &str,
        hi: &str,
        sink: &mut ConfirmingSink<'_>,
    ) -> anyhow::Result<()> {
        if self.inline_mode() {
            self.secondary_scan_inline(lo, hi, sink)
        } else {
            self.secondary_scan_tree(lo, hi, sink)
        }
    }

    /// Inline mode: prune whole files by their secondary range, then let the
    /// reader prune blocks by summary and filter.
    fn secondary_scan_inline(
        &self,
        lo: &str,
        hi: &str,
        sink: &mut ConfirmingSink<'_>,
    ) -> anyhow::Result<()> {
        let files: Vec<FileMeta> = {
            let guard = self.levels.read();
            guard.iter_newest_first().cloned().collect()
        };

        for file in files {
            if sink.acc.saturated_above(file.props.max_seqno) {
                continue;
            }
            if !file.props.sec_range_intersects(lo, hi) {
                continue;
            }
            let reader = self.reader(file.file_id)?;
            if lo == hi {
                reader.secondary_point_scan(lo, sink)?;
            } else {
                reader.secondary_range_scan(lo, hi, sink)?;
            }
        }
        Ok(())
    }

    /// External mode: the process-wide tree enumerates intersecting blocks
    /// in descending max-seqno order, so the scan stops as soon as the
    /// accumulator is saturated above the next block's bound.
    fn secondary_scan_tree(
        &self,
        lo: &str,
        hi: &str,
        sink: &mut ConfirmingSink<'_>,
    ) -> anyhow::Result<()> {
        let tree = self
            .interval_tree
            .as_ref()
            .expect("tree scan without interval tree");

        if let Some(mut iter) = tree.top_k_iter(lo, hi) {
            while let Some(interval) = iter.next() {
                if sink.acc.saturated_above(interval.timestamp) {
                    iter.stop();
                    break;
                }
                self.scan_tree_block(&interval.id, sink)?;
            }
            return Ok(());
        }

        // Another iterator holds the tree (a concurrent lookup); fall back
        // to the bulk search, which shares the same order.
        for interval in tree.top_k(lo, hi) {
            if sink.acc.saturated_above(interval.timestamp) {
                break;
            }
            self.scan_tree_block(&interval.id, sink)?;
        }
        Ok(())
    }

    fn scan_tree_block(&self, interval_id: &str, sink: &mut ConfirmingSink<'_>) -> anyhow::Result<()> {
        let Some((file_part, block_key)) = interval_id.split_once('+') else {
            return Ok(());
        };
        let Ok(file_id) = file_part.parse::<u64>() else {
            return Ok(());
        };
        let reader = self.reader(file_id)?;
        reader.secondary_scan_block_by_last_key(block_key.as_bytes(), sink)
    }

    /// Merges every live run into one L1 run. Versions shadowed below the
    /// minimum pinned snapshot are dropped, tombstones with them (a full
    /// merge always covers the whole key range).
    pub fn compact(&self) -> anyhow::Result<()> {
        let inputs: Vec<FileMeta> = {
            let guard = self.levels.read();
            guard.iter_newest_first().cloned().collect()
        };
        if inputs.is_empty() {
            return Ok(());
        }

        let mut entries: Vec<(InternalKey, Bytes)> = Vec::new();
        for file in &inputs {
            let reader = self.reader(file.file_id)?;
            let mut iter = reader.iter();
            while let Some(next) = iter.next() {
                entries.push(next?);
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let min_snapshot_seqno = self.snapshots.retention_floor();
        let mut out_entries = Vec::with_capacity(entries.len());
        let mut idx = 0usize;
        while idx < entries.len() {
            let user_key = entries[idx].0.user_key.clone();
            let mut group = Vec::new();
            while idx < entries.len() && entries[idx].0.user_key == user_key {
                group.push(entries[idx].clone());
                idx += 1;
            }
            out_entries.extend(compact_user_key_entries(group, min_snapshot_seqno));
        }

        let output = if out_entries.is_empty() {
            None
        } else {
            let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
            let props = self.build_sst(file_id, &out_entries)?;
            Some(FileMeta { file_id, props })
        };

        tracing::info!(
            inputs = inputs.len(),
            input_entries = entries.len(),
            output_entries = out_entries.len(),
            "Compacted all runs into L1"
        );

        {
            let mut guard = self.levels.write();
            let input_ids: Vec<u64> = inputs.iter().map(|f| f.file_id).collect();
            guard.l0.retain(|f| !input_ids.contains(&f.file_id));
            guard.l1 = output.into_iter().collect();
        }

        for file in &inputs {
            self.readers.forget(file.file_id);
            if let Some(tree) = &self.interval_tree {
                tree.delete_all_intervals(&file.file_id.to_string());
            }
            let path = sst_path(&self.dir, file.file_id);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), error = %e, "Failed to delete compacted sst");
            }
        }
        // The snapshot must not outlive the files it points at.
        if let Some(tree) = &self.interval_tree {
            tree.sync();
        }
        Ok(())
    }

    pub fn reader_cache_stats(&self) -> crate::cache::CacheStats {
        self.readers.stats()
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("dir", &self.dir)
            .field("files", &self.file_count())
            .finish()
    }
}

/// Per-user-key version retention: everything at or above the pinned floor
/// survives; below it only the newest version, and never a tombstone.
fn compact_user_key_entries(
    entries: Vec<(InternalKey, Bytes)>,
    min_snapshot_seqno: u64,
) -> Vec<(InternalKey, Bytes)> {
    let mut out = Vec::new();
    let mut kept_one_below_min = false;

    for (ikey, value) in entries {
        if ikey.seqno >= min_snapshot_seqno {
            out.push((ikey, value));
            continue;
        }
        if kept_one_below_min {
            continue;
        }
        kept_one_below_min = true;
        if ikey.kind == KeyKind::Put {
            out.push((ikey, value));
        }
    }

    out
}
