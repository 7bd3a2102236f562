//! Process-wide interval index over data-block summaries.
//!
//! Each flushed data block contributes one interval: its secondary-value
//! range `[low, high]` plus the highest sequence number inside the block as
//! the `timestamp`. The tree answers "which blocks can contain a secondary
//! value in this band", most-recent blocks first, so a top-K query can stop
//! reading files as soon as enough fresh matches are confirmed.
//!
//! Structure: a red-black tree keyed on `low`, augmented per node with
//! `max_high` and `max_timestamp` over the subtree. Nodes live in a single
//! arena indexed by `u32`; index 0 is the nil sentinel, which keeps the
//! CLRS-style fixups free of owner juggling.
//!
//! Interval ids are `"<prefix>+<suffix>"` (a file id plus a block key), so a
//! whole file's summaries can be dropped by prefix when the file is
//! compacted away.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYNC_THRESHOLD: u32 = 10_000;
const ID_DELIM: char = '+';

/// A block summary lifted into `(id, low, high, timestamp)` form.
///
/// Identity is by `id`; `timestamp` is the block's max sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: String,
    pub low: String,
    pub high: String,
    pub timestamp: u64,
}

impl Interval {
    pub fn new(
        id: impl Into<String>,
        low: impl Into<String>,
        high: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            low: low.into(),
            high: high.into(),
            timestamp,
        }
    }

    /// Closed-interval intersection; touching endpoints count.
    pub fn overlaps(&self, low: &str, high: &str) -> bool {
        if self.low.as_str() < low {
            self.high.as_str() >= low
        } else {
            high >= self.low.as_str()
        }
    }
}

const NIL: u32 = 0;

#[derive(Debug, Clone)]
struct Node {
    interval: Interval,
    max_high: String,
    max_timestamp: u64,
    red: bool,
    parent: u32,
    left: u32,
    right: u32,
}

impl Node {
    fn nil() -> Self {
        Self {
            interval: Interval::new("", "", "", 0),
            max_high: String::new(),
            max_timestamp: 0,
            red: false,
            parent: NIL,
            left: NIL,
            right: NIL,
        }
    }
}

#[derive(Debug)]
struct TreeCore {
    nodes: Vec<Node>,
    free: Vec<u32>,
    root: u32,
    /// id → arena index of the live node.
    storage: HashMap<String, u32>,
    /// id prefix → suffixes currently present under it.
    ids: HashMap<String, HashSet<String>>,
    sync_threshold: u32,
    sync_counter: u32,
}

/// Augmented red-black interval tree with an optional snapshot file.
///
/// Mutations take the write lock and preempt any live [`TopKIterator`];
/// reads share. Cloning shares the same tree.
#[derive(Debug, Clone)]
pub struct IntervalTree {
    shared: Arc<TreeShared>,
}

#[derive(Debug)]
struct TreeShared {
    core: RwLock<TreeCore>,
    /// Stop flag of the single live iterator, if any.
    active_iter: Mutex<Option<Arc<AtomicBool>>>,
    sync_file: Option<PathBuf>,
}

impl Default for IntervalTree {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalTree {
    pub fn new() -> Self {
        Self::with_shared(None)
    }

    /// Opens a tree backed by `sync_file`. With `sync_from_file` the snapshot
    /// (if present) is replayed through `insert_interval`; a missing file
    /// starts empty.
    pub fn with_sync_file(sync_file: impl AsRef<Path>, sync_from_file: bool) -> Self {
        let path = sync_file.as_ref().to_path_buf();
        let tree = Self::with_shared(Some(path.clone()));

        if sync_from_file {
            match std::fs::read(&path) {
                Ok(raw) => match bincode::deserialize::<Vec<Interval>>(&raw) {
                    Ok(records) => {
                        for rec in records {
                            tree.insert_interval(&rec.id, &rec.low, &rec.high, rec.timestamp);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "Interval snapshot unreadable, starting empty");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Interval snapshot unreadable, starting empty");
                }
            }
        }
        tree
    }

    fn with_shared(sync_file: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(TreeShared {
                core: RwLock::new(TreeCore::new(DEFAULT_SYNC_THRESHOLD)),
                active_iter: Mutex::new(None),
                sync_file,
            }),
        }
    }

    pub fn set_sync_threshold(&self, threshold: u32) {
        self.shared.core.write().sync_threshold = threshold;
    }

    pub fn len(&self) -> usize {
        self.shared.core.read().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts an interval, replacing any live interval with the same id.
    pub fn insert_interval(&self, id: &str, low: &str, high: &str, timestamp: u64) {
        if id.is_empty() {
            tracing::warn!("Dropping interval with empty id");
            return;
        }
        self.preempt_iterator();

        let mut core = self.shared.core.write();
        let (prefix, suffix) = split_id(id);
        let rewritten = core
            .ids
            .get(prefix)
            .map(|s| s.contains(suffix))
            .unwrap_or(false);
        if rewritten {
            core.remove_by_id(id);
        }
        core.ids
            .entry(prefix.to_string())
            .or_default()
            .insert(suffix.to_string());

        let idx = core.alloc(Interval::new(id, low, high, timestamp));
        core.storage.insert(id.to_string(), idx);
        core.tree_insert(idx);

        self.count_mutation(&mut core);
    }

    pub fn delete_interval(&self, id: &str) {
        self.preempt_iterator();
        let mut core = self.shared.core.write();
        if core.remove_by_id(id) {
            self.count_mutation(&mut core);
        }
    }

    /// Deletes every interval whose id is `prefix` or `prefix + '+' + ...`.
    pub fn delete_all_intervals(&self, prefix: &str) {
        self.preempt_iterator();
        let mut core = self.shared.core.write();
        let Some(suffixes) = core.ids.get(prefix) else {
            return;
        };
        let doomed: Vec<String> = suffixes
            .iter()
            .map(|s| {
                if s.is_empty() {
                    prefix.to_string()
                } else {
                    format!("{prefix}{ID_DELIM}{s}")
                }
            })
            .collect();
        for id in doomed {
            if core.remove_by_id(&id) {
                self.count_mutation(&mut core);
            }
        }
    }

    pub fn get_interval(&self, id: &str) -> Option<Interval> {
        let core = self.shared.core.read();
        core.storage
            .get(id)
            .map(|&idx| core.nodes[idx as usize].interval.clone())
    }

    /// All intervals intersecting `[low, high]`, timestamp-descending.
    pub fn top_k(&self, low: &str, high: &str) -> Vec<Interval> {
        let core = self.shared.core.read();
        let mut out = Vec::new();
        core.search_into(core.root, low, high, &mut out);
        out.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Lazy variant of [`top_k`](Self::top_k): yields intersecting intervals
    /// one at a time in strictly descending timestamp order. Returns `None`
    /// while another iterator is live.
    pub fn top_k_iter(&self, low: &str, high: &str) -> Option<TopKIterator> {
        let mut active = self.shared.active_iter.lock();
        if let Some(flag) = active.as_ref() {
            if !flag.load(Ordering::Acquire) {
                return None;
            }
        }
        let stop = Arc::new(AtomicBool::new(false));
        *active = Some(stop.clone());

        let mut heap = BinaryHeap::new();
        {
            let core = self.shared.core.read();
            if core.root != NIL {
                heap.push(HeapEntry {
                    key: core.nodes[core.root as usize].max_timestamp,
                    idx: core.root,
                });
            }
        }

        Some(TopKIterator {
            shared: self.shared.clone(),
            stop,
            heap,
            explored: HashSet::new(),
            low: low.to_string(),
            high: high.to_string(),
        })
    }

    /// Rewrites the snapshot file. Failures are logged, never propagated;
    /// the next successful sync supersedes them.
    pub fn sync(&self) {
        let mut core = self.shared.core.write();
        self.sync_locked(&mut core);
    }

    fn sync_locked(&self, core: &mut TreeCore) {
        core.sync_counter = 0;
        let Some(path) = self.shared.sync_file.as_ref() else {
            return;
        };
        let records: Vec<Interval> = core
            .storage
            .values()
            .map(|&idx| core.nodes[idx as usize].interval.clone())
            .collect();
        if let Err(e) = write_snapshot(path, &records) {
            tracing::warn!(file = %path.display(), error = %e, "Interval snapshot sync failed");
        }
    }

    fn count_mutation(&self, core: &mut TreeCore) {
        core.sync_counter += 1;
        if core.sync_counter > core.sync_threshold {
            self.sync_locked(core);
        }
    }

    fn preempt_iterator(&self) {
        let mut active = self.shared.active_iter.lock();
        if let Some(flag) = active.take() {
            flag.store(true, Ordering::Release);
        }
    }
}

fn write_snapshot(path: &Path, records: &[Interval]) -> anyhow::Result<()> {
    let encoded = bincode::serialize(records)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &encoded)?;
    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

fn split_id(id: &str) -> (&str, &str) {
    match id.split_once(ID_DELIM) {
        Some((prefix, suffix)) => (prefix, suffix),
        None => (id, ""),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    key: u64,
    idx: u32,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Best-first walk over the tree: a max-heap of subtree `max_timestamp`
/// bounds, refined to exact timestamps as intersecting nodes surface.
///
/// Only one iterator may be live per tree. Any tree mutation preempts it;
/// a preempted iterator's `next` returns `None`.
pub struct TopKIterator {
    shared: Arc<TreeShared>,
    stop: Arc<AtomicBool>,
    heap: BinaryHeap<HeapEntry>,
    explored: HashSet<u32>,
    low: String,
    high: String,
}

impl TopKIterator {
    pub fn next(&mut self) -> Option<Interval> {
        if self.stop.load(Ordering::Acquire) {
            self.release();
            return None;
        }
        let core = self.shared.core.read();
        // Re-check under the lock: a mutation that set the flag has either
        // finished or is blocked until this read guard drops.
        if self.stop.load(Ordering::Acquire) {
            drop(core);
            self.release();
            return None;
        }

        while let Some(HeapEntry { key, idx }) = self.heap.pop() {
            let node = &core.nodes[idx as usize];

            if !self.explored.contains(&idx) {
                for child in [node.left, node.right] {
                    if child != NIL
                        && core.nodes[child as usize].max_high.as_str() >= self.low.as_str()
                    {
                        self.heap.push(HeapEntry {
                            key: core.nodes[child as usize].max_timestamp,
                            idx: child,
                        });
                    }
                }
            }

            if node.interval.overlaps(&self.low, &self.high) {
                let t = node.interval.timestamp;
                if t < key {
                    // Was pushed under a subtree bound; requeue at its own
                    // timestamp so larger intervals surface first.
                    self.heap.push(HeapEntry { key: t, idx });
                    self.explored.insert(idx);
                } else {
                    return Some(node.interval.clone());
                }
            }
        }
        None
    }

    /// Releases the tree immediately; subsequent `next` returns `None`.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.heap.clear();
        self.explored.clear();
        self.release();
    }

    fn release(&mut self) {
        let mut active = self.shared.active_iter.lock();
        if let Some(flag) = active.as_ref() {
            if Arc::ptr_eq(flag, &self.stop) {
                *active = None;
            }
        }
    }
}

impl Drop for TopKIterator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.release();
    }
}

impl TreeCore {
    fn new(sync_threshold: u32) -> Self {
        Self {
            nodes: vec![Node::nil()],
            free: Vec::new(),
            root: NIL,
            storage: HashMap::new(),
            ids: HashMap::new(),
            sync_threshold,
            sync_counter: 0,
        }
    }

    fn alloc(&mut self, interval: Interval) -> u32 {
        let node = Node {
            max_high: interval.high.clone(),
            max_timestamp: interval.timestamp,
            interval,
            red: true,
            parent: NIL,
            left: NIL,
            right: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    /// Structural removal plus id bookkeeping. Returns false for unknown ids.
    fn remove_by_id(&mut self, id: &str) -> bool {
        let Some(idx) = self.storage.remove(id) else {
            return false;
        };
        let (prefix, suffix) = split_id(id);
        if let Some(suffixes) = self.ids.get_mut(prefix) {
            suffixes.remove(suffix);
            if suffixes.is_empty() {
                self.ids.remove(prefix);
            }
        }
        self.tree_delete(idx);
        true
    }

    fn search_into(&self, x: u32, low: &str, high: &str, out: &mut Vec<Interval>) {
        if x == NIL {
            return;
        }
        let node = &self.nodes[x as usize];
        if low > node.max_high.as_str() {
            return;
        }
        self.search_into(node.left, low, high, out);
        if node.interval.overlaps(low, high) {
            out.push(node.interval.clone());
        }
        if high < node.interval.low.as_str() {
            return;
        }
        self.search_into(node.right, low, high, out);
    }

    fn tree_insert(&mut self, z: u32) {
        let mut y = NIL;
        let mut x = self.root;

        // Max fields along the descent absorb the new interval up front.
        let (z_high, z_ts) = {
            let zn = &self.nodes[z as usize];
            (zn.interval.high.clone(), zn.interval.timestamp)
        };
        while x != NIL {
            y = x;
            {
                let xn = &mut self.nodes[x as usize];
                if xn.max_high < z_high {
                    xn.max_high = z_high.clone();
                }
                if xn.max_timestamp < z_ts {
                    xn.max_timestamp = z_ts;
                }
            }
            x = if self.nodes[z as usize].interval.low < self.nodes[x as usize].interval.low {
                self.nodes[x as usize].left
            } else {
                self.nodes[x as usize].right
            };
        }

        self.nodes[z as usize].parent = y;
        if y == NIL {
            self.root = z;
        } else if self.nodes[z as usize].interval.low < self.nodes[y as usize].interval.low {
            self.nodes[y as usize].left = z;
        } else {
            self.nodes[y as usize].right = z;
        }
        self.nodes[z as usize].left = NIL;
        self.nodes[z as usize].right = NIL;
        self.nodes[z as usize].red = true;

        self.insert_fixup(z);
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.nodes[self.nodes[z as usize].parent as usize].red {
            let parent = self.nodes[z as usize].parent;
            let grandparent = self.nodes[parent as usize].parent;
            if parent == self.nodes[grandparent as usize].left {
                let uncle = self.nodes[grandparent as usize].right;
                if self.nodes[uncle as usize].red {
                    self.nodes[parent as usize].red = false;
                    self.nodes[uncle as usize].red = false;
                    self.nodes[grandparent as usize].red = true;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent as usize].right {
                        z = parent;
                        self.left_rotate(z);
                    }
                    let parent = self.nodes[z as usize].parent;
                    let grandparent = self.nodes[parent as usize].parent;
                    self.nodes[parent as usize].red = false;
                    self.nodes[grandparent as usize].red = true;
                    self.right_rotate(grandparent);
                }
            } else {
                let uncle = self.nodes[grandparent as usize].left;
                if self.nodes[uncle as usize].red {
                    self.nodes[parent as usize].red = false;
                    self.nodes[uncle as usize].red = false;
                    self.nodes[grandparent as usize].red = true;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent as usize].left {
                        z = parent;
                        self.right_rotate(z);
                    }
                    let parent = self.nodes[z as usize].parent;
                    let grandparent = self.nodes[parent as usize].parent;
                    self.nodes[parent as usize].red = false;
                    self.nodes[grandparent as usize].red = true;
                    self.left_rotate(grandparent);
                }
            }
        }
        let root = self.root;
        self.nodes[root as usize].red = false;
    }

    fn tree_delete(&mut self, z: u32) {
        let mut y = z;
        let mut y_orig_red = self.nodes[y as usize].red;
        let x;

        if self.nodes[z as usize].left == NIL {
            x = self.nodes[z as usize].right;
            self.transplant(z, x);
        } else if self.nodes[z as usize].right == NIL {
            x = self.nodes[z as usize].left;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.nodes[z as usize].right);
            y_orig_red = self.nodes[y as usize].red;
            x = self.nodes[y as usize].right;
            if self.nodes[y as usize].parent == z {
                self.nodes[x as usize].parent = y;
            } else {
                self.transplant(y, x);
                let z_right = self.nodes[z as usize].right;
                self.nodes[y as usize].right = z_right;
                self.nodes[z_right as usize].parent = y;
            }
            self.transplant(z, y);
            let z_left = self.nodes[z as usize].left;
            self.nodes[y as usize].left = z_left;
            self.nodes[z_left as usize].parent = y;
            self.nodes[y as usize].red = self.nodes[z as usize].red;
        }

        let fixup_from = self.nodes[x as usize].parent;
        self.max_fields_fixup(fixup_from);

        if !y_orig_red {
            self.delete_fixup(x);
        }

        self.free.push(z);
        // Nil picks up stray parent pointers during delete; reset it.
        self.nodes[NIL as usize] = Node::nil();
    }

    fn delete_fixup(&mut self, mut x: u32) {
        while x != self.root && !self.nodes[x as usize].red {
            let parent = self.nodes[x as usize].parent;
            if x == self.nodes[parent as usize].left {
                let mut w = self.nodes[parent as usize].right;
                if self.nodes[w as usize].red {
                    self.nodes[w as usize].red = false;
                    self.nodes[parent as usize].red = true;
                    self.left_rotate(parent);
                    w = self.nodes[self.nodes[x as usize].parent as usize].right;
                }
                let w_left = self.nodes[w as usize].left;
                let w_right = self.nodes[w as usize].right;
                if !self.nodes[w_left as usize].red && !self.nodes[w_right as usize].red {
                    self.nodes[w as usize].red = true;
                    x = self.nodes[x as usize].parent;
                } else {
                    if !self.nodes[w_right as usize].red {
                        self.nodes[w_left as usize].red = false;
                        self.nodes[w as usize].red = true;
                        self.right_rotate(w);
                        w = self.nodes[self.nodes[x as usize].parent as usize].right;
                    }
                    let parent = self.nodes[x as usize].parent;
                    self.nodes[w as usize].red = self.nodes[parent as usize].red;
                    self.nodes[parent as usize].red = false;
                    let w_right = self.nodes[w as usize].right;
                    self.nodes[w_right as usize].red = false;
                    self.left_rotate(parent);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[parent as usize].left;
                if self.nodes[w as usize].red {
                    self.nodes[w as usize].red = false;
                    self.nodes[parent as usize].red = true;
                    self.right_rotate(parent);
                    w = self.nodes[self.nodes[x as usize].parent as usize].left;
                }
                let w_left = self.nodes[w as usize].left;
                let w_right = self.nodes[w as usize].right;
                if !self.nodes[w_left as usize].red && !self.nodes[w_right as usize].red {
                    self.nodes[w as usize].red = true;
                    x = self.nodes[x as usize].parent;
                } else {
                    if !self.nodes[w_left as usize].red {
                        self.nodes[w_right as usize].red = false;
                        self.nodes[w as usize].red = true;
                        self.left_rotate(w);
                        w = self.nodes[self.nodes[x as usize].parent as usize].left;
                    }
                    let parent = self.nodes[x as usize].parent;
                    self.nodes[w as usize].red = self.nodes[parent as usize].red;
                    self.nodes[parent as usize].red = false;
                    let w_left = self.nodes[w as usize].left;
                    self.nodes[w_left as usize].red = false;
                    self.right_rotate(parent);
                    x = self.root;
                }
            }
        }
        self.nodes[x as usize].red = false;
    }

    fn minimum(&self, mut x: u32) -> u32 {
        while self.nodes[x as usize].left != NIL {
            x = self.nodes[x as usize].left;
        }
        x
    }

    fn left_rotate(&mut self, x: u32) {
        let y = self.nodes[x as usize].right;
        let y_left = self.nodes[y as usize].left;
        self.nodes[x as usize].right = y_left;
        if y_left != NIL {
            self.nodes[y_left as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if x == self.nodes[x_parent as usize].left {
            self.nodes[x_parent as usize].left = y;
        } else {
            self.nodes[x_parent as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;

        self.nodes[y as usize].max_high = self.nodes[x as usize].max_high.clone();
        self.nodes[y as usize].max_timestamp = self.nodes[x as usize].max_timestamp;
        self.set_max_fields(x);
    }

    fn right_rotate(&mut self, x: u32) {
        let y = self.nodes[x as usize].left;
        let y_right = self.nodes[y as usize].right;
        self.nodes[x as usize].left = y_right;
        if y_right != NIL {
            self.nodes[y_right as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if x == self.nodes[x_parent as usize].right {
            self.nodes[x_parent as usize].right = y;
        } else {
            self.nodes[x_parent as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;

        self.nodes[y as usize].max_high = self.nodes[x as usize].max_high.clone();
        self.nodes[y as usize].max_timestamp = self.nodes[x as usize].max_timestamp;
        self.set_max_fields(x);
    }

    fn transplant(&mut self, u: u32, v: u32) {
        let u_parent = self.nodes[u as usize].parent;
        if u_parent == NIL {
            self.root = v;
        } else if u == self.nodes[u_parent as usize].left {
            self.nodes[u_parent as usize].left = v;
        } else {
            self.nodes[u_parent as usize].right = v;
        }
        self.nodes[v as usize].parent = u_parent;
    }

    /// Repairs `max_high`/`max_timestamp` upward, stopping once a node's
    /// fields are unchanged.
    fn max_fields_fixup(&mut self, mut x: u32) {
        while x != NIL {
            let old_high = self.nodes[x as usize].max_high.clone();
            let old_ts = self.nodes[x as usize].max_timestamp;
            self.set_max_fields(x);
            let node = &self.nodes[x as usize];
            if node.max_high == old_high && node.max_timestamp == old_ts {
                break;
            }
            x = node.parent;
        }
    }

    fn set_max_fields(&mut self, x: u32) {
        let left = self.nodes[x as usize].left;
        let right = self.nodes[x as usize].right;
        let mut high = self.nodes[x as usize].interval.high.clone();
        let mut ts = self.nodes[x as usize].interval.timestamp;
        for child in [left, right] {
            if child != NIL {
                let cn = &self.nodes[child as usize];
                if cn.max_high > high {
                    high = cn.max_high.clone();
                }
                ts = ts.max(cn.max_timestamp);
            }
        }
        self.nodes[x as usize].max_high = high;
        self.nodes[x as usize].max_timestamp = ts;
    }
}
