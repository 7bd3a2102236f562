use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Attribute extracted from each record to form its primary key.
    /// Must be non-empty.
    pub primary_key: String,
    /// Attribute driving the secondary index; empty disables it.
    pub secondary_key: String,
    pub memtable_shards: usize,
    /// Mutable memtable rotates past this size.
    pub memtable_bytes: u64,
    pub block_size: usize,
    /// False-positive rate for both filter blocks; `None` writes no filters.
    pub filter_fp_rate: Option<f64>,
    /// When set, per-block interval data lives in a process-wide tree
    /// persisted at this path (relative paths resolve under the db dir).
    /// When `None`, interval data is written inline into each sorted run.
    pub interval_tree_file_name: Option<PathBuf>,
    pub interval_sync_threshold: u32,
    pub reader_cache_entries: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            primary_key: "id".to_string(),
            secondary_key: String::new(),
            memtable_shards: 16,
            memtable_bytes: 8 * 1024 * 1024,
            block_size: 16 * 1024,
            filter_fp_rate: Some(0.01),
            interval_tree_file_name: None,
            interval_sync_threshold: crate::interval::DEFAULT_SYNC_THRESHOLD,
            reader_cache_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub snapshot: Option<crate::db::SnapshotId>,
}
