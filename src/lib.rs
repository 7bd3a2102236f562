//! `facetdb` is a log-structured merge-tree (LSM) key-value store for JSON
//! records with a built-in secondary index.
//!
//! Records are stored under a configured primary-key attribute and indexed
//! by a configured secondary-key attribute. Secondary lookups return the
//! top-K freshest records per value or per value band:
//! - Internal keys are ordered by `(user_key ASC, seqno DESC, kind)`.
//! - Reads are snapshot-safe (consistent reads at a sequence number).
//! - Deletes are tombstones.
//! - Each memtable carries an inverted secondary map; each sorted run
//!   carries per-block secondary summaries, bloom filters, and either an
//!   inline interval block or entries in a process-wide interval tree.

pub mod cache;
pub mod db;
pub mod extract;
pub mod internal_key;
pub mod interval;
pub(crate) mod memtable;
pub(crate) mod query;
pub mod sst;
pub(crate) mod version;

pub use db::{Db, DbMetrics, DbOptions, ReadOptions, SnapshotId, Value};
pub use extract::ExtractError;
pub use interval::{Interval, IntervalTree, TopKIterator};
pub use query::SecondaryHit;
