//! Silt — embedded persistent key-value store
//!
//! A single-process storage engine built from five pieces:
//!
//! - **Value codec**: typed records, `[tag][len:u32 LE][payload]`
//! - **Data log**: append-only file of records, read by (offset, size)
//! - **Index**: in-memory key → record-metadata map
//! - **WAL + checkpoint**: durable log of index mutations, periodically
//!   folded into a base index file by an atomic-rename checkpoint
//! - **Engine**: LRU-cached reads, deferred batched writes, TTL expiry,
//!   and background compaction of overwritten/deleted records
//!
//! # Durability contract
//!
//! Data records are appended before their WAL entries are written, so a
//! replayed WAL never installs metadata pointing at bytes that predate a
//! crash — a torn tail is detected and discarded. Checkpoints commit by
//! renaming a freshly written snapshot over the base index file.
//!
//! # Single owner
//!
//! One engine instance exclusively owns its three files. There is no
//! cross-process coordination; opening the same paths twice is undefined
//! behavior.

pub mod cache;
pub mod config;
pub mod datafile;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod snapshot;
pub mod stats;
pub mod sync;
pub mod ttl;
pub mod value;
pub mod wal;

// Re-export key types for convenience
pub use config::Config;
pub use engine::{SetOptions, SiltEngine};
pub use error::{SiltError, SiltResult};
pub use events::{Event, NoopObserver, Observer};
pub use index::RecordMeta;
pub use stats::Stats;
pub use value::{TypeTag, Value};
