//! Engine statistics

/// Snapshot of engine counters, returned by `SiltEngine::stats()`.
///
/// Counter fields accumulate from open (except `bytes_written_wal`, which
/// resets at each checkpoint); the fields after `checkpoints` are derived
/// from live state at snapshot time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub hits: u64,
    pub misses: u64,
    pub disk_reads: u64,
    pub bytes_written_data: u64,
    pub bytes_read_data: u64,
    pub bytes_written_wal: u64,
    pub compactions: u64,
    pub last_compaction_time: Option<u64>,
    pub checkpoints: u64,
    pub last_checkpoint_time: Option<u64>,
    /// Data log bytes not referenced by any live index entry
    pub wasted_space: u64,
    /// Size of the last written base index document
    pub index_size_bytes: u64,
    pub wal_size_bytes: u64,
    pub active_keys: usize,
    pub memory_store_keys: usize,
    pub pending_data_writes: usize,
    pub pending_index_changes: usize,
    pub data_file_size: u64,
}
