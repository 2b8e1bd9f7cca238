//! Core storage engine — the heart of Silt.
//!
//! SiltEngine combines an LRU-bounded value cache, an in-memory key index,
//! an append-only data log, and a WAL+checkpoint pair that persists the
//! index. A background housekeeper thread runs the deferred flushes, TTL
//! expirations, periodic checkpoints, and the automatic compaction check.
//!
//! **Write path**: cache + dirty set now, data log + index + WAL at flush
//! **Read path**: cache first, index + data log on miss
//! **Durability**: WAL entries are only written for records already in the
//! data log, so a replayed SET never points at bytes that were not appended
//! before the crash — and a WAL tail that does is discarded.
//!
//! All state lives behind one mutex. Every public operation and every
//! housekeeper action holds it end to end, so mutations are strictly
//! serialized and file I/O happens in a known order.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};

use crate::cache::ReadCache;
use crate::config::Config;
use crate::datafile::DataLog;
use crate::error::{SiltError, SiltResult};
use crate::events::{Event, NoopObserver, Observer};
use crate::index::{Index, RecordMeta};
use crate::snapshot::{self, SnapshotStats};
use crate::stats::Stats;
use crate::ttl::{now_ms, TtlTable};
use crate::value::{self, Value};
use crate::wal::{self, Replay, WalFile, WalOp};

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// TTL for this write. A zero duration cancels any existing TTL without
    /// scheduling a new one; `None` falls back to `Config::default_ttl`.
    pub ttl: Option<Duration>,
}

impl SetOptions {
    /// Write with the given TTL.
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Compacting,
    Closing,
    Closed,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Open => "open",
            Lifecycle::Compacting => "compacting",
            Lifecycle::Closing => "closing",
            Lifecycle::Closed => "closed",
        }
    }
}

/// An index mutation awaiting its WAL flush. Last writer wins per key.
#[derive(Debug, Clone, Copy)]
enum PendingChange {
    Set(RecordMeta),
    Delete,
}

struct State {
    cache: ReadCache,
    dirty: HashSet<String>,
    pending: HashMap<String, PendingChange>,
    index: Index,
    ttl: TtlTable,
    data_log: DataLog,
    wal: WalFile,
    /// Next data log append position; seeded from the file length at open
    next_offset: u64,
    wal_size: u64,
    wasted_space: u64,
    index_size_bytes: u64,
    checkpoints: u64,
    last_checkpoint_time: Option<u64>,
    checkpointing: bool,
    lifecycle: Lifecycle,
    stats: Stats,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
    shutdown: AtomicBool,
    config: Config,
    observer: Box<dyn Observer>,
}

/// Embedded persistent key-value store.
///
/// Open one instance per set of paths; the files are exclusively owned for
/// the engine's lifetime, and opening the same paths twice is undefined
/// behavior. Dropping the engine closes it.
pub struct SiltEngine {
    inner: Arc<Inner>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl SiltEngine {
    /// Open or create a store with no observer.
    pub fn open(config: Config) -> SiltResult<Self> {
        Self::open_with_observer(config, Box::new(NoopObserver))
    }

    /// Open or create a store.
    ///
    /// Recovery sequence:
    /// 1. Open the data log; its length seeds the append cursor
    /// 2. Open the WAL
    /// 3. Load the base index file if present (malformed is fatal — the
    ///    data log embeds no keys, so the index cannot be rebuilt)
    /// 4. Replay the WAL from offset 0, halting at the first torn or
    ///    malformed entry and trimming the discarded tail
    /// 5. Derive wasted space, preload the cache, start the housekeeper
    pub fn open_with_observer(config: Config, observer: Box<dyn Observer>) -> SiltResult<Self> {
        config.validate()?;

        let (data_log, data_len) = DataLog::open(&config.db_path)?;
        let (mut wal_file, wal_len) = WalFile::open(config.wal_path())?;

        let mut index = Index::new();
        let mut ttl = TtlTable::new();
        let now = now_ms();
        let mut checkpoints = 0u64;
        let mut last_checkpoint_time = None;
        let mut index_size_bytes = 0u64;
        if let Some(loaded) = snapshot::load(&config.index_path)? {
            checkpoints = loaded.stats.checkpoints;
            last_checkpoint_time = loaded.stats.last_checkpoint_time;
            index_size_bytes = fs::metadata(&config.index_path).map(|m| m.len()).unwrap_or(0);
            for (key, meta) in loaded.index {
                match meta.expiry {
                    // Already past: the key is gone and its record is dead
                    // space until the next compaction
                    Some(expiry) if expiry <= now => {}
                    Some(expiry) => {
                        ttl.schedule(&key, expiry);
                        index.insert(key, meta);
                    }
                    None => {
                        index.insert(key, meta);
                    }
                }
            }
        }

        let wal_bytes = wal_file.read_all()?;
        let Replay { ops, halt } = wal::replay(&wal_bytes);

        let mut replayed_ops = 0usize;
        let mut halt_info: Option<(u64, String)> =
            halt.map(|halted| (halted.offset, halted.reason));
        let mut good_len = halt_info.as_ref().map(|(offset, _)| *offset).unwrap_or(wal_len);

        for (entry_offset, op) in ops {
            match op {
                WalOp::Set { key, meta } => {
                    if meta.offset.saturating_add(meta.size as u64) > data_len {
                        // The crash landed between a data append and its WAL
                        // entry; everything from here on references bytes
                        // that never reached the log.
                        halt_info = Some((
                            entry_offset,
                            format!("entry for '{}' points past the data log end", key),
                        ));
                        good_len = entry_offset;
                        break;
                    }
                    match meta.expiry {
                        Some(expiry) if expiry <= now => {
                            index.remove(&key);
                            ttl.cancel(&key);
                        }
                        Some(expiry) => {
                            ttl.schedule(&key, expiry);
                            index.insert(key, meta);
                        }
                        None => {
                            ttl.cancel(&key);
                            index.insert(key, meta);
                        }
                    }
                }
                WalOp::Delete { key } => {
                    index.remove(&key);
                    ttl.cancel(&key);
                }
            }
            replayed_ops += 1;
        }

        if let Some((offset, reason)) = halt_info {
            observer.emit(Event::Warn {
                message: format!(
                    "WAL replay stopped at offset {}: {}; discarding the tail",
                    offset, reason
                ),
            });
            if let Err(e) = wal_file.truncate_to(good_len) {
                observer.emit(Event::Warn {
                    message: format!("Failed to trim the discarded WAL tail: {}", e),
                });
            }
        }
        let wal_size = wal_file.stat_len().unwrap_or(good_len);
        observer.emit(Event::WalReplayed { replayed_ops, final_index_size: index.len() });
        if !index.is_empty() || replayed_ops > 0 {
            observer.emit(Event::Log {
                message: format!(
                    "Recovered {} keys ({} WAL ops replayed)",
                    index.len(),
                    replayed_ops
                ),
            });
        }

        let wasted_space = data_len.saturating_sub(index.live_bytes());

        let mut state = State {
            cache: ReadCache::new(config.max_memory_keys),
            dirty: HashSet::new(),
            pending: HashMap::new(),
            index,
            ttl,
            data_log,
            wal: wal_file,
            next_offset: data_len,
            wal_size,
            wasted_space,
            index_size_bytes,
            checkpoints,
            last_checkpoint_time,
            checkpointing: false,
            lifecycle: Lifecycle::Open,
            stats: Stats::default(),
        };

        if config.preload {
            preload(&mut state, observer.as_ref());
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            config,
            observer,
        });

        let housekeeper = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("silt-housekeeper".to_string())
                .spawn(move || housekeeper_loop(inner))
                .map_err(|e| SiltError::Io {
                    path: None,
                    kind: std::io::ErrorKind::Other,
                    message: format!("Failed to spawn housekeeper thread: {}", e),
                })?
        };

        inner.observer.emit(Event::Ready);
        Ok(Self { inner, housekeeper: Mutex::new(Some(housekeeper)) })
    }

    /// Write a value under `key`.
    pub fn set(&self, key: &str, value: Value) -> SiltResult<()> {
        self.set_with(key, value, SetOptions::default())
    }

    /// Write a value under `key` with per-write options.
    ///
    /// The value lands in the cache and dirty set immediately; the data log
    /// append, index update, and WAL entry happen at the next flush (or
    /// right now under `sync_on_write`).
    pub fn set_with(&self, key: &str, value: Value, options: SetOptions) -> SiltResult<()> {
        if key.is_empty() {
            return Err(SiltError::Config { message: "key must not be empty".into() });
        }
        if key.len() > self.inner.config.max_key_size {
            return Err(SiltError::Config {
                message: format!(
                    "key of {} bytes exceeds max_key_size {}",
                    key.len(),
                    self.inner.config.max_key_size
                ),
            });
        }
        let payload_size = value.payload_size();
        if payload_size > self.inner.config.max_value_size {
            return Err(SiltError::Config {
                message: format!(
                    "value of {} bytes exceeds max_value_size {}",
                    payload_size, self.inner.config.max_value_size
                ),
            });
        }

        let inner = &*self.inner;
        let mut state = inner.state.lock();
        writable(inner, &state, "set")?;

        if !state.cache.contains(key) {
            make_room(inner, &mut state)?;
        }

        let effective_ttl = match options.ttl {
            Some(ttl) if !ttl.is_zero() => Some(ttl),
            Some(_) => None, // explicit cancel
            None => inner.config.default_ttl.filter(|ttl| !ttl.is_zero()),
        };
        match effective_ttl {
            Some(ttl) => state.ttl.schedule(key, now_ms() + ttl.as_millis() as u64),
            None => {
                state.ttl.cancel(key);
            }
        }

        state.cache.insert(key.to_string(), value.clone());
        state.dirty.insert(key.to_string());
        state.stats.writes += 1;
        inner.observer.emit(Event::Set { key: key.to_string(), value });

        if inner.config.sync_on_write {
            // Failures are recovered locally: the key stays dirty or the
            // batch re-merges into pending, and an error event was emitted.
            let _ = flush_data(inner, &mut state, true);
            let _ = flush_wal(inner, &mut state, true);
        }
        // Notified under the lock so the housekeeper cannot miss a new
        // earliest TTL deadline between its check and its wait
        inner.wake.notify_one();
        Ok(())
    }

    /// Read the value for `key`, if it is live.
    pub fn get(&self, key: &str) -> SiltResult<Option<Value>> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        if matches!(state.lifecycle, Lifecycle::Closing | Lifecycle::Closed) {
            return Ok(None);
        }
        state.stats.reads += 1;

        if expired(&state, key) {
            expire_key(inner, &mut state, key);
            state.stats.misses += 1;
            inner.observer.emit(Event::Miss { key: key.to_string() });
            return Ok(None);
        }

        if let Some(value) = state.cache.get(key) {
            let value = value.clone();
            state.stats.hits += 1;
            inner.observer.emit(Event::Get { key: key.to_string(), value: value.clone() });
            return Ok(Some(value));
        }

        let meta = match state.index.get(key) {
            Some(meta) => *meta,
            None => {
                state.stats.misses += 1;
                inner.observer.emit(Event::Miss { key: key.to_string() });
                return Ok(None);
            }
        };

        let bytes = match state.data_log.read_exact_at(meta.offset, meta.size) {
            Ok(bytes) => bytes,
            Err(e) => {
                inner.observer.emit(Event::Error {
                    message: format!("Failed to read record for '{}': {}", key, e),
                });
                return Ok(None);
            }
        };
        state.stats.disk_reads += 1;
        state.stats.bytes_read_data += meta.size as u64;

        let decoded = match value::decode(&bytes) {
            Ok(value) => value,
            Err(e) => {
                inner.observer.emit(Event::Error {
                    message: format!("Corrupt record for '{}': {}", key, e),
                });
                return Ok(None);
            }
        };

        if make_room(inner, &mut state).is_ok() {
            state.cache.insert(key.to_string(), decoded.clone());
        }
        inner.observer.emit(Event::Get { key: key.to_string(), value: decoded.clone() });
        Ok(Some(decoded))
    }

    /// Whether `key` is live in the index.
    pub fn has(&self, key: &str) -> bool {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        if matches!(state.lifecycle, Lifecycle::Closing | Lifecycle::Closed) {
            return false;
        }
        if expired(&state, key) {
            expire_key(inner, &mut state, key);
            return false;
        }
        state.index.contains(key)
    }

    /// Remove `key`. Returns whether it was live in the index.
    pub fn delete(&self, key: &str) -> SiltResult<bool> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        writable(inner, &state, "delete")?;

        let existed = remove_key(&mut state, key);
        if existed {
            state.stats.deletes += 1;
            inner.observer.emit(Event::Delete { key: key.to_string() });
            if inner.config.sync_on_write {
                let _ = flush_wal(inner, &mut state, true);
            }
        }
        inner.wake.notify_one();
        Ok(existed)
    }

    /// Remove everything: cache, index, data log, WAL. Checkpoints the
    /// resulting empty index so a reopen starts clean.
    pub fn clear(&self) -> SiltResult<()> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        writable(inner, &state, "clear")?;

        let old_size = state.index.len();
        state.cache.clear();
        state.dirty.clear();
        state.pending.clear();
        state.ttl.clear();
        state.index.clear();

        state.data_log.truncate()?;
        state.next_offset = 0;
        state.wasted_space = 0;
        state.wal.truncate_to(0)?;
        state.wal_size = 0;

        run_checkpoint(inner, &mut state, true, false)?;
        inner.observer.emit(Event::Clear { old_size });
        Ok(())
    }

    /// All live keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.index.keys().cloned().collect()
    }

    /// Number of live keys.
    pub fn size(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    /// Flush dirty values to the data log and pending changes to the WAL.
    /// A no-op when there is nothing to write.
    pub fn flush(&self, force_sync: bool) -> SiltResult<()> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        writable(inner, &state, "flush")?;
        flush_data(inner, &mut state, force_sync)?;
        flush_wal(inner, &mut state, force_sync)?;
        Ok(())
    }

    /// Snapshot the index to the base file and truncate the WAL.
    pub fn checkpoint(&self, force_sync: bool) -> SiltResult<()> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        writable(inner, &state, "checkpoint")?;
        run_checkpoint(inner, &mut state, force_sync, false)
    }

    /// Rewrite the data log with only live records, reclaiming dead space.
    /// Returns the new data log size.
    pub fn compact(&self) -> SiltResult<u64> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        compact_guarded(inner, &mut state)
    }

    /// Current counters and derived gauges.
    pub fn stats(&self) -> Stats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.checkpoints = state.checkpoints;
        stats.last_checkpoint_time = state.last_checkpoint_time;
        stats.wasted_space = state.wasted_space;
        stats.index_size_bytes = state.index_size_bytes;
        stats.wal_size_bytes = state.wal_size;
        stats.active_keys = state.index.len();
        stats.memory_store_keys = state.cache.len();
        stats.pending_data_writes = state.dirty.len();
        stats.pending_index_changes = state.pending.len();
        stats.data_file_size = state.next_offset;
        stats
    }

    /// Shut down: stop background work, cancel TTLs, flush everything,
    /// checkpoint, and seal the engine. Idempotent and terminal — every
    /// operation after this is rejected or reads as missing.
    pub fn close(&self) -> SiltResult<()> {
        {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                Lifecycle::Closing | Lifecycle::Closed => return Ok(()),
                _ => state.lifecycle = Lifecycle::Closing,
            }
            // Store under the lock: the housekeeper checks the flag while
            // holding it, so this cannot slip between its check and wait
            self.inner.shutdown.store(true, Ordering::Release);
        }
        self.inner.wake.notify_all();
        if let Some(handle) = self.housekeeper.lock().take() {
            let _ = handle.join();
        }

        let inner = &*self.inner;
        let mut state = inner.state.lock();
        inner.observer.emit(Event::Closing);
        state.ttl.clear();

        let data = flush_data(inner, &mut state, true).map(|_| ());
        let wal = flush_wal(inner, &mut state, true).map(|_| ());
        let checkpoint = run_checkpoint(inner, &mut state, true, true);

        state.lifecycle = Lifecycle::Closed;
        inner.observer.emit(Event::Close);
        data.and(wal).and(checkpoint)
    }

    /// Abandon the engine without flushing anything, as if the process
    /// died. Unflushed writes are lost by design; recovery tests are the
    /// only reasonable caller.
    pub fn crash(self) {
        {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Closed;
            self.inner.shutdown.store(true, Ordering::Release);
        }
        self.inner.wake.notify_all();
        if let Some(handle) = self.housekeeper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SiltEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// `<db_path>.compacting`, the scratch file for a data log rewrite.
fn compacting_path(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(".compacting");
    PathBuf::from(name)
}

fn writable(inner: &Inner, state: &State, operation: &'static str) -> SiltResult<()> {
    match state.lifecycle {
        Lifecycle::Closing | Lifecycle::Closed => {
            inner.observer.emit(Event::Warn {
                message: format!("Rejected {}: engine is {}", operation, state.lifecycle.name()),
            });
            Err(SiltError::Lifecycle { operation, state: state.lifecycle.name() })
        }
        Lifecycle::Open | Lifecycle::Compacting => Ok(()),
    }
}

fn expired(state: &State, key: &str) -> bool {
    matches!(state.ttl.expiry_of(key), Some(expiry) if expiry <= now_ms())
}

/// Fire a key's expiry: delete it and report. Called from the housekeeper
/// sweep and from reads that notice a deadline the sweep has not reached.
fn expire_key(inner: &Inner, state: &mut State, key: &str) {
    state.ttl.cancel(key);
    if remove_key(state, key) {
        state.stats.deletes += 1;
        inner.observer.emit(Event::Delete { key: key.to_string() });
    }
    inner.observer.emit(Event::Expired { key: key.to_string() });
}

/// Shared removal path for delete, expiry, and replayed deletes. Returns
/// whether the key was live in the index.
fn remove_key(state: &mut State, key: &str) -> bool {
    state.cache.remove(key);
    state.dirty.remove(key);
    state.ttl.cancel(key);
    if let Some(meta) = state.index.remove(key) {
        state.wasted_space += meta.size as u64;
        state.pending.insert(key.to_string(), PendingChange::Delete);
        true
    } else {
        false
    }
}

/// Encode one value, append it at the cursor, install its metadata, and
/// queue the SET for the WAL. The caller decides when to sync.
fn append_record(inner: &Inner, state: &mut State, key: &str, value: &Value) -> SiltResult<()> {
    let bytes = value::encode(value)?;
    if bytes.len() - value::RECORD_HEADER_SIZE > inner.config.max_value_size {
        return Err(SiltError::Serialization {
            message: format!(
                "encoded value for '{}' is {} bytes, over the {} byte limit",
                key,
                bytes.len() - value::RECORD_HEADER_SIZE,
                inner.config.max_value_size
            ),
        });
    }

    let offset = state.next_offset;
    state.data_log.append_at(offset, &bytes)?;

    let meta = RecordMeta {
        offset,
        size: bytes.len() as u32,
        tag: value.type_tag(),
        expiry: state.ttl.expiry_of(key),
    };
    if let Some(old) = state.index.insert(key.to_string(), meta) {
        state.wasted_space += old.size as u64;
    }
    state.next_offset += bytes.len() as u64;
    state.stats.bytes_written_data += bytes.len() as u64;
    state.pending.insert(key.to_string(), PendingChange::Set(meta));
    Ok(())
}

/// Evict least-recently-used entries until an insert fits the cap. A dirty
/// victim is written to the data log first so its value is never lost; if
/// that write fails, the victim is restored and the triggering operation
/// fails.
fn make_room(inner: &Inner, state: &mut State) -> SiltResult<()> {
    while state.cache.at_capacity() {
        let (victim, value) = match state.cache.pop_lru() {
            Some(entry) => entry,
            None => break,
        };
        if state.dirty.remove(&victim) {
            if let Err(e) = append_record(inner, state, &victim, &value) {
                inner.observer.emit(Event::Error {
                    message: format!("Write-back of evicted '{}' failed: {}", victim, e),
                });
                state.dirty.insert(victim.clone());
                state.cache.insert(victim, value);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Data-flush pass:
/// 1. Take the dirty set (new writes queue independently)
/// 2. Append each cached value at the cursor, install metadata, queue a
///    SET for the WAL
/// 3. An I/O failure re-queues the key for the next pass; a value that
///    cannot encode is reported and dropped from the pass
/// 4. Sync if requested and anything was written
fn flush_data(inner: &Inner, state: &mut State, force_sync: bool) -> SiltResult<usize> {
    if state.dirty.is_empty() {
        return Ok(0);
    }
    let batch: Vec<String> = state.dirty.drain().collect();
    let mut flushed = 0usize;

    for key in batch {
        let value = match state.cache.peek(&key) {
            Some(value) => value.clone(),
            None => continue, // no longer cached; nothing to persist
        };
        match append_record(inner, state, &key, &value) {
            Ok(()) => flushed += 1,
            Err(e @ SiltError::Serialization { .. }) => {
                // Retrying will not make the value encodable
                inner.observer.emit(Event::Error { message: e.to_string() });
            }
            Err(e) => {
                inner.observer.emit(Event::Error {
                    message: format!("Data flush failed for '{}': {}", key, e),
                });
                state.dirty.insert(key);
            }
        }
    }

    if flushed > 0 {
        if force_sync || inner.config.sync_on_write {
            if let Err(e) = state.data_log.sync() {
                inner.observer.emit(Event::Error { message: e.to_string() });
                return Err(e);
            }
        }
        inner.observer.emit(Event::DataFlush { count: flushed });
    }
    Ok(flushed)
}

/// WAL-flush pass:
/// 1. Swap the pending-change set for an empty one
/// 2. Serialize the batch into one contiguous buffer
/// 3. Append it at the WAL end; sync if requested
/// 4. On write failure, re-merge the batch (entries queued after the swap
///    win) and resynchronize the size counter from a stat
/// 5. On success, checkpoint if the WAL crossed its size threshold
fn flush_wal(inner: &Inner, state: &mut State, force_sync: bool) -> SiltResult<usize> {
    if state.pending.is_empty() {
        return Ok(0);
    }
    let batch = std::mem::take(&mut state.pending);
    let count = batch.len();

    let mut buf = Vec::new();
    let mut encode_err = None;
    for (key, change) in &batch {
        match change {
            PendingChange::Set(meta) => {
                if let Err(e) = wal::encode_set(&mut buf, key, meta) {
                    encode_err = Some(e);
                    break;
                }
            }
            PendingChange::Delete => wal::encode_delete(&mut buf, key),
        }
    }
    if let Some(e) = encode_err {
        for (key, change) in batch {
            state.pending.entry(key).or_insert(change);
        }
        inner.observer.emit(Event::Error { message: e.to_string() });
        return Err(e);
    }

    if let Err(e) = state.wal.append(&buf) {
        for (key, change) in batch {
            state.pending.entry(key).or_insert(change);
        }
        state.wal_size = state.wal.stat_len().unwrap_or(state.wal_size);
        inner.observer.emit(Event::Error { message: format!("WAL flush failed: {}", e) });
        return Err(e);
    }
    state.wal_size += buf.len() as u64;
    state.stats.bytes_written_wal += buf.len() as u64;

    if force_sync || inner.config.sync_on_write {
        if let Err(e) = state.wal.sync() {
            inner.observer.emit(Event::Error { message: e.to_string() });
            return Err(e);
        }
    }
    inner.observer.emit(Event::IndexWalFlush { count });

    if state.wal_size >= inner.config.wal_size_threshold {
        run_checkpoint(inner, state, force_sync, false)?;
    }
    Ok(count)
}

/// Checkpoint entry point; the `checkpointing` flag makes the threshold
/// trigger inside `flush_wal` a no-op while one is already running.
fn run_checkpoint(
    inner: &Inner,
    state: &mut State,
    force_sync: bool,
    during_close: bool,
) -> SiltResult<()> {
    if state.checkpointing && !during_close {
        return Ok(());
    }
    state.checkpointing = true;
    let result = checkpoint_locked(inner, state, force_sync, during_close);
    state.checkpointing = false;
    if let Err(e) = &result {
        inner.observer.emit(Event::Error { message: format!("Checkpoint failed: {}", e) });
    }
    result
}

fn checkpoint_locked(
    inner: &Inner,
    state: &mut State,
    force_sync: bool,
    during_close: bool,
) -> SiltResult<()> {
    if !during_close {
        // The snapshot must reflect every change the WAL knows about
        flush_wal(inner, state, false)?;
    }
    inner.observer.emit(Event::CheckpointStart);

    let now = now_ms();
    let counters = SnapshotStats {
        last_checkpoint_time: Some(now),
        checkpoints: state.checkpoints + 1,
    };
    let document = snapshot::serialize(&state.index, counters, now)?;
    // The rename inside is the commit point: before it the old base index
    // is authoritative, after it the WAL's contents are folded in.
    snapshot::write_atomic(&inner.config.index_path, &document, force_sync)?;

    if let Err(e) = state.wal.truncate_to(0) {
        // The snapshot committed; replaying these stale entries over it on
        // a future open is harmless, so only the size counter needs fixing.
        state.wal_size = state.wal.stat_len().unwrap_or(state.wal_size);
        return Err(e);
    }
    if force_sync {
        state.wal.sync()?;
    }
    state.wal_size = 0;
    state.stats.bytes_written_wal = 0;
    state.checkpoints += 1;
    state.last_checkpoint_time = Some(now);
    state.index_size_bytes = document.len() as u64;
    inner.observer.emit(Event::CheckpointEnd { size: document.len() as u64 });
    Ok(())
}

fn compact_guarded(inner: &Inner, state: &mut State) -> SiltResult<u64> {
    match state.lifecycle {
        Lifecycle::Closing | Lifecycle::Closed => {
            inner.observer.emit(Event::Warn {
                message: format!("Rejected compact: engine is {}", state.lifecycle.name()),
            });
            return Err(SiltError::Lifecycle { operation: "compact", state: state.lifecycle.name() });
        }
        Lifecycle::Compacting => {
            inner.observer.emit(Event::Warn {
                message: "Rejected compact: compaction already running".to_string(),
            });
            return Err(SiltError::Lifecycle { operation: "compact", state: "compacting" });
        }
        Lifecycle::Open => {}
    }
    state.lifecycle = Lifecycle::Compacting;
    let result = compact_locked(inner, state);
    state.lifecycle = Lifecycle::Open;
    if let Err(e) = &result {
        inner.observer.emit(Event::Error { message: format!("Compaction failed: {}", e) });
    }
    result
}

/// Rewrite the data log with only live records:
/// 1. Flush data and index so the index is the complete truth
/// 2. Write every live value to `<db_path>.compacting`, building a new
///    index that carries each key's expiry forward
/// 3. Sync the scratch file, rename it over the data log, reopen
/// 4. Swap in the rebuilt index and checkpoint durably
///
/// The scratch file is removed on every failure path; until the rename the
/// old data log is untouched.
fn compact_locked(inner: &Inner, state: &mut State) -> SiltResult<u64> {
    flush_data(inner, state, true)?;
    flush_wal(inner, state, true)?;
    inner.observer.emit(Event::CompactStart);

    let scratch_path = compacting_path(&inner.config.db_path);
    let (rebuilt, new_size) = match rewrite_live_records(state, &scratch_path) {
        Ok(out) => out,
        Err(e) => {
            let _ = fs::remove_file(&scratch_path);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&scratch_path, &inner.config.db_path) {
        let _ = fs::remove_file(&scratch_path);
        return Err(SiltError::io_at(
            &inner.config.db_path,
            "Failed to swap in compacted data log",
            e,
        ));
    }
    state.data_log.reopen(&inner.config.db_path)?;
    state.index.replace(rebuilt);
    state.next_offset = new_size;
    state.wasted_space = 0;
    state.stats.bytes_written_data = new_size;

    run_checkpoint(inner, state, true, false)?;

    state.stats.compactions += 1;
    state.stats.last_compaction_time = Some(now_ms());
    inner.observer.emit(Event::Log {
        message: format!(
            "Compacted data log: {} live records, {} bytes",
            state.index.len(),
            new_size
        ),
    });
    inner.observer.emit(Event::CompactEnd { new_size });
    Ok(new_size)
}

fn rewrite_live_records(
    state: &mut State,
    scratch_path: &Path,
) -> SiltResult<(HashMap<String, RecordMeta>, u64)> {
    let mut scratch = DataLog::create(scratch_path)?;
    let mut rebuilt = HashMap::new();
    let mut cursor = 0u64;

    let live: Vec<(String, RecordMeta)> =
        state.index.iter().map(|(key, meta)| (key.clone(), *meta)).collect();
    for (key, meta) in live {
        let value = match state.cache.peek(&key) {
            Some(value) => value.clone(),
            None => {
                let bytes = state.data_log.read_exact_at(meta.offset, meta.size)?;
                value::decode(&bytes)?
            }
        };
        let bytes = value::encode(&value)?;
        scratch.append_at(cursor, &bytes)?;
        rebuilt.insert(
            key,
            RecordMeta {
                offset: cursor,
                size: bytes.len() as u32,
                tag: value.type_tag(),
                expiry: meta.expiry,
            },
        );
        cursor += bytes.len() as u64;
    }
    scratch.sync()?;
    Ok((rebuilt, cursor))
}

/// Load every live value into the cache, up to the LRU cap.
fn preload(state: &mut State, observer: &dyn Observer) {
    let live: Vec<(String, RecordMeta)> =
        state.index.iter().map(|(key, meta)| (key.clone(), *meta)).collect();
    for (key, meta) in live {
        if state.cache.at_capacity() {
            break;
        }
        let loaded = state
            .data_log
            .read_exact_at(meta.offset, meta.size)
            .and_then(|bytes| value::decode(&bytes));
        match loaded {
            Ok(value) => state.cache.insert(key, value),
            Err(e) => observer.emit(Event::Warn {
                message: format!("Skipping unreadable record for '{}' during preload: {}", key, e),
            }),
        }
    }
}

/// Fire every TTL whose deadline has passed.
fn expire_due(inner: &Inner, state: &mut State) {
    for key in state.ttl.take_due(now_ms()) {
        if remove_key(state, &key) {
            state.stats.deletes += 1;
            inner.observer.emit(Event::Delete { key: key.clone() });
        }
        inner.observer.emit(Event::Expired { key });
    }
}

/// Background loop: sleeps until the earliest of the flush cadence, the
/// checkpoint cadence, the compaction-check cadence, and the next TTL
/// deadline; writes nudge it awake early so a new earliest deadline is
/// picked up.
fn housekeeper_loop(inner: Arc<Inner>) {
    let flush_every = inner.config.flush_interval;
    let checkpoint_every = inner.config.checkpoint_interval;
    let compact_every = inner.config.compact_interval;

    let mut next_flush = flush_every.map(|interval| Instant::now() + interval);
    let mut next_checkpoint = Instant::now() + checkpoint_every;
    let mut next_compact = Instant::now() + compact_every;

    let mut state = inner.state.lock();
    while !inner.shutdown.load(Ordering::Acquire) {
        let ttl_deadline = state.ttl.earliest().map(|expiry| {
            Instant::now() + Duration::from_millis(expiry.saturating_sub(now_ms()))
        });

        let mut deadline = next_checkpoint.min(next_compact);
        if let Some(at) = next_flush {
            deadline = deadline.min(at);
        }
        if let Some(at) = ttl_deadline {
            deadline = deadline.min(at);
        }

        inner.wake.wait_until(&mut state, deadline);
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if state.lifecycle != Lifecycle::Open {
            continue;
        }

        expire_due(&inner, &mut state);

        let now = Instant::now();
        if let (Some(at), Some(interval)) = (next_flush, flush_every) {
            if now >= at {
                let _ = flush_data(&inner, &mut state, false);
                let _ = flush_wal(&inner, &mut state, false);
                next_flush = Some(now + interval);
            }
        }

        if now >= next_checkpoint {
            if state.wal_size > 0 || !state.pending.is_empty() {
                let _ = run_checkpoint(&inner, &mut state, false, false);
            }
            next_checkpoint = now + checkpoint_every;
        }

        if now >= next_compact {
            let size = state.next_offset;
            if size > 0 && state.wasted_space as f64 / size as f64 >= inner.config.compact_threshold
            {
                let _ = compact_guarded(&inner, &mut state);
            }
            next_compact = now + compact_every;
        }
    }
}
