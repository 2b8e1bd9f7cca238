//! End-to-end engine scenarios: durability across reopen, crash recovery,
//! TTL expiry, compaction, LRU behavior, and the event stream.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use silt_core::{Config, Event, Observer, SetOptions, SiltEngine, Value};

/// Observer that records every event for later assertions.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Observer for Recorder {
    fn emit(&self, event: Event) {
        self.0.lock().push(event);
    }
}

impl Recorder {
    fn count(&self, matcher: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().iter().filter(|event| matcher(event)).count()
    }
}

/// No background flushing; every flush in these tests is explicit.
fn manual_config(dir: &TempDir) -> Config {
    Config { flush_interval: None, ..Config::in_dir(dir.path()) }
}

fn sync_config(dir: &TempDir) -> Config {
    Config { sync_on_write: true, ..manual_config(dir) }
}

#[test]
fn basic_puts_and_reads() {
    let dir = TempDir::new().unwrap();
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();

    engine.set("a", Value::from(1.0)).unwrap();
    engine.set("b", Value::from(2.0)).unwrap();
    engine.flush(false).unwrap();

    assert_eq!(engine.get("a").unwrap(), Some(Value::from(1.0)));
    assert_eq!(engine.get("b").unwrap(), Some(Value::from(2.0)));
    assert_eq!(engine.size(), 2);
    let mut keys = engine.keys();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn unflushed_overwrite_is_lost_on_crash() {
    let dir = TempDir::new().unwrap();
    {
        let engine = SiltEngine::open(manual_config(&dir)).unwrap();
        engine.set("a", Value::from(1.0)).unwrap();
        engine.flush(true).unwrap();
        engine.set("a", Value::from(2.0)).unwrap(); // never flushed
        engine.crash();
    }
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.get("a").unwrap(), Some(Value::from(1.0)));
}

#[test]
fn flushed_overwrite_survives_crash_and_leaves_dead_space() {
    let dir = TempDir::new().unwrap();
    let first_record_size;
    {
        let engine = SiltEngine::open(manual_config(&dir)).unwrap();
        engine.set("a", Value::from(1.0)).unwrap();
        engine.flush(true).unwrap();
        first_record_size = engine.stats().data_file_size;
        engine.set("a", Value::from(2.0)).unwrap();
        engine.flush(true).unwrap();
        engine.crash();
    }
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.get("a").unwrap(), Some(Value::from(2.0)));
    assert!(engine.stats().wasted_space >= first_record_size);
}

#[test]
fn durable_writes_survive_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = SiltEngine::open(manual_config(&dir)).unwrap();
        for i in 0..25 {
            engine.set(&format!("key{:02}", i), Value::from(i as f64)).unwrap();
        }
        for i in 0..5 {
            engine.delete(&format!("key{:02}", i)).unwrap();
        }
        engine.close().unwrap();
    }
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.size(), 20);
    for i in 0..5 {
        assert_eq!(engine.get(&format!("key{:02}", i)).unwrap(), None);
    }
    for i in 5..25 {
        assert_eq!(
            engine.get(&format!("key{:02}", i)).unwrap(),
            Some(Value::from(i as f64)),
            "key{:02} lost across reopen",
            i
        );
    }
}

#[test]
fn every_value_shape_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut map = std::collections::BTreeMap::new();
    map.insert("nested".to_string(), Value::Array(vec![Value::from(1.0), Value::Null]));
    map.insert("blob".to_string(), Value::Bytes(vec![0, 255, 128]));
    let shapes = vec![
        ("null", Value::Null),
        ("undefined", Value::Undefined),
        ("bool", Value::Bool(true)),
        ("num", Value::F64(-0.5)),
        ("text", Value::from("多字节 ✓")),
        ("bytes", Value::Bytes(vec![1, 2, 3])),
        ("array", Value::Array(vec![Value::from("x"), Value::Bool(false)])),
        ("map", Value::Map(map)),
    ];
    {
        let engine = SiltEngine::open(manual_config(&dir)).unwrap();
        for (key, value) in &shapes {
            engine.set(key, value.clone()).unwrap();
        }
        engine.close().unwrap();
    }
    // Read both from preload cache and straight off disk
    for preload in [true, false] {
        let config = Config { preload, ..manual_config(&dir) };
        let engine = SiltEngine::open(config).unwrap();
        for (key, value) in &shapes {
            assert_eq!(engine.get(key).unwrap().as_ref(), Some(value), "shape {}", key);
        }
        engine.crash();
    }
}

#[test]
fn ttl_expires_key_and_fires_event_once() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let engine =
        SiltEngine::open_with_observer(sync_config(&dir), Box::new(recorder.clone())).unwrap();

    engine
        .set_with("t", Value::from("x"), SetOptions::ttl(Duration::from_millis(50)))
        .unwrap();
    assert!(engine.has("t"));

    std::thread::sleep(Duration::from_millis(150));
    assert!(!engine.has("t"));
    assert_eq!(engine.get("t").unwrap(), None);
    assert_eq!(
        recorder.count(|event| matches!(event, Event::Expired { key } if key == "t")),
        1
    );
}

#[test]
fn ttl_survives_reopen_and_expires_late_keys() {
    let dir = TempDir::new().unwrap();
    {
        let engine = SiltEngine::open(sync_config(&dir)).unwrap();
        engine
            .set_with("later", Value::from(1.0), SetOptions::ttl(Duration::from_secs(3600)))
            .unwrap();
        engine
            .set_with("soon", Value::from(2.0), SetOptions::ttl(Duration::from_millis(10)))
            .unwrap();
        engine.crash(); // metadata with expiry is already in the WAL
    }
    std::thread::sleep(Duration::from_millis(30));
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    // "soon" expired before reopen and was dropped during replay
    assert!(!engine.has("soon"));
    assert!(engine.has("later"));
}

#[test]
fn ttl_enforced_after_checkpointed_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = SiltEngine::open(sync_config(&dir)).unwrap();
        engine
            .set_with("soon", Value::from(1.0), SetOptions::ttl(Duration::from_millis(20)))
            .unwrap();
        engine
            .set_with("mid", Value::from(2.0), SetOptions::ttl(Duration::from_millis(400)))
            .unwrap();
        // close() checkpoints and truncates the WAL, so the reopen below
        // sees the expiries only through the base index snapshot
        engine.close().unwrap();
    }
    std::thread::sleep(Duration::from_millis(60));

    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert!(!engine.has("soon"), "expiry that passed before reopen must drop the key");
    assert!(engine.has("mid"));

    std::thread::sleep(Duration::from_millis(450));
    assert!(!engine.has("mid"), "snapshot-loaded expiry must still fire after reopen");
    assert_eq!(engine.get("mid").unwrap(), None);
}

#[test]
fn compaction_shrinks_log_to_survivors() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let engine =
        SiltEngine::open_with_observer(sync_config(&dir), Box::new(recorder.clone())).unwrap();

    for i in 0..100 {
        engine.set(&format!("key{:03}", i), Value::from(i as f64)).unwrap();
    }
    for i in 0..50 {
        engine.delete(&format!("key{:03}", i)).unwrap();
    }

    let new_size = engine.compact().unwrap();
    // 50 survivors, each an f64 record: 5-byte header + 8-byte payload
    assert_eq!(new_size, 50 * 13);
    assert_eq!(engine.stats().wasted_space, 0);
    for i in 50..100 {
        assert_eq!(
            engine.get(&format!("key{:03}", i)).unwrap(),
            Some(Value::from(i as f64))
        );
    }
    assert_eq!(recorder.count(|event| matches!(event, Event::CompactStart)), 1);
    assert_eq!(
        recorder.count(|event| matches!(event, Event::CompactEnd { new_size } if *new_size == 650)),
        1
    );

    // Compacted state must also survive a reopen
    engine.close().unwrap();
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.size(), 50);
    assert_eq!(engine.get("key075").unwrap(), Some(Value::from(75.0)));
}

#[test]
fn lru_cap_holds_and_misses_go_to_disk() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_memory_keys: Some(NonZeroUsize::new(2).unwrap()),
        ..manual_config(&dir)
    };
    let engine = SiltEngine::open(config).unwrap();

    engine.set("a", Value::from(1.0)).unwrap();
    engine.set("b", Value::from(2.0)).unwrap();
    engine.set("c", Value::from(3.0)).unwrap(); // evicts "a" with write-back
    engine.flush(false).unwrap();

    let stats = engine.stats();
    assert_eq!(stats.memory_store_keys, 2);
    assert_eq!(stats.active_keys, 3, "eviction must not touch the index");

    let before = engine.stats().disk_reads;
    assert_eq!(engine.get("a").unwrap(), Some(Value::from(1.0)));
    assert_eq!(engine.stats().disk_reads, before + 1, "cold read must hit the data log");

    // Loading "a" evicted "b" by recency; reading it is another disk read
    assert_eq!(engine.get("b").unwrap(), Some(Value::from(2.0)));
    assert_eq!(engine.stats().disk_reads, before + 2);
    assert_eq!(engine.stats().memory_store_keys, 2);
}

#[test]
fn truncated_wal_tail_is_discarded_with_warning() {
    let dir = TempDir::new().unwrap();
    let wal_path;
    {
        let engine = SiltEngine::open(sync_config(&dir)).unwrap();
        engine.set("first", Value::from(1.0)).unwrap();
        engine.set("second", Value::from(2.0)).unwrap();
        wal_path = sync_config(&dir).wal_path();
        engine.crash();
    }

    // Cut the WAL mid-entry
    let bytes = std::fs::read(&wal_path).unwrap();
    assert!(bytes.len() > 3);
    std::fs::write(&wal_path, &bytes[..bytes.len() - 3]).unwrap();

    let recorder = Recorder::default();
    let engine =
        SiltEngine::open_with_observer(manual_config(&dir), Box::new(recorder.clone())).unwrap();

    assert!(recorder.count(|event| matches!(event, Event::Warn { .. })) >= 1);
    assert_eq!(
        recorder.count(
            |event| matches!(event, Event::WalReplayed { replayed_ops: 1, final_index_size: 1 })
        ),
        1
    );
    assert_eq!(engine.get("first").unwrap(), Some(Value::from(1.0)));
    assert_eq!(engine.get("second").unwrap(), None);

    // The store stays writable and durable after the trim
    engine.set("third", Value::from(3.0)).unwrap();
    engine.close().unwrap();
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.get("third").unwrap(), Some(Value::from(3.0)));
}

#[test]
fn repeated_flush_emits_nothing_new() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let engine =
        SiltEngine::open_with_observer(manual_config(&dir), Box::new(recorder.clone())).unwrap();

    engine.set("k", Value::from("v")).unwrap();
    engine.flush(true).unwrap();
    let flushes = recorder.count(|event| matches!(event, Event::DataFlush { .. }));
    let size = engine.stats().data_file_size;

    engine.flush(true).unwrap();
    engine.flush(false).unwrap();
    assert_eq!(recorder.count(|event| matches!(event, Event::DataFlush { .. })), flushes);
    assert_eq!(engine.stats().data_file_size, size);
}

#[test]
fn wasted_space_accounting_never_goes_negative() {
    let dir = TempDir::new().unwrap();
    let engine = SiltEngine::open(sync_config(&dir)).unwrap();

    for round in 0..3 {
        for i in 0..10 {
            engine
                .set(&format!("key{}", i), Value::from((round * 10 + i) as f64))
                .unwrap();
        }
    }
    engine.delete("key0").unwrap();

    let stats = engine.stats();
    assert!(stats.wasted_space <= stats.data_file_size);
    // 9 live f64 records
    assert_eq!(stats.data_file_size - stats.wasted_space, 9 * 13);
}

#[test]
fn periodic_flush_persists_without_explicit_calls() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        flush_interval: Some(Duration::from_millis(20)),
        ..Config::in_dir(dir.path())
    };
    {
        let engine = SiltEngine::open(config).unwrap();
        engine.set("auto", Value::from("flushed")).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        engine.crash(); // deferred flush must have run by now
    }
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.get("auto").unwrap(), Some(Value::from("flushed")));
}

#[test]
fn auto_compaction_triggers_on_waste_ratio() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        sync_on_write: true,
        flush_interval: None,
        compact_interval: Duration::from_millis(40),
        compact_threshold: 0.3,
        ..Config::in_dir(dir.path())
    };
    let engine = SiltEngine::open(config).unwrap();

    engine.set("churn", Value::from(0.0)).unwrap();
    for i in 0..20 {
        engine.set("churn", Value::from(i as f64)).unwrap();
    }
    assert!(engine.stats().wasted_space > 0);

    std::thread::sleep(Duration::from_millis(200));
    let stats = engine.stats();
    assert!(stats.compactions >= 1, "housekeeper should have compacted");
    assert_eq!(stats.wasted_space, 0);
    assert_eq!(engine.get("churn").unwrap(), Some(Value::from(19.0)));
}

#[test]
fn clear_resets_store_and_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::default();
    {
        let engine =
            SiltEngine::open_with_observer(sync_config(&dir), Box::new(recorder.clone()))
                .unwrap();
        engine.set("a", Value::from(1.0)).unwrap();
        engine.set("b", Value::from(2.0)).unwrap();
        engine.clear().unwrap();
        assert_eq!(
            recorder.count(|event| matches!(event, Event::Clear { old_size: 2 })),
            1
        );
        engine.set("after", Value::from(3.0)).unwrap();
        engine.close().unwrap();
    }
    let engine = SiltEngine::open(manual_config(&dir)).unwrap();
    assert_eq!(engine.size(), 1);
    assert_eq!(engine.get("after").unwrap(), Some(Value::from(3.0)));
    assert_eq!(engine.get("a").unwrap(), None);
}

#[test]
fn close_emits_lifecycle_events_in_order() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let engine =
        SiltEngine::open_with_observer(manual_config(&dir), Box::new(recorder.clone())).unwrap();
    engine.set("k", Value::from(1.0)).unwrap();
    engine.close().unwrap();

    let events = recorder.0.lock();
    let ready = events.iter().position(|e| matches!(e, Event::Ready)).unwrap();
    let closing = events.iter().position(|e| matches!(e, Event::Closing)).unwrap();
    let closed = events.iter().position(|e| matches!(e, Event::Close)).unwrap();
    assert!(ready < closing && closing < closed);
    // The final flush ran between closing and close
    let data_flush = events
        .iter()
        .position(|e| matches!(e, Event::DataFlush { count: 1 }))
        .unwrap();
    assert!(closing < data_flush && data_flush < closed);
}
