//! Engine events and the observer seam
//!
//! The engine reports everything noteworthy through a single injected
//! observer. Fan-out to listeners, logging backends, or metrics pipelines
//! is the observer's problem, not the engine's.
//!
//! Events are emitted while the engine state lock is held: an observer must
//! return promptly and must never call back into the engine.

use crate::value::Value;

/// Everything the engine reports.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Open finished: recovery done, preload done, background work running
    Ready,
    /// A recoverable failure the engine worked around
    Error { message: String },
    Set { key: String, value: Value },
    Get { key: String, value: Value },
    Miss { key: String },
    Delete { key: String },
    /// A TTL fired and removed the key
    Expired { key: String },
    /// A batch of dirty values reached the data log
    DataFlush { count: usize },
    /// A batch of pending index changes reached the WAL
    IndexWalFlush { count: usize },
    CompactStart,
    CompactEnd { new_size: u64 },
    CheckpointStart,
    CheckpointEnd { size: u64 },
    Clear { old_size: usize },
    Closing,
    Close,
    Warn { message: String },
    Log { message: String },
    WalReplayed { replayed_ops: usize, final_index_size: usize },
}

/// Event sink injected at open.
pub trait Observer: Send + Sync {
    fn emit(&self, event: Event);
}

/// Discards everything. The default when no observer is supplied.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn emit(&self, _event: Event) {}
}

/// Closures work as observers directly.
impl<F> Observer for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_closure_observer_collects() {
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Box<dyn Observer> = Box::new(move |event| sink.lock().push(event));

        observer.emit(Event::Ready);
        observer.emit(Event::Miss { key: "k".into() });

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], Event::Miss { key: "k".into() });
    }
}
