//! User-thread garbage collection.
//!
//! The master thread never runs user-supplied teardown: spent job
//! payloads, discarded processors and completed probes are queued here
//! and only consumed when a user thread calls
//! [`garbage_collect`](crate::EngineRuntime::garbage_collect). Probe
//! callbacks are invoked at collection time, on the collecting thread.

use parking_lot::Mutex;

use crate::job::{AccessBox, PollBox, ProbeBox, ProbeData, TimerBox};
use crate::module::Processor;

pub(crate) enum Garbage {
    /// A spent (or skipped) access/flow/boundary closure.
    Access(AccessBox),
    /// A discarded module's processor; its `Drop` is the free callback.
    Processor(Box<dyn Processor>),
    /// A satisfied probe: deliver the captured buffers to the callback.
    CompletedProbe { func: ProbeBox, data: ProbeData },
    /// A probe cancelled by discard: drop the callback uninvoked.
    DroppedProbe(ProbeBox),
    Timer(TimerBox),
    Poll(PollBox),
}

pub(crate) struct GcQueue {
    items: Mutex<Vec<Garbage>>,
}

impl GcQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: Garbage) {
        self.items.lock().push(item);
    }

    pub fn has_garbage(&self) -> bool {
        !self.items.lock().is_empty()
    }

    /// Drain and dispose everything queued; returns the number of items
    /// collected. Runs on the calling thread.
    pub fn collect(&self) -> usize {
        let drained: Vec<Garbage> = std::mem::take(&mut *self.items.lock());
        let n = drained.len();
        for item in drained {
            match item {
                Garbage::CompletedProbe { func, data } => func(data),
                // Everything else just needs its Drop to run here.
                Garbage::Access(_)
                | Garbage::Processor(_)
                | Garbage::DroppedProbe(_)
                | Garbage::Timer(_)
                | Garbage::Poll(_) => {}
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_collect_runs_drops_here() {
        let q = GcQueue::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(drops.clone());
        q.push(Garbage::Access(Box::new(move |_| {
            let _ = &guard;
        })));
        assert!(q.has_garbage());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(q.collect(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!q.has_garbage());
    }

    #[test]
    fn test_completed_probe_invoked_dropped_probe_not() {
        let q = GcQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        q.push(Garbage::CompletedProbe {
            func: Box::new(move |data| {
                assert_eq!(data.n_values, 4);
                c1.fetch_add(1, Ordering::SeqCst);
            }),
            data: ProbeData {
                tick_stamp: 128,
                n_values: 4,
                ostreams: vec![Some(vec![0.0; 4])],
            },
        });
        let c2 = calls.clone();
        q.push(Garbage::DroppedProbe(Box::new(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        })));
        q.collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
