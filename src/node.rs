//! Master-side node state behind a [`Module`](crate::module::Module)
//! handle: connection records, stream buffers, suspension bookkeeping and
//! the per-node timed-job queues.

use std::collections::VecDeque;

use crate::job::{AccessBox, ProbeBox};
use crate::module::{Module, ModuleClass, Processor};

/// Activation stamp meaning "suspended until explicitly resumed".
pub(crate) const STAMP_NEVER: u64 = u64::MAX;

pub(crate) enum TimedAction {
    Access(AccessBox),
    Discard,
}

/// A deferred per-node job, ordered by ascending tick stamp with stable
/// insertion order for equal stamps.
pub(crate) struct TimedJob {
    pub stamp: u64,
    pub action: TimedAction,
}

/// In-progress probe capture against a node's output buffers.
pub(crate) struct ProbeState {
    /// First tick stamp to capture from.
    pub start: u64,
    /// Total samples requested per selected channel.
    pub n_values: usize,
    pub ostream_mask: u64,
    pub filled: usize,
    pub bufs: Vec<Option<Vec<f32>>>,
    pub func: Option<ProbeBox>,
}

pub(crate) struct Node {
    /// `None` for virtual modules.
    pub processor: Option<Box<dyn Processor>>,

    /// Per istream: the wired producer, if any.
    pub inputs: Vec<Option<(Module, usize)>>,
    /// Per jstream: the set of producers, in insertion order.
    pub jinputs: Vec<Vec<(Module, usize)>>,
    /// Consumer back-references, one entry per outgoing connection.
    /// Maintained for schedule invalidation and kill-outputs, never used
    /// for computation.
    pub onodes: Vec<Module>,

    /// Owned output buffers, one block each. Allocated at integration.
    pub obufs: Vec<Box<[f32]>>,
    /// Joint-input accumulation buffers, used only when a jstream has
    /// more than one producer.
    pub jaccs: Vec<Box<[f32]>>,

    // Stream pointer tables refreshed by the master before each process
    // pass; kept allocated so the hot path never allocates.
    pub iptrs: Vec<(*const f32, bool)>,
    pub jptrs: Vec<*const f32>,
    pub optrs: Vec<*mut f32>,

    pub is_consumer: bool,
    pub needs_reset: bool,
    /// Outputs currently hold zeros written by the suspension path.
    pub outputs_cleared: bool,

    // Schedule traversal tags.
    pub sched_tag: bool,
    pub sched_recurse_tag: bool,
    pub leaf_level: usize,

    /// Tick stamp from which this node is active by itself.
    pub local_active: u64,
    /// Effective activation stamp (own state combined with consumer
    /// demand), recomputed at every reflow.
    pub next_active: u64,
    /// Recursion guard for the suspension-state walk.
    pub in_suspend_call: bool,
    /// `next_active` has been computed for the current reflow.
    pub suspension_done: bool,

    pub flow_jobs: VecDeque<TimedJob>,
    pub boundary_jobs: VecDeque<TimedJob>,
    pub probes: Vec<ProbeState>,
}

impl Node {
    pub fn new(class: &ModuleClass, processor: Option<Box<dyn Processor>>) -> Self {
        Self {
            processor,
            inputs: vec![None; class.n_istreams],
            jinputs: vec![Vec::new(); class.n_jstreams],
            onodes: Vec::new(),
            obufs: Vec::new(),
            jaccs: Vec::new(),
            iptrs: Vec::new(),
            jptrs: Vec::new(),
            optrs: Vec::new(),
            is_consumer: false,
            needs_reset: true,
            outputs_cleared: false,
            sched_tag: false,
            sched_recurse_tag: false,
            leaf_level: 0,
            local_active: 0,
            next_active: 0,
            in_suspend_call: false,
            suspension_done: false,
            flow_jobs: VecDeque::new(),
            boundary_jobs: VecDeque::new(),
            probes: Vec::new(),
        }
    }

    /// Allocate stream buffers and pointer tables for `block_size`.
    /// Called when the node is integrated.
    pub fn allocate(&mut self, class: &ModuleClass, block_size: usize) {
        self.obufs = (0..class.n_ostreams)
            .map(|_| vec![0.0f32; block_size].into_boxed_slice())
            .collect();
        self.jaccs = (0..class.n_jstreams)
            .map(|_| vec![0.0f32; block_size].into_boxed_slice())
            .collect();
        self.iptrs = vec![(std::ptr::null(), false); class.n_istreams];
        self.jptrs = vec![std::ptr::null(); class.n_jstreams];
        self.optrs = vec![std::ptr::null_mut(); class.n_ostreams];
    }

    /// Insert a timed job keeping ascending stamp order; jobs with equal
    /// stamps keep submission order.
    pub fn insert_timed(queue: &mut VecDeque<TimedJob>, job: TimedJob) {
        let pos = queue.partition_point(|j| j.stamp <= job.stamp);
        queue.insert(pos, job);
    }

    /// Pop the front timed job if its stamp has been reached.
    pub fn pop_due(queue: &mut VecDeque<TimedJob>, stamp: u64) -> Option<TimedJob> {
        if queue.front().is_some_and(|j| j.stamp <= stamp) {
            queue.pop_front()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_job(stamp: u64) -> TimedJob {
        TimedJob {
            stamp,
            action: TimedAction::Access(Box::new(|_| {})),
        }
    }

    #[test]
    fn test_insert_timed_orders_by_stamp() {
        let mut q = VecDeque::new();
        Node::insert_timed(&mut q, access_job(30));
        Node::insert_timed(&mut q, access_job(10));
        Node::insert_timed(&mut q, access_job(20));
        let stamps: Vec<u64> = q.iter().map(|j| j.stamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn test_insert_timed_stable_for_ties() {
        let mut q = VecDeque::new();
        let mk = |stamp, tag: u64| TimedJob {
            stamp,
            action: TimedAction::Access(Box::new(move |_| {
                let _ = tag;
            })),
        };
        Node::insert_timed(&mut q, mk(10, 0));
        Node::insert_timed(&mut q, TimedJob { stamp: 10, action: TimedAction::Discard });
        Node::insert_timed(&mut q, mk(10, 2));
        // The discard stays second: equal stamps keep submission order.
        assert!(matches!(q[1].action, TimedAction::Discard));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_pop_due() {
        let mut q = VecDeque::new();
        Node::insert_timed(&mut q, access_job(100));
        assert!(Node::pop_due(&mut q, 99).is_none());
        assert!(Node::pop_due(&mut q, 100).is_some());
        assert!(q.is_empty());
    }
}
