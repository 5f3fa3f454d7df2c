//! Schedule construction: dependency-ordered processing lists.
//!
//! The schedule is rebuilt whenever topology or suspension state changes:
//! a backward reachability pass from every consumer assigns each reachable
//! node a leaf level (0 = pure producer), elides virtual modules by
//! tracing through to the real producer stream, and computes the
//! effective activation stamp used for suspension.
//!
//! All functions in this module run in the master context; node bodies
//! are accessed under that exclusivity (see [`Module::node_mut`]).

use crate::module::{CostHint, Module};
use crate::node::STAMP_NEVER;

/// Hop limit when tracing through virtual pass-through chains; a chain
/// longer than this can only be a virtual-module cycle.
const TRACE_LIMIT: usize = 4096;

#[derive(Default)]
pub(crate) struct Schedule {
    levels: Vec<Vec<Module>>,
    /// Flattened processing order: ascending leaf level, producers first.
    order: Vec<Module>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the processing order for one block; return it afterwards via
    /// [`Schedule::put_back`] so the allocation is reused.
    pub fn take_order(&mut self) -> Vec<Module> {
        std::mem::take(&mut self.order)
    }

    pub fn put_back(&mut self, order: Vec<Module>) {
        self.order = order;
    }

    /// Rebuild from scratch. Returns the number of contract violations
    /// encountered (dependency cycles, which are unsupported because
    /// deferred processing is not implemented).
    pub fn rebuild(&mut self, nodes: &[Module], consumers: &[Module], stamp: u64) -> usize {
        // SAFETY: master context; no node borrow is held across calls
        // that may re-borrow the same node.
        for m in nodes {
            let n = unsafe { m.node_mut() };
            n.sched_tag = false;
            n.sched_recurse_tag = false;
            n.suspension_done = false;
            n.in_suspend_call = false;
        }
        self.levels.clear();
        self.order.clear();

        let mut violations = 0;
        for c in consumers {
            self.query_node(c, stamp, &mut violations);
        }

        for level in &self.levels {
            self.order.extend(level.iter().cloned());
        }

        // Publish reachability and compute effective activation stamps.
        for m in nodes {
            let tagged = unsafe { m.node_mut() }.sched_tag;
            m.core.scheduled.set(tagged);
        }
        for m in nodes {
            if unsafe { m.node_mut() }.sched_tag {
                suspension_state(m);
            }
        }
        violations
    }

    /// Depth-first backward walk from a consumer; returns the node's leaf
    /// level.
    fn query_node(&mut self, m: &Module, stamp: u64, violations: &mut usize) -> usize {
        {
            let n = unsafe { m.node_mut() };
            if n.sched_tag {
                return n.leaf_level;
            }
            if n.sched_recurse_tag {
                // A dependency cycle. Without deferred processing there is
                // no valid order; ignore the back-edge and keep running.
                tracing::error!(module = ?m, "dependency cycle in module graph; cycles require a delay element, which is not implemented");
                *violations += 1;
                return 0;
            }
            n.sched_recurse_tag = true;
        }

        let mut level = 0;
        let class = *m.class();
        for i in 0..class.n_istreams {
            let entry = unsafe { m.node_mut() }.inputs[i].clone();
            if let Some((src, os)) = entry {
                if let Some((real, _)) = trace_real(&src, os, stamp) {
                    if real.integrated() && !real.same(m) {
                        level = level.max(self.query_node(&real, stamp, violations) + 1);
                    }
                }
            }
        }
        for j in 0..class.n_jstreams {
            let n_producers = unsafe { m.node_mut() }.jinputs[j].len();
            for k in 0..n_producers {
                let (src, os) = unsafe { m.node_mut() }.jinputs[j][k].clone();
                if let Some((real, _)) = trace_real(&src, os, stamp) {
                    if real.integrated() && !real.same(m) {
                        level = level.max(self.query_node(&real, stamp, violations) + 1);
                    }
                }
            }
        }

        {
            let n = unsafe { m.node_mut() };
            n.sched_recurse_tag = false;
            n.sched_tag = true;
            n.leaf_level = level;
        }
        m.core.counter.set(stamp);

        if !m.is_virtual() {
            if self.levels.len() <= level {
                self.levels.resize_with(level + 1, Vec::new);
            }
            // Expensive nodes go to the front of their level so they start
            // as early as their dependencies allow.
            if m.class().cost == CostHint::Expensive {
                self.levels[level].insert(0, m.clone());
            } else {
                self.levels[level].push(m.clone());
            }
        }
        level
    }
}

/// Resolve a producer stream through any chain of virtual pass-through
/// modules to the real producer, tagging traversed virtuals as
/// reachable. Returns `None` for dangling chains (reads as zeros).
pub(crate) fn trace_real(src: &Module, ostream: usize, stamp: u64) -> Option<(Module, usize)> {
    let mut cur = src.clone();
    let mut stream = ostream;
    let mut hops = 0;
    while cur.is_virtual() {
        if !cur.integrated() {
            return None;
        }
        // Virtual modules map istream i to ostream i.
        let n = unsafe { cur.node_mut() };
        n.sched_tag = true;
        cur.core.scheduled.set(true);
        cur.core.counter.set(stamp);
        let next = n.inputs[stream].clone();
        match next {
            Some((inner, inner_stream)) => {
                cur = inner;
                stream = inner_stream;
            }
            None => return None,
        }
        hops += 1;
        if hops > TRACE_LIMIT {
            tracing::error!("virtual module chain does not terminate (virtual cycle)");
            return None;
        }
    }
    Some((cur, stream))
}

/// Effective activation stamp for a scheduled node: the node is inactive
/// (suspended) for stamps below the result. Combines the node's own
/// activation with the earliest demand among its scheduled consumers; a
/// node nobody demands stays inactive even if itself resumed.
pub(crate) fn suspension_state(m: &Module) -> u64 {
    let (local_active, is_consumer) = {
        let n = unsafe { m.node_mut() };
        if n.suspension_done {
            return n.next_active;
        }
        if n.in_suspend_call {
            // Cycle guard: contribute no demand.
            return STAMP_NEVER;
        }
        n.in_suspend_call = true;
        (n.local_active, n.is_consumer)
    };

    let mut demand = if is_consumer { local_active } else { STAMP_NEVER };
    let n_consumers = unsafe { m.node_mut() }.onodes.len();
    for k in 0..n_consumers {
        let consumer = unsafe { m.node_mut() }.onodes[k].clone();
        if consumer.integrated() && unsafe { consumer.node_mut() }.sched_tag {
            demand = demand.min(suspension_state(&consumer));
        }
    }

    let n = unsafe { m.node_mut() };
    n.in_suspend_call = false;
    n.next_active = local_active.max(demand);
    n.suspension_done = true;
    n.next_active
}
