//! The master context: applies committed jobs to the node graph and runs
//! the per-block processing loop.
//!
//! All node-body access in this module happens with the runtime's master
//! lock held (see [`EngineShared::master`]); that lock is what makes the
//! `Module::node_mut` accesses sound.

use std::time::Duration;

use crate::block::zero_block_ptr;
use crate::config::BlockLayout;
use crate::engine::{EngineShared, SyncGate};
use crate::gc::Garbage;
use crate::job::{Job, JobKind, PollBox, PollId, PollState, ProbeData, TimerBox};
use crate::job::EnginePollFd;
use crate::module::{Module, ProcessContext};
use crate::node::{Node, ProbeState, TimedAction, TimedJob, STAMP_NEVER};
use crate::schedule::{trace_real, Schedule};
use crate::transaction::Transaction;

pub(crate) struct PollRec {
    pub id: PollId,
    pub func: PollBox,
    pub fds: Vec<EnginePollFd>,
}

pub(crate) struct MasterState {
    pub layout: BlockLayout,
    /// All integrated nodes, in integration order.
    pub nodes: Vec<Module>,
    pub consumers: Vec<Module>,
    pub schedule: Schedule,
    pub need_reflow: bool,
    pub pollers: Vec<PollRec>,
    pub timers: Vec<TimerBox>,
    /// Latest poll verdict; true means the next dispatch should process a
    /// block. Defaults to true while no pollers are registered.
    pub need_process: bool,
}

impl MasterState {
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            layout,
            nodes: Vec::new(),
            consumers: Vec::new(),
            schedule: Schedule::new(),
            need_reflow: false,
            pollers: Vec::new(),
            timers: Vec::new(),
            need_process: true,
        }
    }

    /// Run every poll callback, merging their timeout suggestions into
    /// `timeout`. With no pollers the engine free-runs.
    pub fn check_pollers(
        &mut self,
        timeout: &mut Option<Duration>,
        revents_filled: bool,
    ) -> bool {
        if self.pollers.is_empty() {
            return true;
        }
        let n_values = self.layout.block_size;
        let mut need = false;
        for rec in &mut self.pollers {
            let mut state = PollState {
                n_values,
                timeout: &mut *timeout,
                fds: rec.fds.as_mut_slice(),
                revents_filled,
            };
            need |= (rec.func)(&mut state);
        }
        need
    }
}

/// Drain the commit queue, applying every job of every transaction in
/// FIFO order, then run due boundary jobs. Returns the sync gates that
/// were committed; the caller must park on each after releasing the
/// master lock.
pub(crate) fn dispatch_jobs(master: &mut MasterState, shared: &EngineShared) -> Vec<SyncGate> {
    let mut gates = Vec::new();
    while let Some(trans) = shared.queue.try_pop() {
        for job in trans.jobs {
            if let Some(g) = apply_job(master, shared, job) {
                gates.push(g);
            }
        }
        shared.queue.mark_done();
    }
    // Queue observed empty: future commits take effect within one block
    // of the current stamp.
    shared.queue.set_base_stamp(shared.clock.tick_stamp());

    run_boundary_jobs(master, shared);
    gates
}

fn apply_job(master: &mut MasterState, shared: &EngineShared, job: Job) -> Option<SyncGate> {
    match job.kind {
        JobKind::Integrate(m) => {
            if m.integrated() {
                shared.violation("integrate: module already integrated");
                return None;
            }
            {
                let class = *m.class();
                let n = unsafe { m.node_mut() };
                n.allocate(&class, master.layout.block_size);
                n.needs_reset = true;
                n.local_active = 0;
                n.is_consumer = false;
            }
            m.core.counter.set(shared.clock.tick_stamp());
            m.core.integrated.set(true);
            master.nodes.push(m);
            shared
                .n_integrated
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            master.need_reflow = true;
        }
        JobKind::Discard(m) => {
            if !m.integrated() {
                shared.violation("discard: module not integrated");
                return None;
            }
            discard_node(master, shared, &m);
        }
        JobKind::BoundaryDiscard(m) => {
            if !m.integrated() {
                shared.violation("boundary discard: module not integrated");
                return None;
            }
            let n = unsafe { m.node_mut() };
            Node::insert_timed(
                &mut n.boundary_jobs,
                TimedJob {
                    stamp: 0,
                    action: TimedAction::Discard,
                },
            );
        }
        JobKind::IConnect {
            src,
            src_ostream,
            dest,
            dest_istream,
        } => {
            if !src.integrated() || !dest.integrated() {
                shared.violation("connect: module not integrated");
                return None;
            }
            let occupied = unsafe { dest.node_mut() }.inputs[dest_istream].is_some();
            if occupied {
                shared.violation("connect: input stream already connected");
                return None;
            }
            unsafe { dest.node_mut() }.inputs[dest_istream] = Some((src.clone(), src_ostream));
            dest.set_source_bit(dest_istream, true);
            unsafe { src.node_mut() }.onodes.push(dest.clone());
            master.need_reflow = true;
        }
        JobKind::JConnect {
            src,
            src_ostream,
            dest,
            dest_jstream,
        } => {
            if !src.integrated() || !dest.integrated() {
                shared.violation("jconnect: module not integrated");
                return None;
            }
            unsafe { dest.node_mut() }.jinputs[dest_jstream].push((src.clone(), src_ostream));
            unsafe { src.node_mut() }.onodes.push(dest.clone());
            master.need_reflow = true;
        }
        JobKind::IDisconnect { dest, dest_istream } => {
            if !idisconnect_exec(&dest, dest_istream) {
                shared.violation("disconnect: no such connection");
                return None;
            }
            master.need_reflow = true;
        }
        JobKind::JDisconnect {
            dest,
            dest_jstream,
            src,
            src_ostream,
        } => {
            if !jdisconnect_exec(&dest, dest_jstream, &src, src_ostream) {
                shared.violation("jdisconnect: no such connection");
                return None;
            }
            master.need_reflow = true;
        }
        JobKind::KillInputs(m) => {
            if !m.integrated() {
                shared.violation("kill inputs: module not integrated");
                return None;
            }
            kill_inputs_exec(&m);
            master.need_reflow = true;
        }
        JobKind::KillOutputs(m) => {
            if !m.integrated() {
                shared.violation("kill outputs: module not integrated");
                return None;
            }
            kill_outputs_exec(shared, &m);
            master.need_reflow = true;
        }
        JobKind::SetConsumer(m) => {
            if !m.integrated() {
                shared.violation("set consumer: module not integrated");
                return None;
            }
            let already = unsafe { m.node_mut() }.is_consumer;
            if already {
                shared.violation("set consumer: module is already a consumer");
                return None;
            }
            unsafe { m.node_mut() }.is_consumer = true;
            master.consumers.push(m);
            master.need_reflow = true;
        }
        JobKind::UnsetConsumer(m) => {
            let was = m.integrated() && unsafe { m.node_mut() }.is_consumer;
            if !was {
                shared.violation("unset consumer: module is not a consumer");
                return None;
            }
            unsafe { m.node_mut() }.is_consumer = false;
            master.consumers.retain(|c| !c.same(&m));
            master.need_reflow = true;
        }
        JobKind::ForceReset(m) => {
            if !m.integrated() {
                shared.violation("force reset: module not integrated");
                return None;
            }
            unsafe { m.node_mut() }.needs_reset = true;
        }
        JobKind::Suspend(m) => {
            if !m.integrated() {
                shared.violation("suspend: module not integrated");
                return None;
            }
            let n = unsafe { m.node_mut() };
            if n.local_active != STAMP_NEVER {
                n.local_active = STAMP_NEVER;
                master.need_reflow = true;
            }
        }
        JobKind::Resume { module: m, tick_stamp } => {
            if !m.integrated() {
                shared.violation("resume: module not integrated");
                return None;
            }
            let n = unsafe { m.node_mut() };
            if n.local_active > tick_stamp {
                n.local_active = tick_stamp;
                master.need_reflow = true;
            }
        }
        JobKind::Access { module: m, mut func } => {
            if !m.integrated() {
                shared.violation("access: module not integrated");
                shared.gc.push(Garbage::Access(func));
                return None;
            }
            if let Some(p) = unsafe { m.node_mut() }.processor.as_mut() {
                func(p.as_mut());
            }
            shared.gc.push(Garbage::Access(func));
        }
        JobKind::FlowAccess {
            module: m,
            tick_stamp,
            func,
        } => {
            if !m.integrated() {
                shared.violation("flow access: module not integrated");
                shared.gc.push(Garbage::Access(func));
                return None;
            }
            let n = unsafe { m.node_mut() };
            Node::insert_timed(
                &mut n.flow_jobs,
                TimedJob {
                    stamp: tick_stamp,
                    action: TimedAction::Access(func),
                },
            );
        }
        JobKind::BoundaryAccess {
            module: m,
            tick_stamp,
            func,
        } => {
            if !m.integrated() {
                shared.violation("boundary access: module not integrated");
                shared.gc.push(Garbage::Access(func));
                return None;
            }
            let n = unsafe { m.node_mut() };
            Node::insert_timed(
                &mut n.boundary_jobs,
                TimedJob {
                    stamp: tick_stamp,
                    action: TimedAction::Access(func),
                },
            );
        }
        JobKind::Probe {
            module: m,
            delay,
            n_values,
            ostream_mask,
            func,
        } => {
            if !m.integrated() {
                shared.violation("probe: module not integrated");
                shared.gc.push(Garbage::DroppedProbe(func));
                return None;
            }
            let n_ostreams = m.class().n_ostreams;
            let bufs = (0..n_ostreams)
                .map(|o| {
                    if ostream_mask & (1 << o) != 0 {
                        Some(Vec::with_capacity(n_values))
                    } else {
                        None
                    }
                })
                .collect();
            unsafe { m.node_mut() }.probes.push(ProbeState {
                start: shared.clock.tick_stamp() + delay,
                n_values,
                ostream_mask,
                filled: 0,
                bufs,
                func: Some(func),
            });
        }
        JobKind::AddPoll { id, func, fds } => {
            master.pollers.push(PollRec { id, func, fds });
        }
        JobKind::RemovePoll(id) => {
            match master.pollers.iter().position(|r| r.id == id) {
                Some(pos) => {
                    let rec = master.pollers.remove(pos);
                    shared.gc.push(Garbage::Poll(rec.func));
                }
                None => shared.violation("remove poll: unknown poll id"),
            }
        }
        JobKind::AddTimer(func) => {
            master.timers.push(func);
        }
        JobKind::Message(text) => {
            tracing::debug!(message = %text, "engine job message");
        }
        JobKind::Sync(gate) => return Some(gate),
    }
    None
}

/// Boundary jobs run after all ordinary jobs of a dispatch, re-looping as
/// long as firing them enqueues new due boundary jobs. A job is due when
/// its stamp falls inside the upcoming block, so it always fires before
/// the tick stamp advances past its target.
fn run_boundary_jobs(master: &mut MasterState, shared: &EngineShared) {
    let stamp = shared.clock.tick_stamp() + master.layout.block_size as u64 - 1;
    loop {
        let mut due: Vec<(Module, TimedAction)> = Vec::new();
        for m in &master.nodes {
            let n = unsafe { m.node_mut() };
            while let Some(tj) = Node::pop_due(&mut n.boundary_jobs, stamp) {
                due.push((m.clone(), tj.action));
            }
        }
        if due.is_empty() {
            break;
        }
        for (m, action) in due {
            match action {
                TimedAction::Access(mut func) => {
                    if m.integrated() {
                        if let Some(p) = unsafe { m.node_mut() }.processor.as_mut() {
                            func(p.as_mut());
                        }
                    }
                    shared.gc.push(Garbage::Access(func));
                }
                TimedAction::Discard => {
                    // The actual discard goes back through the commit
                    // queue, so the upcoming block (and any flow jobs
                    // queued inside it) still runs first.
                    if m.integrated() {
                        let mut trans = Transaction::open();
                        trans.add(Job::discard(&m));
                        shared
                            .queue
                            .push(trans, master.layout.block_size as u64);
                    }
                }
            }
        }
    }
}

/// Process one block: reflow if needed, run every scheduled node in
/// dependency order, sweep unscheduled flow jobs, advance the clock and
/// fire timers.
pub(crate) fn process_block(master: &mut MasterState, shared: &EngineShared) {
    let block_size = master.layout.block_size;
    let block_start = shared.clock.tick_stamp();
    let end = block_start + block_size as u64;

    if master.need_reflow {
        let violations = master
            .schedule
            .rebuild(&master.nodes, &master.consumers, block_start);
        shared.add_violations(violations);
        master.need_reflow = false;
    }

    let order = master.schedule.take_order();
    for m in &order {
        process_node(m, shared, block_start, end, block_size);
    }
    master.schedule.put_back(order);

    // Unscheduled nodes still fire their due flow jobs at the block
    // boundary; their counter tracks the clock so readiness tests keep
    // working while they are disconnected. Virtual nodes are elided from
    // the order, so their counter catches up here as well.
    for idx in 0..master.nodes.len() {
        let m = master.nodes[idx].clone();
        if m.is_scheduled() && !m.is_virtual() {
            continue;
        }
        let n = unsafe { m.node_mut() };
        if let Some(p) = n.processor.as_mut() {
            let due_limit = end - 1;
            while let Some(tj) = Node::pop_due(&mut n.flow_jobs, due_limit) {
                match tj.action {
                    TimedAction::Access(mut func) => {
                        func(p.as_mut());
                        shared.gc.push(Garbage::Access(func));
                    }
                    TimedAction::Discard => {}
                }
            }
        }
        m.core.counter.set(end);
    }

    let new_stamp = shared.clock.advance(block_size as u64, master.layout.sample_freq);

    // Timers fire after every stamp advance; returning false removes the
    // timer (dropped by the garbage collector).
    let mut i = 0;
    while i < master.timers.len() {
        if (master.timers[i])(new_stamp) {
            i += 1;
        } else {
            let t = master.timers.remove(i);
            shared.gc.push(Garbage::Timer(t));
        }
    }
}

fn process_node(m: &Module, shared: &EngineShared, block_start: u64, end: u64, block_size: usize) {
    gather_streams(m, block_start, block_size);

    let node = unsafe { m.node_mut() };
    let active = node.next_active <= block_start;
    if !active {
        if !node.outputs_cleared {
            for buf in node.obufs.iter_mut() {
                buf.fill(0.0);
            }
            node.outputs_cleared = true;
        }
        node.needs_reset = true;
        // Overdue flow jobs still fire while suspended.
        let Node {
            processor,
            flow_jobs,
            ..
        } = node;
        if let Some(p) = processor.as_mut() {
            while let Some(tj) = Node::pop_due(flow_jobs, end - 1) {
                match tj.action {
                    TimedAction::Access(mut func) => {
                        func(p.as_mut());
                        shared.gc.push(Garbage::Access(func));
                    }
                    TimedAction::Discard => {}
                }
            }
        }
        m.core.counter.set(end);
    } else {
        node.outputs_cleared = false;
        let Node {
            processor,
            flow_jobs,
            iptrs,
            jptrs,
            optrs,
            needs_reset,
            ..
        } = node;
        let proc_ = match processor.as_mut() {
            Some(p) => p,
            None => {
                // Virtual modules are elided from the order; nothing to do.
                m.core.counter.set(end);
                return;
            }
        };
        // Flow jobs split the block: the node processes up to the next
        // due stamp, the job fires, and processing continues.
        let mut counter = block_start;
        while counter < end {
            while let Some(tj) = Node::pop_due(flow_jobs, counter) {
                match tj.action {
                    TimedAction::Access(mut func) => {
                        func(proc_.as_mut());
                        shared.gc.push(Garbage::Access(func));
                    }
                    TimedAction::Discard => {}
                }
            }
            let next = match flow_jobs.front() {
                Some(j) if j.stamp < end => j.stamp.max(counter + 1),
                _ => end,
            };
            if *needs_reset {
                proc_.reset();
                *needs_reset = false;
            }
            let mut ctx = ProcessContext {
                n_values: (next - counter) as usize,
                offset: (counter - block_start) as usize,
                istreams: iptrs.as_slice(),
                jstreams: jptrs.as_slice(),
                ostreams: optrs.as_slice(),
            };
            proc_.process(&mut ctx);
            counter = next;
            m.core.counter.set(counter);
        }
    }

    take_probes(m, shared, block_start, end);
}

/// Refresh the node's stream pointer tables for this block. Inputs are
/// resolved through virtual chains to the real producer buffer; dangling
/// inputs read the shared zero block; joint inputs with more than one
/// producer are summed into the node's accumulation buffer.
fn gather_streams(m: &Module, block_start: u64, block_size: usize) {
    let class = *m.class();

    for i in 0..class.n_istreams {
        let entry = unsafe { m.node_mut() }.inputs[i].clone();
        let resolved = entry.and_then(|(src, os)| trace_real(&src, os, block_start));
        let (ptr, connected) = match resolved {
            Some((real, ros)) if real.integrated() && !real.same(m) => {
                // SAFETY: reading another node's buffer pointer; no
                // exclusive borrow of that node is live here.
                let p = unsafe { real.node_mut() }.obufs[ros].as_ptr();
                (p, true)
            }
            _ => (zero_block_ptr(), false),
        };
        unsafe { m.node_mut() }.iptrs[i] = (ptr, connected);
    }

    for j in 0..class.n_jstreams {
        let n_entries = unsafe { m.node_mut() }.jinputs[j].len();
        let mut n_real = 0usize;
        let mut first_ptr: *const f32 = zero_block_ptr();
        for k in 0..n_entries {
            let (src, os) = unsafe { m.node_mut() }.jinputs[j][k].clone();
            let resolved = trace_real(&src, os, block_start);
            let p = match resolved {
                Some((real, ros)) if real.integrated() && !real.same(m) => {
                    unsafe { real.node_mut() }.obufs[ros].as_ptr()
                }
                _ => continue,
            };
            match n_real {
                0 => first_ptr = p,
                1 => {
                    // Second producer: switch to the accumulation buffer.
                    let n = unsafe { m.node_mut() };
                    let acc = &mut n.jaccs[j];
                    // SAFETY: producer buffers are full blocks owned by
                    // other nodes; the accumulation buffer belongs to `m`
                    // and never aliases them.
                    unsafe {
                        std::ptr::copy_nonoverlapping(first_ptr, acc.as_mut_ptr(), block_size);
                        for idx in 0..block_size {
                            acc[idx] += *p.add(idx);
                        }
                    }
                }
                _ => {
                    let n = unsafe { m.node_mut() };
                    let acc = &mut n.jaccs[j];
                    // SAFETY: as above.
                    unsafe {
                        for idx in 0..block_size {
                            acc[idx] += *p.add(idx);
                        }
                    }
                }
            }
            n_real += 1;
        }
        let n = unsafe { m.node_mut() };
        n.jptrs[j] = match n_real {
            0 => zero_block_ptr(),
            // Single producer: alias its buffer, zero copies.
            1 => first_ptr,
            _ => n.jaccs[j].as_ptr(),
        };
    }

    let n = unsafe { m.node_mut() };
    for o in 0..class.n_ostreams {
        n.optrs[o] = n.obufs[o].as_mut_ptr();
    }
}

fn take_probes(m: &Module, shared: &EngineShared, block_start: u64, end: u64) {
    let node = unsafe { m.node_mut() };
    if node.probes.is_empty() {
        return;
    }
    let Node { probes, obufs, .. } = node;
    let mut i = 0;
    while i < probes.len() {
        let complete = {
            let p = &mut probes[i];
            if p.start >= end {
                i += 1;
                continue;
            }
            let seg_start = p.start.max(block_start);
            let off = (seg_start - block_start) as usize;
            let avail = (end - seg_start) as usize;
            let want = p.n_values - p.filled;
            let ncopy = avail.min(want);
            for (o, slot) in p.bufs.iter_mut().enumerate() {
                if let Some(buf) = slot {
                    buf.extend_from_slice(&obufs[o][off..off + ncopy]);
                }
            }
            p.filled += ncopy;
            p.filled >= p.n_values
        };
        if complete {
            let done = probes.remove(i);
            if let Some(func) = done.func {
                shared.gc.push(Garbage::CompletedProbe {
                    func,
                    data: ProbeData {
                        tick_stamp: done.start + done.n_values as u64,
                        n_values: done.n_values,
                        ostreams: done.bufs,
                    },
                });
            }
        } else {
            i += 1;
        }
    }
}

fn discard_node(master: &mut MasterState, shared: &EngineShared, m: &Module) {
    kill_inputs_exec(m);
    kill_outputs_exec(shared, m);

    let was_consumer = unsafe { m.node_mut() }.is_consumer;
    if was_consumer {
        unsafe { m.node_mut() }.is_consumer = false;
        master.consumers.retain(|c| !c.same(m));
    }
    master.nodes.retain(|n| !n.same(m));
    m.core.integrated.set(false);
    m.core.scheduled.set(false);
    m.core.counter.set(STAMP_NEVER);
    shared
        .n_integrated
        .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);

    let n = unsafe { m.node_mut() };
    // Pending timed jobs are dropped, never executed; their payloads are
    // freed exactly once, in the garbage collector.
    for tj in n.flow_jobs.drain(..).chain(n.boundary_jobs.drain(..)) {
        if let TimedAction::Access(func) = tj.action {
            shared.gc.push(Garbage::Access(func));
        }
    }
    for probe in n.probes.drain(..) {
        if let Some(func) = probe.func {
            shared.gc.push(Garbage::DroppedProbe(func));
        }
    }
    // The processor's teardown must run in a user thread.
    if let Some(p) = n.processor.take() {
        shared.gc.push(Garbage::Processor(p));
    }
    n.obufs = Vec::new();
    n.jaccs = Vec::new();
    n.iptrs = Vec::new();
    n.jptrs = Vec::new();
    n.optrs = Vec::new();

    master.need_reflow = true;
}

fn remove_onode_entry(src: &Module, dest: &Module) {
    let sn = unsafe { src.node_mut() };
    if let Some(pos) = sn.onodes.iter().position(|c| c.same(dest)) {
        sn.onodes.remove(pos);
    }
}

fn idisconnect_exec(dest: &Module, istream: usize) -> bool {
    let taken = unsafe { dest.node_mut() }.inputs[istream].take();
    match taken {
        Some((src, _)) => {
            dest.set_source_bit(istream, false);
            remove_onode_entry(&src, dest);
            true
        }
        None => false,
    }
}

fn jdisconnect_exec(dest: &Module, jstream: usize, src: &Module, src_ostream: usize) -> bool {
    let found = {
        let dn = unsafe { dest.node_mut() };
        dn.jinputs[jstream]
            .iter()
            .position(|(s, os)| s.same(src) && *os == src_ostream)
    };
    match found {
        Some(pos) => {
            unsafe { dest.node_mut() }.jinputs[jstream].remove(pos);
            remove_onode_entry(src, dest);
            true
        }
        None => false,
    }
}

fn kill_inputs_exec(m: &Module) {
    let class = *m.class();
    for i in 0..class.n_istreams {
        let _ = idisconnect_exec(m, i);
    }
    for j in 0..class.n_jstreams {
        loop {
            let first = unsafe { m.node_mut() }.jinputs[j].first().cloned();
            match first {
                Some((src, os)) => {
                    jdisconnect_exec(m, j, &src, os);
                }
                None => break,
            }
        }
    }
}

fn kill_outputs_exec(shared: &EngineShared, m: &Module) {
    loop {
        let dest = {
            let n = unsafe { m.node_mut() };
            match n.onodes.last() {
                Some(d) => d.clone(),
                None => break,
            }
        };
        let class = *dest.class();
        let mut removed = false;
        for i in 0..class.n_istreams {
            let fed_by_m = {
                let dn = unsafe { dest.node_mut() };
                matches!(&dn.inputs[i], Some((s, _)) if s.same(m))
            };
            if fed_by_m {
                idisconnect_exec(&dest, i);
                removed = true;
                break;
            }
        }
        if !removed {
            for j in 0..class.n_jstreams {
                let found = {
                    let dn = unsafe { dest.node_mut() };
                    dn.jinputs[j]
                        .iter()
                        .find(|(s, _)| s.same(m))
                        .map(|(_, os)| *os)
                };
                if let Some(os) = found {
                    jdisconnect_exec(&dest, j, m, os);
                    removed = true;
                    break;
                }
            }
        }
        if !removed {
            // Back-reference without a matching edge: drop it rather than
            // loop forever.
            shared.violation("kill outputs: stale consumer back-reference");
            unsafe { m.node_mut() }.onodes.pop();
        }
    }
}
