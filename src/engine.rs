//! The engine runtime: commit entry points, the master driving loop
//! (owned thread or caller-driven), reconfiguration and the user-thread
//! facing clock, GC and diagnostics accessors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::block::ConstPool;
use crate::config::{BlockLayout, EngineConfig};
use crate::error::{Error, Result};
use crate::gc::GcQueue;
use crate::job::{EnginePollFd, Job};
use crate::lockfree::Clock;
use crate::master::{dispatch_jobs, process_block, MasterState};
use crate::transaction::{CommitQueue, Transaction};

/// Wait timeout for the owned master thread when no poll callback
/// suggests one.
const IDLE_WAIT: Duration = Duration::from_millis(5);

#[derive(Default)]
struct GateState {
    arrived: bool,
    released: bool,
}

struct GateInner {
    state: Mutex<GateState>,
    cond: Condvar,
}

/// Rendezvous between a user thread and the master: the master signals
/// arrival at a job boundary and parks (holding no locks) until released.
#[derive(Clone)]
pub(crate) struct SyncGate {
    inner: Arc<GateInner>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Master side: signal arrival, then park until released.
    pub fn arrive_and_wait(&self) {
        let mut st = self.inner.state.lock();
        st.arrived = true;
        self.inner.cond.notify_all();
        while !st.released {
            self.inner.cond.wait(&mut st);
        }
    }

    /// User side: block until the master has arrived.
    pub fn wait_arrived(&self) {
        let mut st = self.inner.state.lock();
        while !st.arrived {
            self.inner.cond.wait(&mut st);
        }
    }

    /// User side: let the master continue.
    pub fn release(&self) {
        let mut st = self.inner.state.lock();
        st.released = true;
        self.inner.cond.notify_all();
    }
}

enum Wake {
    Commit,
    Shutdown,
}

/// State shared between user threads and the master context.
pub(crate) struct EngineShared {
    pub(crate) clock: Clock,
    pub(crate) layout: ArcSwap<BlockLayout>,
    pub(crate) pool: ArcSwap<ConstPool>,
    pub(crate) queue: CommitQueue,
    pub(crate) gc: GcQueue,
    pub(crate) master: Mutex<MasterState>,
    /// Modules currently integrated; gates reconfiguration.
    pub(crate) n_integrated: AtomicUsize,
    /// Contract violations logged by the master so far.
    pub(crate) violations: AtomicUsize,
    wake_tx: Sender<Wake>,
    wake_rx: Receiver<Wake>,
}

impl EngineShared {
    /// Log a contract violation and count it. The offending job's effect
    /// has already been skipped by the caller.
    pub(crate) fn violation(&self, what: &str) {
        self.violations.fetch_add(1, Ordering::AcqRel);
        tracing::error!("contract violation: {what}");
    }

    pub(crate) fn add_violations(&self, n: usize) {
        if n > 0 {
            self.violations.fetch_add(n, Ordering::AcqRel);
        }
    }
}

/// How the master context is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    /// The runtime owns a master thread; user threads only commit.
    Threaded,
    /// The caller integrates [`EngineRuntime::prepare`],
    /// [`EngineRuntime::check`] and [`EngineRuntime::dispatch`] into its
    /// own event loop. The engine never polls descriptors itself.
    Caller,
}

/// State the caller's event loop shuttles between [`prepare`], the
/// caller's own `poll`/reactor, and [`check`].
///
/// [`prepare`]: EngineRuntime::prepare
/// [`check`]: EngineRuntime::check
#[derive(Default)]
pub struct LoopState {
    /// Maximum time the caller should wait before calling
    /// [`EngineRuntime::dispatch`] anyway.
    pub timeout: Option<Duration>,
    /// Descriptors to include in the caller's poll set; filled by
    /// [`EngineRuntime::prepare`], `revents` read back by
    /// [`EngineRuntime::check`].
    pub fds: Vec<EnginePollFd>,
}

/// The engine runtime.
///
/// Owns the shared engine state and, in [`Threading::Threaded`] mode, the
/// master thread. All graph mutation goes through [`Transaction`]s
/// committed here.
pub struct EngineRuntime {
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<()>>,
    threading: Threading,
}

impl EngineRuntime {
    /// Create a runtime from a configuration.
    pub fn new(config: &EngineConfig, threading: Threading) -> Result<Self> {
        let layout = BlockLayout::derive(config)?;
        let (wake_tx, wake_rx) = unbounded();
        let shared = Arc::new(EngineShared {
            clock: Clock::new(layout.sample_freq),
            layout: ArcSwap::from_pointee(layout),
            pool: ArcSwap::from_pointee(ConstPool::new(layout.block_size)),
            queue: CommitQueue::new(),
            gc: GcQueue::new(),
            master: Mutex::new(MasterState::new(layout)),
            n_integrated: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            wake_tx,
            wake_rx,
        });
        let thread = match threading {
            Threading::Threaded => {
                let for_master = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name("engine-master".into())
                    .spawn(move || master_loop(for_master))
                    .map_err(|_| Error::MasterGone)?;
                Some(handle)
            }
            Threading::Caller => None,
        };
        Ok(Self {
            shared,
            thread,
            threading,
        })
    }

    /// Create a threaded runtime with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&EngineConfig::default(), Threading::Threaded)
    }

    pub fn threading(&self) -> Threading {
        self.threading
    }

    // --- commit entry points -------------------------------------------

    /// Commit a transaction for execution by the master. Returns the tick
    /// stamp by which execution is guaranteed to have started, or `0` for
    /// an empty transaction (nothing to execute, no wakeup).
    pub fn commit(&self, trans: Transaction) -> u64 {
        if trans.is_empty() {
            return 0;
        }
        let stamp = self
            .shared
            .queue
            .push(trans, self.block_size() as u64);
        // In caller-driven mode nothing reads the wake channel; the next
        // dispatch picks the transaction up.
        if self.thread.is_some() {
            let _ = self.shared.wake_tx.send(Wake::Commit);
        }
        stamp
    }

    /// Commit a batch of jobs as one transaction.
    pub fn transact(&self, jobs: impl IntoIterator<Item = Job>) -> u64 {
        let mut trans = Transaction::open();
        for job in jobs {
            trans.add(job);
        }
        self.commit(trans)
    }

    /// Commit `trans` so that it executes no earlier than `tick_stamp`,
    /// blocking the caller until the clock reaches that stamp. A timer
    /// holds the transaction, re-commits it when the stamp is reached,
    /// and releases the caller. Must never be called from the master
    /// context (in caller-driven mode, something else has to keep
    /// dispatching while this blocks).
    pub fn commit_delayed(&self, trans: Transaction, tick_stamp: u64) {
        if trans.is_empty() {
            return;
        }
        if tick_stamp <= self.tick_stamp() {
            self.commit(trans);
            return;
        }
        let released = Arc::new((Mutex::new(false), Condvar::new()));
        let release = Arc::clone(&released);
        let shared = Arc::downgrade(&self.shared);
        let block = self.block_size() as u64;
        let mut pending = Some(trans);
        self.transact([Job::add_timer(move |stamp| {
            if stamp < tick_stamp {
                return true;
            }
            if let (Some(trans), Some(shared)) = (pending.take(), shared.upgrade()) {
                shared.queue.push(trans, block);
            }
            let (flag, cond) = &*release;
            *flag.lock() = true;
            cond.notify_all();
            false
        })]);
        let (flag, cond) = &*released;
        let mut done = flag.lock();
        while !*done {
            cond.wait(&mut done);
        }
    }

    /// Block until every committed transaction has been executed. In
    /// caller-driven mode another thread (or the caller itself, before
    /// waiting) must keep dispatching.
    pub fn wait_on_trans(&self) {
        self.shared.queue.wait_drained();
    }

    /// Whether committed transactions are still waiting for the master.
    pub fn jobs_pending(&self) -> bool {
        self.shared.queue.job_pending()
    }

    // --- caller-driven loop --------------------------------------------

    /// Caller-driven mode: gather poll descriptors and a wait timeout for
    /// the caller's reactor. Returns true when a block should be
    /// processed right away (skip the poll).
    pub fn prepare(&self, state: &mut LoopState) -> bool {
        let mut master = self.shared.master.lock();
        state.fds.clear();
        for rec in &master.pollers {
            state.fds.extend_from_slice(&rec.fds);
        }
        state.timeout = None;
        let need = master.check_pollers(&mut state.timeout, false)
            || self.shared.queue.job_pending();
        master.need_process = need;
        need
    }

    /// Caller-driven mode: after the caller's poll returned, feed the
    /// descriptor results back. Returns true when a block should be
    /// processed now.
    pub fn check(&self, state: &LoopState) -> bool {
        let mut master = self.shared.master.lock();
        let mut off = 0;
        for rec in &mut master.pollers {
            for fd in rec.fds.iter_mut() {
                if let Some(polled) = state.fds.get(off) {
                    fd.revents = polled.revents;
                }
                off += 1;
            }
        }
        let mut timeout = None;
        let need =
            master.check_pollers(&mut timeout, true) || self.shared.queue.job_pending();
        master.need_process = need;
        need
    }

    /// Caller-driven mode: execute pending transactions and, if the last
    /// [`prepare`]/[`check`] verdict asked for it, process one block.
    ///
    /// [`prepare`]: EngineRuntime::prepare
    /// [`check`]: EngineRuntime::check
    pub fn dispatch(&self) {
        let gates = {
            let mut master = self.shared.master.lock();
            let gates = dispatch_jobs(&mut master, &self.shared);
            if master.need_process && gates.is_empty() {
                process_block(&mut master, &self.shared);
            }
            gates
        };
        for gate in gates {
            gate.arrive_and_wait();
        }
    }

    // --- reconfiguration -----------------------------------------------

    /// Reconfigure block layout. Only legal while no modules are
    /// integrated; in threaded mode the master is halted at a job
    /// boundary for the swap.
    pub fn configure(&self, config: &EngineConfig) -> Result<BlockLayout> {
        let layout = BlockLayout::derive(config)?;
        let n = self.shared.n_integrated.load(Ordering::Acquire);
        if n != 0 {
            return Err(Error::EngineBusy(n));
        }
        match self.threading {
            Threading::Caller => {
                let mut master = self.shared.master.lock();
                let n = self.shared.n_integrated.load(Ordering::Acquire);
                if n != 0 {
                    return Err(Error::EngineBusy(n));
                }
                master.layout = layout;
                self.install_layout(layout);
                Ok(layout)
            }
            Threading::Threaded => {
                let gate = SyncGate::new();
                self.transact([Job::sync(gate.clone())]);
                gate.wait_arrived();
                // The master is parked at a job boundary, holding no locks.
                let result = {
                    let n = self.shared.n_integrated.load(Ordering::Acquire);
                    if n != 0 {
                        Err(Error::EngineBusy(n))
                    } else {
                        let mut master = self.shared.master.lock();
                        master.layout = layout;
                        self.install_layout(layout);
                        Ok(layout)
                    }
                };
                gate.release();
                result
            }
        }
    }

    fn install_layout(&self, layout: BlockLayout) {
        self.shared.layout.store(Arc::new(layout));
        // Cached constant blocks have the old block size; release them
        // now instead of waiting for outstanding handles to drop.
        self.shared.pool.load().recycle(true);
        self.shared
            .pool
            .store(Arc::new(ConstPool::new(layout.block_size)));
    }

    // --- clock and diagnostics -----------------------------------------

    /// Current global tick stamp. Advances by one block size per
    /// processed block.
    pub fn tick_stamp(&self) -> u64 {
        self.shared.clock.tick_stamp()
    }

    /// Extrapolate a system time onto the tick clock using the last
    /// published stamp/time pairing.
    pub fn tick_stamp_from_systime(&self, at: Instant) -> u64 {
        self.shared.clock.tick_stamp_from_systime(at)
    }

    pub fn block_size(&self) -> usize {
        self.shared.layout.load().block_size
    }

    pub fn control_raster(&self) -> usize {
        self.shared.layout.load().control_raster
    }

    pub fn sample_freq(&self) -> u32 {
        self.shared.layout.load().sample_freq
    }

    /// A shared read-only block filled with `value`, sized to the current
    /// block size.
    pub fn const_values(&self, value: f32) -> Arc<[f32]> {
        self.shared.pool.load().const_values(value)
    }

    /// Contract violations (misuse detected and skipped by the master)
    /// since the runtime was created.
    pub fn contract_violations(&self) -> usize {
        self.shared.violations.load(Ordering::Acquire)
    }

    /// Whether garbage is queued for collection.
    pub fn has_garbage(&self) -> bool {
        self.shared.gc.has_garbage()
    }

    /// Dispose spent payloads and deliver completed probes on this
    /// thread. Must be called from a user thread, never from processor
    /// code. Returns the number of items collected.
    pub fn garbage_collect(&self) -> usize {
        let n = self.shared.gc.collect();
        self.shared.pool.load().recycle(false);
        n
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.shared.wake_tx.send(Wake::Shutdown);
            let _ = handle.join();
        }
        // Remaining payload teardown happens here, on a user thread.
        self.shared.gc.collect();
    }
}

/// The owned master thread: wait for work, execute transactions, process
/// blocks while any poll callback (or the absence of pollers) asks for
/// them.
fn master_loop(shared: Arc<EngineShared>) {
    let mut timeout = IDLE_WAIT;
    loop {
        match shared.wake_rx.recv_timeout(timeout) {
            Ok(Wake::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Wake::Commit) | Err(RecvTimeoutError::Timeout) => {}
        }
        // Coalesce queued wakeups.
        let mut shutdown = false;
        while let Ok(wake) = shared.wake_rx.try_recv() {
            if matches!(wake, Wake::Shutdown) {
                shutdown = true;
            }
        }
        if shutdown {
            break;
        }

        let gates = {
            let mut master = shared.master.lock();
            let gates = dispatch_jobs(&mut master, &shared);
            let mut suggested = None;
            let need = master.check_pollers(&mut suggested, false);
            master.need_process = need;
            if need && gates.is_empty() {
                process_block(&mut master, &shared);
            }
            timeout = if need {
                Duration::ZERO
            } else {
                suggested.unwrap_or(IDLE_WAIT)
            };
            gates
        };
        // Park outside the master lock so user threads can inspect and
        // reconfigure while we wait.
        for gate in gates {
            gate.arrive_and_wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_gate_handshake() {
        let gate = SyncGate::new();
        let master_side = gate.clone();
        let t = std::thread::spawn(move || {
            master_side.arrive_and_wait();
        });
        gate.wait_arrived();
        gate.release();
        t.join().unwrap();
    }

    #[test]
    fn test_runtime_caller_mode_basics() {
        let rt = EngineRuntime::new(&EngineConfig::default(), Threading::Caller).unwrap();
        assert_eq!(rt.tick_stamp(), 0);
        let block = rt.block_size();
        assert!(block >= 8);
        rt.dispatch();
        assert_eq!(rt.tick_stamp(), block as u64);
        rt.dispatch();
        assert_eq!(rt.tick_stamp(), 2 * block as u64);
    }

    #[test]
    fn test_configure_swaps_layout() {
        let rt = EngineRuntime::new(&EngineConfig::default(), Threading::Caller).unwrap();
        let stale = rt.const_values(0.5);
        let layout = rt
            .configure(&EngineConfig {
                latency_ms: 10,
                sample_freq: 48000,
                control_freq: 100,
            })
            .unwrap();
        assert_eq!(rt.block_size(), layout.block_size);
        assert_eq!(rt.sample_freq(), 48000);
        // The constant cache is rebuilt at the new block size.
        let fresh = rt.const_values(0.5);
        assert_eq!(fresh.len(), layout.block_size);
        assert!(!Arc::ptr_eq(&stale, &fresh));
    }

    #[test]
    fn test_const_values_shared() {
        let rt = EngineRuntime::new(&EngineConfig::default(), Threading::Caller).unwrap();
        let a = rt.const_values(0.5);
        let b = rt.const_values(0.5);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), rt.block_size());
    }
}
