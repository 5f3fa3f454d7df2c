//! Jobs: single requested mutations against the live graph.
//!
//! Job constructors validate structural preconditions (stream bounds,
//! virtual-module restrictions) and never touch the live graph; only
//! execution by the master applies the effect. Payloads are move-only
//! owned boxes: a job owns its payload until the master either consumes
//! it or transfers it into a node-local timed queue, and every payload is
//! ultimately dropped in a user thread by the garbage collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::module::{Module, Processor, MAX_STREAMS};

pub(crate) type AccessBox = Box<dyn FnMut(&mut dyn Processor) + Send>;
pub(crate) type ProbeBox = Box<dyn FnOnce(ProbeData) + Send>;
pub(crate) type TimerBox = Box<dyn FnMut(u64) -> bool + Send>;
pub(crate) type PollBox = Box<dyn FnMut(&mut PollState<'_>) -> bool + Send>;

/// Output buffers captured by a probe, delivered to the probe callback in
/// a user thread. Channels not selected by the probe mask are `None`.
/// Ownership of every buffer transfers to the callback.
pub struct ProbeData {
    /// Tick stamp at which the capture completed.
    pub tick_stamp: u64,
    /// Samples captured per selected channel.
    pub n_values: usize,
    pub ostreams: Vec<Option<Vec<f32>>>,
}

/// A registered poll descriptor, passed through to the caller's reactor
/// in caller-driven mode. The engine never polls descriptors itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnginePollFd {
    pub fd: i32,
    pub events: u16,
    pub revents: u16,
}

/// State handed to a poll callback once per master iteration.
pub struct PollState<'a> {
    /// Block size the next process pass would cover.
    pub n_values: usize,
    /// Callback may lower the master's wait timeout.
    pub timeout: &'a mut Option<Duration>,
    /// The descriptors registered with this callback; `revents` are
    /// filled in when `revents_filled` is true.
    pub fds: &'a mut [EnginePollFd],
    pub revents_filled: bool,
}

/// Identity for a registered poll callback, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(u64);

impl PollId {
    /// Allocate a process-unique poll identity.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) enum JobKind {
    Integrate(Module),
    Discard(Module),
    IConnect {
        src: Module,
        src_ostream: usize,
        dest: Module,
        dest_istream: usize,
    },
    JConnect {
        src: Module,
        src_ostream: usize,
        dest: Module,
        dest_jstream: usize,
    },
    IDisconnect {
        dest: Module,
        dest_istream: usize,
    },
    JDisconnect {
        dest: Module,
        dest_jstream: usize,
        src: Module,
        src_ostream: usize,
    },
    KillInputs(Module),
    KillOutputs(Module),
    SetConsumer(Module),
    UnsetConsumer(Module),
    ForceReset(Module),
    Suspend(Module),
    Resume {
        module: Module,
        tick_stamp: u64,
    },
    Access {
        module: Module,
        func: AccessBox,
    },
    FlowAccess {
        module: Module,
        tick_stamp: u64,
        func: AccessBox,
    },
    BoundaryAccess {
        module: Module,
        tick_stamp: u64,
        func: AccessBox,
    },
    BoundaryDiscard(Module),
    Probe {
        module: Module,
        delay: u64,
        n_values: usize,
        ostream_mask: u64,
        func: ProbeBox,
    },
    AddPoll {
        id: PollId,
        func: PollBox,
        fds: Vec<EnginePollFd>,
    },
    RemovePoll(PollId),
    AddTimer(TimerBox),
    Message(String),
    Sync(crate::engine::SyncGate),
}

/// One requested mutation or deferred callback against the graph.
pub struct Job {
    pub(crate) kind: JobKind,
}

impl Job {
    /// Install `module` into the live graph.
    pub fn integrate(module: &Module) -> Job {
        Job {
            kind: JobKind::Integrate(module.clone()),
        }
    }

    /// Remove `module` from the live graph, detaching all connections and
    /// dropping its pending timed jobs. The processor's teardown runs in
    /// the garbage collector, never on the master thread.
    pub fn discard(module: &Module) -> Job {
        Job {
            kind: JobKind::Discard(module.clone()),
        }
    }

    /// Like [`Job::discard`], but deferred to the next block boundary, so
    /// same-block jobs already queued against the module still apply
    /// first.
    pub fn boundary_discard(module: &Module) -> Job {
        Job {
            kind: JobKind::BoundaryDiscard(module.clone()),
        }
    }

    /// Wire `src`'s output `src_ostream` to `dest`'s single-producer
    /// input `dest_istream`. The input must be unconnected at execution
    /// time.
    ///
    /// # Panics
    /// If a stream index is out of the class-declared range.
    pub fn connect(src: &Module, src_ostream: usize, dest: &Module, dest_istream: usize) -> Job {
        assert!(
            src_ostream < src.class().n_ostreams,
            "src_ostream out of range"
        );
        assert!(
            dest_istream < dest.class().n_istreams,
            "dest_istream out of range"
        );
        Job {
            kind: JobKind::IConnect {
                src: src.clone(),
                src_ostream,
                dest: dest.clone(),
                dest_istream,
            },
        }
    }

    /// Add `src` as one producer of `dest`'s joint input `dest_jstream`.
    /// All producers of a joint input are summed elementwise at process
    /// time.
    ///
    /// # Panics
    /// If a stream index is out of the class-declared range.
    pub fn jconnect(src: &Module, src_ostream: usize, dest: &Module, dest_jstream: usize) -> Job {
        assert!(
            src_ostream < src.class().n_ostreams,
            "src_ostream out of range"
        );
        assert!(
            dest_jstream < dest.class().n_jstreams,
            "dest_jstream out of range"
        );
        Job {
            kind: JobKind::JConnect {
                src: src.clone(),
                src_ostream,
                dest: dest.clone(),
                dest_jstream,
            },
        }
    }

    /// Disconnect `dest`'s input `dest_istream`. The connection must
    /// exist at execution time.
    ///
    /// # Panics
    /// If the stream index is out of range.
    pub fn disconnect(dest: &Module, dest_istream: usize) -> Job {
        assert!(
            dest_istream < dest.class().n_istreams,
            "dest_istream out of range"
        );
        Job {
            kind: JobKind::IDisconnect {
                dest: dest.clone(),
                dest_istream,
            },
        }
    }

    /// Remove the named producer from `dest`'s joint input. The
    /// connection must exist at execution time.
    ///
    /// # Panics
    /// If a stream index is out of range.
    pub fn jdisconnect(
        dest: &Module,
        dest_jstream: usize,
        src: &Module,
        src_ostream: usize,
    ) -> Job {
        assert!(
            dest_jstream < dest.class().n_jstreams,
            "dest_jstream out of range"
        );
        assert!(
            src_ostream < src.class().n_ostreams,
            "src_ostream out of range"
        );
        Job {
            kind: JobKind::JDisconnect {
                dest: dest.clone(),
                dest_jstream,
                src: src.clone(),
                src_ostream,
            },
        }
    }

    /// Force-disconnect all input and joint-input connections of
    /// `module`.
    pub fn kill_inputs(module: &Module) -> Job {
        Job {
            kind: JobKind::KillInputs(module.clone()),
        }
    }

    /// Force-disconnect every connection fed from `module`'s outputs.
    pub fn kill_outputs(module: &Module) -> Job {
        Job {
            kind: JobKind::KillOutputs(module.clone()),
        }
    }

    /// Mark `module` as a schedule root ("toplevel consumer").
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn set_consumer(module: &Module) -> Job {
        assert!(!module.is_virtual(), "virtual modules cannot be consumers");
        Job {
            kind: JobKind::SetConsumer(module.clone()),
        }
    }

    /// Unmark `module` as a schedule root.
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn unset_consumer(module: &Module) -> Job {
        assert!(!module.is_virtual(), "virtual modules cannot be consumers");
        Job {
            kind: JobKind::UnsetConsumer(module.clone()),
        }
    }

    /// Request a `reset()` before the module's next process call.
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn force_reset(module: &Module) -> Job {
        assert!(!module.is_virtual(), "virtual modules cannot be reset");
        Job {
            kind: JobKind::ForceReset(module.clone()),
        }
    }

    /// Suspend `module` immediately. Suspended modules are skipped by
    /// processing and their outputs read as zeros; ancestors with no
    /// other active consumer suspend transitively.
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn suspend_now(module: &Module) -> Job {
        assert!(!module.is_virtual(), "virtual modules cannot be suspended");
        Job {
            kind: JobKind::Suspend(module.clone()),
        }
    }

    /// Resume `module` once the global tick stamp reaches `tick_stamp`
    /// (`reset()` fires before its first process call). Ancestors resume
    /// with it unless independently suspended.
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn resume_at(module: &Module, tick_stamp: u64) -> Job {
        assert!(!module.is_virtual(), "virtual modules cannot be resumed");
        Job {
            kind: JobKind::Resume {
                module: module.clone(),
                tick_stamp,
            },
        }
    }

    /// Run `func` against the module's processor on the master thread at
    /// the next opportunity. This is the only sanctioned way for control
    /// threads to touch live processor state. The closure is dropped in
    /// the garbage collector after execution.
    ///
    /// # Panics
    /// If `module` is virtual (virtual modules have no processor).
    pub fn access<F>(module: &Module, func: F) -> Job
    where
        F: FnMut(&mut dyn Processor) + Send + 'static,
    {
        assert!(!module.is_virtual(), "virtual modules have no processor");
        Job {
            kind: JobKind::Access {
                module: module.clone(),
                func: Box::new(func),
            },
        }
    }

    /// Like [`Job::access`], but deferred until the module's local tick
    /// counter reaches `tick_stamp`; fires interleaved with per-block
    /// processing.
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn flow_access<F>(module: &Module, tick_stamp: u64, func: F) -> Job
    where
        F: FnMut(&mut dyn Processor) + Send + 'static,
    {
        assert!(!module.is_virtual(), "flow jobs are invalid on virtual modules");
        Job {
            kind: JobKind::FlowAccess {
                module: module.clone(),
                tick_stamp,
                func: Box::new(func),
            },
        }
    }

    /// Like [`Job::flow_access`], but fires at the block boundary, after
    /// all ordinary jobs of the dispatch and strictly before the tick
    /// stamp advances past `tick_stamp`.
    ///
    /// # Panics
    /// If `module` is virtual.
    pub fn boundary_access<F>(module: &Module, tick_stamp: u64, func: F) -> Job
    where
        F: FnMut(&mut dyn Processor) + Send + 'static,
    {
        assert!(
            !module.is_virtual(),
            "boundary jobs are invalid on virtual modules"
        );
        Job {
            kind: JobKind::BoundaryAccess {
                module: module.clone(),
                tick_stamp,
                func: Box::new(func),
            },
        }
    }

    /// Arm a one-shot capture of `n_values` samples from each output
    /// channel selected by `ostream_mask`, starting after a further
    /// `delay` samples of processing. The callback runs in a user thread
    /// during garbage collection, receiving ownership of the captured
    /// buffers.
    ///
    /// # Panics
    /// If `module` is virtual, `n_values` is zero, or the mask selects a
    /// channel the class does not declare.
    pub fn probe_request<F>(
        module: &Module,
        delay: u64,
        n_values: usize,
        ostream_mask: u64,
        func: F,
    ) -> Job
    where
        F: FnOnce(ProbeData) + Send + 'static,
    {
        assert!(!module.is_virtual(), "probes are invalid on virtual modules");
        assert!(n_values > 0, "probe capture length must be > 0");
        let n_ostreams = module.class().n_ostreams;
        let valid = if n_ostreams >= MAX_STREAMS {
            u64::MAX
        } else {
            (1u64 << n_ostreams) - 1
        };
        assert!(
            ostream_mask & !valid == 0 && ostream_mask != 0,
            "probe mask selects undeclared output channels"
        );
        Job {
            kind: JobKind::Probe {
                module: module.clone(),
                delay,
                n_values,
                ostream_mask,
                func: Box::new(func),
            },
        }
    }

    /// Register a poll callback gating whether the engine should process
    /// a block now. `fds` are surfaced to the caller's reactor in
    /// caller-driven mode.
    pub fn add_poll<F>(id: PollId, func: F, fds: Vec<EnginePollFd>) -> Job
    where
        F: FnMut(&mut PollState<'_>) -> bool + Send + 'static,
    {
        Job {
            kind: JobKind::AddPoll {
                id,
                func: Box::new(func),
                fds,
            },
        }
    }

    /// Remove a previously added poll callback. The callback is dropped
    /// in the garbage collector.
    pub fn remove_poll(id: PollId) -> Job {
        Job {
            kind: JobKind::RemovePoll(id),
        }
    }

    /// Register a timer fired with the new tick stamp after every block;
    /// returning `false` unregisters it (dropped in the garbage
    /// collector).
    pub fn add_timer<F>(func: F) -> Job
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        Job {
            kind: JobKind::AddTimer(Box::new(func)),
        }
    }

    /// Debug marker, logged when the master executes it.
    pub fn message(text: impl Into<String>) -> Job {
        Job {
            kind: JobKind::Message(text.into()),
        }
    }

    pub(crate) fn sync(gate: crate::engine::SyncGate) -> Job {
        Job {
            kind: JobKind::Sync(gate),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match &self.kind {
            JobKind::Integrate(_) => "Integrate",
            JobKind::Discard(_) => "Discard",
            JobKind::IConnect { .. } => "IConnect",
            JobKind::JConnect { .. } => "JConnect",
            JobKind::IDisconnect { .. } => "IDisconnect",
            JobKind::JDisconnect { .. } => "JDisconnect",
            JobKind::KillInputs(_) => "KillInputs",
            JobKind::KillOutputs(_) => "KillOutputs",
            JobKind::SetConsumer(_) => "SetConsumer",
            JobKind::UnsetConsumer(_) => "UnsetConsumer",
            JobKind::ForceReset(_) => "ForceReset",
            JobKind::Suspend(_) => "Suspend",
            JobKind::Resume { .. } => "Resume",
            JobKind::Access { .. } => "Access",
            JobKind::FlowAccess { .. } => "FlowAccess",
            JobKind::BoundaryAccess { .. } => "BoundaryAccess",
            JobKind::BoundaryDiscard(_) => "BoundaryDiscard",
            JobKind::Probe { .. } => "Probe",
            JobKind::AddPoll { .. } => "AddPoll",
            JobKind::RemovePoll(_) => "RemovePoll",
            JobKind::AddTimer(_) => "AddTimer",
            JobKind::Message(_) => "Message",
            JobKind::Sync(_) => "Sync",
        };
        f.debug_struct("Job").field("kind", &name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleClass, ProcessContext};

    struct Null;
    impl Processor for Null {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
    }

    fn source() -> Module {
        Module::new(ModuleClass::new(0, 0, 2), Box::new(Null)).unwrap()
    }

    fn sink() -> Module {
        Module::new(ModuleClass::new(2, 1, 0), Box::new(Null)).unwrap()
    }

    #[test]
    fn test_connect_validates_bounds() {
        let s = source();
        let d = sink();
        let _ = Job::connect(&s, 1, &d, 1);
        let _ = Job::jconnect(&s, 0, &d, 0);
    }

    #[test]
    #[should_panic(expected = "src_ostream out of range")]
    fn test_connect_bad_ostream() {
        let s = source();
        let d = sink();
        let _ = Job::connect(&s, 2, &d, 0);
    }

    #[test]
    #[should_panic(expected = "dest_istream out of range")]
    fn test_connect_bad_istream() {
        let s = source();
        let d = sink();
        let _ = Job::connect(&s, 0, &d, 2);
    }

    #[test]
    #[should_panic(expected = "flow jobs are invalid on virtual modules")]
    fn test_flow_access_on_virtual() {
        let v = Module::new_virtual(1).unwrap();
        let _ = Job::flow_access(&v, 0, |_| {});
    }

    #[test]
    #[should_panic(expected = "virtual modules cannot be suspended")]
    fn test_suspend_on_virtual() {
        let v = Module::new_virtual(1).unwrap();
        let _ = Job::suspend_now(&v);
    }

    #[test]
    #[should_panic(expected = "probe mask selects undeclared output channels")]
    fn test_probe_mask_validated() {
        let s = source();
        let _ = Job::probe_request(&s, 0, 16, 0b100, |_| {});
    }

    #[test]
    fn test_poll_id_unique() {
        assert_ne!(PollId::new(), PollId::new());
    }
}
