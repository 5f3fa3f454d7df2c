//! Modules: the engine's unit of signal processing.
//!
//! A module pairs an immutable [`ModuleClass`] (stream counts, cost hint)
//! with a [`Processor`] instance. User threads hold cheap-clone [`Module`]
//! handles; the connection state and buffers behind a handle are owned
//! exclusively by the engine's master context.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::lockfree::{AtomicFlag, TickStampCell};
use crate::node::Node;

/// Upper bound on per-kind stream counts (istreams, jstreams, ostreams).
pub const MAX_STREAMS: usize = 64;

/// Processing-cost hint; biases scheduling order, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostHint {
    Cheap,
    #[default]
    Normal,
    Expensive,
}

/// Immutable per-kind description shared by all instances of a module
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleClass {
    /// Number of single-producer input streams.
    pub n_istreams: usize,
    /// Number of joint (multi-producer, summed) input streams.
    pub n_jstreams: usize,
    /// Number of output streams.
    pub n_ostreams: usize,
    pub cost: CostHint,
}

impl ModuleClass {
    pub fn new(n_istreams: usize, n_jstreams: usize, n_ostreams: usize) -> Self {
        Self {
            n_istreams,
            n_jstreams,
            n_ostreams,
            cost: CostHint::Normal,
        }
    }

    pub fn with_cost(mut self, cost: CostHint) -> Self {
        self.cost = cost;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.n_istreams > MAX_STREAMS
            || self.n_jstreams > MAX_STREAMS
            || self.n_ostreams > MAX_STREAMS
        {
            return Err(Error::UnsupportedClass(format!(
                "stream counts ({}, {}, {}) exceed {} streams",
                self.n_istreams, self.n_jstreams, self.n_ostreams, MAX_STREAMS
            )));
        }
        Ok(())
    }
}

/// Stream views handed to [`Processor::process`] for one block segment.
///
/// Input views may alias each other and the shared constant blocks; they
/// never alias this context's output views.
pub struct ProcessContext<'a> {
    pub(crate) n_values: usize,
    pub(crate) offset: usize,
    pub(crate) istreams: &'a [(*const f32, bool)],
    pub(crate) jstreams: &'a [*const f32],
    pub(crate) ostreams: &'a [*mut f32],
}

impl<'a> ProcessContext<'a> {
    /// Number of samples to produce in this call (at most the block size).
    #[inline]
    pub fn n_values(&self) -> usize {
        self.n_values
    }

    /// Whether input stream `i` currently has a producer wired.
    /// Unconnected inputs read as zeros.
    #[inline]
    pub fn istream_connected(&self, i: usize) -> bool {
        self.istreams[i].1
    }

    /// Input stream `i` for this segment.
    #[inline]
    pub fn istream(&self, i: usize) -> &[f32] {
        let (ptr, _) = self.istreams[i];
        // SAFETY: the master context keeps every input pointer valid for
        // the full block; `offset + n_values` never exceeds the block size.
        unsafe { std::slice::from_raw_parts(ptr.add(self.offset), self.n_values) }
    }

    /// Joint input stream `j`, already summed over all producers.
    #[inline]
    pub fn jstream(&self, j: usize) -> &[f32] {
        // SAFETY: as for `istream`.
        unsafe { std::slice::from_raw_parts(self.jstreams[j].add(self.offset), self.n_values) }
    }

    /// Copy joint input `j` into output `o` for this segment.
    #[inline]
    pub fn pass_jstream(&mut self, j: usize, o: usize) {
        // SAFETY: input views never alias this context's output views.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.jstreams[j].add(self.offset),
                self.ostreams[o].add(self.offset),
                self.n_values,
            );
        }
    }

    /// Output stream `o` for this segment.
    #[inline]
    pub fn ostream(&mut self, o: usize) -> &mut [f32] {
        // SAFETY: output buffers are owned by the node being processed and
        // are disjoint from each other and from all input pointers; the
        // &mut self receiver prevents overlapping borrows.
        unsafe { std::slice::from_raw_parts_mut(self.ostreams[o].add(self.offset), self.n_values) }
    }
}

/// Per-instance computation attached to a module.
///
/// `process` must be free of side effects observable outside its own
/// output buffers; cross-thread access to processor state goes through
/// access jobs. Instance teardown is `Drop`, which the engine runs only
/// in a user thread (during garbage collection), never on the master
/// thread.
pub trait Processor: Any + Send {
    /// Fill the output streams from the input streams.
    fn process(&mut self, ctx: &mut ProcessContext<'_>);

    /// Re-initialize internal state. Called once before the first
    /// `process` after integration, a forced reset, or leaving
    /// suspension.
    fn reset(&mut self) {}
}

impl dyn Processor {
    /// Downcast to a concrete processor type, for access-job callbacks.
    pub fn downcast_mut<T: Processor>(&mut self) -> Option<&mut T> {
        let any: &mut dyn Any = self;
        any.downcast_mut::<T>()
    }
}

/// Shared module state. The atomics are readable from any thread; `node`
/// is the master-context-only body.
pub(crate) struct ModuleCore {
    pub(crate) class: ModuleClass,
    pub(crate) virtual_node: bool,
    /// Tick stamp reached once this node's current block is processed.
    pub(crate) counter: TickStampCell,
    pub(crate) integrated: AtomicFlag,
    pub(crate) scheduled: AtomicFlag,
    /// Bit per istream: set while a producer is wired.
    pub(crate) source_mask: AtomicU64,
    pub(crate) node: UnsafeCell<Node>,
}

// SAFETY: `node` is only accessed from the engine's master context, which
// is serialized by the runtime's master lock; everything else is atomic.
unsafe impl Send for ModuleCore {}
unsafe impl Sync for ModuleCore {}

/// Handle to a module. Clones are cheap and share the same module.
#[derive(Clone)]
pub struct Module {
    pub(crate) core: Arc<ModuleCore>,
}

impl Module {
    /// Create a module from a class and a processor instance.
    ///
    /// The module is inert until an integrate job installs it into a live
    /// graph. Deferred (delay-cycle) processing is not implemented; every
    /// module processes its full block in dependency order, so feedback
    /// loops cannot be expressed at this layer.
    pub fn new(class: ModuleClass, processor: Box<dyn Processor>) -> Result<Self> {
        class.validate()?;
        Ok(Self {
            core: Arc::new(ModuleCore {
                class,
                virtual_node: false,
                counter: TickStampCell::new(0),
                integrated: AtomicFlag::new(false),
                scheduled: AtomicFlag::new(false),
                source_mask: AtomicU64::new(0),
                node: UnsafeCell::new(Node::new(&class, Some(processor))),
            }),
        })
    }

    /// Create a virtual pass-through module with `n_iostreams` inputs
    /// mapped 1:1 to outputs.
    ///
    /// Virtual modules are elided from the processed-node list; the
    /// scheduler splices their consumers directly onto their producers.
    /// Flow, boundary, probe and access jobs, suspension, and consumer
    /// status are all rejected on virtual modules.
    pub fn new_virtual(n_iostreams: usize) -> Result<Self> {
        let class = ModuleClass::new(n_iostreams, 0, n_iostreams).with_cost(CostHint::Cheap);
        class.validate()?;
        Ok(Self {
            core: Arc::new(ModuleCore {
                class,
                virtual_node: true,
                counter: TickStampCell::new(0),
                integrated: AtomicFlag::new(false),
                scheduled: AtomicFlag::new(false),
                source_mask: AtomicU64::new(0),
                node: UnsafeCell::new(Node::new(&class, None)),
            }),
        })
    }

    pub fn class(&self) -> &ModuleClass {
        &self.core.class
    }

    pub fn is_virtual(&self) -> bool {
        self.core.virtual_node
    }

    /// Tick stamp this module has been processed up to. Readable from any
    /// thread.
    pub fn tick_stamp(&self) -> u64 {
        self.core.counter.get()
    }

    /// Whether the module has been installed into a live graph.
    pub fn integrated(&self) -> bool {
        self.core.integrated.get()
    }

    /// Whether the module is integrated and reachable from a consumer in
    /// the current schedule.
    pub fn is_scheduled(&self) -> bool {
        self.core.integrated.get() && self.core.scheduled.get()
    }

    /// Whether input stream `istream` currently has a producer wired.
    /// Independent of scheduling: dangling chains count.
    pub fn has_source(&self, istream: usize) -> bool {
        assert!(istream < self.core.class.n_istreams, "istream out of range");
        self.core.source_mask.load(Ordering::Acquire) & (1 << istream) != 0
    }

    /// The node body behind this handle.
    ///
    /// # Safety
    /// Only the master context may call this, with the runtime's master
    /// lock held; the returned borrow must not outlive that critical
    /// section, and no second `node_mut` borrow of the same module may be
    /// live at once.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn node_mut(&self) -> &mut Node {
        &mut *self.core.node.get()
    }

    pub(crate) fn set_source_bit(&self, istream: usize, set: bool) {
        if set {
            self.core
                .source_mask
                .fetch_or(1 << istream, Ordering::AcqRel);
        } else {
            self.core
                .source_mask
                .fetch_and(!(1 << istream), Ordering::AcqRel);
        }
    }

    pub(crate) fn same(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Module {}

impl Hash for Module {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.core) as usize).hash(state);
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("ptr", &Arc::as_ptr(&self.core))
            .field("class", &self.core.class)
            .field("virtual", &self.core.virtual_node)
            .field("integrated", &self.core.integrated.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silence;
    impl Processor for Silence {
        fn process(&mut self, ctx: &mut ProcessContext<'_>) {
            for v in ctx.ostream(0) {
                *v = 0.0;
            }
        }
    }

    #[test]
    fn test_module_new() {
        let m = Module::new(ModuleClass::new(0, 0, 1), Box::new(Silence)).unwrap();
        assert!(!m.is_virtual());
        assert!(!m.integrated());
        assert!(!m.is_scheduled());
        assert_eq!(m.tick_stamp(), 0);
        assert_eq!(m.class().n_ostreams, 1);
    }

    #[test]
    fn test_module_new_virtual() {
        let m = Module::new_virtual(3).unwrap();
        assert!(m.is_virtual());
        assert_eq!(m.class().n_istreams, 3);
        assert_eq!(m.class().n_ostreams, 3);
        assert_eq!(m.class().n_jstreams, 0);
    }

    #[test]
    fn test_oversized_class_rejected() {
        let class = ModuleClass::new(MAX_STREAMS + 1, 0, 1);
        assert!(Module::new(class, Box::new(Silence)).is_err());
        assert!(Module::new_virtual(MAX_STREAMS + 1).is_err());
    }

    #[test]
    fn test_handle_identity() {
        let a = Module::new_virtual(1).unwrap();
        let b = a.clone();
        let c = Module::new_virtual(1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_processor_downcast() {
        struct Tagged(u32);
        impl Processor for Tagged {
            fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
        }
        let mut p: Box<dyn Processor> = Box::new(Tagged(7));
        assert_eq!(p.downcast_mut::<Tagged>().map(|t| t.0), Some(7));
        assert!(p.downcast_mut::<Silence>().is_none());
    }
}
