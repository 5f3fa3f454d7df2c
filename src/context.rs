//! Context virtualization: instantiate a named topology any number of
//! times over the same live engine, for polyphony.
//!
//! A [`Topology`] describes module slots, internal wiring and named
//! ports. [`ContextGraph::create_context`] expands one copy of it into
//! integrate/connect jobs appended to a caller transaction, so an entire
//! context appears in the schedule atomically or not at all.
//! [`ContextGraph::clone_branch`] instantiates an independent per-voice
//! copy whose output ports feed a shared [`ContextMerger`].

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::module::{CostHint, Module, ModuleClass, ProcessContext, Processor};
use crate::registry::ModuleRegistry;
use crate::transaction::Transaction;

/// Joint input (and output) arity of a [`ContextMerger`].
pub const CONTEXT_MERGER_PORTS: usize = 8;

/// Opaque identity of one instantiated context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(NonZeroU32);

impl ContextHandle {
    fn get(self) -> u32 {
        self.0.get()
    }
}

/// What occupies a topology slot.
#[derive(Clone)]
pub enum SlotKind {
    /// A registered module kind, instantiated per context.
    Kind(String),
    /// A virtual pass-through module with `n` inputs mapped to `n`
    /// outputs.
    Virtual(usize),
    /// A nested topology, exposed through a virtual in/out port pair.
    Sub(Arc<Topology>),
}

/// A named stream endpoint on a slot.
#[derive(Clone)]
pub struct Port {
    pub name: String,
    pub slot: String,
    pub stream: usize,
}

#[derive(Clone)]
struct Wire {
    src_slot: String,
    src_ostream: usize,
    dest_slot: String,
    dest_stream: usize,
    joint: bool,
}

/// A reusable wiring description: slots, wires, named ports and consumer
/// marks. Immutable once built; instantiated via [`ContextGraph`].
pub struct Topology {
    name: String,
    slots: Vec<(String, SlotKind)>,
    wires: Vec<Wire>,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    consumers: Vec<String>,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            wires: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            consumers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a slot holding a registered module kind.
    pub fn module(mut self, slot: impl Into<String>, kind: impl Into<String>) -> Self {
        self.slots.push((slot.into(), SlotKind::Kind(kind.into())));
        self
    }

    /// Add a virtual pass-through slot with `n_iostreams` ports.
    pub fn virtual_slot(mut self, slot: impl Into<String>, n_iostreams: usize) -> Self {
        self.slots
            .push((slot.into(), SlotKind::Virtual(n_iostreams)));
        self
    }

    /// Add a nested-topology slot. Its istreams/ostreams are the nested
    /// topology's named input/output ports, in declaration order.
    pub fn sub(mut self, slot: impl Into<String>, topology: Arc<Topology>) -> Self {
        self.slots.push((slot.into(), SlotKind::Sub(topology)));
        self
    }

    /// Wire `src` ostream to `dest`'s single-producer istream.
    pub fn wire(
        mut self,
        src: impl Into<String>,
        src_ostream: usize,
        dest: impl Into<String>,
        dest_istream: usize,
    ) -> Self {
        self.wires.push(Wire {
            src_slot: src.into(),
            src_ostream,
            dest_slot: dest.into(),
            dest_stream: dest_istream,
            joint: false,
        });
        self
    }

    /// Wire `src` ostream into `dest`'s joint (summed) istream.
    pub fn wire_joint(
        mut self,
        src: impl Into<String>,
        src_ostream: usize,
        dest: impl Into<String>,
        dest_jstream: usize,
    ) -> Self {
        self.wires.push(Wire {
            src_slot: src.into(),
            src_ostream,
            dest_slot: dest.into(),
            dest_stream: dest_jstream,
            joint: true,
        });
        self
    }

    /// Name an input port (a slot istream reachable from outside).
    pub fn input_port(
        mut self,
        name: impl Into<String>,
        slot: impl Into<String>,
        istream: usize,
    ) -> Self {
        self.inputs.push(Port {
            name: name.into(),
            slot: slot.into(),
            stream: istream,
        });
        self
    }

    /// Name an output port (a slot ostream reachable from outside).
    pub fn output_port(
        mut self,
        name: impl Into<String>,
        slot: impl Into<String>,
        ostream: usize,
    ) -> Self {
        self.outputs.push(Port {
            name: name.into(),
            slot: slot.into(),
            stream: ostream,
        });
        self
    }

    /// Mark a slot as a schedule root in every instantiation.
    pub fn consumer(mut self, slot: impl Into<String>) -> Self {
        self.consumers.push(slot.into());
        self
    }
}

/// One instantiated slot. For nested topologies the input side and
/// output side are the two virtual port modules; otherwise both are the
/// slot's module.
#[derive(Clone)]
struct SlotInstance {
    input_side: Module,
    output_side: Module,
}

#[derive(Default)]
struct ContextInstance {
    slots: HashMap<String, SlotInstance>,
    /// Every integrated module of this context, for dismissal.
    all_modules: Vec<Module>,
    /// Resolved top-level ports.
    inputs: Vec<(String, Module, usize)>,
    outputs: Vec<(String, Module, usize)>,
}

impl ContextInstance {
    fn slot(&self, path: &str) -> Result<&SlotInstance> {
        self.slots
            .get(path)
            .ok_or_else(|| Error::UnknownTopologyModule(path.into()))
    }
}

/// Instantiates topologies over a module registry and tracks the live
/// contexts.
pub struct ContextGraph {
    registry: Arc<ModuleRegistry>,
    contexts: Mutex<HashMap<ContextHandle, ContextInstance>>,
    next_handle: AtomicU32,
}

impl ContextGraph {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            contexts: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Expand one copy of `topology` into jobs appended to `trans`.
    /// Nothing reaches the live graph until the caller commits, so the
    /// context is scheduled atomically.
    pub fn create_context(
        &self,
        topology: &Topology,
        trans: &mut Transaction,
    ) -> Result<ContextHandle> {
        let mut inst = ContextInstance::default();
        let mut stack = vec![topology.name.clone()];
        self.instantiate(topology, "", &mut stack, &mut inst, trans)?;

        for port in &topology.inputs {
            let slot = inst.slot(&port.slot)?;
            inst.inputs
                .push((port.name.clone(), slot.input_side.clone(), port.stream));
        }
        for port in &topology.outputs {
            let slot = inst.slot(&port.slot)?;
            inst.outputs
                .push((port.name.clone(), slot.output_side.clone(), port.stream));
        }

        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handle = ContextHandle(NonZeroU32::new(raw).ok_or(Error::UnknownContext(0))?);
        self.contexts.lock().insert(handle, inst);
        Ok(handle)
    }

    /// Instantiate a per-voice copy of `topology` and jconnect its output
    /// ports, in declaration order, into the merger's joint inputs.
    pub fn clone_branch(
        &self,
        topology: &Topology,
        merger: &ContextMerger,
        trans: &mut Transaction,
    ) -> Result<ContextHandle> {
        if topology.outputs.len() > CONTEXT_MERGER_PORTS {
            return Err(Error::InvalidConfig(format!(
                "topology '{}' has {} output ports, merger carries {}",
                topology.name,
                topology.outputs.len(),
                CONTEXT_MERGER_PORTS
            )));
        }
        let handle = self.create_context(topology, trans)?;
        let contexts = self.contexts.lock();
        let inst = contexts
            .get(&handle)
            .ok_or(Error::UnknownContext(handle.get()))?;
        for (port_index, (_, module, ostream)) in inst.outputs.iter().enumerate() {
            trans.add(Job::jconnect(module, *ostream, merger.module(), port_index));
        }
        Ok(handle)
    }

    /// Unwire and discard every module of a context. Appended as jobs;
    /// pending payloads and processors reach the garbage collector.
    pub fn dismiss_context(&self, handle: ContextHandle, trans: &mut Transaction) -> Result<()> {
        let inst = self
            .contexts
            .lock()
            .remove(&handle)
            .ok_or(Error::UnknownContext(handle.get()))?;
        // Discard detaches all connections itself.
        for module in &inst.all_modules {
            trans.add(Job::discard(module));
        }
        Ok(())
    }

    /// Resolve a context's named input port to its module and istream.
    pub fn input_port(&self, handle: ContextHandle, name: &str) -> Result<(Module, usize)> {
        let contexts = self.contexts.lock();
        let inst = contexts
            .get(&handle)
            .ok_or(Error::UnknownContext(handle.get()))?;
        inst.inputs
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, m, s)| (m.clone(), *s))
            .ok_or_else(|| Error::UnknownPort(name.into()))
    }

    /// Resolve a context's named output port to its module and ostream.
    pub fn output_port(&self, handle: ContextHandle, name: &str) -> Result<(Module, usize)> {
        let contexts = self.contexts.lock();
        let inst = contexts
            .get(&handle)
            .ok_or(Error::UnknownContext(handle.get()))?;
        inst.outputs
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, m, s)| (m.clone(), *s))
            .ok_or_else(|| Error::UnknownPort(name.into()))
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    fn instantiate(
        &self,
        topology: &Topology,
        prefix: &str,
        stack: &mut Vec<String>,
        inst: &mut ContextInstance,
        trans: &mut Transaction,
    ) -> Result<()> {
        for (slot, kind) in &topology.slots {
            let path = join_path(prefix, slot);
            match kind {
                SlotKind::Kind(kind_name) => {
                    let module = self.registry.create(kind_name)?;
                    trans.add(Job::integrate(&module));
                    inst.all_modules.push(module.clone());
                    inst.slots.insert(
                        path,
                        SlotInstance {
                            input_side: module.clone(),
                            output_side: module,
                        },
                    );
                }
                SlotKind::Virtual(n_iostreams) => {
                    let module = Module::new_virtual(*n_iostreams)?;
                    trans.add(Job::integrate(&module));
                    inst.all_modules.push(module.clone());
                    inst.slots.insert(
                        path,
                        SlotInstance {
                            input_side: module.clone(),
                            output_side: module,
                        },
                    );
                }
                SlotKind::Sub(sub) => {
                    let vin = Module::new_virtual(sub.inputs.len())?;
                    let vout = Module::new_virtual(sub.outputs.len())?;
                    trans.add(Job::integrate(&vin));
                    trans.add(Job::integrate(&vout));
                    inst.all_modules.push(vin.clone());
                    inst.all_modules.push(vout.clone());

                    if stack.iter().any(|name| name == &sub.name) {
                        // Self-referential nesting cannot terminate; the
                        // port pair stays unwired and reads as zeros.
                        tracing::warn!(
                            topology = %sub.name,
                            "recursive topology nesting skipped"
                        );
                    } else {
                        stack.push(sub.name.clone());
                        self.instantiate(sub, &path, stack, inst, trans)?;
                        stack.pop();

                        for (k, port) in sub.inputs.iter().enumerate() {
                            let target = inst.slot(&join_path(&path, &port.slot))?.clone();
                            trans.add(Job::connect(&vin, k, &target.input_side, port.stream));
                        }
                        for (k, port) in sub.outputs.iter().enumerate() {
                            let source = inst.slot(&join_path(&path, &port.slot))?.clone();
                            trans.add(Job::connect(&source.output_side, port.stream, &vout, k));
                        }
                    }

                    inst.slots.insert(
                        path,
                        SlotInstance {
                            input_side: vin,
                            output_side: vout,
                        },
                    );
                }
            }
        }

        for wire in &topology.wires {
            let src = inst.slot(&join_path(prefix, &wire.src_slot))?.clone();
            let dest = inst.slot(&join_path(prefix, &wire.dest_slot))?.clone();
            if wire.joint {
                trans.add(Job::jconnect(
                    &src.output_side,
                    wire.src_ostream,
                    &dest.input_side,
                    wire.dest_stream,
                ));
            } else {
                trans.add(Job::connect(
                    &src.output_side,
                    wire.src_ostream,
                    &dest.input_side,
                    wire.dest_stream,
                ));
            }
        }

        for slot in &topology.consumers {
            let instance = inst.slot(&join_path(prefix, slot))?;
            if instance.output_side.is_virtual() {
                return Err(Error::InvalidConfig(format!(
                    "consumer slot '{slot}' is virtual"
                )));
            }
            trans.add(Job::set_consumer(&instance.output_side));
        }
        Ok(())
    }
}

fn join_path(prefix: &str, slot: &str) -> String {
    if prefix.is_empty() {
        slot.to_string()
    } else {
        format!("{prefix}/{slot}")
    }
}

struct MergerProcessor;

impl Processor for MergerProcessor {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        // Joint inputs arrive pre-summed; each port is a plain copy.
        for port in 0..CONTEXT_MERGER_PORTS {
            ctx.pass_jstream(port, port);
        }
    }
}

/// Fixed-arity summing stage combining all active voices: each of its
/// [`CONTEXT_MERGER_PORTS`] joint inputs sums the voices wired into it
/// and passes the sum through to the matching output.
pub struct ContextMerger {
    module: Module,
}

impl ContextMerger {
    pub fn new() -> Result<Self> {
        let class = ModuleClass::new(0, CONTEXT_MERGER_PORTS, CONTEXT_MERGER_PORTS)
            .with_cost(CostHint::Cheap);
        Ok(Self {
            module: Module::new(class, Box::new(MergerProcessor))?,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Append the merger's integration to `trans`.
    pub fn integrate_into(&self, trans: &mut Transaction) {
        trans.add(Job::integrate(&self.module));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;
    impl Processor for Null {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
    }

    fn registry() -> Arc<ModuleRegistry> {
        let reg = ModuleRegistry::new();
        reg.register("osc", ModuleClass::new(0, 0, 1), || Box::new(Null))
            .unwrap();
        reg.register("filter", ModuleClass::new(1, 0, 1), || Box::new(Null))
            .unwrap();
        reg.register("sink", ModuleClass::new(1, 0, 0), || Box::new(Null))
            .unwrap();
        Arc::new(reg)
    }

    fn voice_topology() -> Topology {
        Topology::new("voice")
            .module("osc", "osc")
            .module("filter", "filter")
            .wire("osc", 0, "filter", 0)
            .output_port("out", "filter", 0)
    }

    #[test]
    fn test_create_context_emits_jobs() {
        let graph = ContextGraph::new(registry());
        let mut trans = Transaction::open();
        let handle = graph
            .create_context(&voice_topology(), &mut trans)
            .unwrap();
        // Two integrates plus one connect.
        assert_eq!(trans.len(), 3);
        assert_eq!(graph.live_contexts(), 1);
        let (module, stream) = graph.output_port(handle, "out").unwrap();
        assert_eq!(stream, 0);
        assert!(!module.is_virtual());
    }

    #[test]
    fn test_two_contexts_are_independent() {
        let graph = ContextGraph::new(registry());
        let topo = voice_topology();
        let mut trans = Transaction::open();
        let a = graph.create_context(&topo, &mut trans).unwrap();
        let b = graph.create_context(&topo, &mut trans).unwrap();
        assert_ne!(a, b);
        let (ma, _) = graph.output_port(a, "out").unwrap();
        let (mb, _) = graph.output_port(b, "out").unwrap();
        assert_ne!(ma, mb);
    }

    #[test]
    fn test_clone_branch_feeds_merger() {
        let graph = ContextGraph::new(registry());
        let merger = ContextMerger::new().unwrap();
        let topo = voice_topology();
        let mut trans = Transaction::open();
        merger.integrate_into(&mut trans);
        let before = trans.len();
        graph.clone_branch(&topo, &merger, &mut trans).unwrap();
        // Voice jobs plus one jconnect into the merger.
        assert_eq!(trans.len(), before + 4);
    }

    #[test]
    fn test_dismiss_context() {
        let graph = ContextGraph::new(registry());
        let mut trans = Transaction::open();
        let handle = graph
            .create_context(&voice_topology(), &mut trans)
            .unwrap();
        let mut teardown = Transaction::open();
        graph.dismiss_context(handle, &mut teardown).unwrap();
        assert_eq!(teardown.len(), 2);
        assert_eq!(graph.live_contexts(), 0);
        assert!(matches!(
            graph.dismiss_context(handle, &mut teardown),
            Err(Error::UnknownContext(_))
        ));
    }

    #[test]
    fn test_nested_topology_port_pair() {
        let inner = Arc::new(
            Topology::new("inner")
                .module("filter", "filter")
                .input_port("in", "filter", 0)
                .output_port("out", "filter", 0),
        );
        let outer = Topology::new("outer")
            .module("osc", "osc")
            .sub("fx", inner)
            .module("sink", "sink")
            .wire("osc", 0, "fx", 0)
            .wire("fx", 0, "sink", 0)
            .consumer("sink");
        let graph = ContextGraph::new(registry());
        let mut trans = Transaction::open();
        graph.create_context(&outer, &mut trans).unwrap();
        // osc + vin + vout + inner filter + sink integrates, port wiring
        // (2), outer wires (2), consumer (1).
        assert_eq!(trans.len(), 10);
    }

    #[test]
    fn test_recursive_nesting_skipped() {
        let inner = Arc::new(
            Topology::new("loop")
                .module("osc", "osc")
                .output_port("out", "osc", 0),
        );
        // Same topology name nested inside itself triggers the guard.
        let outer = Topology::new("loop").module("osc", "osc").sub("again", inner);
        let graph = ContextGraph::new(registry());
        let mut trans = Transaction::open();
        let handle = graph.create_context(&outer, &mut trans).unwrap();
        // osc integrate + the port pair integrates; no nested expansion.
        assert_eq!(trans.len(), 3);
        assert_eq!(graph.live_contexts(), 1);
        let _ = handle;
    }

    #[test]
    fn test_unknown_wire_slot_rejected() {
        let topo = Topology::new("bad")
            .module("osc", "osc")
            .wire("osc", 0, "nope", 0);
        let graph = ContextGraph::new(registry());
        let mut trans = Transaction::open();
        assert!(matches!(
            graph.create_context(&topo, &mut trans),
            Err(Error::UnknownTopologyModule(_))
        ));
    }
}
