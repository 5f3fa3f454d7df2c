//! Lock-minimized block-based signal-processing engine with transactional
//! live graph editing.
//!
//! # Primary API
//!
//! - [`EngineRuntime`]: the runtime (commit queue, master context, clock)
//! - [`Module`] / [`ModuleClass`] / [`Processor`]: units of processing
//! - [`Transaction`] / [`Job`]: atomic batches of graph mutations
//! - [`ModuleRegistry`] / [`Topology`] / [`ContextGraph`]: context
//!   virtualization for polyphony
//!
//! The engine processes audio in fixed-size blocks on a master context
//! (an owned thread, or the caller's loop in [`Threading::Caller`] mode).
//! User threads never mutate the live graph directly: every change is a
//! [`Job`] inside a [`Transaction`], committed through the runtime and
//! applied by the master at block boundaries. Teardown of user-supplied
//! payloads runs only in [`EngineRuntime::garbage_collect`], never on the
//! master.
//!
//! # Example
//!
//! ```ignore
//! use tickflow::*;
//!
//! let engine = EngineRuntime::with_defaults()?;
//! let osc = Module::new(osc_class, Box::new(MyOsc::default()))?;
//! let sink = Module::new(sink_class, Box::new(MySink::default()))?;
//!
//! engine.transact([
//!     Job::integrate(&osc),
//!     Job::integrate(&sink),
//!     Job::connect(&osc, 0, &sink, 0),
//!     Job::set_consumer(&sink),
//! ]);
//! engine.wait_on_trans();
//! ```

mod block;
pub use block::{const_zeros, ConstPool, MAX_BLOCK_SIZE};

mod config;
pub use config::{BlockLayout, EngineConfig};

mod context;
pub use context::{
    ContextGraph, ContextHandle, ContextMerger, Port, SlotKind, Topology, CONTEXT_MERGER_PORTS,
};

mod engine;
pub use engine::{EngineRuntime, LoopState, Threading};

pub mod error;
pub use error::{Error, Result};

mod gc;

mod job;
pub use job::{EnginePollFd, Job, PollId, PollState, ProbeData};

mod lockfree;
pub use lockfree::{AtomicFlag, ClockSnapshot, TickStampCell};

mod master;

mod module;
pub use module::{CostHint, Module, ModuleClass, ProcessContext, Processor, MAX_STREAMS};

mod node;

mod registry;
pub use registry::ModuleRegistry;

mod schedule;

mod transaction;
pub use transaction::Transaction;
