//! Centralized error type for the engine.

use thiserror::Error;

/// Engine error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconfiguration attempted while modules are still integrated.
    #[error("Engine busy: {0} module(s) still integrated")]
    EngineBusy(usize),

    /// A module class the engine cannot host.
    #[error("Unsupported module class: {0}")]
    UnsupportedClass(String),

    /// Module kind not present in the registry.
    #[error("Unknown module kind: {0}")]
    UnknownKind(String),

    /// Module kind registered twice.
    #[error("Module kind already registered: {0}")]
    DuplicateKind(String),

    /// Topology port name that does not exist.
    #[error("Unknown port: {0}")]
    UnknownPort(String),

    /// Topology refers to a module slot that does not exist.
    #[error("Unknown topology module: {0}")]
    UnknownTopologyModule(String),

    /// Context handle not present in the context table.
    #[error("Unknown context handle: {0}")]
    UnknownContext(u32),

    /// The master thread terminated or was never started.
    #[error("Master thread unavailable")]
    MasterGone,
}

/// Result type alias using [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
