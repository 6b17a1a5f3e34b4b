use thiserror::Error;

use crate::backend::{BackendError, BackendKind};
use crate::graph::{NodeId, OperationKind};
use crate::instance::InstanceState;
use crate::layout::{Dims, Shape};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no compatible implementation for node {node} ({op:?}) with layouts {layouts}")]
    NoCompatibleImplementation {
        node: NodeId,
        op: OperationKind,
        layouts: String,
    },
    #[error("finalization of node {node} ({op:?}) failed for shapes {shapes:?}: {reason}")]
    FinalizationFailure {
        node: NodeId,
        op: OperationKind,
        shapes: Vec<Dims>,
        reason: String,
    },
    #[error("allocating {requested} bytes for slot {slot} failed: {reason}")]
    AllocationFailure {
        requested: usize,
        slot: usize,
        reason: String,
    },
    #[error("artifact for node {node} rejected: {reason}")]
    IncompatibleArtifact { node: NodeId, reason: String },
    #[error("execution of node {node} ({op:?}) failed for shapes {shapes:?}: {source}")]
    ExecutionFailure {
        node: NodeId,
        op: OperationKind,
        shapes: Vec<Dims>,
        #[source]
        source: BackendError,
    },
    #[error("invalid graph: {reason}")]
    InvalidGraph { reason: String },
    #[error("node {node} expects extents within {expected}, got {actual:?}")]
    ShapeOutOfRange {
        node: NodeId,
        expected: Shape,
        actual: Dims,
    },
    #[error("no binding supplied for parameter {node}")]
    MissingBinding { node: NodeId },
    /// Raised for a second `(op, backend)` registration with either the same supported set
    /// or the same name. Names must stay unique per key because artifacts are resolved by
    /// `(op, backend, name)`.
    #[error("implementation {name} for {op:?} on {backend:?} duplicates an existing registration")]
    DuplicateImplementation {
        name: String,
        op: OperationKind,
        backend: BackendKind,
    },
    #[error("registry has no reference implementation for {missing:?}")]
    IncompleteRegistry { missing: Vec<OperationKind> },
    #[error("implementation registry has not been installed")]
    RegistryNotInitialized,
    #[error("implementation registry is already installed")]
    RegistryAlreadyInitialized,
    #[error("program is poisoned by node {node}: {reason}; rebuild it before executing")]
    ProgramPoisoned { node: NodeId, reason: String },
    #[error("execution aborted after {completed} instances")]
    Aborted { completed: usize },
    #[error("node {node} is {state:?}, not ready")]
    NotReady { node: NodeId, state: InstanceState },
}

impl RuntimeError {
    /// Errors after which the program's state can no longer be trusted.
    pub fn poisons_program(&self) -> bool {
        match self {
            RuntimeError::FinalizationFailure { .. }
            | RuntimeError::NoCompatibleImplementation { .. }
            | RuntimeError::AllocationFailure { .. } => true,
            RuntimeError::ExecutionFailure { source, .. } => source.is_corrupting(),
            _ => false,
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            RuntimeError::NoCompatibleImplementation { node, .. }
            | RuntimeError::FinalizationFailure { node, .. }
            | RuntimeError::IncompatibleArtifact { node, .. }
            | RuntimeError::ExecutionFailure { node, .. }
            | RuntimeError::ShapeOutOfRange { node, .. }
            | RuntimeError::MissingBinding { node }
            | RuntimeError::ProgramPoisoned { node, .. }
            | RuntimeError::NotReady { node, .. } => Some(*node),
            _ => None,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
