//! The contract every backend implementation fulfils.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::graph::{Node, OpSpec};
use crate::hashing::FingerprintHasher;
use crate::layout::{Dims, Layout};
use crate::tensor::{TensorView, TensorViewMut};

/// Backend family. Declaration order is the selection preference on priority ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    VendorLibrary,
    GenericKernel,
    Reference,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::VendorLibrary,
        BackendKind::GenericKernel,
        BackendKind::Reference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::VendorLibrary => "vendor",
            BackendKind::GenericKernel => "generic",
            BackendKind::Reference => "reference",
        }
    }
}

/// Concrete extents of one invocation of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteShapes {
    pub inputs: Vec<Dims>,
    pub outputs: Vec<Dims>,
}

impl ConcreteShapes {
    pub fn new(inputs: Vec<Dims>, outputs: Vec<Dims>) -> Self {
        Self { inputs, outputs }
    }

    /// Concrete layouts for `supports` checks: declared dtype/format, pinned extents.
    pub fn layouts(
        &self,
        declared_inputs: &[Layout],
        declared_outputs: &[Layout],
    ) -> (Vec<Layout>, Vec<Layout>) {
        let pin = |declared: &[Layout], dims: &[Dims]| {
            declared
                .iter()
                .zip(dims)
                .map(|(layout, dims)| layout.concretize(dims))
                .collect::<Vec<_>>()
        };
        (
            pin(declared_inputs, &self.inputs),
            pin(declared_outputs, &self.outputs),
        )
    }

    pub fn all(&self) -> Vec<Dims> {
        self.inputs.iter().chain(&self.outputs).cloned().collect()
    }
}

/// Backend-specific compiled parameters of one instance, as far as the runtime sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedForm {
    /// Kernel identifier chosen by the backend.
    pub kernel: String,
    /// Fingerprint over the kernel identifier, shapes and backend parameters.
    pub fingerprint: u64,
    pub shapes: ConcreteShapes,
}

impl FinalizedForm {
    pub fn new<P: Serialize + ?Sized>(
        kernel: impl Into<String>,
        shapes: &ConcreteShapes,
        params: &P,
    ) -> Self {
        let kernel = kernel.into();
        let mut hasher = FingerprintHasher::new();
        hasher.write_str(&kernel);
        hasher.write_serialized(shapes);
        hasher.write_serialized(params);
        Self {
            kernel,
            fingerprint: hasher.finish(),
            shapes: shapes.clone(),
        }
    }
}

/// Identifies the stream an instance is dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub usize);

/// One backend's implementation of one operation kind.
///
/// Implementations are created unbound by a descriptor factory, specialised by `finalize`
/// for concrete shapes, and then executed any number of times. `execute` takes `&self` so
/// a finalized implementation can be shared read-only while it runs.
pub trait Implementation: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> BackendKind;

    /// Whether the implementation can handle these layouts. Called with declared layouts at
    /// bind time and with concrete ones before every re-finalization.
    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool;

    /// Specialises for concrete shapes. Must be deterministic: the same shapes and
    /// parameters yield an equal form.
    fn finalize(&mut self, shapes: &ConcreteShapes, op: &OpSpec) -> BackendResult<FinalizedForm>;

    fn execute(
        &self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
        stream: StreamId,
    ) -> BackendResult<()>;

    /// Backend-opaque payload that `deserialize` turns back into the finalized state.
    fn serialize(&self) -> BackendResult<Vec<u8>>;

    fn deserialize(&mut self, payload: &[u8]) -> BackendResult<FinalizedForm>;

    fn clone_boxed(&self) -> Box<dyn Implementation>;
}

pub type ImplementationFactory = fn(&Node) -> Box<dyn Implementation>;

#[derive(Debug)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
    Payload { message: String },
    /// Device or backend state is no longer trustworthy.
    Corrupted { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        BackendError::Payload {
            message: message.into(),
        }
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        BackendError::Corrupted {
            message: message.into(),
        }
    }

    pub fn is_corrupting(&self) -> bool {
        matches!(self, BackendError::Corrupted { .. })
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::Payload { message } => write!(f, "invalid backend payload: {message}"),
            BackendError::Corrupted { message } => write!(f, "backend state corrupted: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

pub fn encode_payload<T: Serialize>(value: &T) -> BackendResult<Vec<u8>> {
    bincode::serialize(value).map_err(|err| BackendError::payload(err.to_string()))
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> BackendResult<T> {
    bincode::deserialize(bytes).map_err(|err| BackendError::payload(err.to_string()))
}
