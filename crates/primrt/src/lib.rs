extern crate self as primrt;

pub mod artifact;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod ops;
pub mod profiling;
pub mod program;
pub mod registry;
pub mod tensor;
mod env;

pub use backend::{BackendKind, DeviceCaps, Implementation};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use graph::{Graph, GraphBuilder, Node, NodeId, OpSpec, OperationKind};
pub use layout::{DType, Dim, Dims, Format, Layout, Shape};
pub use program::{Bindings, Program};
pub use registry::{ImplementationDescriptor, ImplementationRegistry, RegistryBuilder};
pub use tensor::HostTensor;
