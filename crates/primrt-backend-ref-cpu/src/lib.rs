pub mod kernels;
mod reference;

use std::sync::Arc;

use primrt::backend::BackendKind;
use primrt::graph::OperationKind;
use primrt::layout::{DType, Format};
use primrt::{ImplementationDescriptor, ImplementationRegistry, RegistryBuilder, RuntimeResult};

pub use reference::{reference_name, RefKernel, ReferenceImplementation};

/// Formats the reference loops accept directly. Anything else is reached through a
/// format conversion.
pub const REFERENCE_FORMATS: [Format; 3] = [Format::RowMajor, Format::Nhwc, Format::Any];

/// One reference descriptor per operation kind.
pub fn descriptors() -> Vec<ImplementationDescriptor> {
    OperationKind::ALL
        .iter()
        .map(|kind| {
            ImplementationDescriptor::new(
                reference_name(*kind),
                *kind,
                BackendKind::Reference,
                reference::create,
            )
            .support_all(&DType::ALL, &REFERENCE_FORMATS)
        })
        .collect()
}

pub fn register(builder: &mut RegistryBuilder) -> RuntimeResult<()> {
    for descriptor in descriptors() {
        builder.register(descriptor)?;
    }
    tracing::debug!(count = OperationKind::ALL.len(), "registered reference implementations");
    Ok(())
}

/// A registry holding only the reference implementations.
pub fn registry() -> RuntimeResult<Arc<ImplementationRegistry>> {
    let mut builder = RegistryBuilder::new();
    register(&mut builder)?;
    Ok(Arc::new(builder.build()?))
}
