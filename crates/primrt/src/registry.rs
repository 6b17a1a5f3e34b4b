//! Capability-indexed registry of backend implementations.
//!
//! Backends contribute `ImplementationDescriptor`s through a `RegistryBuilder`. `build()`
//! is the initialization barrier: it checks that every operation kind has a reference
//! implementation and freezes the registry. After that the registry is read-only and can be
//! shared freely, either explicitly as an `Arc` or through the process-wide slot managed by
//! `install`/`global`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::backend::{BackendKind, DeviceCaps, Implementation, ImplementationFactory};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{Node, OperationKind};
use crate::layout::{format_layouts, DType, Format, Layout};

/// Static description of one implementation and how to construct it.
#[derive(Clone)]
pub struct ImplementationDescriptor {
    pub name: &'static str,
    pub op: OperationKind,
    pub backend: BackendKind,
    /// Bumped whenever the serialized payload layout changes.
    pub version: u32,
    pub priority: i32,
    pub supported: Vec<(DType, Format)>,
    pub factory: ImplementationFactory,
}

impl ImplementationDescriptor {
    pub fn new(
        name: &'static str,
        op: OperationKind,
        backend: BackendKind,
        factory: ImplementationFactory,
    ) -> Self {
        Self {
            name,
            op,
            backend,
            version: 1,
            priority: 0,
            supported: Vec::new(),
            factory,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn support(mut self, dtype: DType, format: Format) -> Self {
        if !self.supported.contains(&(dtype, format)) {
            self.supported.push((dtype, format));
        }
        self
    }

    /// Declares support for every pairing of the given dtypes and formats.
    pub fn support_all(mut self, dtypes: &[DType], formats: &[Format]) -> Self {
        for dtype in dtypes {
            for format in formats {
                self = self.support(*dtype, *format);
            }
        }
        self
    }

    pub fn instantiate(&self, node: &Node) -> Box<dyn Implementation> {
        (self.factory)(node)
    }

    fn supported_set(&self) -> BTreeSet<(DType, Format)> {
        self.supported.iter().copied().collect()
    }

    fn matches_exactly(&self, layout: &Layout) -> bool {
        self.supported.iter().any(|(dtype, format)| {
            *dtype == layout.dtype && (layout.format == Format::Any || *format == layout.format)
        })
    }

    fn matches_with_conversion(&self, layout: &Layout) -> bool {
        self.matches_exactly(layout)
            || self
                .supported
                .iter()
                .any(|(dtype, format)| *dtype == layout.dtype && *format == Format::Any)
    }
}

impl fmt::Debug for ImplementationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationDescriptor")
            .field("name", &self.name)
            .field("op", &self.op)
            .field("backend", &self.backend)
            .field("version", &self.version)
            .field("priority", &self.priority)
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

/// Index of a descriptor inside its registry. Stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub usize);

/// A ranked candidate for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub descriptor: DescriptorId,
    /// The candidate only accepts the node's layouts through a format conversion.
    pub requires_conversion: bool,
}

#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<ImplementationDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a descriptor whose `(op, backend)` key is already taken by one with the same
    /// supported set or the same name.
    pub fn register(&mut self, descriptor: ImplementationDescriptor) -> RuntimeResult<&mut Self> {
        let incoming = descriptor.supported_set();
        let duplicate = self.descriptors.iter().any(|existing| {
            existing.op == descriptor.op
                && existing.backend == descriptor.backend
                && (existing.name == descriptor.name || existing.supported_set() == incoming)
        });
        if duplicate {
            return Err(RuntimeError::DuplicateImplementation {
                name: descriptor.name.to_string(),
                op: descriptor.op,
                backend: descriptor.backend,
            });
        }
        tracing::debug!(
            name = descriptor.name,
            op = descriptor.op.as_str(),
            backend = descriptor.backend.as_str(),
            priority = descriptor.priority,
            "registered implementation"
        );
        self.descriptors.push(descriptor);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Freezes the registry after checking every operation kind has a reference fallback.
    pub fn build(self) -> RuntimeResult<ImplementationRegistry> {
        let missing: Vec<OperationKind> = OperationKind::ALL
            .iter()
            .copied()
            .filter(|op| {
                !self
                    .descriptors
                    .iter()
                    .any(|d| d.op == *op && d.backend == BackendKind::Reference)
            })
            .collect();
        if !missing.is_empty() {
            return Err(RuntimeError::IncompleteRegistry { missing });
        }
        let mut by_op: HashMap<OperationKind, Vec<DescriptorId>> = HashMap::new();
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            by_op
                .entry(descriptor.op)
                .or_default()
                .push(DescriptorId(index));
        }
        Ok(ImplementationRegistry {
            descriptors: self.descriptors,
            by_op,
        })
    }
}

pub struct ImplementationRegistry {
    descriptors: Vec<ImplementationDescriptor>,
    by_op: HashMap<OperationKind, Vec<DescriptorId>>,
}

impl fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationRegistry")
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

impl ImplementationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn descriptor(&self, id: DescriptorId) -> &ImplementationDescriptor {
        &self.descriptors[id.0]
    }

    pub fn descriptors(&self) -> &[ImplementationDescriptor] {
        &self.descriptors
    }

    pub fn lookup(
        &self,
        op: OperationKind,
        backend: BackendKind,
        name: &str,
    ) -> Option<DescriptorId> {
        self.by_op.get(&op)?.iter().copied().find(|id| {
            let descriptor = self.descriptor(*id);
            descriptor.backend == backend && descriptor.name == name
        })
    }

    /// Every descriptor able to run `node` on `device`, best first.
    ///
    /// Exact `(dtype, format)` matches rank ahead of candidates that need a format
    /// conversion. Within each group: priority descending, then backend preference, then
    /// registration order.
    pub fn candidates(
        &self,
        node: &Node,
        inputs: &[Layout],
        device: &DeviceCaps,
    ) -> RuntimeResult<Vec<Selection>> {
        let layouts: Vec<&Layout> = inputs.iter().chain(node.outputs.iter()).collect();
        let mut exact = Vec::new();
        let mut converting = Vec::new();
        for id in self.by_op.get(&node.kind()).into_iter().flatten() {
            let descriptor = self.descriptor(*id);
            if !device.enables(descriptor.backend) {
                continue;
            }
            if layouts.iter().all(|layout| descriptor.matches_exactly(layout)) {
                exact.push(*id);
            } else if layouts
                .iter()
                .all(|layout| descriptor.matches_with_conversion(layout))
            {
                converting.push(*id);
            }
        }
        let rank = |id: &DescriptorId| {
            let descriptor = self.descriptor(*id);
            (Reverse(descriptor.priority), descriptor.backend, *id)
        };
        exact.sort_by_key(rank);
        converting.sort_by_key(rank);

        let selections: Vec<Selection> = exact
            .into_iter()
            .map(|descriptor| Selection {
                descriptor,
                requires_conversion: false,
            })
            .chain(converting.into_iter().map(|descriptor| Selection {
                descriptor,
                requires_conversion: true,
            }))
            .collect();
        if selections.is_empty() {
            let all: Vec<Layout> = layouts.into_iter().cloned().collect();
            return Err(RuntimeError::NoCompatibleImplementation {
                node: node.id,
                op: node.kind(),
                layouts: format_layouts(&all),
            });
        }
        Ok(selections)
    }

    pub fn select(
        &self,
        node: &Node,
        inputs: &[Layout],
        device: &DeviceCaps,
    ) -> RuntimeResult<Selection> {
        let selection = self.candidates(node, inputs, device)?[0];
        let descriptor = self.descriptor(selection.descriptor);
        tracing::debug!(
            node = %node.id,
            op = node.kind().as_str(),
            implementation = descriptor.name,
            backend = descriptor.backend.as_str(),
            requires_conversion = selection.requires_conversion,
            "selected implementation"
        );
        Ok(selection)
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<ImplementationRegistry>> = OnceLock::new();

/// Publishes `registry` as the process-wide registry. Succeeds once.
pub fn install(registry: ImplementationRegistry) -> RuntimeResult<Arc<ImplementationRegistry>> {
    let registry = Arc::new(registry);
    GLOBAL_REGISTRY
        .set(Arc::clone(&registry))
        .map_err(|_| RuntimeError::RegistryAlreadyInitialized)?;
    tracing::info!(
        descriptors = registry.descriptors().len(),
        "installed implementation registry"
    );
    Ok(registry)
}

pub fn global() -> RuntimeResult<Arc<ImplementationRegistry>> {
    GLOBAL_REGISTRY
        .get()
        .cloned()
        .ok_or(RuntimeError::RegistryNotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, ConcreteShapes, FinalizedForm, StreamId};
    use crate::graph::{BinaryOp, NodeId, OpSpec};
    use crate::tensor::{TensorView, TensorViewMut};

    struct Noop(&'static str, BackendKind);

    impl Implementation for Noop {
        fn name(&self) -> &str {
            self.0
        }
        fn backend(&self) -> BackendKind {
            self.1
        }
        fn supports(&self, _: &[Layout], _: &[Layout]) -> bool {
            true
        }
        fn finalize(
            &mut self,
            shapes: &ConcreteShapes,
            _: &OpSpec,
        ) -> BackendResult<FinalizedForm> {
            Ok(FinalizedForm::new(self.0, shapes, &()))
        }
        fn execute(
            &self,
            _: &[TensorView<'_>],
            _: &mut [TensorViewMut<'_>],
            _: StreamId,
        ) -> BackendResult<()> {
            Ok(())
        }
        fn serialize(&self) -> BackendResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn deserialize(&mut self, _: &[u8]) -> BackendResult<FinalizedForm> {
            Ok(FinalizedForm::new(self.0, &ConcreteShapes::new(vec![], vec![]), &()))
        }
        fn clone_boxed(&self) -> Box<dyn Implementation> {
            Box::new(Noop(self.0, self.1))
        }
    }

    fn reference(_: &Node) -> Box<dyn Implementation> {
        Box::new(Noop("noop.reference", BackendKind::Reference))
    }

    fn vendor(_: &Node) -> Box<dyn Implementation> {
        Box::new(Noop("noop.vendor", BackendKind::VendorLibrary))
    }

    fn complete_builder() -> RegistryBuilder {
        let mut builder = RegistryBuilder::new();
        for op in OperationKind::ALL {
            builder
                .register(
                    ImplementationDescriptor::new(
                        "noop.reference",
                        op,
                        BackendKind::Reference,
                        reference,
                    )
                    .support(DType::F32, Format::RowMajor)
                    .support(DType::F32, Format::Any),
                )
                .expect("register reference");
        }
        builder
    }

    fn add_node(format: Format) -> (Node, Vec<Layout>) {
        let layout = Layout::fixed(DType::F32, &[4, 4]).with_format(format);
        let node = Node {
            id: NodeId(2),
            op: OpSpec::ElementwiseBinary(BinaryOp::Add),
            inputs: vec![NodeId(0), NodeId(1)],
            outputs: vec![layout.clone()],
        };
        (node, vec![layout.clone(), layout])
    }

    #[test]
    fn build_rejects_missing_reference_kinds() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                ImplementationDescriptor::new(
                    "noop.reference",
                    OperationKind::MatMul,
                    BackendKind::Reference,
                    reference,
                )
                .support(DType::F32, Format::RowMajor),
            )
            .expect("register");
        match builder.build() {
            Err(RuntimeError::IncompleteRegistry { missing }) => {
                assert_eq!(missing.len(), OperationKind::ALL.len() - 1);
                assert!(!missing.contains(&OperationKind::MatMul));
            }
            other => panic!("expected IncompleteRegistry, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_support_sets_are_rejected() {
        let mut builder = complete_builder();
        let err = builder
            .register(
                ImplementationDescriptor::new(
                    "noop.other",
                    OperationKind::Reduce,
                    BackendKind::Reference,
                    reference,
                )
                .support(DType::F32, Format::Any)
                .support(DType::F32, Format::RowMajor),
            )
            .err()
            .expect("duplicate must fail");
        assert!(matches!(err, RuntimeError::DuplicateImplementation { .. }));
    }

    #[test]
    fn reused_name_is_rejected_even_with_new_support() {
        let mut builder = complete_builder();
        let err = builder
            .register(
                ImplementationDescriptor::new(
                    "noop.reference",
                    OperationKind::Reduce,
                    BackendKind::Reference,
                    reference,
                )
                .support(DType::I32, Format::RowMajor),
            )
            .err()
            .expect("reused name must fail");
        assert!(matches!(
            err,
            RuntimeError::DuplicateImplementation { ref name, .. } if name == "noop.reference"
        ));

        builder
            .register(
                ImplementationDescriptor::new(
                    "noop.reference_i32",
                    OperationKind::Reduce,
                    BackendKind::Reference,
                    reference,
                )
                .support(DType::I32, Format::RowMajor),
            )
            .expect("distinct name and support");
    }

    #[test]
    fn priority_then_backend_then_registration_order() {
        let mut builder = complete_builder();
        builder
            .register(
                ImplementationDescriptor::new(
                    "noop.vendor",
                    OperationKind::ElementwiseBinary,
                    BackendKind::VendorLibrary,
                    vendor,
                )
                .support(DType::F32, Format::RowMajor),
            )
            .expect("register vendor");
        let registry = builder.build().expect("registry");
        let (node, inputs) = add_node(Format::RowMajor);

        let selection = registry
            .select(&node, &inputs, &DeviceCaps::new("test", &BackendKind::ALL))
            .expect("select");
        assert_eq!(registry.descriptor(selection.descriptor).name, "noop.vendor");
        assert!(!selection.requires_conversion);

        let reference_only = DeviceCaps::new("test", &[BackendKind::Reference]);
        let selection = registry.select(&node, &inputs, &reference_only).expect("select");
        assert_eq!(registry.descriptor(selection.descriptor).backend, BackendKind::Reference);
    }

    #[test]
    fn unmatched_format_falls_back_with_conversion() {
        let registry = complete_builder().build().expect("registry");
        let (node, inputs) = add_node(Format::Blocked16);
        let candidates = registry
            .candidates(&node, &inputs, &DeviceCaps::host())
            .expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].requires_conversion);
    }

    #[test]
    fn unsupported_dtype_has_no_candidate() {
        let registry = complete_builder().build().expect("registry");
        let layout = Layout::fixed(DType::I32, &[2]);
        let node = Node {
            id: NodeId(1),
            op: OpSpec::ElementwiseUnary(crate::graph::UnaryOp::Neg),
            inputs: vec![NodeId(0)],
            outputs: vec![layout.clone()],
        };
        let err = registry
            .select(&node, &[layout], &DeviceCaps::host())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NoCompatibleImplementation { .. }));
    }

    #[test]
    fn lookup_finds_descriptor_by_name() {
        let registry = complete_builder().build().expect("registry");
        let id = registry
            .lookup(OperationKind::Reorder, BackendKind::Reference, "noop.reference")
            .expect("lookup");
        assert_eq!(registry.descriptor(id).op, OperationKind::Reorder);
        assert!(registry
            .lookup(OperationKind::Reorder, BackendKind::VendorLibrary, "noop.reference")
            .is_none());
    }
}
