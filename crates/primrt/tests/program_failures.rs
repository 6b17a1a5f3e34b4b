use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use primrt::backend::{
    BackendError, BackendKind, BackendResult, ConcreteShapes, FinalizedForm, Implementation,
    StreamId,
};
use primrt::graph::{BinaryOp, GraphBuilder, Node, OpSpec, OperationKind, UnaryOp};
use primrt::instance::InstanceState;
use primrt::layout::{DType, Dim, Format, Layout};
use primrt::tensor::{TensorView, TensorViewMut};
use primrt::{
    Bindings, DeviceCaps, HostTensor, ImplementationDescriptor, Program, RegistryBuilder,
    RuntimeConfig, RuntimeError,
};
use primrt_backend_tests::failing::{failing_descriptor, FAILING_NAME};

static DEVICE_LOST: AtomicBool = AtomicBool::new(true);

/// Negation that reports a lost device on its first execution.
#[derive(Debug, Clone)]
struct FlakyNeg;

fn flaky(_node: &Node) -> Box<dyn Implementation> {
    Box::new(FlakyNeg)
}

impl Implementation for FlakyNeg {
    fn name(&self) -> &str {
        "test.flaky_neg"
    }

    fn backend(&self) -> BackendKind {
        BackendKind::VendorLibrary
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        inputs.iter().chain(outputs).all(|layout| layout.dtype == DType::F32)
    }

    fn finalize(
        &mut self,
        shapes: &ConcreteShapes,
        op: &OpSpec,
    ) -> BackendResult<FinalizedForm> {
        if *op != OpSpec::ElementwiseUnary(UnaryOp::Neg) {
            return Err(BackendError::unimplemented("flaky", "only negation"));
        }
        Ok(FinalizedForm::new("test.flaky_neg", shapes, &()))
    }

    fn execute(
        &self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        if DEVICE_LOST.swap(false, Ordering::SeqCst) {
            return Err(BackendError::corrupted("device lost"));
        }
        let ([input], [output]) = (inputs, outputs) else {
            return Err(BackendError::execution("flaky neg arity"));
        };
        for (o, x) in output.as_f32_mut()?.iter_mut().zip(input.as_f32()?) {
            *o = -x;
        }
        Ok(())
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        Err(BackendError::payload("not persistable"))
    }

    fn deserialize(&mut self, _payload: &[u8]) -> BackendResult<FinalizedForm> {
        Err(BackendError::payload("not persistable"))
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(self.clone())
    }
}

#[test]
fn corrupted_backend_poisons_until_rebuild() {
    primrt_backend_tests::init_tracing();
    let mut registry = RegistryBuilder::new();
    primrt_backend_ref_cpu::register(&mut registry).expect("reference");
    registry
        .register(
            ImplementationDescriptor::new(
                "test.flaky_neg",
                OperationKind::ElementwiseUnary,
                BackendKind::VendorLibrary,
                flaky,
            )
            .priority(50)
            .support(DType::F32, Format::RowMajor),
        )
        .expect("flaky");
    let registry = Arc::new(registry.build().expect("registry"));

    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[3]));
    let y = builder.unary(UnaryOp::Neg, x).expect("neg");
    let graph = builder.finish(&[y]).expect("graph");
    let mut program = Program::build(graph, registry, DeviceCaps::host(), RuntimeConfig::default())
        .expect("program");
    assert_eq!(program.bound_implementation(y).as_deref(), Some("test.flaky_neg"));

    let input = HostTensor::from_f32(&[3], vec![1.0, -2.0, 3.0]).expect("tensor");
    let bindings: Bindings = HashMap::from([(x, input)]);
    let err = program.execute(&bindings).unwrap_err();
    assert!(matches!(err, RuntimeError::ExecutionFailure { node, .. } if node == y), "{err}");
    assert!(program.is_poisoned());
    assert_eq!(program.instance_state(y), Some(InstanceState::Failed));

    let err = program.execute(&bindings).unwrap_err();
    assert!(matches!(err, RuntimeError::ProgramPoisoned { node, .. } if node == y), "{err}");

    program.rebuild().expect("rebuild");
    assert!(!program.is_poisoned());
    let outputs = program.execute(&bindings).expect("execute after rebuild");
    assert_eq!(outputs[0].as_f32(), Some(&[-1.0f32, 2.0, -3.0][..]));
}

#[test]
fn pool_limit_failure_poisons_the_program() {
    primrt_backend_tests::init_tracing();
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::dynamic(DType::F32, vec![Dim::Unbounded]));
    let y = builder.unary(UnaryOp::Abs, x).expect("abs");
    let graph = builder.finish(&[y]).expect("graph");
    let registry = primrt_backend_ref_cpu::registry().expect("registry");
    let config = RuntimeConfig::default().with_max_pool_bytes(256);
    let mut program = Program::build(graph, registry, DeviceCaps::host(), config).expect("program");
    assert_eq!(program.pool_bytes(), 0);

    let small: Bindings = HashMap::from([(x, HostTensor::full_f32(&[8], -1.0))]);
    let outputs = program.execute(&small).expect("fits");
    assert_eq!(outputs[0].as_f32(), Some(&[1.0f32; 8][..]));

    let large: Bindings = HashMap::from([(x, HostTensor::full_f32(&[100], -1.0))]);
    let err = program.execute(&large).unwrap_err();
    assert!(matches!(err, RuntimeError::AllocationFailure { requested: 400, .. }), "{err}");
    assert!(program.is_poisoned());
    assert!(matches!(program.execute(&small), Err(RuntimeError::ProgramPoisoned { .. })));

    program.rebuild().expect("rebuild");
    assert!(program.execute(&small).is_ok());
}

#[test]
fn static_pool_over_limit_fails_the_build() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[64, 64]));
    let y = builder.unary(UnaryOp::Neg, x).expect("neg");
    let graph = builder.finish(&[y]).expect("graph");
    let registry = primrt_backend_ref_cpu::registry().expect("registry");
    let config = RuntimeConfig::default().with_max_pool_bytes(1024);
    let err = Program::build(graph, registry, DeviceCaps::host(), config).unwrap_err();
    assert!(matches!(err, RuntimeError::AllocationFailure { .. }), "{err}");
}

/// Absolute value whose kernel panics. Only binds to `Abs` nodes.
#[derive(Debug, Clone)]
struct PanickingAbs;

fn panicking(_node: &Node) -> Box<dyn Implementation> {
    Box::new(PanickingAbs)
}

impl Implementation for PanickingAbs {
    fn name(&self) -> &str {
        "test.panicking_abs"
    }

    fn backend(&self) -> BackendKind {
        BackendKind::VendorLibrary
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        inputs.iter().chain(outputs).all(|layout| layout.dtype == DType::F32)
    }

    fn finalize(
        &mut self,
        shapes: &ConcreteShapes,
        op: &OpSpec,
    ) -> BackendResult<FinalizedForm> {
        if *op != OpSpec::ElementwiseUnary(UnaryOp::Abs) {
            return Err(BackendError::unimplemented("panicking", "only abs"));
        }
        Ok(FinalizedForm::new("test.panicking_abs", shapes, &()))
    }

    fn execute(
        &self,
        _inputs: &[TensorView<'_>],
        _outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        panic!("abs kernel fault");
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        Err(BackendError::payload("not persistable"))
    }

    fn deserialize(&mut self, _payload: &[u8]) -> BackendResult<FinalizedForm> {
        Err(BackendError::payload("not persistable"))
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(self.clone())
    }
}

#[test]
fn panicking_kernel_fails_every_stream_instead_of_hanging() {
    primrt_backend_tests::init_tracing();
    let mut registry = RegistryBuilder::new();
    primrt_backend_ref_cpu::register(&mut registry).expect("reference");
    registry
        .register(
            ImplementationDescriptor::new(
                "test.panicking_abs",
                OperationKind::ElementwiseUnary,
                BackendKind::VendorLibrary,
                panicking,
            )
            .priority(50)
            .support(DType::F32, Format::RowMajor),
        )
        .expect("panicking");
    let registry = Arc::new(registry.build().expect("registry"));

    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[4]));
    let negated = builder.unary(UnaryOp::Neg, x).expect("neg");
    let magnitude = builder.unary(UnaryOp::Abs, x).expect("abs");
    let joined = builder
        .binary(BinaryOp::Add, negated, magnitude)
        .expect("add");
    let graph = builder.finish(&[joined]).expect("graph");
    let config = RuntimeConfig::default().with_streams(2);
    let mut program = Program::build(graph, registry, DeviceCaps::host(), config).expect("program");
    assert_eq!(
        program.bound_implementation(magnitude).as_deref(),
        Some("test.panicking_abs")
    );
    assert_ne!(
        program.schedule().stream_of(2),
        program.schedule().stream_of(3),
        "abs and the join must run on different streams"
    );

    let bindings: Bindings = HashMap::from([(x, HostTensor::full_f32(&[4], -1.0))]);
    let err = program.execute(&bindings).unwrap_err();
    match &err {
        RuntimeError::ExecutionFailure { node, source, .. } => {
            assert_eq!(*node, magnitude);
            assert!(source.is_corrupting());
            assert!(source.to_string().contains("abs kernel fault"), "{source}");
        }
        other => panic!("expected ExecutionFailure, got {other}"),
    }
    assert!(program.is_poisoned());
    assert_eq!(program.instance_state(magnitude), Some(InstanceState::Failed));
}

#[test]
fn every_candidate_failing_to_finalize_fails_the_build() {
    let mut registry = RegistryBuilder::new();
    for descriptor in primrt_backend_ref_cpu::descriptors() {
        if descriptor.op != OperationKind::ElementwiseBinary {
            registry.register(descriptor).expect("reference");
        }
    }
    registry
        .register(failing_descriptor(BackendKind::Reference))
        .expect("failing");
    let registry = Arc::new(registry.build().expect("registry"));

    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[2]));
    let sum = builder.binary(BinaryOp::Add, x, x).expect("add");
    let graph = builder.finish(&[sum]).expect("graph");
    let err = Program::build(graph, registry, DeviceCaps::host(), RuntimeConfig::default())
        .unwrap_err();
    match err {
        RuntimeError::FinalizationFailure { node, reason, .. } => {
            assert_eq!(node, sum);
            assert!(reason.contains(FAILING_NAME), "{reason}");
        }
        other => panic!("expected FinalizationFailure, got {other}"),
    }
}
