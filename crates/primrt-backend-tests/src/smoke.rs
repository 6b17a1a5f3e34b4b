use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use primrt::artifact::{self, ArtifactStore};
use primrt::backend::{BackendKind, ConcreteShapes, DeviceCaps};
use primrt::graph::{BinaryOp, ReduceKind, UnaryOp};
use primrt::layout::{DType, Dim, Dims, Layout};
use primrt::{
    Bindings, Graph, GraphBuilder, HostTensor, ImplementationRegistry, Program,
    RegistryBuilder, RuntimeConfig, RuntimeResult,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::failing::{failing_descriptor, FAILING_NAME};
use crate::limited::{limited_descriptor, LIMITED_NAME};

/// Registers a backend's descriptors, together with whatever it needs to pass the
/// reference-completeness check.
pub type RegisterFn = fn(&mut RegistryBuilder) -> RuntimeResult<()>;

pub fn build_registry(register: RegisterFn) -> Result<Arc<ImplementationRegistry>> {
    let mut builder = RegistryBuilder::new();
    register(&mut builder)?;
    let registry = builder.build()?;
    tracing::debug!(descriptors = registry.descriptors().len(), "conformance registry built");
    Ok(Arc::new(registry))
}

fn program(
    graph: Graph,
    registry: &Arc<ImplementationRegistry>,
    config: RuntimeConfig,
) -> Result<Program> {
    Ok(Program::build(
        graph,
        Arc::clone(registry),
        DeviceCaps::host(),
        config,
    )?)
}

fn random_f32(rng: &mut StdRng, dims: &[usize]) -> Result<HostTensor> {
    let len: usize = dims.iter().product();
    let values = (0..len).map(|_| rng.gen_range(-4.0f32..4.0)).collect();
    Ok(HostTensor::from_f32(dims, values)?)
}

fn bits(tensor: &HostTensor) -> Result<Vec<u32>> {
    let values = tensor.as_f32().context("expected an F32 output")?;
    Ok(values.iter().map(|value| value.to_bits()).collect())
}

pub fn static_add_of_ones(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[4, 4]));
    let y = builder.parameter(Layout::fixed(DType::F32, &[4, 4]));
    let sum = builder.binary(BinaryOp::Add, x, y)?;
    let mut program = program(builder.finish(&[sum])?, &registry, RuntimeConfig::default())?;

    let ones = HostTensor::full_f32(&[4, 4], 1.0);
    let bindings: Bindings = HashMap::from([(x, ones.clone()), (y, ones)]);
    let outputs = program.execute(&bindings)?;

    ensure!(outputs.len() == 1, "expected one output, got {}", outputs.len());
    ensure!(outputs[0].dims.as_slice() == [4, 4]);
    ensure!(outputs[0].as_f32() == Some(&[2.0f32; 16][..]));
    Ok(())
}

pub fn matmul_matches_expected(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let mut builder = GraphBuilder::new();
    let a = builder.constant(HostTensor::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0])?);
    let b = builder.parameter(Layout::fixed(DType::F32, &[2, 2]));
    let product = builder.matmul(a, b)?;
    let mut program = program(builder.finish(&[product])?, &registry, RuntimeConfig::default())?;

    let bindings: Bindings =
        HashMap::from([(b, HostTensor::from_f32(&[2, 2], vec![5.0, 6.0, 7.0, 8.0])?)]);
    let outputs = program.execute(&bindings)?;
    ensure!(outputs[0].as_f32() == Some(&[19.0f32, 22.0, 43.0, 50.0][..]));
    Ok(())
}

/// `[1,8] x [1,8]` add executed at `[2,2]` then `[5,5]`: one re-specialisation of the add,
/// no re-selection.
pub fn dynamic_add_respecializes_once(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let dims = vec![Dim::range(1, 8), Dim::range(1, 8)];
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::dynamic(DType::F32, dims.clone()));
    let y = builder.parameter(Layout::dynamic(DType::F32, dims));
    let sum = builder.binary(BinaryOp::Add, x, y)?;
    let mut program = program(builder.finish(&[sum])?, &registry, RuntimeConfig::default())?;
    let bound = program.bound_implementation(sum);

    for extent in [2usize, 5] {
        let bindings: Bindings = HashMap::from([
            (x, HostTensor::full_f32(&[extent, extent], 1.5)),
            (y, HostTensor::full_f32(&[extent, extent], 2.0)),
        ]);
        let outputs = program.execute(&bindings)?;
        ensure!(outputs[0].dims.as_slice() == [extent, extent]);
        ensure!(outputs[0]
            .as_f32()
            .is_some_and(|values| values.iter().all(|value| *value == 3.5)));
    }

    let stats = program.instance_stats(sum).context("add instance")?;
    ensure!(stats.respecializations == 1, "stats: {stats:?}");
    ensure!(stats.reselections == 0, "stats: {stats:?}");
    ensure!(program.bound_implementation(sum) == bound);
    Ok(())
}

/// A bound implementation that declines the grown extents is replaced through the registry.
/// Shrinking back keeps the replacement, which still supports the smaller extents.
pub fn out_of_support_shape_reselects(register: RegisterFn) -> Result<()> {
    let mut builder = RegistryBuilder::new();
    register(&mut builder)?;
    builder.register(limited_descriptor())?;
    let registry = Arc::new(builder.build()?);

    let dims = vec![Dim::range(1, 8), Dim::range(1, 8)];
    let mut graph = GraphBuilder::new();
    let x = graph.parameter(Layout::dynamic(DType::F32, dims.clone()));
    let y = graph.parameter(Layout::dynamic(DType::F32, dims));
    let diff = graph.binary(BinaryOp::Sub, x, y)?;
    let mut program = program(graph.finish(&[diff])?, &registry, RuntimeConfig::default())?;
    ensure!(program.bound_implementation(diff).as_deref() == Some(LIMITED_NAME));

    let mut replacement = None;
    for extent in [2usize, 5, 2] {
        let bindings: Bindings = HashMap::from([
            (x, HostTensor::full_f32(&[extent, extent], 5.0)),
            (y, HostTensor::full_f32(&[extent, extent], 1.0)),
        ]);
        let outputs = program.execute(&bindings)?;
        ensure!(outputs[0].as_f32().is_some_and(|values| {
            values.len() == extent * extent && values.iter().all(|v| *v == 4.0)
        }));
        let bound = program.bound_implementation(diff);
        if extent == 5 {
            ensure!(bound.as_deref() != Some(LIMITED_NAME));
            replacement = bound;
        } else if replacement.is_some() {
            ensure!(bound == replacement, "shrinking switched to {bound:?}");
        }
    }

    let stats = program.instance_stats(diff).context("sub instance")?;
    ensure!(stats.reselections == 1, "stats: {stats:?}");
    ensure!(stats.respecializations == 2, "stats: {stats:?}");
    Ok(())
}

/// A candidate whose finalize fails is skipped in favour of the next-ranked one.
pub fn failed_finalize_falls_back(register: RegisterFn) -> Result<()> {
    let mut builder = RegistryBuilder::new();
    register(&mut builder)?;
    builder.register(failing_descriptor(BackendKind::GenericKernel))?;
    let registry = Arc::new(builder.build()?);

    let mut graph = GraphBuilder::new();
    let x = graph.parameter(Layout::fixed(DType::F32, &[3]));
    let y = graph.parameter(Layout::fixed(DType::F32, &[3]));
    let diff = graph.binary(BinaryOp::Sub, x, y)?;
    let mut program = program(graph.finish(&[diff])?, &registry, RuntimeConfig::default())?;
    let bound = program.bound_implementation(diff).context("sub is bound")?;
    ensure!(bound != FAILING_NAME, "bound to {bound}");

    let bindings: Bindings = HashMap::from([
        (x, HostTensor::from_f32(&[3], vec![4.0, 5.0, 6.0])?),
        (y, HostTensor::from_f32(&[3], vec![1.0, 1.0, 1.0])?),
    ]);
    let outputs = program.execute(&bindings)?;
    ensure!(outputs[0].as_f32() == Some(&[3.0f32, 4.0, 5.0][..]));
    let stats = program.instance_stats(diff).context("sub instance")?;
    ensure!(stats.finalizations == 1, "stats: {stats:?}");
    Ok(())
}

fn relu_row_sums(register: RegisterFn, input: &HostTensor) -> Result<HostTensor> {
    let registry = build_registry(register)?;
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &input.dims));
    let relu = builder.unary(UnaryOp::Relu, x)?;
    let sums = builder.reduce(ReduceKind::Sum, relu)?;
    let mut program = program(builder.finish(&[sums])?, &registry, RuntimeConfig::default())?;
    let bindings: Bindings = HashMap::from([(x, input.clone())]);
    program
        .execute(&bindings)?
        .pop()
        .context("program produced no output")
}

/// Unary and reduce results are bit-identical to a sequential fold.
pub fn unary_reduce_bit_identical(register: RegisterFn) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let input = random_f32(&mut rng, &[6, 129])?;
    let actual = relu_row_sums(register, &input)?;

    let values = input.as_f32().context("input")?;
    let expected: Vec<f32> = values
        .chunks(129)
        .map(|row| row.iter().fold(0.0f32, |acc, value| acc + value.max(0.0)))
        .collect();
    ensure!(actual.dims.as_slice() == [6]);
    ensure!(
        bits(&actual)? == expected.iter().map(|value| value.to_bits()).collect::<Vec<_>>(),
        "row sums differ: {:?} vs {expected:?}",
        actual.as_f32()
    );
    Ok(())
}

fn diamond(rng: &mut StdRng) -> Result<(Graph, Bindings)> {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[8, 16]));
    let w = builder.parameter(Layout::fixed(DType::F32, &[16, 8]));
    let left = builder.unary(UnaryOp::Tanh, x)?;
    let right = builder.unary(UnaryOp::Abs, x)?;
    let mixed = builder.binary(BinaryOp::Mul, left, right)?;
    let projected = builder.matmul(mixed, w)?;
    let peak = builder.reduce(ReduceKind::Max, projected)?;
    let bindings = HashMap::from([
        (x, random_f32(rng, &[8, 16])?),
        (w, random_f32(rng, &[16, 8])?),
    ]);
    Ok((builder.finish(&[projected, peak])?, bindings))
}

/// Two executions of one program, and a single- versus multi-stream build, agree bit for
/// bit.
pub fn execution_is_deterministic(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let (graph, bindings) = diamond(&mut StdRng::seed_from_u64(11))?;

    let mut sequential = program(graph.clone(), &registry, RuntimeConfig::default())?;
    let first = sequential.execute(&bindings)?;
    let second = sequential.execute(&bindings)?;
    ensure!(first == second);

    let mut streamed = program(graph, &registry, RuntimeConfig::default().with_streams(3))?;
    ensure!(streamed.schedule().stream_count() == 3);
    let third = streamed.execute(&bindings)?;
    for (lhs, rhs) in first.iter().zip(&third) {
        ensure!(bits(lhs)? == bits(rhs)?);
    }
    Ok(())
}

/// Finalizing the same implementation twice for the same shapes yields equal forms.
pub fn finalize_is_idempotent(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let (graph, _) = diamond(&mut StdRng::seed_from_u64(3))?;
    let device = DeviceCaps::host();
    for node in graph.nodes() {
        let declared = graph.input_layouts(node);
        let inputs: Vec<Dims> = declared
            .iter()
            .map(|layout| layout.shape.static_dims().context("static input"))
            .collect::<Result<_>>()?;
        let output = node.output().shape.static_dims().context("static output")?;
        let shapes = ConcreteShapes::new(inputs, vec![output]);
        for selection in registry.candidates(node, &declared, &device)? {
            let descriptor = registry.descriptor(selection.descriptor);
            let mut implementation = descriptor.instantiate(node);
            if !implementation.supports(&declared, &node.outputs) {
                continue;
            }
            let once = implementation.finalize(&shapes, &node.op)?;
            let twice = implementation.finalize(&shapes, &node.op)?;
            let fresh = descriptor.instantiate(node).finalize(&shapes, &node.op)?;
            ensure!(once == twice, "{} is not idempotent", descriptor.name);
            ensure!(once == fresh, "{} depends on prior state", descriptor.name);
        }
    }
    Ok(())
}

/// Exported artifacts restore `Ready` instances with the same finalized form, and a program
/// rebuilt against the store performs no finalization.
pub fn artifacts_round_trip(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let device = DeviceCaps::host();
    let (graph, bindings) = diamond(&mut StdRng::seed_from_u64(5))?;
    let store = Arc::new(ArtifactStore::in_memory());

    let mut original = Program::build_with(
        graph.clone(),
        Arc::clone(&registry),
        device.clone(),
        RuntimeConfig::default(),
        Arc::clone(&store),
    )?;
    ensure!(original.artifact_hits() == 0);
    let expected = original.execute(&bindings)?;

    for (id, blob) in original.export_artifacts()? {
        let node = graph.node(id).context("exported node")?;
        let restored = artifact::deserialize(
            &blob,
            Arc::clone(node),
            graph.input_layouts(node),
            &registry,
            &device,
        )?;
        ensure!(restored.finalized() == original.finalized_form(id).as_ref());
        ensure!(restored.stats().finalizations == 0);
    }

    let mut reloaded = Program::build_with(
        graph.clone(),
        Arc::clone(&registry),
        device,
        RuntimeConfig::default(),
        Arc::clone(&store),
    )?;
    ensure!(reloaded.artifact_hits() == graph.len());
    for node in graph.nodes() {
        let stats = reloaded.instance_stats(node.id).context("instance")?;
        ensure!(stats.finalizations == 0, "{} finalized again", node.id);
    }
    ensure!(reloaded.execute(&bindings)? == expected);
    Ok(())
}

/// Artifacts written under one device fingerprint are rejected under another; the build
/// falls back to normal selection.
pub fn foreign_fingerprint_is_rejected(register: RegisterFn) -> Result<()> {
    let registry = build_registry(register)?;
    let (graph, bindings) = diamond(&mut StdRng::seed_from_u64(9))?;
    let store = Arc::new(ArtifactStore::in_memory());
    let device_a = DeviceCaps::host();
    let device_b = DeviceCaps::host().with_feature("foreign-isa");

    let mut first = Program::build_with(
        graph.clone(),
        Arc::clone(&registry),
        device_a,
        RuntimeConfig::default(),
        Arc::clone(&store),
    )?;
    ensure!(!store.is_empty());
    let expected = first.execute(&bindings)?;

    let mut second = Program::build_with(
        graph,
        Arc::clone(&registry),
        device_b,
        RuntimeConfig::default(),
        store,
    )?;
    ensure!(second.artifact_hits() == 0);
    ensure!(second.execute(&bindings)? == expected);
    Ok(())
}
