//! Dependency-ordered dispatch of a program's instances over one or more streams.
//!
//! Each stream executes its queue in enqueue order on its own scoped thread. Edges whose
//! producer lives on another stream become waits on the producer's completion event. The
//! first failure halts every stream at its next instance boundary.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, RwLockReadGuard};

use crate::backend::{BackendError, BackendResult, ConcreteShapes, StreamId};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{Graph, Node, OperationKind};
use crate::instance::{PrimitiveInstance, SpecializeContext, Transition};
use crate::layout::{element_count, Dims};
use crate::memory::MemoryPool;
use crate::ops;
use crate::program::Bindings;
use crate::tensor::{TensorData, TensorView, TensorViewMut};

/// Cooperative cancellation, observed between instances only.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
        }
    }
}

/// Assignment of instances (by graph position) to streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchedule {
    queues: Vec<Vec<usize>>,
    stream_of: Vec<usize>,
    waits: Vec<Vec<usize>>,
}

impl StreamSchedule {
    /// A node continues the stream of an input whose producer is that stream's most recent
    /// entry; otherwise it goes to the least loaded stream.
    pub fn new(graph: &Graph, streams: usize) -> Self {
        let streams = streams.max(1);
        let count = graph.len();
        let mut queues: Vec<Vec<usize>> = vec![Vec::new(); streams];
        let mut stream_of: Vec<usize> = Vec::with_capacity(count);
        let mut waits: Vec<Vec<usize>> = Vec::with_capacity(count);
        for position in 0..count {
            let inputs = graph.input_positions(position);
            let chained = inputs
                .iter()
                .map(|input| stream_of[*input])
                .zip(inputs.iter())
                .find(|(stream, input)| queues[*stream].last() == Some(*input))
                .map(|(stream, _)| stream);
            let stream = chained.unwrap_or_else(|| {
                (0..streams)
                    .min_by_key(|stream| (queues[*stream].len(), *stream))
                    .unwrap_or(0)
            });
            let mut cross: Vec<usize> = inputs
                .into_iter()
                .filter(|input| stream_of[*input] != stream)
                .collect();
            cross.sort_unstable();
            cross.dedup();
            queues[stream].push(position);
            stream_of.push(stream);
            waits.push(cross);
        }
        Self {
            queues,
            stream_of,
            waits,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, stream: usize) -> &[usize] {
        &self.queues[stream]
    }

    pub fn stream_of(&self, position: usize) -> usize {
        self.stream_of[position]
    }

    /// Producers on other streams that `position` must wait for.
    pub fn waits(&self, position: usize) -> &[usize] {
        &self.waits[position]
    }

    pub fn cross_stream_edges(&self) -> usize {
        self.waits.iter().map(Vec::len).sum()
    }
}

pub(crate) struct ExecutionContext<'a> {
    pub graph: &'a Graph,
    pub instances: &'a [Mutex<PrimitiveInstance>],
    pub pool: &'a MemoryPool,
    pub schedule: &'a StreamSchedule,
    pub specialize: SpecializeContext<'a>,
    pub bindings: &'a Bindings,
    pub cancel: Option<&'a CancellationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pending,
    Done,
    Failed,
}

struct Completion {
    state: Mutex<Signal>,
    changed: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            state: Mutex::new(Signal::Pending),
            changed: Condvar::new(),
        }
    }

    fn signal(&self, signal: Signal) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == Signal::Pending {
            *state = signal;
            self.changed.notify_all();
        }
    }

    fn wait(&self) -> Signal {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *state == Signal::Pending {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *state
    }
}

struct Shared {
    events: Vec<Completion>,
    shapes: Vec<OnceLock<Dims>>,
    halted: AtomicBool,
    completed: AtomicUsize,
    failure: Mutex<Option<RuntimeError>>,
}

impl Shared {
    fn new(count: usize) -> Self {
        Self {
            events: (0..count).map(|_| Completion::new()).collect(),
            shapes: (0..count).map(|_| OnceLock::new()).collect(),
            halted: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    fn record(&self, err: RuntimeError) {
        let mut failure = self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}

enum Stop {
    Halted,
    Failed(RuntimeError),
}

/// Runs every instance once. Returns the output extents of each node by position.
pub(crate) fn run(ctx: &ExecutionContext<'_>) -> RuntimeResult<Vec<Dims>> {
    let shared = Shared::new(ctx.graph.len());
    let streams = ctx.schedule.stream_count();
    if streams == 1 {
        run_stream(ctx, &shared, 0);
    } else {
        let shared = &shared;
        std::thread::scope(|scope| {
            for stream in 0..streams {
                scope.spawn(move || run_stream(ctx, shared, stream));
            }
        });
    }

    let failure = shared
        .failure
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(shared
        .shapes
        .into_iter()
        .map(|cell| cell.into_inner().unwrap_or_default())
        .collect())
}

/// Fails every queued instance from `next` on when dropped, so waiters on other streams
/// wake up even if this stream unwinds.
struct QueueGuard<'a> {
    shared: &'a Shared,
    queue: &'a [usize],
    next: usize,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.next >= self.queue.len() {
            return;
        }
        self.shared.halted.store(true, Ordering::Release);
        for rest in &self.queue[self.next..] {
            self.shared.events[*rest].signal(Signal::Failed);
        }
    }
}

fn run_stream(ctx: &ExecutionContext<'_>, shared: &Shared, stream: usize) {
    let queue = ctx.schedule.queue(stream);
    let _span = tracing::debug_span!("primrt.stream", stream, instances = queue.len()).entered();
    let mut guard = QueueGuard {
        shared,
        queue,
        next: 0,
    };
    for position in queue.iter().copied() {
        match step(ctx, shared, position, StreamId(stream)) {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::AcqRel);
                shared.events[position].signal(Signal::Done);
                guard.next += 1;
            }
            Err(stop) => {
                if let Stop::Failed(err) = stop {
                    tracing::debug!(stream, error = %err, "stream stopped");
                    shared.record(err);
                }
                return;
            }
        }
    }
}

fn step(
    ctx: &ExecutionContext<'_>,
    shared: &Shared,
    position: usize,
    stream: StreamId,
) -> Result<(), Stop> {
    if shared.halted.load(Ordering::Acquire) {
        return Err(Stop::Halted);
    }
    if ctx.cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(Stop::Failed(RuntimeError::Aborted {
            completed: shared.completed.load(Ordering::Acquire),
        }));
    }
    for producer in ctx.schedule.waits(position) {
        if shared.events[*producer].wait() == Signal::Failed {
            return Err(Stop::Halted);
        }
    }
    run_instance(ctx, &shared.shapes, position, stream).map_err(Stop::Failed)
}

fn lock_instance(instance: &Mutex<PrimitiveInstance>) -> MutexGuard<'_, PrimitiveInstance> {
    instance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_instance(
    ctx: &ExecutionContext<'_>,
    shapes: &[OnceLock<Dims>],
    position: usize,
    stream: StreamId,
) -> RuntimeResult<()> {
    let node = &ctx.graph.nodes()[position];
    let mut instance = lock_instance(&ctx.instances[position]);

    let input_dims = node
        .inputs
        .iter()
        .map(|input| {
            ctx.graph
                .position(*input)
                .and_then(|producer| shapes[producer].get().cloned())
                .ok_or_else(|| RuntimeError::InvalidGraph {
                    reason: format!("extents of {input} are unavailable to {}", node.id),
                })
        })
        .collect::<RuntimeResult<Vec<Dims>>>()?;

    let output_dims = output_extents(ctx, node, &input_dims)?;
    if !node.output().shape.accepts(&output_dims) {
        return Err(RuntimeError::ShapeOutOfRange {
            node: node.id,
            expected: node.output().shape.clone(),
            actual: output_dims,
        });
    }

    let concrete = ConcreteShapes::new(input_dims, vec![output_dims.clone()]);
    let transition = match instance.prepare(&concrete, &ctx.specialize) {
        Ok(transition) => transition,
        Err(err) => {
            if err.poisons_program() {
                instance.mark_failed();
            }
            return Err(err);
        }
    };
    if let Transition::Respecialized { reselected } = transition {
        tracing::debug!(
            node = %node.id,
            reselected,
            implementation = instance.implementation_name().unwrap_or("<none>"),
            "respecialized"
        );
    }

    match node.kind() {
        OperationKind::Parameter => write_binding(ctx, &mut instance, node)?,
        OperationKind::Constant | OperationKind::Reshape => {}
        _ => {
            let output_len = checked_len(node, &output_dims)?;
            let slot = output_slot(&instance)?;
            if let Err(err) = ctx.pool.ensure_capacity(slot, output_len) {
                instance.mark_failed();
                return Err(err);
            }
            instance.begin_execute()?;
            match dispatch(ctx.pool, &instance, &concrete, stream) {
                Ok(()) => instance.finish_execute(),
                Err(source) => {
                    if source.is_corrupting() {
                        instance.mark_failed();
                    } else {
                        instance.abort_execute();
                    }
                    return Err(RuntimeError::ExecutionFailure {
                        node: node.id,
                        op: node.kind(),
                        shapes: concrete.all(),
                        source,
                    });
                }
            }
        }
    }

    let _ = shapes[position].set(output_dims);
    Ok(())
}

fn output_extents(
    ctx: &ExecutionContext<'_>,
    node: &Node,
    input_dims: &[Dims],
) -> RuntimeResult<Dims> {
    if node.kind() == OperationKind::Parameter {
        return ctx
            .bindings
            .get(&node.id)
            .map(|binding| binding.dims.clone())
            .ok_or(RuntimeError::MissingBinding { node: node.id });
    }
    let refs: Vec<&[usize]> = input_dims.iter().map(|dims| dims.as_slice()).collect();
    ops::infer_output_shape(&node.op, &refs).map_err(|reason| RuntimeError::InvalidGraph {
        reason: format!("node {}: {reason}", node.id),
    })
}

fn checked_len(node: &Node, dims: &[usize]) -> RuntimeResult<usize> {
    element_count(dims).ok_or_else(|| RuntimeError::ShapeOutOfRange {
        node: node.id,
        expected: node.output().shape.clone(),
        actual: Dims::from_slice(dims),
    })
}

fn output_slot(instance: &PrimitiveInstance) -> RuntimeResult<usize> {
    instance.output_slot().ok_or(RuntimeError::NotReady {
        node: instance.id(),
        state: instance.state(),
    })
}

fn write_binding(
    ctx: &ExecutionContext<'_>,
    instance: &mut PrimitiveInstance,
    node: &Node,
) -> RuntimeResult<()> {
    let binding = ctx
        .bindings
        .get(&node.id)
        .ok_or(RuntimeError::MissingBinding { node: node.id })?;
    let slot = output_slot(instance)?;
    if let Err(err) = ctx.pool.ensure_capacity(slot, binding.len()) {
        instance.mark_failed();
        return Err(err);
    }
    let mut data = ctx.pool.write(slot)?;
    data.copy_from(&binding.data)
        .map_err(|source| RuntimeError::ExecutionFailure {
            node: node.id,
            op: node.kind(),
            shapes: vec![binding.dims.clone()],
            source,
        })
}

/// Borrows the instance's slots and hands views to the bound implementation. A panic in
/// the implementation is reported as a corrupting backend error.
fn dispatch(
    pool: &MemoryPool,
    instance: &PrimitiveInstance,
    shapes: &ConcreteShapes,
    stream: StreamId,
) -> BackendResult<()> {
    let implementation = instance
        .implementation()
        .ok_or_else(|| BackendError::execution("instance has no bound implementation"))?;
    let output_slot = instance
        .output_slot()
        .ok_or_else(|| BackendError::execution("instance has no output slot"))?;
    let input_slots = instance.input_slots();

    let mut read_slots = input_slots.to_vec();
    read_slots.sort_unstable();
    read_slots.dedup();
    if read_slots.binary_search(&output_slot).is_ok() {
        return Err(BackendError::execution(format!(
            "output slot {output_slot} is also read by the same instance"
        )));
    }
    let guards = read_slots
        .iter()
        .map(|slot| pool.read(*slot).map(|guard| (*slot, guard)))
        .collect::<RuntimeResult<Vec<(usize, RwLockReadGuard<'_, TensorData>)>>>()
        .map_err(|err| BackendError::execution(err.to_string()))?;
    let mut output = pool
        .write(output_slot)
        .map_err(|err| BackendError::execution(err.to_string()))?;

    let mut inputs = Vec::with_capacity(input_slots.len());
    for (slot, dims) in input_slots.iter().zip(&shapes.inputs) {
        let guard = guards
            .iter()
            .find(|(candidate, _)| candidate == slot)
            .map(|(_, guard)| guard)
            .ok_or_else(|| BackendError::execution(format!("slot {slot} is not locked")))?;
        let len = element_count(dims)
            .ok_or_else(|| BackendError::execution(format!("extents {dims:?} overflow")))?;
        inputs.push(TensorView::new(dims, guard.view(len)?));
    }
    let output_dims = shapes
        .outputs
        .first()
        .ok_or_else(|| BackendError::execution("missing output extents"))?;
    let output_len = element_count(output_dims)
        .ok_or_else(|| BackendError::execution(format!("extents {output_dims:?} overflow")))?;
    let mut outputs = [TensorViewMut::new(output_dims, output.view_mut(output_len)?)];
    panic::catch_unwind(AssertUnwindSafe(|| {
        implementation.execute(&inputs, &mut outputs, stream)
    }))
    .unwrap_or_else(|payload| {
        Err(BackendError::corrupted(format!(
            "{} panicked: {}",
            implementation.name(),
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BinaryOp, GraphBuilder, UnaryOp};
    use crate::layout::{DType, Layout};

    #[test]
    fn single_stream_schedule_is_graph_order() {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::fixed(DType::F32, &[4]));
        let y = builder.unary(UnaryOp::Neg, x).expect("neg");
        let graph = builder.finish(&[y]).expect("graph");
        let schedule = StreamSchedule::new(&graph, 1);
        assert_eq!(schedule.queue(0), &[0, 1]);
        assert_eq!(schedule.cross_stream_edges(), 0);
    }

    #[test]
    fn branches_spread_over_streams_with_join_waits() {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::fixed(DType::F32, &[4]));
        let a = builder.unary(UnaryOp::Neg, x).expect("a");
        let b = builder.unary(UnaryOp::Abs, x).expect("b");
        let join = builder.binary(BinaryOp::Add, a, b).expect("join");
        let graph = builder.finish(&[join]).expect("graph");
        let schedule = StreamSchedule::new(&graph, 2);

        // a continues x's chain, b lands on the idle stream, join continues a.
        assert_eq!(schedule.stream_of(0), schedule.stream_of(1));
        assert_ne!(schedule.stream_of(1), schedule.stream_of(2));
        assert_eq!(schedule.stream_of(3), schedule.stream_of(1));
        assert_eq!(schedule.waits(2), &[0]);
        assert_eq!(schedule.waits(3), &[2]);
    }

    #[test]
    fn completion_wakes_waiters() {
        let completion = Arc::new(Completion::new());
        let waiter = {
            let completion = Arc::clone(&completion);
            std::thread::spawn(move || completion.wait())
        };
        completion.signal(Signal::Done);
        completion.signal(Signal::Failed);
        assert_eq!(waiter.join().expect("join"), Signal::Done);
    }

    #[test]
    fn unwinding_stream_fails_its_remaining_queue() {
        let shared = Shared::new(3);
        let queue = [0usize, 1, 2];
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut guard = QueueGuard {
                shared: &shared,
                queue: &queue,
                next: 0,
            };
            shared.events[0].signal(Signal::Done);
            guard.next += 1;
            panic!("kernel fault");
        }));
        assert!(unwound.is_err());
        assert!(shared.halted.load(Ordering::Acquire));
        assert_eq!(shared.events[0].wait(), Signal::Done);
        assert_eq!(shared.events[1].wait(), Signal::Failed);
        assert_eq!(shared.events[2].wait(), Signal::Failed);
    }
}
