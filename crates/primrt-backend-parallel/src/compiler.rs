use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use primrt::backend::{BackendError, BackendResult};
use primrt::profiling;
use serde::{Deserialize, Serialize};

use crate::ParallelKernel;

/// Smallest number of output elements handed to one rayon task.
pub const MIN_TASK_ELEMENTS: usize = 4096;

/// Everything a compiled kernel needs at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelPlan {
    pub kernel: ParallelKernel,
    /// Output elements produced by the kernel.
    pub elements: usize,
    /// Innermost extent of the input; rows for reductions.
    pub inner: usize,
    /// Output elements per rayon task.
    pub chunk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct KernelKey {
    kernel: ParallelKernel,
    elements: usize,
    inner: usize,
}

static COMPILED: Lazy<Mutex<HashMap<KernelKey, Arc<KernelPlan>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn task_chunk(elements: usize, inner: usize, threads: usize) -> usize {
    let per_task_work = MIN_TASK_ELEMENTS / inner.max(1);
    let balanced = elements.div_ceil(threads.max(1) * 4);
    balanced.max(per_task_work).max(1)
}

/// Plans a kernel for the current rayon pool, reusing an earlier plan for the same key.
pub fn compile(
    kernel: ParallelKernel,
    elements: usize,
    inner: usize,
) -> BackendResult<Arc<KernelPlan>> {
    let key = KernelKey {
        kernel,
        elements,
        inner,
    };
    let mut compiled = COMPILED
        .lock()
        .map_err(|_| BackendError::execution("parallel kernel cache mutex poisoned"))?;
    if let Some(plan) = compiled.get(&key) {
        profiling::cache_event("parallel_backend.kernel_hit");
        return Ok(Arc::clone(plan));
    }
    profiling::cache_event("parallel_backend.kernel_miss");
    let _scope = profiling::compile_scope("parallel_backend.compile");
    let plan = Arc::new(KernelPlan {
        kernel,
        elements,
        inner,
        chunk: task_chunk(elements, inner, rayon::current_num_threads()),
    });
    tracing::trace!(?kernel, elements, inner, chunk = plan.chunk, "compiled parallel kernel");
    compiled.insert(key, Arc::clone(&plan));
    Ok(plan)
}

/// Adopts a plan restored from an artifact. A cached plan for the same key wins so that
/// every instance of a key dispatches identically.
pub fn adopt(plan: KernelPlan) -> BackendResult<Arc<KernelPlan>> {
    let key = KernelKey {
        kernel: plan.kernel,
        elements: plan.elements,
        inner: plan.inner,
    };
    let mut compiled = COMPILED
        .lock()
        .map_err(|_| BackendError::execution("parallel kernel cache mutex poisoned"))?;
    Ok(Arc::clone(compiled.entry(key).or_insert_with(|| Arc::new(plan))))
}
