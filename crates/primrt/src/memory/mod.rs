//! Memory planning and the slot arena it drives.

pub mod plan;
pub mod pool;

pub use plan::{
    plan_memory, AliasKind, BufferSlot, BufferSpec, BufferUsage, LiveRange, MemoryPlan, PlanError,
    PlanOptions, Reachability,
};
pub use pool::MemoryPool;

use crate::error::RuntimeError;

impl From<PlanError> for RuntimeError {
    fn from(err: PlanError) -> Self {
        RuntimeError::InvalidGraph {
            reason: err.to_string(),
        }
    }
}
