use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::plan::MemoryPlan;
use crate::tensor::TensorData;

/// Arena of typed slots backing a memory plan.
///
/// Slots are addressed by index and guarded individually, so instances touching disjoint
/// slots never contend. A slot only grows; growth is charged against the optional byte
/// limit.
pub struct MemoryPool {
    slots: Vec<RwLock<TensorData>>,
    limit: Option<usize>,
    allocated: AtomicUsize,
}

impl MemoryPool {
    /// Allocates every sized slot up front. Slots with unbounded capacity start empty.
    pub fn allocate(plan: &MemoryPlan, limit: Option<usize>) -> RuntimeResult<Self> {
        let pool = Self {
            slots: plan
                .slots()
                .iter()
                .map(|slot| RwLock::new(TensorData::empty(slot.dtype)))
                .collect(),
            limit,
            allocated: AtomicUsize::new(0),
        };
        for slot in plan.slots() {
            if let Some(capacity) = slot.capacity {
                pool.ensure_capacity(slot.id, capacity)?;
            }
        }
        tracing::debug!(
            slots = pool.slots.len(),
            bytes = pool.allocated_bytes(),
            "allocated memory pool"
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn slot_len(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, |lock| {
            lock.read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len()
        })
    }

    /// Grows `slot` to hold at least `elements` values. Returns whether it grew.
    pub fn ensure_capacity(&self, slot: usize, elements: usize) -> RuntimeResult<bool> {
        let mut data = self.write(slot)?;
        let current = data.len();
        if current >= elements {
            return Ok(false);
        }
        let element_size = data.dtype().size_in_bytes();
        let requested = elements.saturating_mul(element_size);
        let additional = (elements - current).saturating_mul(element_size);
        self.charge(slot, requested, additional)?;
        if let Err(err) = data.try_grow(elements) {
            self.allocated.fetch_sub(additional, Ordering::AcqRel);
            return Err(RuntimeError::AllocationFailure {
                requested,
                slot,
                reason: err.to_string(),
            });
        }
        if current > 0 {
            tracing::debug!(slot, from = current, to = elements, "grew pool slot");
        }
        Ok(true)
    }

    fn charge(&self, slot: usize, requested: usize, additional: usize) -> RuntimeResult<()> {
        let limit = self.limit;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                let total = allocated.checked_add(additional)?;
                match limit {
                    Some(limit) if total > limit => None,
                    _ => Some(total),
                }
            })
            .map(|_| ())
            .map_err(|allocated| RuntimeError::AllocationFailure {
                requested,
                slot,
                reason: format!(
                    "pool holds {allocated} bytes, limit is {} bytes",
                    limit.map_or_else(|| "unbounded".to_string(), |limit| limit.to_string())
                ),
            })
    }

    pub fn read(&self, slot: usize) -> RuntimeResult<RwLockReadGuard<'_, TensorData>> {
        let lock = self.slot(slot)?;
        // Slot contents after a panicking writer are undefined either way.
        Ok(lock.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    pub fn write(&self, slot: usize) -> RuntimeResult<RwLockWriteGuard<'_, TensorData>> {
        let lock = self.slot(slot)?;
        Ok(lock.write().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn slot(&self, slot: usize) -> RuntimeResult<&RwLock<TensorData>> {
        self.slots.get(slot).ok_or_else(|| RuntimeError::AllocationFailure {
            requested: 0,
            slot,
            reason: format!("pool has {} slots", self.slots.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, UnaryOp};
    use crate::layout::{DType, Dim, Layout};
    use crate::memory::plan::{plan_memory, PlanOptions};

    fn dynamic_plan() -> MemoryPlan {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::dynamic(DType::F32, vec![Dim::Unbounded]));
        let y = builder.unary(UnaryOp::Neg, x).expect("neg");
        let graph = builder.finish(&[y]).expect("graph");
        plan_memory(&graph, &PlanOptions::default()).expect("plan")
    }

    #[test]
    fn unbounded_slots_start_empty_and_grow() {
        let pool = MemoryPool::allocate(&dynamic_plan(), None).expect("pool");
        assert_eq!(pool.allocated_bytes(), 0);
        assert!(pool.ensure_capacity(0, 16).expect("grow"));
        assert!(!pool.ensure_capacity(0, 8).expect("no-op"));
        assert_eq!(pool.slot_len(0), 16);
        assert_eq!(pool.allocated_bytes(), 64);
    }

    #[test]
    fn growth_beyond_limit_reports_requested_bytes() {
        let pool = MemoryPool::allocate(&dynamic_plan(), Some(100)).expect("pool");
        pool.ensure_capacity(0, 16).expect("within limit");
        match pool.ensure_capacity(1, 16) {
            Err(RuntimeError::AllocationFailure { requested, slot, .. }) => {
                assert_eq!(requested, 64);
                assert_eq!(slot, 1);
            }
            other => panic!("expected AllocationFailure, got {other:?}"),
        }
        assert_eq!(pool.allocated_bytes(), 64);
    }
}
