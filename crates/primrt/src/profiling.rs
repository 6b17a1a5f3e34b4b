//! Process-wide counters for cache traffic and timing of compile-like work.
//!
//! Counters are cumulative for the process; callers that want deltas take a snapshot
//! before and after.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub calls: u64,
    pub total: Duration,
}

#[derive(Default)]
struct Profiler {
    events: BTreeMap<&'static str, u64>,
    scopes: BTreeMap<&'static str, ScopeStats>,
}

static PROFILER: Lazy<Mutex<Profiler>> = Lazy::new(|| Mutex::new(Profiler::default()));

fn with_profiler<R>(f: impl FnOnce(&mut Profiler) -> R) -> R {
    // A panicking recorder must not take the counters down with it.
    let mut guard = match PROFILER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

/// Records one occurrence of a named cache event (hit, miss, reject, ...).
#[inline]
pub fn cache_event(name: &'static str) {
    with_profiler(|p| *p.events.entry(name).or_insert(0) += 1);
    tracing::trace!(event = name, "cache event");
}

pub fn event_count(name: &str) -> u64 {
    with_profiler(|p| p.events.get(name).copied().unwrap_or(0))
}

pub fn scope_stats(name: &str) -> ScopeStats {
    with_profiler(|p| p.scopes.get(name).copied().unwrap_or_default())
}

pub fn snapshot_events() -> Vec<(&'static str, u64)> {
    with_profiler(|p| p.events.iter().map(|(k, v)| (*k, *v)).collect())
}

/// Times the enclosing scope under `name` until the guard drops.
#[must_use = "the scope is measured until the guard is dropped"]
pub struct ScopeGuard {
    name: &'static str,
    start: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        with_profiler(|p| {
            let entry = p.scopes.entry(self.name).or_default();
            entry.calls = entry.calls.saturating_add(1);
            entry.total = entry.total.saturating_add(elapsed);
        });
        tracing::trace!(scope = self.name, elapsed_us = elapsed.as_micros() as u64, "scope closed");
    }
}

#[inline]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        name,
        start: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_events_accumulate() {
        let before = event_count("profiling.test_event");
        cache_event("profiling.test_event");
        cache_event("profiling.test_event");
        assert_eq!(event_count("profiling.test_event"), before + 2);
    }

    #[test]
    fn compile_scope_records_a_call_on_drop() {
        let before = scope_stats("profiling.test_scope").calls;
        {
            let _scope = compile_scope("profiling.test_scope");
        }
        assert_eq!(scope_stats("profiling.test_scope").calls, before + 1);
    }
}
