//! Runtime configuration shared by program build and execution.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::env;

/// Knobs that shape how a program is built and executed.
///
/// Defaults describe a single-stream program with the in-memory caches enabled and no
/// pool limit. `from_env` layers `PRIMRT_*` variables on top of the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of execution streams. Values below one are treated as one.
    pub streams: usize,
    /// Capacity of the per-program implementation cache; zero disables it.
    pub impl_cache_capacity: usize,
    /// Consult and populate the artifact store during build.
    pub artifact_cache: bool,
    /// Directory backing the artifact store when the caller does not supply one.
    pub artifact_dir: Option<PathBuf>,
    /// Upper bound on bytes held by the memory pool.
    pub max_pool_bytes: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            streams: 1,
            impl_cache_capacity: 64,
            artifact_cache: true,
            artifact_dir: None,
            max_pool_bytes: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(streams) = env::env_usize(env::PRIMRT_STREAMS) {
            config.streams = streams.max(1);
        }
        if let Some(capacity) = env::env_usize(env::PRIMRT_IMPL_CACHE) {
            config.impl_cache_capacity = capacity;
        }
        if let Some(enabled) = env::env_bool(env::PRIMRT_ARTIFACT_CACHE) {
            config.artifact_cache = enabled;
        }
        if let Some(dir) = env::env_path(env::PRIMRT_ARTIFACT_DIR) {
            config.artifact_dir = Some(dir);
        }
        if let Some(limit) = env::env_usize(env::PRIMRT_MAX_POOL_BYTES) {
            config.max_pool_bytes = Some(limit);
        }
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_streams(mut self, streams: usize) -> Self {
        self.streams = streams.max(1);
        self
    }

    pub fn with_max_pool_bytes(mut self, limit: usize) -> Self {
        self.max_pool_bytes = Some(limit);
        self
    }

    pub fn with_impl_cache_capacity(mut self, capacity: usize) -> Self {
        self.impl_cache_capacity = capacity;
        self
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.streams.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_keep_unspecified_defaults() {
        let config = RuntimeConfig::from_json_str(r#"{"streams": 3, "max_pool_bytes": 4096}"#)
            .expect("parse config");
        assert_eq!(config.streams, 3);
        assert_eq!(config.max_pool_bytes, Some(4096));
        assert_eq!(config.impl_cache_capacity, 64);
        assert!(config.artifact_cache);
    }

    #[test]
    fn zero_streams_clamps_to_one() {
        let config = RuntimeConfig::default().with_streams(0);
        assert_eq!(config.stream_count(), 1);
    }
}
