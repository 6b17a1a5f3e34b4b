use std::env;
use std::path::PathBuf;

pub(crate) const PRIMRT_STREAMS: &str = "PRIMRT_STREAMS";
pub(crate) const PRIMRT_ARTIFACT_DIR: &str = "PRIMRT_ARTIFACT_DIR";
pub(crate) const PRIMRT_ARTIFACT_CACHE: &str = "PRIMRT_ARTIFACT_CACHE";
pub(crate) const PRIMRT_IMPL_CACHE: &str = "PRIMRT_IMPL_CACHE";
pub(crate) const PRIMRT_MAX_POOL_BYTES: &str = "PRIMRT_MAX_POOL_BYTES";

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    non_empty(name).map(|value| parse_bool(&value))
}

/// Unparseable values are ignored with a warning rather than failing configuration.
pub(crate) fn env_usize(name: &str) -> Option<usize> {
    let raw = non_empty(name)?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(variable = name, value = %raw, error = %err, "ignoring malformed value");
            None
        }
    }
}

pub(crate) fn env_path(name: &str) -> Option<PathBuf> {
    non_empty(name).map(|value| PathBuf::from(value.trim()))
}
