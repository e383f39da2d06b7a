use std::env;
use std::sync::OnceLock;

use crate::options::OptimizationLevel;

static OPT_LEVEL: OnceLock<OptimizationLevel> = OnceLock::new();
static COMPILE_TIMEOUT_MS: OnceLock<Option<u64>> = OnceLock::new();
static CACHE_CAPACITY: OnceLock<usize> = OnceLock::new();
static PASS_STATS: OnceLock<bool> = OnceLock::new();
static OPT_MAX_ITERS: OnceLock<usize> = OnceLock::new();

const DEFAULT_CACHE_CAPACITY: usize = 16;
const DEFAULT_OPT_MAX_ITERS: usize = 4;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parse_usize(name: &str, default: usize) -> usize {
    match read_var(name) {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %value, "ignoring unparsable environment value");
            default
        }),
        None => default,
    }
}

/// Optimization level used when a prepare call does not set one.
pub(crate) fn default_optimization_level() -> OptimizationLevel {
    *OPT_LEVEL.get_or_init(|| match read_var("ONNX_XLA_OPT_LEVEL") {
        Some(value) => OptimizationLevel::parse(&value).unwrap_or_else(|_| {
            tracing::warn!(value = %value, "ignoring unknown ONNX_XLA_OPT_LEVEL");
            OptimizationLevel::default()
        }),
        None => OptimizationLevel::default(),
    })
}

/// Compile deadline used when a prepare call does not set `timeout_ms`.
pub(crate) fn default_compile_timeout_ms() -> Option<u64> {
    *COMPILE_TIMEOUT_MS.get_or_init(|| {
        read_var("ONNX_XLA_COMPILE_TIMEOUT_MS").and_then(|value| match value.trim().parse() {
            Ok(ms) => Some(ms),
            Err(_) => {
                tracing::warn!(value = %value, "ignoring unparsable ONNX_XLA_COMPILE_TIMEOUT_MS");
                None
            }
        })
    })
}

/// Number of prepared executables retained by a backend facade; 0 disables caching.
pub(crate) fn executable_cache_capacity() -> usize {
    *CACHE_CAPACITY
        .get_or_init(|| parse_usize("ONNX_XLA_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY))
}

pub(crate) fn pass_stats_enabled() -> bool {
    *PASS_STATS.get_or_init(|| match read_var("ONNX_XLA_PASS_STATS") {
        Some(value) => parse_bool(&value),
        None => false,
    })
}

pub(crate) fn optimizer_max_iters() -> usize {
    *OPT_MAX_ITERS
        .get_or_init(|| parse_usize("ONNX_XLA_OPT_MAX_ITERS", DEFAULT_OPT_MAX_ITERS).max(1))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value} should be truthy");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value} should be falsy");
        }
    }
}
