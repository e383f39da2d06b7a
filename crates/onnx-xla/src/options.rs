//! Validated prepare/compile options.
//!
//! Callers pass a flat string map; every key is checked here so that nothing is
//! forwarded to the compiler unvalidated.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::error::{OnnxXlaError, Result};

pub const OPT_LEVEL_KEY: &str = "optimization_level";
pub const TIMEOUT_KEY: &str = "timeout_ms";
pub const DIM_BINDING_PREFIX: &str = "dim.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OptimizationLevel {
    /// Lower only.
    None,
    /// Constant folding and dead-code elimination.
    Basic,
    /// Adds exact fusions and common-subexpression elimination.
    #[default]
    Aggressive,
}

impl OptimizationLevel {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(OptimizationLevel::None),
            "1" | "basic" => Ok(OptimizationLevel::Basic),
            "2" | "aggressive" => Ok(OptimizationLevel::Aggressive),
            other => Err(OnnxXlaError::option(
                OPT_LEVEL_KEY,
                format!("expected none|basic|aggressive or 0|1|2, got `{other}`"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationLevel::None => "none",
            OptimizationLevel::Basic => "basic",
            OptimizationLevel::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    pub device: String,
    pub optimization_level: OptimizationLevel,
    pub timeout_ms: Option<u64>,
    /// Values for named dynamic input dimensions.
    pub dim_bindings: BTreeMap<String, usize>,
}

impl BackendOptions {
    /// Options for `device` with environment defaults.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            optimization_level: crate::env::default_optimization_level(),
            timeout_ms: crate::env::default_compile_timeout_ms(),
            dim_bindings: BTreeMap::new(),
        }
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_dim_binding(mut self, symbol: impl Into<String>, value: usize) -> Self {
        self.dim_bindings.insert(symbol.into(), value);
        self
    }

    /// Parses and validates a caller-supplied option map.
    pub fn from_map(device: impl Into<String>, map: &HashMap<String, String>) -> Result<Self> {
        let mut options = Self::new(device);
        let mut keys = map.keys().collect::<Vec<_>>();
        keys.sort();
        for key in keys {
            let value = &map[key];
            match key.as_str() {
                OPT_LEVEL_KEY => options.optimization_level = OptimizationLevel::parse(value)?,
                TIMEOUT_KEY => {
                    let ms = value.trim().parse::<u64>().map_err(|_| {
                        OnnxXlaError::option(
                            key,
                            format!("expected a non-negative integer, got `{value}`"),
                        )
                    })?;
                    options.timeout_ms = Some(ms);
                }
                other => match other.strip_prefix(DIM_BINDING_PREFIX) {
                    Some(symbol) if !symbol.is_empty() => {
                        let dim = value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .filter(|dim| *dim > 0)
                            .ok_or_else(|| {
                                OnnxXlaError::option(
                                    key,
                                    format!("expected a positive dimension, got `{value}`"),
                                )
                            })?;
                        options.dim_bindings.insert(symbol.to_string(), dim);
                    }
                    _ => return Err(OnnxXlaError::option(key, "unknown option")),
                },
            }
        }
        Ok(options)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Canonical text form used to key the executable cache.
    pub fn fingerprint(&self) -> String {
        let bindings = self
            .dim_bindings
            .iter()
            .map(|(symbol, dim)| format!("{symbol}={dim}"))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "device={};opt={};timeout={:?};dims=[{}]",
            self.device.to_ascii_uppercase(),
            self.optimization_level,
            self.timeout_ms,
            bindings
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_known_keys() {
        let options = BackendOptions::from_map(
            "CPU",
            &map(&[
                ("optimization_level", "basic"),
                ("timeout_ms", "2500"),
                ("dim.batch", "8"),
            ]),
        )
        .unwrap();
        assert_eq!(options.optimization_level, OptimizationLevel::Basic);
        assert_eq!(options.timeout_ms, Some(2500));
        assert_eq!(options.dim_bindings.get("batch"), Some(&8));
    }

    #[test]
    fn numeric_levels_are_accepted() {
        assert_eq!(OptimizationLevel::parse("0").unwrap(), OptimizationLevel::None);
        assert_eq!(
            OptimizationLevel::parse(" 2 ").unwrap(),
            OptimizationLevel::Aggressive
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_keys() {
        let err = BackendOptions::from_map("CPU", &map(&[("fast_math", "1")])).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InvalidOptions { ref key, .. } if key == "fast_math"));

        let err = BackendOptions::from_map("CPU", &map(&[("timeout_ms", "-3")])).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InvalidOptions { .. }));

        let err = BackendOptions::from_map("CPU", &map(&[("dim.batch", "0")])).unwrap_err();
        assert!(matches!(err, OnnxXlaError::InvalidOptions { .. }));
    }

    #[test]
    fn fingerprint_ignores_device_case() {
        let a = BackendOptions::new("cpu").with_optimization_level(OptimizationLevel::Basic);
        let b = BackendOptions::new("CPU").with_optimization_level(OptimizationLevel::Basic);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
