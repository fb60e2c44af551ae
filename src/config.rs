//! Runtime configuration
//!
//! Defaults, then an optional JSON document, then `GPU_OP_*` environment
//! overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;

use crate::backend::Vendor;
use crate::error::RuntimeError;

/// Work-group cap used when nothing else is configured.
pub const DEFAULT_MAX_WORK_GROUP_SIZE: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Host,
    Vulkan,
}

impl FromStr for BackendKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(BackendKind::Host),
            "vulkan" => Ok(BackendKind::Vulkan),
            other => Err(RuntimeError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Host => f.write_str("host"),
            BackendKind::Vulkan => f.write_str("vulkan"),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    pub device_index: usize,
    pub enable_validation: bool,
    /// Upper bound for work-group size; the device limit still applies.
    pub max_work_group_size: u32,
    pub compute_units: u32,
    /// Vendor path to select. The Vulkan backend reports the real vendor
    /// when this is `Generic`.
    pub vendor: Vendor,
    /// JSON manifest naming the SPIR-V file of each kernel (Vulkan only).
    pub kernel_manifest: Option<PathBuf>,
    /// Kernel names compiled when the runtime starts.
    pub precompile: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            device_index: 0,
            enable_validation: cfg!(feature = "validation"),
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
            compute_units: 1,
            vendor: Vendor::Generic,
            kernel_manifest: None,
            precompile: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document. Absent keys keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, RuntimeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RuntimeError::Config(format!("invalid JSON: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json(value: &Value) -> Result<Self, RuntimeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RuntimeError::Config("config root must be an object".to_string()))?;
        let mut config = Self::default();

        for (key, v) in obj {
            match key.as_str() {
                "backend" => config.backend = expect_str(key, v)?.parse()?,
                "device_index" => config.device_index = expect_u64(key, v)? as usize,
                "enable_validation" => {
                    config.enable_validation = v.as_bool().ok_or_else(|| type_error(key, "a bool"))?
                }
                "max_work_group_size" => config.max_work_group_size = expect_u32(key, v)?,
                "compute_units" => config.compute_units = expect_u32(key, v)?,
                "vendor" => config.vendor = expect_str(key, v)?.parse()?,
                "kernel_manifest" => {
                    config.kernel_manifest = Some(PathBuf::from(expect_str(key, v)?))
                }
                "precompile" => {
                    let list = v.as_array().ok_or_else(|| type_error(key, "an array"))?;
                    config.precompile = list
                        .iter()
                        .map(|n| expect_str(key, n).map(str::to_string))
                        .collect::<Result<_, _>>()?;
                }
                other => log::warn!("Ignoring unknown config key '{}'", other),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `GPU_OP_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, RuntimeError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GPU_OP_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = lookup("GPU_OP_DEVICE_INDEX") {
            self.device_index = parse_env("GPU_OP_DEVICE_INDEX", &v)?;
        }
        if let Some(v) = lookup("GPU_OP_MAX_WORK_GROUP") {
            self.max_work_group_size = parse_env("GPU_OP_MAX_WORK_GROUP", &v)?;
        }
        if let Some(v) = lookup("GPU_OP_VENDOR") {
            self.vendor = v.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_work_group_size == 0 {
            return Err(RuntimeError::Config(
                "max_work_group_size must be at least 1".to_string(),
            ));
        }
        if self.compute_units == 0 {
            return Err(RuntimeError::Config(
                "compute_units must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn type_error(key: &str, expected: &str) -> RuntimeError {
    RuntimeError::Config(format!("'{}' must be {}", key, expected))
}

fn expect_str<'a>(key: &str, v: &'a Value) -> Result<&'a str, RuntimeError> {
    v.as_str().ok_or_else(|| type_error(key, "a string"))
}

fn expect_u64(key: &str, v: &Value) -> Result<u64, RuntimeError> {
    v.as_u64().ok_or_else(|| type_error(key, "a non-negative integer"))
}

fn expect_u32(key: &str, v: &Value) -> Result<u32, RuntimeError> {
    u32::try_from(expect_u64(key, v)?).map_err(|_| type_error(key, "a 32-bit integer"))
}

fn parse_env<T: FromStr>(key: &str, v: &str) -> Result<T, RuntimeError> {
    v.trim()
        .parse()
        .map_err(|_| RuntimeError::Config(format!("{}='{}' is not a valid number", key, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.backend, BackendKind::Host);
        assert_eq!(c.max_work_group_size, 128);
        assert_eq!(c.compute_units, 1);
    }

    #[test]
    fn test_json_overrides_present_keys_only() {
        let c = RuntimeConfig::from_json_str(
            r#"{"vendor": "powervr", "compute_units": 4, "precompile": ["gather_FP32"]}"#,
        )
        .unwrap();
        let expected = RuntimeConfig {
            vendor: Vendor::PowerVR,
            compute_units: 4,
            precompile: vec!["gather_FP32".to_string()],
            ..RuntimeConfig::default()
        };
        assert_eq!(c, expected);
    }

    #[test]
    fn test_json_type_errors() {
        let err = RuntimeConfig::from_json_str(r#"{"compute_units": "four"}"#).unwrap_err();
        assert!(err.to_string().contains("compute_units"));
        assert!(RuntimeConfig::from_json_str("[1, 2]").is_err());
        assert!(RuntimeConfig::from_json_str(r#"{"max_work_group_size": 0}"#).is_err());
        assert!(RuntimeConfig::from_json_str(r#"{"backend": "metal"}"#).is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let c = RuntimeConfig::default()
            .with_overrides(|key| match key {
                "GPU_OP_MAX_WORK_GROUP" => Some("64".to_string()),
                "GPU_OP_VENDOR" => Some("mali".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(c.max_work_group_size, 64);
        assert_eq!(c.vendor, Vendor::Mali);

        let bad = RuntimeConfig::default().with_overrides(|key| {
            (key == "GPU_OP_DEVICE_INDEX").then(|| "first".to_string())
        });
        assert!(bad.is_err());
    }
}
