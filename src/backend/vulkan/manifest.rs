//! Kernel manifest
//!
//! Maps full kernel names to SPIR-V files:
//!
//! ```json
//! { "kernels": [
//!     { "name": "gather_FP32", "file": "gather_fp32.spv", "entry": "main",
//!       "args": ["buffer", "buffer", "buffer", "u32", "u32", "u32"] }
//! ] }
//! ```
//!
//! Relative file paths resolve against the manifest's directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::VulkanErrorKind;
use crate::kernel::{ArgKind, KernelName};

/// Storage-buffer bindings in the shared descriptor set layout.
pub const MAX_BUFFER_BINDINGS: usize = 8;
/// Push-constant block size; every scalar takes four bytes.
pub const MAX_PUSH_CONSTANT_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub file: PathBuf,
    pub entry: String,
    pub signature: Vec<ArgKind>,
}

#[derive(Debug, Clone, Default)]
pub struct KernelManifest {
    entries: HashMap<String, ManifestEntry>,
}

fn invalid(reason: impl Into<String>) -> VulkanErrorKind {
    VulkanErrorKind::ManifestInvalid(reason.into())
}

/// Check that a signature fits the binding layout.
pub fn check_signature(name: &str, signature: &[ArgKind]) -> Result<(), VulkanErrorKind> {
    let buffers = signature.iter().filter(|k| **k == ArgKind::Buffer).count();
    if buffers > MAX_BUFFER_BINDINGS {
        return Err(invalid(format!(
            "{}: {} buffers exceed {} bindings",
            name, buffers, MAX_BUFFER_BINDINGS
        )));
    }
    let scalar_bytes = (signature.len() - buffers) * 4;
    if scalar_bytes > MAX_PUSH_CONSTANT_BYTES {
        return Err(invalid(format!(
            "{}: {} bytes of scalars exceed the {}-byte push-constant block",
            name, scalar_bytes, MAX_PUSH_CONSTANT_BYTES
        )));
    }
    Ok(())
}

impl KernelManifest {
    pub fn from_file(path: &Path) -> Result<Self, VulkanErrorKind> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read {}: {}", path.display(), e)))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&text, base)
    }

    pub fn from_json_str(text: &str, base_dir: &Path) -> Result<Self, VulkanErrorKind> {
        let root: Value =
            serde_json::from_str(text).map_err(|e| invalid(format!("invalid JSON: {}", e)))?;
        let kernels = root
            .get("kernels")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("missing 'kernels' array"))?;

        let mut entries = HashMap::with_capacity(kernels.len());
        for (i, k) in kernels.iter().enumerate() {
            let entry = parse_entry(i, k, base_dir)?;
            if entries.contains_key(&entry.name) {
                return Err(invalid(format!("duplicate kernel '{}'", entry.name)));
            }
            entries.insert(entry.name.clone(), entry);
        }
        log::debug!("Kernel manifest: {} entries", entries.len());
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(index: usize, value: &Value, base_dir: &Path) -> Result<ManifestEntry, VulkanErrorKind> {
    let field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("kernel #{}: missing string '{}'", index, key)))
    };
    let name = field("name")?.to_string();
    KernelName::parse(&name).map_err(|e| invalid(format!("kernel #{}: {}", index, e)))?;

    let file = Path::new(field("file")?);
    let file = if file.is_absolute() {
        file.to_path_buf()
    } else {
        base_dir.join(file)
    };
    let entry = value
        .get("entry")
        .and_then(Value::as_str)
        .unwrap_or("main")
        .to_string();

    let args = value
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("{}: missing 'args' array", name)))?;
    let signature = args
        .iter()
        .map(|a| {
            a.as_str()
                .and_then(ArgKind::parse)
                .ok_or_else(|| invalid(format!("{}: bad argument kind {}", name, a)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_signature(&name, &signature)?;

    Ok(ManifestEntry {
        name,
        file,
        entry,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "kernels": [
            { "name": "gather_FP32", "file": "gather_fp32.spv",
              "args": ["buffer", "buffer", "buffer", "u32", "u32", "u32"] },
            { "name": "SIGNEDpad_INT8", "file": "/opt/spv/pad.spv", "entry": "pad_main",
              "args": ["buffer", "buffer", "i32", "f32"] }
        ]
    }"#;

    #[test]
    fn test_parse_resolves_paths_and_defaults() {
        let m = KernelManifest::from_json_str(MANIFEST, Path::new("/kernels")).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.names(), vec!["SIGNEDpad_INT8", "gather_FP32"]);

        let gather = m.get("gather_FP32").unwrap();
        assert_eq!(gather.file, PathBuf::from("/kernels/gather_fp32.spv"));
        assert_eq!(gather.entry, "main");
        assert_eq!(gather.signature[3], ArgKind::U32);

        let pad = m.get("SIGNEDpad_INT8").unwrap();
        assert_eq!(pad.file, PathBuf::from("/opt/spv/pad.spv"));
        assert_eq!(pad.entry, "pad_main");
        assert_eq!(pad.signature, vec![ArgKind::Buffer, ArgKind::Buffer, ArgKind::I32, ArgKind::F32]);
    }

    #[test]
    fn test_rejects_bad_documents() {
        let base = Path::new(".");
        assert!(KernelManifest::from_json_str("[]", base).is_err());
        assert!(KernelManifest::from_json_str("{ \"kernels\": 3 }", base).is_err());

        let no_suffix = r#"{ "kernels": [ { "name": "gather", "file": "g.spv", "args": [] } ] }"#;
        assert!(KernelManifest::from_json_str(no_suffix, base).is_err());

        let bad_kind = r#"{ "kernels": [ { "name": "gather_FP32", "file": "g.spv", "args": ["f64"] } ] }"#;
        assert!(KernelManifest::from_json_str(bad_kind, base).is_err());

        let dup = r#"{ "kernels": [
            { "name": "tanh_FP32", "file": "a.spv", "args": [] },
            { "name": "tanh_FP32", "file": "b.spv", "args": [] } ] }"#;
        let err = KernelManifest::from_json_str(dup, base).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_signature_limits() {
        let nine = vec![ArgKind::Buffer; 9];
        assert!(check_signature("k", &nine).is_err());
        let mut wide = vec![ArgKind::Buffer; 2];
        wide.extend(std::iter::repeat(ArgKind::U32).take(32));
        assert!(check_signature("k", &wide).is_ok());
        wide.push(ArgKind::F32);
        assert!(check_signature("k", &wide).is_err());
    }
}
