//! Kernel names, handles and typed arguments
//!
//! Kernel variants are named by composing fixed tokens around an
//! operator's base name:
//!
//! ```text
//! [SIGNED][RELU|RELU6][MERGEADD][INT32]<base><infix...><_FP32|_FP16|_INT8>
//! ```
//!
//! Token order is fixed, so the order the flags are set in never changes
//! the result.

pub mod registry;

use std::fmt;
use std::sync::Arc;

use crate::backend::Program;
use crate::error::RuntimeError;
use crate::memory::DeviceMemory;
use crate::precision::{Activation, PrecisionType};
use crate::tensor::Tensor;

pub use registry::{KernelRegistry, RegistryStats};

const SIGNED: &str = "SIGNED";
const MERGEADD: &str = "MERGEADD";
const INT32: &str = "INT32";

/// Unsuffixed kernel name plus the structural flags that mangle it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelName {
    base: String,
    infix: String,
    signed: bool,
    activation: Activation,
    merge_add: bool,
    int32_input: bool,
}

impl KernelName {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            infix: String::new(),
            signed: false,
            activation: Activation::None,
            merge_add: false,
            int32_input: false,
        }
    }

    /// Signed 8-bit data (`SIGNED` prefix).
    pub fn signed(mut self, on: bool) -> Self {
        self.signed = on;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Fused residual-add epilogue (`MERGEADD` prefix).
    pub fn merge_add(mut self, on: bool) -> Self {
        self.merge_add = on;
        self
    }

    /// INT32 input overriding the declared precision (`INT32` prefix).
    pub fn int32_input(mut self, on: bool) -> Self {
        self.int32_input = on;
        self
    }

    /// Structural token appended after the base, e.g. `_srcdepth2`.
    pub fn infix(mut self, token: &str) -> Self {
        self.infix.push_str(token);
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn activation_kind(&self) -> Activation {
        self.activation
    }

    pub fn is_merge_add(&self) -> bool {
        self.merge_add
    }

    pub fn is_int32_input(&self) -> bool {
        self.int32_input
    }

    /// Base name with infix tokens, no prefixes.
    pub fn stem(&self) -> String {
        format!("{}{}", self.base, self.infix)
    }

    /// Name without the precision suffix.
    pub fn compose(&self) -> String {
        let mut name = String::with_capacity(self.base.len() + self.infix.len() + 24);
        if self.signed {
            name.push_str(SIGNED);
        }
        name.push_str(self.activation.prefix());
        if self.merge_add {
            name.push_str(MERGEADD);
        }
        if self.int32_input {
            name.push_str(INT32);
        }
        name.push_str(&self.base);
        name.push_str(&self.infix);
        name
    }

    /// Full registry name.
    pub fn with_precision(&self, precision: PrecisionType) -> String {
        format!("{}{}", self.compose(), precision.suffix())
    }

    /// Split a full registry name back into flags, stem and precision.
    ///
    /// The stem comes back as the base; infix boundaries are not recoverable
    /// and not needed to look a program up.
    pub fn parse(full: &str) -> Result<(KernelName, PrecisionType), RuntimeError> {
        let (rest, suffix_precision) = [
            ("_FP32", PrecisionType::Fp32),
            ("_FP16", PrecisionType::Fp16),
            ("_INT8", PrecisionType::UInt8),
        ]
        .iter()
        .find_map(|(suffix, p)| full.strip_suffix(suffix).map(|r| (r, *p)))
        .ok_or_else(|| RuntimeError::resolution(full, "missing precision suffix"))?;

        let mut rest = rest;
        let mut take = |token: &str| match rest.strip_prefix(token) {
            Some(r) => {
                rest = r;
                true
            }
            None => false,
        };
        let signed = take(SIGNED);
        let activation = if take("RELU6") {
            Activation::Relu6
        } else if take("RELU") {
            Activation::Relu
        } else {
            Activation::None
        };
        let merge_add = take(MERGEADD);
        let int32_input = take(INT32);

        if rest.is_empty() {
            return Err(RuntimeError::resolution(full, "empty base name"));
        }
        let precision = match (signed, suffix_precision) {
            (true, PrecisionType::UInt8) => PrecisionType::Int8,
            (true, _) => {
                return Err(RuntimeError::resolution(
                    full,
                    "SIGNED prefix requires the _INT8 suffix",
                ))
            }
            (false, p) => p,
        };
        let name = KernelName::new(rest)
            .signed(signed)
            .activation(activation)
            .merge_add(merge_add)
            .int32_input(int32_input);
        Ok((name, precision))
    }
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compose())
    }
}

/// Kind of one positional kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Buffer,
    U32,
    I32,
    F32,
}

impl ArgKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "buffer" => Some(ArgKind::Buffer),
            "u32" => Some(ArgKind::U32),
            "i32" => Some(ArgKind::I32),
            "f32" => Some(ArgKind::F32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(Arc<dyn DeviceMemory>),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl KernelArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            KernelArg::Buffer(_) => ArgKind::Buffer,
            KernelArg::U32(_) => ArgKind::U32,
            KernelArg::I32(_) => ArgKind::I32,
            KernelArg::F32(_) => ArgKind::F32,
        }
    }

    /// Scalar payload as little-endian bytes; buffers have none.
    pub fn scalar_bytes(&self) -> Option<[u8; 4]> {
        match self {
            KernelArg::Buffer(_) => None,
            KernelArg::U32(v) => Some(v.to_le_bytes()),
            KernelArg::I32(v) => Some(v.to_le_bytes()),
            KernelArg::F32(v) => Some(v.to_le_bytes()),
        }
    }
}

/// Ordered argument list, one call per kernel parameter.
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(mut self, tensor: &Tensor) -> Self {
        self.args.push(KernelArg::Buffer(tensor.buffer()));
        self
    }

    pub fn memory(mut self, memory: Arc<dyn DeviceMemory>) -> Self {
        self.args.push(KernelArg::Buffer(memory));
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.args.push(KernelArg::U32(v));
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        self.args.push(KernelArg::I32(v));
        self
    }

    pub fn f32(mut self, v: f32) -> Self {
        self.args.push(KernelArg::F32(v));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn as_slice(&self) -> &[KernelArg] {
        &self.args
    }

    pub fn into_vec(self) -> Vec<KernelArg> {
        self.args
    }
}

/// A resolved, launchable program variant. Cheap to clone.
#[derive(Clone)]
pub struct KernelHandle {
    name: String,
    program: Arc<dyn Program>,
}

impl KernelHandle {
    pub(crate) fn new(name: String, program: Arc<dyn Program>) -> Self {
        Self { name, program }
    }

    /// Full registry name including the precision suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Arc<dyn Program> {
        &self.program
    }

    pub fn signature(&self) -> &[ArgKind] {
        self.program.signature()
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_order_is_fixed() {
        let a = KernelName::new("gemmBlocked")
            .merge_add(true)
            .activation(Activation::Relu6);
        let b = KernelName::new("gemmBlocked")
            .activation(Activation::Relu6)
            .merge_add(true);
        assert_eq!(a.compose(), "RELU6MERGEADDgemmBlocked");
        assert_eq!(a.compose(), b.compose());
        assert_eq!(a.with_precision(PrecisionType::Fp16), "RELU6MERGEADDgemmBlocked_FP16");
    }

    #[test]
    fn test_infix_tokens_follow_base() {
        let name = KernelName::new("powervr")
            .infix("_is1x11")
            .infix("_srcdepth1")
            .infix("_block211")
            .activation(Activation::Relu);
        assert_eq!(
            name.with_precision(PrecisionType::Fp32),
            "RELUpowervr_is1x11_srcdepth1_block211_FP32"
        );
    }

    #[test]
    fn test_parse_recovers_flags() {
        let (name, precision) = KernelName::parse("SIGNEDgather_INT8").unwrap();
        assert!(name.is_signed());
        assert_eq!(name.stem(), "gather");
        assert_eq!(precision, PrecisionType::Int8);

        let (name, precision) = KernelName::parse("INT32gather_FP32").unwrap();
        assert!(name.is_int32_input());
        assert_eq!(precision, PrecisionType::Fp32);

        let (name, precision) = KernelName::parse("gather_INT8").unwrap();
        assert!(!name.is_signed());
        assert_eq!(precision, PrecisionType::UInt8);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(KernelName::parse("gather").is_err());
        assert!(KernelName::parse("SIGNEDgather_FP32").is_err());
        assert!(KernelName::parse("RELU_FP32").is_err());
    }

    #[test]
    fn test_scalar_bytes() {
        assert_eq!(KernelArg::U32(1).scalar_bytes(), Some([1, 0, 0, 0]));
        assert_eq!(KernelArg::F32(1.0).scalar_bytes(), Some(1.0f32.to_le_bytes()));
        assert_eq!(KernelArg::I32(-1).kind(), ArgKind::I32);
    }
}
