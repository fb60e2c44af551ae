//! Precision tags and fused activation clamps

use std::fmt;

use crate::tensor::DataType;

/// Declared numeric representation of an operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrecisionType {
    Fp32,
    Fp16,
    /// Unsigned 8-bit quantized.
    UInt8,
    /// Signed 8-bit quantized.
    Int8,
}

impl PrecisionType {
    pub const ALL: [PrecisionType; 4] = [
        PrecisionType::Fp32,
        PrecisionType::Fp16,
        PrecisionType::UInt8,
        PrecisionType::Int8,
    ];

    /// Mandatory kernel-name suffix. Both 8-bit tags share `_INT8`; the
    /// `SIGNED` prefix tells them apart.
    pub fn suffix(self) -> &'static str {
        match self {
            PrecisionType::Fp32 => "_FP32",
            PrecisionType::Fp16 => "_FP16",
            PrecisionType::UInt8 | PrecisionType::Int8 => "_INT8",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrecisionType::Fp32 | PrecisionType::Fp16)
    }

    pub fn is_quantized(self) -> bool {
        !self.is_float()
    }

    /// Element type a tensor must carry to be processed at this precision.
    pub fn storage_type(self) -> DataType {
        match self {
            PrecisionType::Fp32 => DataType::Float32,
            PrecisionType::Fp16 => DataType::Float16,
            PrecisionType::UInt8 => DataType::UInt8,
            PrecisionType::Int8 => DataType::Int8,
        }
    }

    /// Representable quantized range.
    pub fn quant_range(self) -> (i32, i32) {
        match self {
            PrecisionType::Int8 => (i8::MIN as i32, i8::MAX as i32),
            _ => (u8::MIN as i32, u8::MAX as i32),
        }
    }
}

impl fmt::Display for PrecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PrecisionType::Fp32 => "FP32",
            PrecisionType::Fp16 => "FP16",
            PrecisionType::UInt8 => "UINT8",
            PrecisionType::Int8 => "INT8",
        };
        f.write_str(text)
    }
}

/// Activation clamp fused into a kernel epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
}

impl Activation {
    pub const ALL: [Activation; 3] = [Activation::None, Activation::Relu, Activation::Relu6];

    pub fn prefix(self) -> &'static str {
        match self {
            Activation::None => "",
            Activation::Relu => "RELU",
            Activation::Relu6 => "RELU6",
        }
    }

    #[inline]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Activation::None => v,
            Activation::Relu => v.max(0.0),
            Activation::Relu6 => v.clamp(0.0, 6.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eight_bit_tags_share_suffix() {
        assert_eq!(PrecisionType::UInt8.suffix(), PrecisionType::Int8.suffix());
        assert_eq!(PrecisionType::Fp16.suffix(), "_FP16");
    }

    #[test]
    fn test_activation_clamps() {
        assert_eq!(Activation::Relu.apply(-3.0), 0.0);
        assert_eq!(Activation::Relu6.apply(9.0), 6.0);
        assert_eq!(Activation::None.apply(-3.0), -3.0);
    }
}
