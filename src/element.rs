//! Element types stored in device buffers.

use half::f16;

use crate::tensor::DataType;

/// Scalar that can live in a tensor buffer.
///
/// Arithmetic is done in `f32`; integer conversions round and saturate.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DATA_TYPE: DataType;
    const SIZE: usize;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! int_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = $dtype;
            const SIZE: usize = std::mem::size_of::<$ty>();

            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }

            #[inline]
            fn from_f32(v: f32) -> Self {
                // `as` saturates and maps NaN to zero
                v.round() as $ty
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

int_element!(u8, DataType::UInt8);
int_element!(i8, DataType::Int8);
int_element!(i32, DataType::Int32);

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
    const SIZE: usize = 4;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::Float16;
    const SIZE: usize = 2;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    fn read_le(bytes: &[u8]) -> Self {
        f16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }
}

/// Decode a little-endian byte buffer into elements. Trailing bytes that do
/// not form a whole element are ignored.
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    for (chunk, v) in out.chunks_exact_mut(T::SIZE).zip(values) {
        v.write_le(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_conversion_saturates() {
        assert_eq!(u8::from_f32(300.0), 255);
        assert_eq!(u8::from_f32(-4.0), 0);
        assert_eq!(i8::from_f32(-200.0), -128);
        assert_eq!(i8::from_f32(2.5), 3);
        assert_eq!(i32::from_f32(f32::NAN), 0);
    }

    #[test]
    fn test_f16_bytes() {
        let values = [f16::from_f32(1.5), f16::from_f32(-2.0)];
        let bytes = encode(&values);
        assert_eq!(bytes.len(), 4);
        let back: Vec<f16> = decode(&bytes);
        assert_eq!(back[0].to_f32(), 1.5);
        assert_eq!(back[1].to_f32(), -2.0);
    }
}
