//! Launch context seen by host kernels.

use crate::element::{self, Element};
use crate::error::RuntimeError;
use crate::kernel::{KernelArg, KernelName};
use crate::precision::{Activation, PrecisionType};
use crate::worksize::WorkSize;

/// Element type a host program instantiates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    F32,
    F16,
    U8,
    I8,
    I32,
}

/// Flags parsed from the program name, visible to the kernel body.
#[derive(Debug, Clone)]
pub struct Variant {
    pub name: KernelName,
    pub precision: PrecisionType,
}

impl Variant {
    pub fn element(&self) -> ElementKind {
        if self.name.is_int32_input() {
            return ElementKind::I32;
        }
        match self.precision {
            PrecisionType::Fp32 => ElementKind::F32,
            PrecisionType::Fp16 => ElementKind::F16,
            PrecisionType::UInt8 => ElementKind::U8,
            PrecisionType::Int8 => ElementKind::I8,
        }
    }

    pub fn quantized(&self) -> bool {
        matches!(self.element(), ElementKind::U8 | ElementKind::I8)
    }

    pub fn activation(&self) -> Activation {
        self.name.activation_kind()
    }

    pub fn merge_add(&self) -> bool {
        self.name.is_merge_add()
    }
}

pub struct HostLaunch<'a> {
    kernel: &'a str,
    args: &'a [KernelArg],
    work: &'a WorkSize,
}

impl<'a> HostLaunch<'a> {
    pub fn new(kernel: &'a str, args: &'a [KernelArg], work: &'a WorkSize) -> Self {
        Self { kernel, args, work }
    }

    pub fn fail(&self, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::kernel(self.kernel, reason)
    }

    fn arg(&self, index: usize) -> Result<&KernelArg, RuntimeError> {
        self.args
            .get(index)
            .ok_or_else(|| self.fail(format!("missing argument {}", index)))
    }

    /// Read a whole buffer argument.
    pub fn load<T: Element>(&self, index: usize) -> Result<Vec<T>, RuntimeError> {
        match self.arg(index)? {
            KernelArg::Buffer(mem) => {
                let mut bytes = vec![0u8; mem.byte_len()];
                mem.read_bytes(0, &mut bytes)?;
                Ok(element::decode(&bytes))
            }
            other => Err(self.fail(format!("argument {} is {:?}, not a buffer", index, other.kind()))),
        }
    }

    /// Write `values` to the start of a buffer argument.
    pub fn store<T: Element>(&self, index: usize, values: &[T]) -> Result<(), RuntimeError> {
        match self.arg(index)? {
            KernelArg::Buffer(mem) => mem.write_bytes(0, &element::encode(values)),
            other => Err(self.fail(format!("argument {} is {:?}, not a buffer", index, other.kind()))),
        }
    }

    pub fn u32(&self, index: usize) -> Result<u32, RuntimeError> {
        match self.arg(index)? {
            KernelArg::U32(v) => Ok(*v),
            other => Err(self.fail(format!("argument {} is {:?}, not u32", index, other.kind()))),
        }
    }

    pub fn usize(&self, index: usize) -> Result<usize, RuntimeError> {
        self.u32(index).map(|v| v as usize)
    }

    pub fn i32(&self, index: usize) -> Result<i32, RuntimeError> {
        match self.arg(index)? {
            KernelArg::I32(v) => Ok(*v),
            other => Err(self.fail(format!("argument {} is {:?}, not i32", index, other.kind()))),
        }
    }

    pub fn f32(&self, index: usize) -> Result<f32, RuntimeError> {
        match self.arg(index)? {
            KernelArg::F32(v) => Ok(*v),
            other => Err(self.fail(format!("argument {} is {:?}, not f32", index, other.kind()))),
        }
    }

    pub fn global(&self) -> [u32; 3] {
        self.work.global3()
    }

    /// Every work-item id of the global grid.
    pub fn grid(&self) -> impl Iterator<Item = [usize; 3]> {
        let [gx, gy, gz] = self.work.global3().map(|g| g as usize);
        (0..gz).flat_map(move |z| (0..gy).flat_map(move |y| (0..gx).map(move |x| [x, y, z])))
    }

    /// Bounds-checked read.
    #[inline]
    pub fn get<T: Copy>(&self, data: &[T], index: usize) -> Result<T, RuntimeError> {
        data.get(index)
            .copied()
            .ok_or_else(|| self.fail(format!("read at {} beyond {} elements", index, data.len())))
    }

    /// Bounds-checked write.
    #[inline]
    pub fn set<T>(&self, data: &mut [T], index: usize, value: T) -> Result<(), RuntimeError> {
        let len = data.len();
        match data.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.fail(format!("write at {} beyond {} elements", index, len))),
        }
    }
}
