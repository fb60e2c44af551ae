//! Device tensors
//!
//! A tensor is shared between the graph and every operator that touches it
//! (`Arc<Tensor>`). Its dims and buffer sit behind a lock so an operator can
//! reconfigure an output during `initialize` without exclusive ownership.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::f16;

use crate::element::{self, Element};
use crate::error::RuntimeError;
use crate::memory::{BufferAllocator, DeviceMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Float16,
    Int8,
    UInt8,
    Int32,
    Bool,
}

impl DataType {
    pub fn element_size(self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 => 2,
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Affine mapping `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }
}

/// Memory layout of the backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Buffer,
    /// Image-backed layout used by texture kernel paths.
    Texture,
}

/// Everything needed to allocate a tensor.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub dims: Vec<u32>,
    pub data_type: DataType,
    pub quant: Option<QuantParams>,
    pub storage: StorageType,
}

impl TensorDesc {
    pub fn new(dims: &[u32], data_type: DataType) -> Self {
        Self {
            dims: dims.to_vec(),
            data_type,
            quant: None,
            storage: StorageType::Buffer,
        }
    }

    pub fn quant(mut self, scale: f32, zero_point: i32) -> Self {
        self.quant = Some(QuantParams { scale, zero_point });
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }
}

struct TensorState {
    dims: Vec<u32>,
    buffer: Arc<dyn DeviceMemory>,
}

pub struct Tensor {
    data_type: DataType,
    quant: Option<QuantParams>,
    storage: StorageType,
    allocator: Arc<dyn BufferAllocator>,
    state: RwLock<TensorState>,
}

pub type TensorRef = Arc<Tensor>;

/// Buffer allocated for new dims, not yet visible on its tensor.
#[derive(Debug)]
pub struct StagedReshape {
    dims: Vec<u32>,
    buffer: Arc<dyn DeviceMemory>,
}

impl Tensor {
    pub fn allocate(
        allocator: Arc<dyn BufferAllocator>,
        desc: TensorDesc,
    ) -> Result<TensorRef, RuntimeError> {
        let bytes = element_count(&desc.dims) * desc.data_type.element_size();
        let buffer = allocator.allocate(bytes)?;
        log::trace!(
            "Tensor allocated: dims={:?} type={} bytes={} buffer={}",
            desc.dims,
            desc.data_type,
            bytes,
            buffer.id()
        );
        Ok(Arc::new(Self {
            data_type: desc.data_type,
            quant: desc.quant,
            storage: desc.storage,
            allocator,
            state: RwLock::new(TensorState {
                dims: desc.dims,
                buffer,
            }),
        }))
    }

    pub fn dims(&self) -> Vec<u32> {
        self.read_state().dims.clone()
    }

    pub fn num_dims(&self) -> usize {
        self.read_state().dims.len()
    }

    pub fn total_size(&self) -> usize {
        element_count(&self.read_state().dims)
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn quant(&self) -> Option<QuantParams> {
        self.quant
    }

    pub fn storage(&self) -> StorageType {
        self.storage
    }

    /// Device buffer handle. No copy is made.
    pub fn buffer(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.read_state().buffer)
    }

    pub fn byte_size(&self) -> usize {
        self.total_size() * self.data_type.element_size()
    }

    /// Replace the dims and reallocate the buffer.
    ///
    /// A no-op returning `false` when `dims` already match, so repeated
    /// initialization keeps the same buffer. The previous buffer is released
    /// once the last in-flight launch referencing it completes.
    pub fn reconfigure_dims_and_buffer(&self, dims: &[u32]) -> Result<bool, RuntimeError> {
        match self.stage_reshape(dims)? {
            Some(staged) => {
                self.commit_reshape(staged);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Allocate a buffer for `dims` without touching the tensor; `None`
    /// when the dims already match. Dropping the result frees the buffer.
    pub fn stage_reshape(&self, dims: &[u32]) -> Result<Option<StagedReshape>, RuntimeError> {
        if self.read_state().dims == dims {
            return Ok(None);
        }
        let bytes = element_count(dims) * self.data_type.element_size();
        let buffer = self.allocator.allocate(bytes)?;
        Ok(Some(StagedReshape {
            dims: dims.to_vec(),
            buffer,
        }))
    }

    /// Install a staged buffer and its dims.
    pub fn commit_reshape(&self, staged: StagedReshape) {
        let mut state = self.write_state();
        log::debug!(
            "Tensor reconfigured: {:?} -> {:?} (buffer {} -> {})",
            state.dims,
            staged.dims,
            state.buffer.id(),
            staged.buffer.id()
        );
        state.dims = staged.dims;
        state.buffer = staged.buffer;
    }

    /// Upload host data. `values` must cover the whole tensor.
    pub fn write<T: Element>(&self, values: &[T]) -> Result<(), RuntimeError> {
        self.check_element::<T>()?;
        let state = self.read_state();
        let total = element_count(&state.dims);
        if values.len() != total {
            return Err(RuntimeError::Tensor(format!(
                "write of {} elements into tensor {:?} ({} elements)",
                values.len(),
                state.dims,
                total
            )));
        }
        state.buffer.write_bytes(0, &element::encode(values))
    }

    /// Download the whole tensor. Call after the queue has been drained.
    pub fn read<T: Element>(&self) -> Result<Vec<T>, RuntimeError> {
        self.check_element::<T>()?;
        let state = self.read_state();
        let mut bytes = vec![0u8; element_count(&state.dims) * T::SIZE];
        state.buffer.read_bytes(0, &mut bytes)?;
        Ok(element::decode(&bytes))
    }

    /// Download as `f32` raw values whatever the element type.
    pub fn read_f32(&self) -> Result<Vec<f32>, RuntimeError> {
        fn widen<T: Element>(t: &Tensor) -> Result<Vec<f32>, RuntimeError> {
            Ok(t.read::<T>()?.into_iter().map(Element::to_f32).collect())
        }
        match self.data_type {
            DataType::Float32 => widen::<f32>(self),
            DataType::Float16 => widen::<f16>(self),
            DataType::Int8 => widen::<i8>(self),
            DataType::UInt8 | DataType::Bool => widen::<u8>(self),
            DataType::Int32 => widen::<i32>(self),
        }
    }

    fn check_element<T: Element>(&self) -> Result<(), RuntimeError> {
        let compatible = T::DATA_TYPE == self.data_type
            || (self.data_type == DataType::Bool && T::DATA_TYPE == DataType::UInt8);
        if compatible {
            Ok(())
        } else {
            Err(RuntimeError::Tensor(format!(
                "element type {} does not match tensor type {}",
                T::DATA_TYPE,
                self.data_type
            )))
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, TensorState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, TensorState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("Tensor")
            .field("dims", &state.dims)
            .field("data_type", &self.data_type)
            .field("quant", &self.quant)
            .field("buffer", &state.buffer.id())
            .finish()
    }
}

pub fn element_count(dims: &[u32]) -> usize {
    dims.iter().map(|&d| d as usize).product()
}

/// View a rank 1..=4 shape as NCHW by padding leading 1s.
pub fn nchw(dims: &[u32]) -> Option<[u32; 4]> {
    if dims.is_empty() || dims.len() > 4 {
        return None;
    }
    let mut out = [1u32; 4];
    out[4 - dims.len()..].copy_from_slice(dims);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostAllocator;

    fn allocator() -> Arc<dyn BufferAllocator> {
        Arc::new(HostAllocator::new())
    }

    #[test]
    fn test_buffer_size_follows_dims() {
        let t = Tensor::allocate(allocator(), TensorDesc::new(&[2, 3, 4], DataType::Float16)).unwrap();
        assert_eq!(t.total_size(), 24);
        assert_eq!(t.byte_size(), 48);
        assert_eq!(t.buffer().byte_len(), 48);
    }

    #[test]
    fn test_reconfigure_replaces_buffer_once() {
        let alloc = allocator();
        let t = Tensor::allocate(Arc::clone(&alloc), TensorDesc::new(&[1], DataType::Float32)).unwrap();
        let first = t.buffer().id();

        assert!(t.reconfigure_dims_and_buffer(&[4, 5]).unwrap());
        let second = t.buffer().id();
        assert_ne!(first, second);
        assert_eq!(alloc.live_bytes(), 80);

        assert!(!t.reconfigure_dims_and_buffer(&[4, 5]).unwrap());
        assert_eq!(t.buffer().id(), second);
        assert_eq!(alloc.live_bytes(), 80);
    }

    #[test]
    fn test_write_checks_type_and_length() {
        let t = Tensor::allocate(allocator(), TensorDesc::new(&[2], DataType::Int32)).unwrap();
        assert!(t.write(&[1.0f32, 2.0]).is_err());
        assert!(t.write(&[1i32]).is_err());
        t.write(&[7i32, -3]).unwrap();
        assert_eq!(t.read::<i32>().unwrap(), vec![7, -3]);
        assert_eq!(t.read_f32().unwrap(), vec![7.0, -3.0]);
    }

    #[test]
    fn test_nchw_padding() {
        assert_eq!(nchw(&[3, 4]), Some([1, 1, 3, 4]));
        assert_eq!(nchw(&[2, 3, 4, 5]), Some([2, 3, 4, 5]));
        assert_eq!(nchw(&[]), None);
        assert_eq!(nchw(&[1, 1, 1, 1, 1]), None);
    }
}
