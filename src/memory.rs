//! Device memory seams
//!
//! Backends hand out [`DeviceMemory`] through a [`BufferAllocator`].
//! Tensors own the resulting handles; kernels only borrow them.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::RuntimeError;

/// Image object backing a buffer on texture-based hardware paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Opaque handle to a block of device memory.
pub trait DeviceMemory: Send + Sync + Debug {
    /// Unique per allocation; a reallocated tensor gets a new id.
    fn id(&self) -> u64;

    fn byte_len(&self) -> usize;

    fn image(&self) -> Option<ImageDesc> {
        None
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError>;

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), RuntimeError>;

    fn as_any(&self) -> &dyn Any;
}

pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, bytes: usize) -> Result<Arc<dyn DeviceMemory>, RuntimeError>;

    /// Bytes currently held by live allocations.
    fn live_bytes(&self) -> usize;
}

/// Range check shared by the backends' host-visible buffers.
pub(crate) fn check_range(
    id: u64,
    len: usize,
    offset: usize,
    count: usize,
) -> Result<(), RuntimeError> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(RuntimeError::Tensor(format!(
            "buffer {}: access [{}..+{}] exceeds {} bytes",
            id, offset, count, len
        ))),
    }
}
