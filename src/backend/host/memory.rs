//! Host-resident buffers

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RuntimeError;
use crate::memory::{check_range, BufferAllocator, DeviceMemory};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocator that tracks live bytes so leaked buffers are observable.
#[derive(Debug, Default)]
pub struct HostAllocator {
    live: Arc<AtomicUsize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferAllocator for HostAllocator {
    fn allocate(&self, bytes: usize) -> Result<Arc<dyn DeviceMemory>, RuntimeError> {
        self.live.fetch_add(bytes, Ordering::AcqRel);
        Ok(Arc::new(HostMemory {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(vec![0u8; bytes]),
            len: bytes,
            live: Arc::clone(&self.live),
        }))
    }

    fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

pub struct HostMemory {
    id: u64,
    data: Mutex<Vec<u8>>,
    len: usize,
    live: Arc<AtomicUsize>,
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceMemory for HostMemory {
    fn id(&self) -> u64 {
        self.id
    }

    fn byte_len(&self) -> usize {
        self.len
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        check_range(self.id, self.len, offset, data.len())?;
        let mut bytes = self.data.lock().unwrap_or_else(|p| p.into_inner());
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), RuntimeError> {
        check_range(self.id, self.len, offset, out.len())?;
        let bytes = self.data.lock().unwrap_or_else(|p| p.into_inner());
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(self.len, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_bytes_follow_drops() {
        let alloc = HostAllocator::new();
        let a = alloc.allocate(16).unwrap();
        let b = alloc.allocate(8).unwrap();
        assert_eq!(alloc.live_bytes(), 24);
        drop(a);
        assert_eq!(alloc.live_bytes(), 8);
        assert_ne!(b.id(), 0);
    }

    #[test]
    fn test_out_of_range_access() {
        let alloc = HostAllocator::new();
        let m = alloc.allocate(4).unwrap();
        assert!(m.write_bytes(2, &[1, 2, 3]).is_err());
        m.write_bytes(1, &[9, 8]).unwrap();
        let mut out = [0u8; 4];
        m.read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [0, 9, 8, 0]);
        assert!(m.as_any().downcast_ref::<HostMemory>().is_some());
    }
}
