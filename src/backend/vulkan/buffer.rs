//! Storage buffers in host-visible, coherent memory.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::backend::vulkan::context::VulkanDevice;
use crate::error::{RuntimeError, VulkanErrorKind};
use crate::memory::{check_range, BufferAllocator, DeviceMemory};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Vulkan rejects zero-sized buffers; empty tensors still get a binding.
const MIN_BUFFER_BYTES: u64 = 4;

pub struct VulkanAllocator {
    device: Arc<VulkanDevice>,
    live: Arc<AtomicUsize>,
}

impl VulkanAllocator {
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self {
            device,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl BufferAllocator for VulkanAllocator {
    fn allocate(&self, bytes: usize) -> Result<Arc<dyn DeviceMemory>, RuntimeError> {
        let memory = VulkanMemory::new(Arc::clone(&self.device), bytes, Arc::clone(&self.live))?;
        Ok(Arc::new(memory))
    }

    fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

pub struct VulkanMemory {
    id: u64,
    len: usize,
    pub(crate) buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    capacity: u64,
    /// Serializes map/unmap; a memory object may be mapped once at a time.
    map_lock: Mutex<()>,
    live: Arc<AtomicUsize>,
    device: Arc<VulkanDevice>,
}

impl VulkanMemory {
    fn new(
        device: Arc<VulkanDevice>,
        len: usize,
        live: Arc<AtomicUsize>,
    ) -> Result<Self, VulkanErrorKind> {
        let capacity = (len as u64).max(MIN_BUFFER_BYTES);
        let fail = |what: &str, e: vk::Result| {
            VulkanErrorKind::BufferAllocationFailed(format!("{} ({} bytes): {:?}", what, capacity, e))
        };
        let dev = &device.device;

        let info = vk::BufferCreateInfo::default()
            .size(capacity)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { dev.create_buffer(&info, None) }.map_err(|e| fail("vkCreateBuffer", e))?;

        let requirements = unsafe { dev.get_buffer_memory_requirements(buffer) };
        let memory_type = device.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let Some(memory_type) = memory_type else {
            unsafe { dev.destroy_buffer(buffer, None) };
            return Err(VulkanErrorKind::BufferAllocationFailed(
                "no host-visible coherent memory type".to_string(),
            ));
        };

        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match unsafe { dev.allocate_memory(&alloc, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { dev.destroy_buffer(buffer, None) };
                return Err(fail("vkAllocateMemory", e));
            }
        };
        if let Err(e) = unsafe { dev.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                dev.destroy_buffer(buffer, None);
                dev.free_memory(memory, None);
            }
            return Err(fail("vkBindBufferMemory", e));
        }

        live.fetch_add(len, Ordering::AcqRel);
        let this = Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            len,
            buffer,
            memory,
            capacity,
            map_lock: Mutex::new(()),
            live,
            device,
        };
        // fresh device memory is undefined; tensors start zeroed
        this.with_mapped(0, capacity as usize, |bytes| bytes.fill(0))?;
        Ok(this)
    }

    /// Size bound to the descriptor.
    pub(crate) fn range(&self) -> u64 {
        self.capacity
    }

    fn with_mapped<R>(
        &self,
        offset: usize,
        count: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, VulkanErrorKind> {
        let _guard = self.map_lock.lock().unwrap_or_else(|p| p.into_inner());
        let dev = &self.device.device;
        let ptr = unsafe {
            dev.map_memory(
                self.memory,
                offset as u64,
                count as u64,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(|e| VulkanErrorKind::BufferAllocationFailed(format!("vkMapMemory: {:?}", e)))?;
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), count) };
        let result = f(bytes);
        unsafe { dev.unmap_memory(self.memory) };
        Ok(result)
    }
}

impl fmt::Debug for VulkanMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanMemory")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceMemory for VulkanMemory {
    fn id(&self) -> u64 {
        self.id
    }

    fn byte_len(&self) -> usize {
        self.len
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        check_range(self.id, self.len, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.with_mapped(offset, data.len(), |bytes| bytes.copy_from_slice(data))?;
        Ok(())
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), RuntimeError> {
        check_range(self.id, self.len, offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        self.with_mapped(offset, out.len(), |bytes| out.copy_from_slice(bytes))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(self.len, Ordering::AcqRel);
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}
