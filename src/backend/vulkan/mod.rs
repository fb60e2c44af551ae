//! Vulkan compute backend
//!
//! One compute queue. Each launch records its own command buffer and
//! descriptor set and is submitted with a fence; `finish` waits on every
//! outstanding fence and recycles what the launches used. A barrier at the
//! head of every command buffer orders it after earlier shader writes, which
//! together with submission order makes the queue in-order.

mod buffer;
mod context;
mod manifest;
mod program;
mod validation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::backend::{ComputeBackend, DeviceLimits, Launch, Program, Vendor};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, VulkanErrorKind};
use crate::kernel::KernelArg;
use crate::memory::BufferAllocator;

pub use buffer::{VulkanAllocator, VulkanMemory};
pub use context::VulkanDevice;
pub use manifest::{
    check_signature, KernelManifest, ManifestEntry, MAX_BUFFER_BINDINGS, MAX_PUSH_CONSTANT_BYTES,
};
pub use program::{dispatch_groups, pack_push_constants, shader_id, ShaderModule, VulkanProgram};
pub use validation::{spirv_words, validate_spirv};

use program::BindingLayout;

/// Launches allowed in flight before `submit` drains the queue itself.
const MAX_IN_FLIGHT: u32 = 256;

struct InFlight {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    descriptor_set: vk::DescriptorSet,
    /// Keeps the program and every bound buffer alive until the fence signals.
    _launch: Launch,
}

struct QueueState {
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    in_flight: Vec<InFlight>,
    first_error: Option<RuntimeError>,
}

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    limits: DeviceLimits,
    allocator: Arc<VulkanAllocator>,
    manifest: KernelManifest,
    layout: Arc<BindingLayout>,
    shaders: Mutex<HashMap<String, Arc<ShaderModule>>>,
    queue: Mutex<QueueState>,
}

impl VulkanBackend {
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let manifest = match &config.kernel_manifest {
            Some(path) => KernelManifest::from_file(path)?,
            None => {
                log::warn!("No kernel manifest configured; every kernel lookup will fail");
                KernelManifest::default()
            }
        };
        let device = Arc::new(VulkanDevice::new(config.device_index, config.enable_validation)?);
        let layout = Arc::new(BindingLayout::new(Arc::clone(&device))?);
        let queue = create_queue_state(&device)?;

        let vendor = match config.vendor {
            Vendor::Generic => Vendor::from_vendor_id(device.properties.vendor_id),
            configured => configured,
        };
        let limits = DeviceLimits {
            max_work_group_size: device.properties.limits.max_compute_work_group_invocations,
            compute_units: config.compute_units,
            vendor,
        };
        log::info!(
            "VulkanBackend initialized: {} ({} kernels, vendor={})",
            device.device_name,
            manifest.len(),
            vendor
        );

        Ok(Self {
            allocator: Arc::new(VulkanAllocator::new(Arc::clone(&device))),
            device,
            limits,
            manifest,
            layout,
            shaders: Mutex::new(HashMap::new()),
            queue: Mutex::new(queue),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device.device_name
    }

    /// Load SPIR-V bytes, sharing the module with any identical blob.
    fn shader(&self, entry: &ManifestEntry) -> Result<Arc<ShaderModule>, RuntimeError> {
        let bytes = std::fs::read(&entry.file).map_err(|e| {
            RuntimeError::resolution(
                entry.name.as_str(),
                format!("failed to read {}: {}", entry.file.display(), e),
            )
        })?;
        let id = shader_id(&bytes);
        let mut shaders = self.shaders.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(module) = shaders.get(&id) {
            log::debug!("Shader cache HIT: {} ({})", id, entry.name);
            return Ok(Arc::clone(module));
        }
        log::debug!("Shader cache MISS: {} ({})", id, entry.name);
        let module = Arc::new(ShaderModule::new(Arc::clone(&self.device), &bytes)?);
        shaders.insert(id, Arc::clone(&module));
        Ok(module)
    }

    fn record(&self, state: &mut QueueState, launch: &Launch) -> Result<InFlight, VulkanErrorKind> {
        let dev = &self.device.device;
        let name = launch.program.name();
        let program = launch
            .program
            .as_any()
            .downcast_ref::<VulkanProgram>()
            .ok_or_else(|| VulkanErrorKind::DispatchFailed(format!("{}: not a Vulkan program", name)))?;
        let push = pack_push_constants(&launch.args)?;
        let pipeline = program.pipeline(launch.work.local3())?;
        let groups = dispatch_groups(&launch.work);

        let set_layouts = [self.layout.set_layout];
        let set_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(state.descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_set = unsafe { dev.allocate_descriptor_sets(&set_info) }
            .map_err(|e| dispatch_error(name, "descriptor set", e))?[0];

        let buffer_infos = launch
            .args
            .iter()
            .filter_map(|arg| match arg {
                KernelArg::Buffer(memory) => Some(memory),
                _ => None,
            })
            .map(|memory| {
                let vk_memory = memory
                    .as_any()
                    .downcast_ref::<VulkanMemory>()
                    .ok_or_else(|| {
                        VulkanErrorKind::DispatchFailed(format!(
                            "{}: buffer {} is not Vulkan memory",
                            name,
                            memory.id()
                        ))
                    })?;
                Ok(vk::DescriptorBufferInfo::default()
                    .buffer(vk_memory.buffer)
                    .offset(0)
                    .range(vk_memory.range()))
            })
            .collect::<Result<Vec<_>, VulkanErrorKind>>();
        let buffer_infos = match buffer_infos {
            Ok(infos) => infos,
            Err(e) => {
                unsafe {
                    let _ = dev.free_descriptor_sets(state.descriptor_pool, &[descriptor_set]);
                }
                return Err(e);
            }
        };
        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { dev.update_descriptor_sets(&writes, &[]) };

        let cb_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(state.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { dev.allocate_command_buffers(&cb_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe {
                    let _ = dev.free_descriptor_sets(state.descriptor_pool, &[descriptor_set]);
                }
                return Err(dispatch_error(name, "command buffer", e));
            }
        };

        let submitted = unsafe {
            self.encode(command_buffer, program, pipeline, descriptor_set, &push, groups)
                .and_then(|()| {
                    let fence = dev
                        .create_fence(&vk::FenceCreateInfo::default(), None)
                        .map_err(|e| dispatch_error(name, "fence", e))?;
                    let submit = vk::SubmitInfo::default()
                        .command_buffers(std::slice::from_ref(&command_buffer));
                    match dev.queue_submit(self.device.queue, std::slice::from_ref(&submit), fence) {
                        Ok(()) => Ok(fence),
                        Err(e) => {
                            dev.destroy_fence(fence, None);
                            Err(dispatch_error(name, "vkQueueSubmit", e))
                        }
                    }
                })
        };
        match submitted {
            Ok(fence) => Ok(InFlight {
                fence,
                command_buffer,
                descriptor_set,
                _launch: Launch {
                    program: Arc::clone(&launch.program),
                    args: launch.args.clone(),
                    work: launch.work,
                },
            }),
            Err(e) => {
                unsafe {
                    dev.free_command_buffers(state.command_pool, &[command_buffer]);
                    let _ = dev.free_descriptor_sets(state.descriptor_pool, &[descriptor_set]);
                }
                Err(e)
            }
        }
    }

    unsafe fn encode(
        &self,
        command_buffer: vk::CommandBuffer,
        program: &VulkanProgram,
        pipeline: vk::Pipeline,
        descriptor_set: vk::DescriptorSet,
        push: &[u8],
        groups: [u32; 3],
    ) -> Result<(), VulkanErrorKind> {
        let dev = &self.device.device;
        let name = program.name();
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        dev.begin_command_buffer(command_buffer, &begin)
            .map_err(|e| dispatch_error(name, "begin command buffer", e))?;

        let after_writes = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::HOST_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
        dev.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::HOST,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            std::slice::from_ref(&after_writes),
            &[],
            &[],
        );
        dev.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
        dev.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::COMPUTE,
            program.pipeline_layout(),
            0,
            &[descriptor_set],
            &[],
        );
        if !push.is_empty() {
            dev.cmd_push_constants(
                command_buffer,
                program.pipeline_layout(),
                vk::ShaderStageFlags::COMPUTE,
                0,
                push,
            );
        }
        dev.cmd_dispatch(command_buffer, groups[0], groups[1], groups[2]);

        let to_host = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ);
        dev.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            std::slice::from_ref(&to_host),
            &[],
            &[],
        );
        dev.end_command_buffer(command_buffer)
            .map_err(|e| dispatch_error(name, "end command buffer", e))
    }

    /// Wait for every in-flight launch and release its resources.
    fn drain(&self, state: &mut QueueState) -> Result<(), VulkanErrorKind> {
        if state.in_flight.is_empty() {
            return Ok(());
        }
        let dev = &self.device.device;
        let fences: Vec<vk::Fence> = state.in_flight.iter().map(|f| f.fence).collect();
        let waited = unsafe { dev.wait_for_fences(&fences, true, u64::MAX) };
        log::trace!("Vulkan drain: {} launches", state.in_flight.len());
        for done in state.in_flight.drain(..) {
            unsafe {
                dev.destroy_fence(done.fence, None);
                dev.free_command_buffers(state.command_pool, &[done.command_buffer]);
                let _ = dev.free_descriptor_sets(state.descriptor_pool, &[done.descriptor_set]);
            }
        }
        waited.map_err(|e| VulkanErrorKind::DispatchFailed(format!("vkWaitForFences: {:?}", e)))
    }
}

fn dispatch_error(kernel: &str, what: &str, e: vk::Result) -> VulkanErrorKind {
    VulkanErrorKind::DispatchFailed(format!("{}: {}: {:?}", kernel, what, e))
}

fn create_queue_state(device: &VulkanDevice) -> Result<QueueState, VulkanErrorKind> {
    let dev = &device.device;
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(device.queue_family);
    let command_pool = unsafe { dev.create_command_pool(&pool_info, None) }
        .map_err(|e| VulkanErrorKind::InitializationFailed(format!("command pool: {:?}", e)))?;

    let sizes = [vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(MAX_IN_FLIGHT * MAX_BUFFER_BINDINGS as u32)];
    let descriptor_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(MAX_IN_FLIGHT)
        .pool_sizes(&sizes);
    let descriptor_pool = match unsafe { dev.create_descriptor_pool(&descriptor_info, None) } {
        Ok(pool) => pool,
        Err(e) => {
            unsafe { dev.destroy_command_pool(command_pool, None) };
            return Err(VulkanErrorKind::InitializationFailed(format!(
                "descriptor pool: {:?}",
                e
            )));
        }
    };
    Ok(QueueState {
        command_pool,
        descriptor_pool,
        in_flight: Vec::new(),
        first_error: None,
    })
}

impl ComputeBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(&self.allocator) as Arc<dyn BufferAllocator>
    }

    fn compile(&self, name: &str) -> Result<Arc<dyn Program>, RuntimeError> {
        let entry = self
            .manifest
            .get(name)
            .ok_or_else(|| RuntimeError::resolution(name, "not in the kernel manifest"))?;
        let shader = self.shader(entry)?;
        let program = VulkanProgram::new(
            name,
            entry.signature.clone(),
            &entry.entry,
            shader,
            Arc::clone(&self.layout),
        )?;
        Ok(Arc::new(program))
    }

    fn kernel_names(&self) -> Vec<String> {
        self.manifest.names()
    }

    fn submit(&self, launch: Launch) -> Result<(), RuntimeError> {
        let mut state = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if state.in_flight.len() as u32 >= MAX_IN_FLIGHT {
            if let Err(e) = self.drain(&mut state) {
                state.first_error.get_or_insert(RuntimeError::Backend(e));
            }
        }
        log::trace!("Vulkan submit: {} {}", launch.program.name(), launch.work);
        let in_flight = self
            .record(&mut state, &launch)
            .map_err(|e| RuntimeError::enqueue(launch.program.name(), e.to_string()))?;
        state.in_flight.push(in_flight);
        Ok(())
    }

    fn finish(&self) -> Result<(), RuntimeError> {
        let mut state = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        let drained = self.drain(&mut state);
        if let Some(e) = state.first_error.take() {
            return Err(e);
        }
        drained.map_err(|e| RuntimeError::kernel("<queue>", e.to_string()))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let state = self.queue.get_mut().unwrap_or_else(|p| p.into_inner());
        let dev = &self.device.device;
        unsafe {
            let _ = dev.queue_wait_idle(self.device.queue);
            for done in state.in_flight.drain(..) {
                dev.destroy_fence(done.fence, None);
            }
            // destroying the pools frees their command buffers and sets
            dev.destroy_descriptor_pool(state.descriptor_pool, None);
            dev.destroy_command_pool(state.command_pool, None);
        }
        log::info!("VulkanBackend shut down ({})", self.device.device_name);
    }
}
