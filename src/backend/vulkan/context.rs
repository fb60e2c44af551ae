//! Instance, physical device and compute queue.

use std::ffi::CStr;

use ash::{vk, Device, Entry, Instance};

use crate::error::VulkanErrorKind;

/// Owns the Vulkan instance and logical device. Shared through `Arc` by
/// every buffer and program so it is destroyed last.
pub struct VulkanDevice {
    pub device_name: String,
    pub api_version: String,
    pub(crate) device: Device,
    pub(crate) queue: vk::Queue,
    pub(crate) queue_family: u32,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    instance: Instance,
    _entry: Entry,
}

impl VulkanDevice {
    pub fn new(device_index: usize, enable_validation: bool) -> Result<Self, VulkanErrorKind> {
        log::info!(
            "Initializing Vulkan (device_index={}, validation={})",
            device_index,
            enable_validation
        );
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanErrorKind::EntryLoadFailed(e.to_string()))?;
        let instance = create_instance(&entry, enable_validation)?;

        let selected = select_physical_device(&instance, device_index)
            .and_then(|physical| {
                let (device, queue, family) = create_logical_device(&instance, physical)?;
                Ok((physical, device, queue, family))
            });
        let (physical, device, queue, queue_family) = match selected {
            Ok(v) => v,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical) };
        let device_name = device_name(&properties);
        let api_version = format!(
            "{}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Vulkan device ready: {} (API {}, vendor 0x{:04x}, max invocations {})",
            device_name,
            api_version,
            properties.vendor_id,
            properties.limits.max_compute_work_group_invocations
        );

        Ok(Self {
            device_name,
            api_version,
            device,
            queue,
            queue_family,
            properties,
            memory_properties,
            instance,
            _entry: entry,
        })
    }

    /// Index of a memory type allowed by `type_bits` with all `flags`.
    pub(crate) fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan device {}", self.device_name);
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn create_instance(entry: &Entry, enable_validation: bool) -> Result<Instance, VulkanErrorKind> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"gpu-op-runtime")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"gpu-op-runtime")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let layers = if enable_validation {
        log::info!("Enabling Vulkan validation layers");
        vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
    } else {
        Vec::new()
    };
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| VulkanErrorKind::InitializationFailed(format!("vkCreateInstance: {:?}", e)))
}

fn select_physical_device(
    instance: &Instance,
    device_index: usize,
) -> Result<vk::PhysicalDevice, VulkanErrorKind> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        VulkanErrorKind::InitializationFailed(format!("enumerate_physical_devices: {:?}", e))
    })?;
    log::info!("Found {} Vulkan device(s)", devices.len());
    for (i, &dev) in devices.iter().enumerate() {
        let props = unsafe { instance.get_physical_device_properties(dev) };
        log::debug!("  Device {}: {}", i, device_name(&props));
    }
    devices
        .get(device_index)
        .copied()
        .ok_or(VulkanErrorKind::NoSuitableDevice)
}

fn create_logical_device(
    instance: &Instance,
    physical: vk::PhysicalDevice,
) -> Result<(Device, vk::Queue, u32), VulkanErrorKind> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
    let family = families
        .iter()
        .position(|p| p.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
        .ok_or_else(|| {
            VulkanErrorKind::InitializationFailed("no compute queue family".to_string())
        })?;
    log::debug!("Using queue family {} for compute", family);

    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(family)
        .queue_priorities(&priorities);
    let device_info =
        vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));

    let device = unsafe { instance.create_device(physical, &device_info, None) }
        .map_err(|e| VulkanErrorKind::InitializationFailed(format!("vkCreateDevice: {:?}", e)))?;
    let queue = unsafe { device.get_device_queue(family, 0) };
    Ok((device, queue, family))
}
