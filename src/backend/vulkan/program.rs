//! Shader modules, the shared binding layout and compute pipelines.
//!
//! Every program uses one layout: storage buffers at bindings 0..8 of set 0
//! and a 128-byte push-constant block holding the scalars in argument order.
//! The work-group size is fed through specialization constants 0..2, so a
//! program keeps one pipeline per distinct local size.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::sync::{Arc, Mutex};

use ash::vk;
use sha2::{Digest, Sha256};

use crate::backend::vulkan::context::VulkanDevice;
use crate::backend::vulkan::manifest::{MAX_BUFFER_BINDINGS, MAX_PUSH_CONSTANT_BYTES};
use crate::backend::vulkan::validation::spirv_words;
use crate::backend::Program;
use crate::error::VulkanErrorKind;
use crate::kernel::{ArgKind, KernelArg};
use crate::worksize::{div_round_up, WorkSize};

/// Content address of a SPIR-V blob; identical bytes share one module.
pub fn shader_id(spirv: &[u8]) -> String {
    let digest = Sha256::digest(spirv);
    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

/// Scalars in argument order, four little-endian bytes each.
pub fn pack_push_constants(args: &[KernelArg]) -> Result<Vec<u8>, VulkanErrorKind> {
    let bytes: Vec<u8> = args
        .iter()
        .filter_map(KernelArg::scalar_bytes)
        .flatten()
        .collect();
    if bytes.len() > MAX_PUSH_CONSTANT_BYTES {
        return Err(VulkanErrorKind::DispatchFailed(format!(
            "{} bytes of scalars exceed the push-constant block",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Work groups per axis: `ceil(global / local)`, padded to three axes.
pub fn dispatch_groups(work: &WorkSize) -> [u32; 3] {
    let global = work.global3();
    let local = work.local3();
    [
        div_round_up(global[0], local[0].max(1)),
        div_round_up(global[1], local[1].max(1)),
        div_round_up(global[2], local[2].max(1)),
    ]
}

pub struct ShaderModule {
    pub(crate) handle: vk::ShaderModule,
    pub id: String,
    pub spirv_size: usize,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: Arc<VulkanDevice>, spirv: &[u8]) -> Result<Self, VulkanErrorKind> {
        let code = spirv_words(spirv)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&code);
        let handle = unsafe { device.device.create_shader_module(&info, None) }
            .map_err(|e| VulkanErrorKind::ShaderCreationFailed(format!("{:?}", e)))?;
        let id = shader_id(spirv);
        log::debug!("Created shader module {} ({} bytes)", id, spirv.len());
        Ok(Self {
            handle,
            id,
            spirv_size: spirv.len(),
            device,
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        log::debug!("Destroying shader module {}", self.id);
        unsafe { self.device.device.destroy_shader_module(self.handle, None) };
    }
}

/// Descriptor set layout plus pipeline layout shared by all programs.
pub struct BindingLayout {
    pub(crate) set_layout: vk::DescriptorSetLayout,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl BindingLayout {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self, VulkanErrorKind> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..MAX_BUFFER_BINDINGS as u32)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let set_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe { device.device.create_descriptor_set_layout(&set_info, None) }
            .map_err(|e| {
                VulkanErrorKind::PipelineCreationFailed(format!("descriptor set layout: {:?}", e))
            })?;

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(MAX_PUSH_CONSTANT_BYTES as u32);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_range));
        let pipeline_layout = match unsafe { device.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(VulkanErrorKind::PipelineCreationFailed(format!(
                    "pipeline layout: {:?}",
                    e
                )));
            }
        };
        Ok(Self {
            set_layout,
            pipeline_layout,
            device,
        })
    }
}

impl Drop for BindingLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

pub struct VulkanProgram {
    name: String,
    signature: Vec<ArgKind>,
    entry: CString,
    shader: Arc<ShaderModule>,
    layout: Arc<BindingLayout>,
    pipelines: Mutex<HashMap<[u32; 3], vk::Pipeline>>,
}

impl VulkanProgram {
    pub fn new(
        name: &str,
        signature: Vec<ArgKind>,
        entry: &str,
        shader: Arc<ShaderModule>,
        layout: Arc<BindingLayout>,
    ) -> Result<Self, VulkanErrorKind> {
        let entry = CString::new(entry).map_err(|_| {
            VulkanErrorKind::ManifestInvalid(format!("{}: entry point contains NUL", name))
        })?;
        Ok(Self {
            name: name.to_string(),
            signature,
            entry,
            shader,
            layout,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout.pipeline_layout
    }

    /// Pipeline specialized for `local`, created on first use.
    pub(crate) fn pipeline(&self, local: [u32; 3]) -> Result<vk::Pipeline, VulkanErrorKind> {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&pipeline) = pipelines.get(&local) {
            return Ok(pipeline);
        }

        let data: Vec<u8> = local.iter().flat_map(|v| v.to_le_bytes()).collect();
        let entries: Vec<vk::SpecializationMapEntry> = (0..3u32)
            .map(|i| {
                vk::SpecializationMapEntry::default()
                    .constant_id(i)
                    .offset(i * 4)
                    .size(4)
            })
            .collect();
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(&data);
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader.handle)
            .name(&self.entry)
            .specialization_info(&specialization);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.layout.pipeline_layout);

        let created = unsafe {
            self.shader.device.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
        }
        .map_err(|(_, e)| {
            VulkanErrorKind::PipelineCreationFailed(format!("{}: {:?}", self.name, e))
        })?;
        let pipeline = created.into_iter().next().ok_or_else(|| {
            VulkanErrorKind::PipelineCreationFailed(format!("{}: no pipeline returned", self.name))
        })?;
        log::debug!("Pipeline {} local={:?}", self.name, local);
        pipelines.insert(local, pipeline);
        Ok(pipeline)
    }
}

impl fmt::Debug for VulkanProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanProgram")
            .field("name", &self.name)
            .field("shader", &self.shader.id)
            .field("signature", &self.signature)
            .finish()
    }
}

impl Program for VulkanProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &[ArgKind] {
        &self.signature
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanProgram {
    fn drop(&mut self) {
        let pipelines = self.pipelines.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, pipeline) in pipelines.drain() {
            unsafe { self.shader.device.device.destroy_pipeline(pipeline, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shader_id_is_content_addressed() {
        let a = shader_id(b"\x03\x02\x23\x07module-a");
        assert_eq!(a.len(), 32);
        assert_eq!(a, shader_id(b"\x03\x02\x23\x07module-a"));
        assert_ne!(a, shader_id(b"\x03\x02\x23\x07module-b"));
    }

    #[test]
    fn test_push_constants_skip_buffers() {
        let args = [
            KernelArg::U32(7),
            KernelArg::F32(1.5),
            KernelArg::I32(-1),
        ];
        let bytes = pack_push_constants(&args).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(-1i32).to_le_bytes());

        let too_many = vec![KernelArg::U32(0); 33];
        assert!(pack_push_constants(&too_many).is_err());
    }

    #[test]
    fn test_dispatch_groups_round_up() {
        assert_eq!(dispatch_groups(&WorkSize::one_d(100, Some(32))), [4, 1, 1]);
        assert_eq!(
            dispatch_groups(&WorkSize::three_d([8, 5, 3], Some([4, 2, 1]))),
            [2, 3, 3]
        );
        assert_eq!(dispatch_groups(&WorkSize::two_d([6, 2], None)), [6, 2, 1]);
    }
}
