//! Vulkan compute pipeline creation.

use crate::error::{GpuError, Result};
use ash::vk;

/// A compute pipeline and its layout, without any scheduling around it.
pub struct RawComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl RawComputePipeline {
    /// Create a compute pipeline from shader code.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        shader_code: &[u32],
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        if shader_code.is_empty() {
            return Err(GpuError::ShaderCompilation("empty SPIR-V".to_string()));
        }

        let shader_info = vk::ShaderModuleCreateInfo::default().code(shader_code);
        let shader_module = device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::ShaderCompilation(e.to_string()))?;

        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(descriptor_set_layouts);

        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_shader_module(shader_module, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let created =
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        // The module is not needed once the pipeline exists (or failed to).
        device.destroy_shader_module(shader_module, None);

        let pipelines = match created {
            Ok(pipelines) => pipelines,
            Err((_pipelines, e)) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
        })
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}
