//! [`GpuDevice`] implemented on Vulkan.

use crate::command::{begin_command_buffer, end_command_buffer, submit_batches, CommandPool};
use crate::context::GpuContext;
use crate::descriptors::{write_buffer, DescriptorPool, DescriptorSetLayoutBuilder};
use crate::device::{
    BufferDesc, ComputeProgram, ComputeShader, GpuDevice, ImageDesc, MappedPtr, SubmitInfo,
};
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, GpuImage};
use crate::pipeline::RawComputePipeline;
use crate::sync::{fence_status, wait_for_fences, FencePool};
use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Default number of descriptor sets a device can hand out.
pub const DEFAULT_DESCRIPTOR_CAPACITY: u32 = 1024;

/// Objects that share the command pool's external synchronisation.
struct VulkanResources {
    command_pool: CommandPool,
    descriptor_pool: DescriptorPool,
    fences: FencePool,
    buffers: HashMap<vk::Buffer, GpuBuffer>,
    images: HashMap<vk::Image, GpuImage>,
}

/// A Vulkan device with one command pool on its compute queue family.
///
/// Every recording call and every queue submission is serialised through one
/// mutex, which is the pool's external synchronisation.
pub struct VulkanDevice {
    context: GpuContext,
    resources: Mutex<VulkanResources>,
}

impl VulkanDevice {
    pub fn new(context: GpuContext) -> Result<Self> {
        Self::with_descriptor_capacity(context, DEFAULT_DESCRIPTOR_CAPACITY)
    }

    pub fn with_descriptor_capacity(context: GpuContext, max_sets: u32) -> Result<Self> {
        let device = context.device();
        let command_pool = unsafe { CommandPool::new(device, context.queue_family()) }?;
        let descriptor_pool = match unsafe { DescriptorPool::new(device, max_sets) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { command_pool.destroy(device) };
                return Err(e);
            }
        };

        Ok(Self {
            resources: Mutex::new(VulkanResources {
                command_pool,
                descriptor_pool,
                fences: FencePool::new(),
                buffers: HashMap::new(),
                images: HashMap::new(),
            }),
            context,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn device(&self) -> &ash::Device {
        self.context.device()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
        let device = self.context.device();
        let mut resources = self.resources.lock();
        let mut allocator = self.context.allocator().lock();

        let buffers: Vec<GpuBuffer> = resources.buffers.drain().map(|(_, b)| b).collect();
        if !buffers.is_empty() {
            tracing::warn!("{} buffers still alive when the device was dropped", buffers.len());
        }
        for mut buffer in buffers {
            let _ = allocator.free_buffer(&mut buffer);
        }
        let images: Vec<GpuImage> = resources.images.drain().map(|(_, i)| i).collect();
        for mut image in images {
            let _ = allocator.free_image(&mut image);
        }

        unsafe {
            resources.fences.destroy(device);
            resources.descriptor_pool.destroy(device);
            resources.command_pool.destroy(device);
        }
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        let buffer = self.context.allocator().lock().create_buffer(
            desc.size,
            desc.usage,
            desc.location,
            desc.name,
        )?;
        let handle = buffer.buffer;
        self.resources.lock().buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) -> Result<()> {
        let mut gpu_buffer = self
            .resources
            .lock()
            .buffers
            .remove(&buffer)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {buffer:?}")))?;
        self.context.allocator().lock().free_buffer(&mut gpu_buffer)
    }

    fn mapped_ptr(&self, buffer: vk::Buffer) -> Result<MappedPtr> {
        let resources = self.resources.lock();
        let gpu_buffer = resources
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {buffer:?}")))?;
        gpu_buffer
            .mapped_ptr()
            .map(MappedPtr::new)
            .ok_or_else(|| GpuError::InvalidState(format!("buffer {buffer:?} is not host visible")))
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let create_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = self
            .context
            .allocator()
            .lock()
            .create_image(&create_info, desc.name)?;
        let handle = image.image;
        self.resources.lock().images.insert(handle, image);
        Ok(handle)
    }

    fn destroy_image(&self, image: vk::Image) -> Result<()> {
        let mut gpu_image = self
            .resources
            .lock()
            .images
            .remove(&image)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {image:?}")))?;
        self.context.allocator().lock().free_image(&mut gpu_image)
    }

    fn image_layout(&self, image: vk::Image) -> Result<vk::ImageLayout> {
        self.resources
            .lock()
            .images
            .get(&image)
            .map(|i| i.layout)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {image:?}")))
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let resources = self.resources.lock();
        unsafe { resources.command_pool.allocate_command_buffers(self.device(), count) }
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let resources = self.resources.lock();
        unsafe {
            resources
                .command_pool
                .free_command_buffers(self.device(), command_buffers)
        };
    }

    fn begin_simultaneous_use(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe {
            begin_command_buffer(
                self.device(),
                cmd,
                vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
            )
        }
    }

    fn end(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe { end_command_buffer(self.device(), cmd) }
    }

    fn reset(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe {
            self.device()
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| GpuError::vulkan("vkResetCommandBuffer", e))
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe { self.device().cmd_copy_buffer(cmd, src, dst, regions) };
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe {
            self.device()
                .cmd_copy_buffer_to_image(cmd, src, dst, layout, regions)
        };
        Ok(())
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe {
            self.device()
                .cmd_copy_image_to_buffer(cmd, src, layout, dst, regions)
        };
        Ok(())
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let mut resources = self.resources.lock();
        let gpu_image = resources
            .images
            .get_mut(&image)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {image:?}")))?;

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .old_layout(gpu_image.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range());

        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        // Tracked at record time; the command buffer must execute before any
        // other use of the image.
        gpu_image.layout = new_layout;
        Ok(())
    }

    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        program: &ComputeProgram,
        set: vk::DescriptorSet,
    ) -> Result<()> {
        let _resources = self.resources.lock();
        unsafe {
            self.device()
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, program.pipeline);
            self.device().cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                program.layout,
                0,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) -> Result<()> {
        if !self.context.capabilities().fits_dispatch([x, y, z]) {
            return Err(GpuError::InvalidState(format!(
                "dispatch({x}, {y}, {z}) exceeds device limits"
            )));
        }
        let _resources = self.resources.lock();
        unsafe { self.device().cmd_dispatch(cmd, x, y, z) };
        Ok(())
    }

    fn create_compute_program(&self, shader: &ComputeShader<'_>) -> Result<ComputeProgram> {
        let device = self.device();
        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .compute_bindings(shader.bindings)
                .build(device)
        }?;
        let raw = match unsafe { RawComputePipeline::new(device, shader.spirv, &[set_layout]) } {
            Ok(raw) => raw,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e);
            }
        };
        tracing::debug!("Created compute program {}", shader.name);
        Ok(ComputeProgram {
            pipeline: raw.pipeline,
            layout: raw.layout,
            set_layout,
        })
    }

    fn destroy_compute_program(&self, program: &ComputeProgram) {
        let device = self.device();
        unsafe {
            device.destroy_pipeline(program.pipeline, None);
            device.destroy_pipeline_layout(program.layout, None);
            device.destroy_descriptor_set_layout(program.set_layout, None);
        }
    }

    fn allocate_descriptor_set(&self, program: &ComputeProgram) -> Result<vk::DescriptorSet> {
        let resources = self.resources.lock();
        unsafe {
            resources
                .descriptor_pool
                .allocate(self.device(), program.set_layout)
        }
    }

    fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        let resources = self.resources.lock();
        if let Err(e) = unsafe { resources.descriptor_pool.free(self.device(), sets) } {
            tracing::error!("Freeing {} descriptor sets failed: {e}", sets.len());
        }
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        range: u64,
    ) -> Result<()> {
        if !self.context.capabilities().fits_buffer_range(ty, range) {
            tracing::error!("{ty:?} descriptor of {range} bytes exceeds the device limit");
            return Err(GpuError::InvalidState(format!(
                "{ty:?} range of {range} bytes exceeds the device limit"
            )));
        }
        let _resources = self.resources.lock();
        unsafe { write_buffer(self.device(), set, binding, ty, buffer, range) };
        Ok(())
    }

    fn queue_count(&self) -> usize {
        self.context.queues().len()
    }

    fn submit(&self, queue_index: usize, batches: &[SubmitInfo], fence: vk::Fence) -> Result<()> {
        let queue = *self.context.queues().get(queue_index).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "queue {queue_index} out of range ({} queues)",
                self.context.queues().len()
            ))
        })?;
        let _resources = self.resources.lock();
        unsafe { submit_batches(self.device(), queue, batches, fence) }
    }

    fn borrow_fence(&self) -> Result<vk::Fence> {
        let mut resources = self.resources.lock();
        unsafe { resources.fences.borrow(self.device()) }
    }

    fn unborrow_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut resources = self.resources.lock();
        unsafe { resources.fences.unborrow(self.device(), fence) }
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        unsafe { fence_status(self.device(), fence) }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<bool> {
        unsafe { wait_for_fences(self.device(), fences, wait_all, timeout_ns) }
    }

    fn wait_idle(&self) -> Result<()> {
        self.context.wait_idle()
    }
}
