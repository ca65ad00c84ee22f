//! Command pool and queue submission helpers.

use crate::device::SubmitInfo;
use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
///
/// Command pools are externally synchronised: the owner must serialise every
/// use of the pool and of the command buffers allocated from it.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool whose buffers can be reset individually.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = device
            .create_command_pool(&create_info, None)
            .map_err(|e| GpuError::vulkan("vkCreateCommandPool", e))?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| GpuError::vulkan("vkAllocateCommandBuffers", e))
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// The command buffers must not be pending.
    pub unsafe fn free_command_buffers(&self, device: &ash::Device, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            device.free_command_buffers(self.pool, buffers);
        }
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device
        .begin_command_buffer(cmd, &begin_info)
        .map_err(|e| GpuError::vulkan("vkBeginCommandBuffer", e))
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device
        .end_command_buffer(cmd)
        .map_err(|e| GpuError::vulkan("vkEndCommandBuffer", e))
}

/// Submit batches to a queue.
///
/// # Safety
/// All handles must be valid and the queue externally synchronised.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_batches(
    device: &ash::Device,
    queue: vk::Queue,
    batches: &[SubmitInfo],
    fence: vk::Fence,
) -> Result<()> {
    for batch in batches {
        if batch.wait_semaphores.len() != batch.wait_stages.len() {
            return Err(GpuError::InvalidState(format!(
                "{} wait semaphores but {} wait stages",
                batch.wait_semaphores.len(),
                batch.wait_stages.len()
            )));
        }
    }

    let infos: Vec<vk::SubmitInfo<'_>> = batches
        .iter()
        .map(|batch| {
            vk::SubmitInfo::default()
                .command_buffers(&batch.command_buffers)
                .wait_semaphores(&batch.wait_semaphores)
                .wait_dst_stage_mask(&batch.wait_stages)
                .signal_semaphores(&batch.signal_semaphores)
        })
        .collect();

    device
        .queue_submit(queue, &infos, fence)
        .map_err(|e| GpuError::vulkan("vkQueueSubmit", e))
}
