//! The device boundary consumed by staging and compute scheduling.
//!
//! [`GpuDevice`] is the narrow set of calls the upper layers make: buffer and
//! image lifetime, command recording, program and descriptor creation, queue
//! submission and fence pooling. [`crate::VulkanDevice`] forwards each call to
//! Vulkan; [`crate::HostDevice`] executes them in host memory.

use crate::error::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;

/// Description of a buffer to create.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Debug name.
    pub name: &'a str,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: vk::BufferUsageFlags,
    /// Where the memory lives. Only host-visible locations can be mapped.
    pub location: MemoryLocation,
}

/// Description of a 2D or 3D image to create.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
}

/// One descriptor binding of a compute program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
}

impl DescriptorBinding {
    pub fn storage_buffer(binding: u32) -> Self {
        Self {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    pub fn uniform_buffer(binding: u32) -> Self {
        Self {
            binding,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// Compute shader code plus the single descriptor set layout it uses.
#[derive(Debug, Clone, Copy)]
pub struct ComputeShader<'a> {
    /// Name of the shader. The host device uses it to look up a kernel.
    pub name: &'a str,
    /// SPIR-V words.
    pub spirv: &'a [u32],
    /// Bindings of descriptor set 0.
    pub bindings: &'a [DescriptorBinding],
}

/// Handles of a created compute program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeProgram {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
}

/// One batch of a queue submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

impl SubmitInfo {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch holding a single command buffer.
    pub fn with_command_buffer(cmd: vk::CommandBuffer) -> Self {
        Self {
            command_buffers: vec![cmd],
            ..Self::default()
        }
    }

    /// Append a command buffer. Command buffers execute in append order.
    pub fn push(&mut self, cmd: vk::CommandBuffer) {
        self.command_buffers.push(cmd);
    }

    /// Wait on `semaphore` before `stage` of this batch.
    pub fn wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
    }

    /// Signal `semaphore` when this batch completes.
    pub fn signal(&mut self, semaphore: vk::Semaphore) {
        self.signal_semaphores.push(semaphore);
    }

    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
    }
}

/// Persistent CPU mapping of a host-visible buffer.
///
/// The pointer stays valid until the buffer is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to device memory that outlives every holder; all
// access goes through callers that own the corresponding buffer exclusively.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Calls the scheduling layers make into a device.
///
/// Recording calls require the command buffer to be in the recording state.
/// Implementations serialise command recording and queue submission
/// internally, so a device can be shared between threads.
pub trait GpuDevice: Send + Sync {
    /// Create a buffer and bind memory to it.
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer>;

    /// Destroy a buffer and free its memory.
    fn destroy_buffer(&self, buffer: vk::Buffer) -> Result<()>;

    /// Persistent mapping of a host-visible buffer.
    fn mapped_ptr(&self, buffer: vk::Buffer) -> Result<MappedPtr>;

    /// Create an image in `UNDEFINED` layout.
    fn create_image(&self, desc: &ImageDesc<'_>) -> Result<vk::Image>;

    fn destroy_image(&self, image: vk::Image) -> Result<()>;

    /// Layout the image will be in once recorded transitions have executed.
    fn image_layout(&self, image: vk::Image) -> Result<vk::ImageLayout>;

    /// Allocate primary command buffers in the initial state.
    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);

    /// Begin recording with `SIMULTANEOUS_USE`. Implicitly resets an
    /// executable command buffer.
    fn begin_simultaneous_use(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn end(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Return a command buffer that is not pending to the initial state.
    fn reset(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<()>;

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()>;

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()>;

    /// Record a layout transition from the image's tracked layout.
    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        new_layout: vk::ImageLayout,
    ) -> Result<()>;

    /// Bind a compute program and its descriptor set 0.
    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        program: &ComputeProgram,
        set: vk::DescriptorSet,
    ) -> Result<()>;

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) -> Result<()>;

    fn create_compute_program(&self, shader: &ComputeShader<'_>) -> Result<ComputeProgram>;

    fn destroy_compute_program(&self, program: &ComputeProgram);

    fn allocate_descriptor_set(&self, program: &ComputeProgram) -> Result<vk::DescriptorSet>;

    fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]);

    /// Point `binding` of `set` at the first `range` bytes of `buffer`.
    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        range: u64,
    ) -> Result<()>;

    /// Number of queues `submit` accepts.
    fn queue_count(&self) -> usize;

    /// Submit batches to queue `queue_index`; `fence` is signalled when all
    /// of them complete.
    fn submit(&self, queue_index: usize, batches: &[SubmitInfo], fence: vk::Fence) -> Result<()>;

    /// Take an unsignalled fence from the pool.
    fn borrow_fence(&self) -> Result<vk::Fence>;

    /// Reset a fence and return it to the pool.
    fn unborrow_fence(&self, fence: vk::Fence) -> Result<()>;

    /// `true` once the fence is signalled.
    fn fence_status(&self, fence: vk::Fence) -> Result<bool>;

    /// Wait for any (or all) of `fences`. Returns `false` on timeout.
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64)
        -> Result<bool>;

    fn wait_idle(&self) -> Result<()>;
}

/// Bytes per texel for the formats staging transfers support.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R16G16_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_info_keeps_append_order() {
        let mut info = SubmitInfo::new();
        assert!(info.is_empty());
        info.push(ash::vk::Handle::from_raw(7));
        info.push(ash::vk::Handle::from_raw(3));
        let raw: Vec<u64> = info
            .command_buffers
            .iter()
            .map(|c| ash::vk::Handle::as_raw(*c))
            .collect();
        assert_eq!(raw, vec![7, 3]);
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }
}
