//! Device layer for the Volcano compute engine.
//!
//! This crate provides:
//! - Vulkan instance, device and queue management
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Command pools, descriptor pools and a fence pool
//! - The [`GpuDevice`] boundary with a Vulkan and a host implementation

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod host;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod sync;
pub mod vulkan;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
pub use device::{
    texel_size, BufferDesc, ComputeProgram, ComputeShader, DescriptorBinding, GpuDevice,
    ImageDesc, MappedPtr, SubmitInfo,
};
pub use error::{GpuError, Result};
pub use host::{CompletionMode, HostDevice, HostKernel};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::RawComputePipeline;
pub use sync::{create_fence, FencePool};
pub use vulkan::VulkanDevice;

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
