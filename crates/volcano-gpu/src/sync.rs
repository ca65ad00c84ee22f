//! Fences and the fence pool.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    device
        .create_fence(&create_info, None)
        .map_err(|e| GpuError::vulkan("vkCreateFence", e))
}

/// Wait for any or all of `fences`. Returns `false` if the timeout elapsed.
///
/// # Safety
/// The device and fences must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fences(
    device: &ash::Device,
    fences: &[vk::Fence],
    wait_all: bool,
    timeout_ns: u64,
) -> Result<bool> {
    match device.wait_for_fences(fences, wait_all, timeout_ns) {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(e) => Err(GpuError::vulkan("vkWaitForFences", e)),
    }
}

/// Whether a fence is signalled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn fence_status(device: &ash::Device, fence: vk::Fence) -> Result<bool> {
    device
        .get_fence_status(fence)
        .map_err(|e| GpuError::vulkan("vkGetFenceStatus", e))
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device
        .reset_fences(&[fence])
        .map_err(|e| GpuError::vulkan("vkResetFences", e))
}

/// Recycles fences between submissions.
///
/// Borrowed fences are always unsignalled. Returning a fence resets it.
#[derive(Default)]
pub struct FencePool {
    free: Vec<vk::Fence>,
    all: Vec<vk::Fence>,
}

impl FencePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free fence, creating one if the pool is empty.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn borrow(&mut self, device: &ash::Device) -> Result<vk::Fence> {
        if let Some(fence) = self.free.pop() {
            return Ok(fence);
        }
        let fence = create_fence(device, false)?;
        self.all.push(fence);
        tracing::trace!("Fence pool grew to {}", self.all.len());
        Ok(fence)
    }

    /// Reset a borrowed fence and make it available again.
    ///
    /// # Safety
    /// The device must be valid and the fence must not be pending.
    pub unsafe fn unborrow(&mut self, device: &ash::Device, fence: vk::Fence) -> Result<()> {
        if !self.all.contains(&fence) {
            return Err(GpuError::ContractViolation(format!(
                "fence {fence:?} does not belong to this pool"
            )));
        }
        if self.free.contains(&fence) {
            return Err(GpuError::ContractViolation(format!(
                "fence {fence:?} returned twice"
            )));
        }
        reset_fence(device, fence)?;
        self.free.push(fence);
        Ok(())
    }

    /// Number of fences currently borrowed.
    pub fn borrowed(&self) -> usize {
        self.all.len() - self.free.len()
    }

    /// Destroy every fence.
    ///
    /// # Safety
    /// The device must be valid and no fence may be pending.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for fence in self.all.drain(..) {
            device.destroy_fence(fence, None);
        }
        self.free.clear();
    }
}
