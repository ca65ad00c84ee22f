//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Instance, logical device, allocator and compute queues.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) queue_family: u32,
    pub(crate) queues: Vec<vk::Queue>,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Queue family used for compute and transfer work.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Queues of [`Self::queue_family`], indexed by queue index.
    pub fn queues(&self) -> &[vk::Queue] {
        &self.queues
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| GpuError::vulkan("vkDeviceWaitIdle", e))?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    queue_count: u32,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Volcano".to_string(),
            enable_validation: cfg!(debug_assertions),
            queue_count: 1,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Request up to `count` queues from the compute family.
    pub fn queue_count(mut self, count: u32) -> Self {
        self.queue_count = count.max(1);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let (queue_family, available) = unsafe { find_compute_family(&instance, physical_device) }?;
        let queue_count = self.queue_count.min(available);

        let (device, queues) =
            unsafe { create_device(&instance, physical_device, queue_family, queue_count)? };

        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_family,
            queues,
        })
    }
}

/// Find the queue family for compute and transfer work and its queue count.
///
/// A dedicated compute family (no graphics) is preferred. Any compute family
/// also supports transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_compute_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(u32, u32)> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let dedicated = families.iter().enumerate().find(|(_, f)| {
        f.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });
    let any = families
        .iter()
        .enumerate()
        .find(|(_, f)| f.queue_flags.contains(vk::QueueFlags::COMPUTE));

    dedicated
        .or(any)
        .map(|(i, f)| (i as u32, f.queue_count))
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device and retrieve its queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    queue_count: u32,
) -> Result<(ash::Device, Vec<vk::Queue>)> {
    let priorities = vec![1.0_f32; queue_count as usize];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities);

    #[cfg(target_os = "macos")]
    let extension_names: Vec<*const std::ffi::c_char> = vec![ash::khr::portability_subset::NAME.as_ptr()];
    #[cfg(not(target_os = "macos"))]
    let extension_names: Vec<*const std::ffi::c_char> = Vec::new();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(|e| GpuError::vulkan("vkCreateDevice", e))?;

    let queues = (0..queue_count)
        .map(|i| device.get_device_queue(queue_family, i))
        .collect();

    Ok((device, queues))
}
