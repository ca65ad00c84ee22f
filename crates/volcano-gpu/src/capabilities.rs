//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Capabilities relevant to staging and compute dispatch.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    /// Device-local memory in MB.
    pub device_local_memory_mb: u64,
    /// Whether some memory type is both device-local and host-visible, so a
    /// buffer could be written without a staging copy.
    pub has_host_visible_device_memory: bool,

    pub max_compute_workgroup_count: [u32; 3],
    pub max_compute_workgroup_size: [u32; 3],
    pub max_storage_buffer_range: u32,
    pub max_uniform_buffer_range: u32,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let has_host_visible_device_memory = memory_properties
            .memory_types
            .iter()
            .take(memory_properties.memory_type_count as usize)
            .any(|ty| {
                ty.property_flags.contains(
                    vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
                )
            });

        let limits = properties.limits;
        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            has_host_visible_device_memory,
            max_compute_workgroup_count: limits.max_compute_work_group_count,
            max_compute_workgroup_size: limits.max_compute_work_group_size,
            max_storage_buffer_range: limits.max_storage_buffer_range,
            max_uniform_buffer_range: limits.max_uniform_buffer_range,
        }
    }

    /// Check the device can run Volcano: Vulkan 1.2 or newer.
    pub fn meets_requirements(&self) -> bool {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        major > 1 || (major == 1 && minor >= 2)
    }

    /// Whether a dispatch of `groups` workgroups fits the device limits.
    pub fn fits_dispatch(&self, groups: [u32; 3]) -> bool {
        groups
            .iter()
            .zip(self.max_compute_workgroup_count.iter())
            .all(|(want, max)| *want >= 1 && want <= max)
    }

    /// Whether a descriptor of type `ty` may cover `range` bytes.
    /// Types other than storage and uniform buffers have no range limit here.
    pub fn fits_buffer_range(&self, ty: vk::DescriptorType, range: u64) -> bool {
        let max = match ty {
            vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                self.max_storage_buffer_range
            }
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                self.max_uniform_buffer_range
            }
            _ => return true,
        };
        range <= u64::from(max)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM{}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.has_host_visible_device_memory {
                " (host visible)"
            } else {
                ""
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(api_version: u32) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".into(),
            api_version,
            driver_version: 0,
            device_local_memory_mb: 0,
            has_host_visible_device_memory: false,
            max_compute_workgroup_count: [65535, 65535, 65535],
            max_compute_workgroup_size: [1024, 1024, 64],
            max_storage_buffer_range: 1 << 27,
            max_uniform_buffer_range: 1 << 16,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn requires_vulkan_1_2() {
        assert!(!caps(vk::make_api_version(0, 1, 1, 0)).meets_requirements());
        assert!(caps(vk::API_VERSION_1_2).meets_requirements());
        assert!(caps(vk::API_VERSION_1_3).meets_requirements());
    }

    #[test]
    fn dispatch_limits() {
        let c = caps(vk::API_VERSION_1_2);
        assert!(c.fits_dispatch([1, 1, 1]));
        assert!(!c.fits_dispatch([0, 1, 1]));
        assert!(!c.fits_dispatch([70000, 1, 1]));
    }

    #[test]
    fn buffer_range_limits() {
        let c = caps(vk::API_VERSION_1_2);
        assert!(c.fits_buffer_range(vk::DescriptorType::STORAGE_BUFFER, 1 << 27));
        assert!(!c.fits_buffer_range(vk::DescriptorType::STORAGE_BUFFER, (1 << 27) + 4));
        assert!(c.fits_buffer_range(vk::DescriptorType::UNIFORM_BUFFER, 1 << 16));
        assert!(!c.fits_buffer_range(vk::DescriptorType::UNIFORM_BUFFER, 1 << 17));
        assert!(c.fits_buffer_range(vk::DescriptorType::STORAGE_IMAGE, u64::MAX));
    }

    #[test]
    fn summary_mentions_host_visible_device_memory() {
        let mut c = caps(vk::API_VERSION_1_2);
        assert!(!c.summary().contains("host visible"));
        c.has_host_visible_device_memory = true;
        assert!(c.summary().contains("host visible"));
    }
}
