//! GPU capability detection.

use std::ffi::CStr;

use ash::vk;

use crate::vulkan::instance::is_vulkan_1_3;

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

/// What the selected device offers the backend.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    /// Fences are timeline semaphores.
    pub supports_timeline_semaphore: bool,
    /// Barriers are recorded with `vkCmdPipelineBarrier2`.
    pub supports_synchronization2: bool,
    /// Upload heaps and buffer views hand out device addresses.
    pub supports_buffer_device_address: bool,

    /// Device-local memory in MB.
    pub device_local_memory_mb: u64,
    pub max_memory_allocation_count: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub optimal_buffer_copy_offset_alignment: u64,
}

impl DeviceCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_2)
            .push_next(&mut vulkan_1_3);
        instance.get_physical_device_features2(physical_device, &mut features2);

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_timeline_semaphore: vulkan_1_2.timeline_semaphore == vk::TRUE,
            supports_synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
            supports_buffer_device_address: vulkan_1_2.buffer_device_address == vk::TRUE,

            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            optimal_buffer_copy_offset_alignment: properties
                .limits
                .optimal_buffer_copy_offset_alignment,
        }
    }

    /// Check that the device supports everything the backend relies on.
    pub fn meets_requirements(&self) -> bool {
        is_vulkan_1_3(self.api_version)
            && self.supports_timeline_semaphore
            && self.supports_synchronization2
            && self.supports_buffer_device_address
            // The upload buffer hands out 256-byte aligned constants.
            && self.min_uniform_buffer_offset_alignment <= 256
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".into(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            supports_timeline_semaphore: true,
            supports_synchronization2: true,
            supports_buffer_device_address: true,
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            min_uniform_buffer_offset_alignment: 64,
            optimal_buffer_copy_offset_alignment: 1,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Other(0x5143));
    }

    #[test]
    fn requirements() {
        assert!(capabilities().meets_requirements());

        let mut old = capabilities();
        old.api_version = vk::API_VERSION_1_2;
        assert!(!old.meets_requirements());

        let mut no_timeline = capabilities();
        no_timeline.supports_timeline_semaphore = false;
        assert!(!no_timeline.meets_requirements());
    }

    #[test]
    fn summary_mentions_version_and_memory() {
        let summary = capabilities().summary();
        assert!(summary.starts_with("Test GPU (Amd)"));
        assert!(summary.contains("Vulkan 1.3.0"));
        assert!(summary.contains("8192 MB"));
    }
}
