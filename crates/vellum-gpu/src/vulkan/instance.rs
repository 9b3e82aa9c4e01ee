//! Vulkan instance creation and physical device selection.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::{GpuError, Result};

/// Instance extensions the backend needs.
///
/// No surface extensions: presentation is handled outside this crate.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers enabled on request.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan 1.3 instance.
///
/// Missing validation layers are reported and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidArgument("application name contains a NUL byte".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Vellum")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = if enable_validation {
        validation_layers()
            .into_iter()
            .filter(|layer| {
                let found = available_layers
                    .iter()
                    .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
                if !found {
                    tracing::warn!("Validation layer {:?} not available", layer);
                }
                found
            })
            .collect()
    } else {
        Vec::new()
    };
    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Select the highest scoring Vulkan 1.3 device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .filter_map(|device| {
            let score = score_physical_device(instance, device)?;
            Some((score, device))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a device, `None` if it cannot be used at all.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u64> {
    let properties = instance.get_physical_device_properties(device);
    if !is_vulkan_1_3(properties.api_version) {
        return None;
    }

    let type_score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    let memory = instance.get_physical_device_memory_properties(device);
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size >> 30)
        .sum();

    Some(type_score + vram_gb)
}

/// Returns `true` if `api_version` is at least 1.3.
pub fn is_vulkan_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_gate() {
        assert!(is_vulkan_1_3(vk::API_VERSION_1_3));
        assert!(is_vulkan_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(!is_vulkan_1_3(vk::API_VERSION_1_2));
        assert!(!is_vulkan_1_3(vk::API_VERSION_1_0));
    }
}
