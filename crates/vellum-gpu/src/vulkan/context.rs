//! Vulkan instance, device and queue ownership.

use std::collections::BTreeSet;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::CommandListType;
use crate::error::{GpuError, Result};
use crate::vulkan::capabilities::DeviceCapabilities;
use crate::vulkan::instance::{create_instance, select_physical_device};
use crate::vulkan::memory::MemoryAllocator;
use crate::vulkan::VulkanDevice;

/// One hardware queue and the lock serializing submissions to it.
pub(crate) struct SubmissionQueue {
    pub(crate) family: u32,
    queue: Mutex<vk::Queue>,
}

/// Vulkan objects shared by the device and every native object it creates.
///
/// Native objects keep the context alive through an `Arc`, so the device is
/// destroyed only after the last of them.
pub struct VulkanContext {
    // Keeps the loader alive.
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) capabilities: DeviceCapabilities,
    pub(crate) allocator: Mutex<MemoryAllocator>,
    queue_families: QueueFamilyIndices,
    /// One entry per distinct queue family.
    queues: Vec<SubmissionQueue>,
}

impl VulkanContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Queue family command lists of a type are recorded for.
    pub fn queue_family(&self, list_type: CommandListType) -> u32 {
        match list_type {
            CommandListType::Direct => self.queue_families.graphics,
            CommandListType::Compute => self.queue_families.compute,
            CommandListType::Copy => self.queue_families.transfer,
        }
    }

    /// Index into the submission queues for a command list type.
    pub(crate) fn queue_slot(&self, list_type: CommandListType) -> usize {
        let family = self.queue_family(list_type);
        self.queues
            .iter()
            .position(|queue| queue.family == family)
            .unwrap_or_default()
    }

    /// Submit to a hardware queue.
    ///
    /// # Safety
    /// Every handle referenced by `submits` must be valid and every command
    /// buffer must be executable.
    pub(crate) unsafe fn submit(
        &self,
        slot: usize,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        let queue = self.queues[slot].queue.lock();
        match self.device.queue_submit2(*queue, submits, fence) {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(GpuError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }

    /// Submit and block until the queue is idle.
    ///
    /// # Safety
    /// Same as [`submit`](Self::submit).
    pub(crate) unsafe fn submit_and_wait(
        &self,
        slot: usize,
        submits: &[vk::SubmitInfo2<'_>],
    ) -> Result<()> {
        let queue = self.queues[slot].queue.lock();
        self.device
            .queue_submit2(*queue, submits, vk::Fence::null())?;
        self.device.queue_wait_idle(*queue)?;
        Ok(())
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees every VkDeviceMemory; must happen before the device goes.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for a [`VulkanDevice`].
pub struct VulkanDeviceBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for VulkanDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Vellum".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl VulkanDeviceBuilder {
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

    /// Load Vulkan, pick a device and create the logical device.
    pub fn build(self) -> Result<VulkanDevice> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let context = match unsafe { Self::create_context(entry.clone(), instance.clone()) } {
            Ok(context) => context,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        VulkanDevice::new(Arc::new(context))
    }

    unsafe fn create_context(entry: ash::Entry, instance: ash::Instance) -> Result<VulkanContext> {
        let physical_device = select_physical_device(&instance)?;
        let capabilities = DeviceCapabilities::query(&instance, physical_device);
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_families = find_queue_families(&instance, physical_device)?;
        let unique_families: BTreeSet<u32> = [
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer,
        ]
        .into_iter()
        .collect();

        let device = create_device(&instance, physical_device, &unique_families)?;

        let allocator = match MemoryAllocator::new(&instance, &device, physical_device) {
            Ok(allocator) => allocator,
            Err(e) => {
                device.destroy_device(None);
                return Err(e);
            }
        };

        let queues = unique_families
            .iter()
            .map(|&family| SubmissionQueue {
                family,
                queue: Mutex::new(device.get_device_queue(family, 0)),
            })
            .collect();

        tracing::debug!(
            "Queue families: graphics {}, compute {}, transfer {}",
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer
        );

        Ok(VulkanContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_families,
            queues,
        })
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Find queue families for graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let flags: Vec<vk::QueueFlags> = instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .map(|family| family.queue_flags)
        .collect();
    pick_queue_families(&flags)
}

/// Prefer dedicated compute and transfer families, falling back to the
/// graphics family.
fn pick_queue_families(families: &[vk::QueueFlags]) -> Result<QueueFamilyIndices> {
    let position = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        families
            .iter()
            .position(|&flags| pred(flags))
            .and_then(|i| u32::try_from(i).ok())
    };

    let graphics = position(&|f| f.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
        .ok_or(GpuError::NoSuitableDevice)?;
    let compute = position(&|f| {
        f.contains(vk::QueueFlags::COMPUTE) && !f.contains(vk::QueueFlags::GRAPHICS)
    })
    .unwrap_or(graphics);
    let transfer = position(&|f| {
        f.contains(vk::QueueFlags::TRANSFER)
            && !f.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })
    .unwrap_or(compute);

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

/// Create the logical device with timeline semaphores, synchronization2 and
/// buffer device addresses enabled.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &BTreeSet<u32>,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut features2);

    Ok(instance.create_device(physical_device, &device_create_info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(
            picked,
            QueueFamilyIndices {
                graphics: 0,
                compute: 1,
                transfer: 2,
            }
        );
    }

    #[test]
    fn single_family_serves_everything() {
        let families = [vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!((picked.graphics, picked.compute, picked.transfer), (0, 0, 0));
    }

    #[test]
    fn graphics_family_is_required() {
        assert!(pick_queue_families(&[vk::QueueFlags::TRANSFER]).is_err());
    }
}
