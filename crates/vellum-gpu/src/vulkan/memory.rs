//! GPU memory management.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::device::HeapKind;
use crate::error::{GpuError, Result};

/// Memory location a heap kind is allocated from.
pub fn memory_location(heap: HeapKind) -> MemoryLocation {
    match heap {
        HeapKind::Default => MemoryLocation::GpuOnly,
        HeapKind::Upload => MemoryLocation::CpuToGpu,
        HeapKind::Readback => MemoryLocation::GpuToCpu,
    }
}

/// Sub-allocating wrapper around `gpu_allocator`.
pub struct MemoryAllocator {
    allocator: Option<Allocator>,
    device: ash::Device,
}

impl MemoryAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device: device.clone(),
        })
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".into()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("'{name}': {e}")))
    }

    fn free(&mut self, allocation: Allocation) {
        let Some(allocator) = self.allocator.as_mut() else {
            return;
        };
        if let Err(e) = allocator.free(allocation) {
            tracing::error!("Failed to free GPU memory: {e}");
        }
    }

    /// Create a buffer bound to freshly allocated memory.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<VulkanBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { self.device.get_buffer_device_address(&info) }
        } else {
            0
        };

        Ok(VulkanBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            address,
        })
    }

    /// Destroy a buffer and release its memory.
    pub fn free_buffer(&mut self, buffer: &mut VulkanBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            self.free(allocation);
        }
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();
    }

    /// Create an image bound to freshly allocated memory.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<VulkanImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(name, requirements, location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            self.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        Ok(VulkanImage {
            image,
            allocation: Some(allocation),
        })
    }

    /// Destroy an image and release its memory.
    pub fn free_image(&mut self, image: &mut VulkanImage) {
        if let Some(allocation) = image.allocation.take() {
            self.free(allocation);
        }
        unsafe { self.device.destroy_image(image.image, None) };
        image.image = vk::Image::null();
    }

    /// Free all GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed. Remaining
    /// allocations are logged as leaks.
    pub fn shutdown(&mut self) {
        drop(self.allocator.take());
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer with its allocation.
pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    /// Zero unless created with `SHADER_DEVICE_ADDRESS`.
    pub address: vk::DeviceAddress,
}

impl VulkanBuffer {
    /// CPU pointer to host-visible memory.
    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(std::ptr::NonNull::cast)
    }
}

/// An image with its allocation.
pub struct VulkanImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_kinds_map_to_locations() {
        assert_eq!(memory_location(HeapKind::Default), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(HeapKind::Upload), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(HeapKind::Readback), MemoryLocation::GpuToCpu);
    }
}
