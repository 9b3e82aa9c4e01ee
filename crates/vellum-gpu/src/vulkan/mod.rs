//! Vulkan 1.3 backend.
//!
//! Fences are timeline semaphores, barriers go through synchronization2 and
//! resource states map onto image layouts, with the common state being
//! `GENERAL`. Descriptor heaps are host-visible slabs of
//! [`DescriptorRecord`]s addressed through buffer device addresses.

mod barrier;
mod capabilities;
mod command;
mod context;
mod descriptor;
mod device;
mod instance;
mod memory;
mod resource;
mod sync;

use ash::vk;

pub use barrier::{state_access, StateAccess};
pub use capabilities::{DeviceCapabilities, GpuVendor};
pub use context::{VulkanContext, VulkanDeviceBuilder};
pub use descriptor::{DescriptorRecord, VulkanDescriptorHeap, DESCRIPTOR_STRIDE};
pub use device::{
    VulkanCommandAllocator, VulkanCommandList, VulkanDevice, VulkanFence, VulkanQueue,
    VulkanUploadHeap,
};
pub use resource::VulkanResource;

/// Identity of a Vulkan resource, with what barriers and copies need to know
/// about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VulkanResourceId {
    Buffer {
        buffer: vk::Buffer,
        size: u64,
    },
    Image {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
        array_layers: u32,
        width: u32,
        height: u32,
    },
}
