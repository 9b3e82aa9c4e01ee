//! Buffers and images owned by the Vulkan backend.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::{Format, ResourceDesc, ResourceDimension, ResourceFlags};
use crate::error::{GpuError, Result};
use crate::vulkan::context::VulkanContext;
use crate::vulkan::memory::{memory_location, VulkanBuffer, VulkanImage};
use crate::vulkan::VulkanResourceId;

/// Every buffer can be copied, bound and addressed from shaders.
pub const BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// Vulkan format of a core format.
pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Unknown => vk::Format::UNDEFINED,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::R32Uint => vk::Format::R32_UINT,
        // No typeless formats in Vulkan.
        Format::R32Typeless => vk::Format::R32_UINT,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Aspects covered by barriers on an image of `format`.
pub fn image_aspect(format: Format) -> vk::ImageAspectFlags {
    match format {
        Format::D32Float => vk::ImageAspectFlags::DEPTH,
        Format::D24UnormS8Uint => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Image usage implied by the resource flags.
pub fn image_usage(flags: ResourceFlags) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    if flags.allow_unordered_access {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if flags.allow_render_target {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if flags.allow_depth_stencil {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    usage
}

pub(crate) enum ResourceMemory {
    Buffer(VulkanBuffer),
    Image(VulkanImage),
}

/// A buffer or image and the memory bound to it.
pub struct VulkanResource {
    context: Arc<VulkanContext>,
    memory: ResourceMemory,
    id: VulkanResourceId,
    address: vk::DeviceAddress,
    name: Mutex<String>,
}

impl VulkanResource {
    /// Create the resource with memory bound.
    ///
    /// Images start in `UNDEFINED`; the caller transitions them into the
    /// layout of their initial state.
    pub(crate) fn new(context: Arc<VulkanContext>, desc: &ResourceDesc, name: &str) -> Result<Self> {
        let location = memory_location(desc.heap);
        let (memory, id, address) = match desc.dimension {
            ResourceDimension::Buffer { size } => {
                if size == 0 {
                    return Err(GpuError::InvalidArgument(format!(
                        "buffer '{name}' has zero size"
                    )));
                }
                let buffer = context
                    .allocator
                    .lock()
                    .create_buffer(size, BUFFER_USAGE, location, name)?;
                let id = VulkanResourceId::Buffer {
                    buffer: buffer.buffer,
                    size,
                };
                let address = buffer.address;
                (ResourceMemory::Buffer(buffer), id, address)
            }
            ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                mip_levels,
                format,
            } => {
                if width == 0 || height == 0 || format == Format::Unknown {
                    return Err(GpuError::InvalidArgument(format!(
                        "texture '{name}' needs a non-zero extent and a known format"
                    )));
                }
                if desc.heap != crate::device::HeapKind::Default {
                    return Err(GpuError::InvalidArgument(format!(
                        "texture '{name}' must live in GPU-local memory"
                    )));
                }

                let create_info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(vk_format(format))
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(u32::from(mip_levels))
                    .array_layers(u32::from(array_size))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(image_usage(desc.flags))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);

                let image = context
                    .allocator
                    .lock()
                    .create_image(&create_info, location, name)?;
                let id = VulkanResourceId::Image {
                    image: image.image,
                    aspect: image_aspect(format),
                    mip_levels: u32::from(mip_levels),
                    array_layers: u32::from(array_size),
                    width,
                    height,
                };
                (ResourceMemory::Image(image), id, 0)
            }
        };

        Ok(Self {
            context,
            memory,
            id,
            address,
            name: Mutex::new(name.to_owned()),
        })
    }

    /// Identity used for state tracking and commands.
    pub fn id(&self) -> VulkanResourceId {
        self.id
    }

    /// Device address of a buffer, 0 for images.
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Current debug name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        name.clone_into(&mut self.name.lock());
    }
}

impl Drop for VulkanResource {
    fn drop(&mut self) {
        let mut allocator = self.context.allocator.lock();
        match &mut self.memory {
            ResourceMemory::Buffer(buffer) => allocator.free_buffer(buffer),
            ResourceMemory::Image(image) => allocator.free_image(image),
        }
    }
}
