//! Descriptor heaps as host-visible slabs of fixed-size records.
//!
//! Each slot holds one [`DescriptorRecord`] at a fixed stride. Shaders index
//! the slab through its device address.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;

use crate::device::{DescriptorHeapType, ViewDesc};
use crate::error::{GpuError, Result};
use crate::vulkan::context::VulkanContext;
use crate::vulkan::memory::VulkanBuffer;
use crate::vulkan::resource::vk_format;
use crate::vulkan::VulkanResourceId;

/// Distance between two descriptor slots, in bytes.
pub const DESCRIPTOR_STRIDE: u32 = 64;

/// Record kinds stored in [`DescriptorRecord::kind`].
pub mod kind {
    pub const EMPTY: u32 = 0;
    pub const CONSTANT_BUFFER: u32 = 1;
    pub const BUFFER_SRV: u32 = 2;
    pub const BUFFER_UAV: u32 = 3;
    pub const TEXTURE_SRV: u32 = 4;
    pub const TEXTURE_UAV: u32 = 5;
    pub const RENDER_TARGET: u32 = 6;
    pub const DEPTH_STENCIL: u32 = 7;
}

/// Set in [`DescriptorRecord::flags`] for byte address views.
pub const FLAG_RAW: u32 = 1;

/// GPU-visible layout of one descriptor slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DescriptorRecord {
    pub kind: u32,
    /// `VkFormat` value.
    pub format: u32,
    pub num_elements: u32,
    pub stride: u32,
    /// Buffer device address, or image handle for texture views.
    pub address: u64,
    pub first_element: u64,
    pub size: u64,
    pub mip_slice: u32,
    pub flags: u32,
}

impl DescriptorRecord {
    /// Encode a view. `buffer_address` resolves buffer device addresses.
    pub fn encode(
        view: &ViewDesc<VulkanResourceId>,
        buffer_address: impl Fn(vk::Buffer) -> u64,
    ) -> Result<Self> {
        let record = match *view {
            ViewDesc::ConstantBuffer { address, size } => Self {
                kind: kind::CONSTANT_BUFFER,
                address,
                size: u64::from(size),
                ..Self::default()
            },
            ViewDesc::BufferSrv {
                resource,
                first_element,
                num_elements,
                structure_stride,
                raw,
            }
            | ViewDesc::BufferUav {
                resource,
                first_element,
                num_elements,
                structure_stride,
                raw,
            } => {
                let VulkanResourceId::Buffer { buffer, size } = resource else {
                    return Err(GpuError::InvalidArgument(
                        "buffer view of a texture".to_string(),
                    ));
                };
                Self {
                    kind: if matches!(view, ViewDesc::BufferSrv { .. }) {
                        kind::BUFFER_SRV
                    } else {
                        kind::BUFFER_UAV
                    },
                    num_elements,
                    stride: structure_stride,
                    address: buffer_address(buffer),
                    first_element,
                    size,
                    flags: if raw { FLAG_RAW } else { 0 },
                    ..Self::default()
                }
            }
            ViewDesc::TextureSrv { resource, format } => {
                Self::texture(kind::TEXTURE_SRV, resource, format, 0)?
            }
            ViewDesc::TextureUav {
                resource,
                format,
                mip_slice,
            } => Self::texture(kind::TEXTURE_UAV, resource, format, mip_slice)?,
            ViewDesc::RenderTarget {
                resource,
                format,
                mip_slice,
            } => Self::texture(kind::RENDER_TARGET, resource, format, mip_slice)?,
            ViewDesc::DepthStencil {
                resource,
                format,
                mip_slice,
            } => Self::texture(kind::DEPTH_STENCIL, resource, format, mip_slice)?,
        };
        Ok(record)
    }

    fn texture(
        kind: u32,
        resource: VulkanResourceId,
        format: crate::device::Format,
        mip_slice: u32,
    ) -> Result<Self> {
        let VulkanResourceId::Image {
            image, mip_levels, ..
        } = resource
        else {
            return Err(GpuError::InvalidArgument("texture view of a buffer".to_string()));
        };
        if mip_slice >= mip_levels {
            return Err(GpuError::InvalidArgument(format!(
                "mip slice {mip_slice} of an image with {mip_levels} mips"
            )));
        }
        Ok(Self {
            kind,
            format: vk_format(format).as_raw() as u32,
            num_elements: mip_levels,
            address: image.as_raw(),
            mip_slice,
            ..Self::default()
        })
    }
}

/// A mapped slab of descriptor records.
pub struct VulkanDescriptorHeap {
    context: Arc<VulkanContext>,
    buffer: VulkanBuffer,
    ptr: NonNull<u8>,
    heap_type: DescriptorHeapType,
    num_descriptors: u32,
}

// SAFETY: `ptr` points into the mapped allocation owned by `buffer`, which
// lives as long as the heap. Slots are written by whoever owns their
// descriptor allocation; the core never hands one slot to two owners.
unsafe impl Send for VulkanDescriptorHeap {}
unsafe impl Sync for VulkanDescriptorHeap {}

impl VulkanDescriptorHeap {
    pub(crate) fn new(
        context: Arc<VulkanContext>,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<Self> {
        if num_descriptors == 0 {
            return Err(GpuError::InvalidArgument(
                "descriptor heap needs at least one slot".to_string(),
            ));
        }
        let size = u64::from(num_descriptors) * u64::from(DESCRIPTOR_STRIDE);
        let mut buffer = context.allocator.lock().create_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            &format!("{heap_type:?} descriptor heap"),
        )?;
        let Some(ptr) = buffer.mapped_ptr() else {
            context.allocator.lock().free_buffer(&mut buffer);
            return Err(GpuError::InvalidState(
                "descriptor heap memory is not host visible".to_string(),
            ));
        };

        Ok(Self {
            context,
            buffer,
            ptr,
            heap_type,
            num_descriptors,
        })
    }

    /// Heap type.
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// Number of slots.
    pub fn num_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    /// Device address of slot 0.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.buffer.address
    }

    pub(crate) fn cpu_base(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn write(&self, index: u32, record: &DescriptorRecord) -> Result<()> {
        if index >= self.num_descriptors {
            return Err(GpuError::InvalidArgument(format!(
                "descriptor index {index} out of range"
            )));
        }
        let offset = index as usize * DESCRIPTOR_STRIDE as usize;
        // SAFETY: the slot lies inside the mapped allocation.
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<DescriptorRecord>()
                .write_unaligned(*record);
        }
        Ok(())
    }

    /// Record stored in a slot.
    pub fn read(&self, index: u32) -> Option<DescriptorRecord> {
        if index >= self.num_descriptors {
            return None;
        }
        let offset = index as usize * DESCRIPTOR_STRIDE as usize;
        // SAFETY: the slot lies inside the mapped allocation.
        Some(unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<DescriptorRecord>()
                .read_unaligned()
        })
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        self.context.allocator.lock().free_buffer(&mut self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Format;

    fn buffer() -> VulkanResourceId {
        VulkanResourceId::Buffer {
            buffer: vk::Buffer::from_raw(0x10),
            size: 4096,
        }
    }

    fn image() -> VulkanResourceId {
        VulkanResourceId::Image {
            image: vk::Image::from_raw(0x20),
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 4,
            array_layers: 1,
            width: 256,
            height: 256,
        }
    }

    #[test]
    fn record_fits_its_slot() {
        assert_eq!(std::mem::size_of::<DescriptorRecord>(), 48);
        assert!(std::mem::size_of::<DescriptorRecord>() <= DESCRIPTOR_STRIDE as usize);
    }

    #[test]
    fn raw_buffer_views_carry_the_address() {
        let view = ViewDesc::BufferUav {
            resource: buffer(),
            first_element: 0,
            num_elements: 1024,
            structure_stride: 0,
            raw: true,
        };
        let record = DescriptorRecord::encode(&view, |_| 0xdead_0000).unwrap();

        assert_eq!(record.kind, kind::BUFFER_UAV);
        assert_eq!(record.address, 0xdead_0000);
        assert_eq!(record.flags, FLAG_RAW);
        assert_eq!(record.size, 4096);
    }

    #[test]
    fn texture_views_check_the_mip() {
        let uav = ViewDesc::TextureUav {
            resource: image(),
            format: Format::Rgba8Unorm,
            mip_slice: 3,
        };
        let record = DescriptorRecord::encode(&uav, |_| 0).unwrap();
        assert_eq!(record.address, 0x20);
        assert_eq!(record.format, vk::Format::R8G8B8A8_UNORM.as_raw() as u32);

        let past_end = ViewDesc::TextureUav {
            resource: image(),
            format: Format::Rgba8Unorm,
            mip_slice: 4,
        };
        assert!(DescriptorRecord::encode(&past_end, |_| 0)
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn views_must_match_the_resource_kind() {
        let view = ViewDesc::TextureSrv {
            resource: buffer(),
            format: Format::Rgba8Unorm,
        };
        assert!(DescriptorRecord::encode(&view, |_| 0).is_err());
    }
}
