//! Typed buffers and their views.

use crate::descriptors::DescriptorAllocation;
use crate::device::{
    CpuDescriptorHandle, DescriptorHeapType, Format, GpuDevice, GpuVirtualAddress, ResourceDesc,
    ResourceFlags, ViewDesc,
};
use crate::error::{GpuError, Result};
use crate::resource::Resource;
use crate::session::GpuSession;
use crate::state::ResourceState;

/// Constant buffer views cover whole multiples of this many bytes.
pub const CONSTANT_BUFFER_VIEW_ALIGNMENT: u64 = 256;

/// What a buffer is used for, which decides the views it gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Raw 32-bit words, read and written through byte offsets.
    ByteAddress,
    /// Shader constants.
    Constant,
    /// Array of structures.
    Structured,
    /// Vertex data.
    Vertex,
    /// 16- or 32-bit indices.
    Index,
}

/// Vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub address: GpuVirtualAddress,
    pub size_in_bytes: u32,
    pub stride: u32,
}

/// Index buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub address: GpuVirtualAddress,
    pub size_in_bytes: u32,
    pub format: Format,
}

/// Views created for a buffer, by kind.
#[derive(Debug)]
pub enum BufferViews<D: GpuDevice> {
    /// Descriptor 0 is the SRV, descriptor 1 the UAV.
    ByteAddress(DescriptorAllocation<D>),
    Constant(DescriptorAllocation<D>),
    /// Descriptor 0 is the SRV, descriptor 1 the UAV.
    Structured(DescriptorAllocation<D>),
    Vertex(VertexBufferView),
    Index(IndexBufferView),
}

/// A buffer resource together with the views its kind needs.
pub struct Buffer<D: GpuDevice> {
    resource: Resource<D>,
    kind: BufferKind,
    num_elements: u32,
    element_size: u32,
    views: BufferViews<D>,
}

impl<D: GpuDevice> Buffer<D> {
    /// Create a buffer of `num_elements` elements in the common state.
    pub fn new(
        session: &GpuSession<D>,
        kind: BufferKind,
        num_elements: u32,
        element_size: u32,
        name: &str,
    ) -> Result<Self> {
        if num_elements == 0 || element_size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{name}' needs at least one element of non-zero size"
            )));
        }
        match kind {
            BufferKind::ByteAddress if element_size != 4 => {
                return Err(GpuError::InvalidArgument(format!(
                    "byte address buffer '{name}' must use 4 byte elements, got {element_size}"
                )))
            }
            BufferKind::Index if !matches!(element_size, 2 | 4) => {
                return Err(GpuError::InvalidArgument(format!(
                    "index buffer '{name}' must use 2 or 4 byte indices, got {element_size}"
                )))
            }
            _ => {}
        }

        let mut size = u64::from(num_elements) * u64::from(element_size);
        if kind == BufferKind::Constant {
            size = size.next_multiple_of(CONSTANT_BUFFER_VIEW_ALIGNMENT);
        }
        let flags = ResourceFlags {
            allow_unordered_access: matches!(kind, BufferKind::ByteAddress | BufferKind::Structured),
            ..ResourceFlags::default()
        };

        let resource = session.create_resource(
            &ResourceDesc::buffer(size).with_flags(flags),
            ResourceState::COMMON,
            None,
            name,
        )?;
        let views = Self::create_views(session, kind, &resource, num_elements, element_size)?;

        Ok(Self {
            resource,
            kind,
            num_elements,
            element_size,
            views,
        })
    }

    fn create_views(
        session: &GpuSession<D>,
        kind: BufferKind,
        resource: &Resource<D>,
        num_elements: u32,
        element_size: u32,
    ) -> Result<BufferViews<D>> {
        let size = resource.desc().buffer_size().unwrap_or_default();
        let size_in_bytes = u32::try_from(size).map_err(|_| {
            GpuError::InvalidArgument(format!("buffer '{}' exceeds 4 GiB", resource.name()))
        })?;

        let views = match kind {
            BufferKind::ByteAddress | BufferKind::Structured => {
                let raw = kind == BufferKind::ByteAddress;
                let (count, stride) = if raw {
                    (size_in_bytes / 4, 0)
                } else {
                    (num_elements, element_size)
                };
                let descriptors = session.allocate_descriptors(DescriptorHeapType::CbvSrvUav, 2)?;
                descriptors.write_view(
                    0,
                    &ViewDesc::BufferSrv {
                        resource: resource.raw(),
                        first_element: 0,
                        num_elements: count,
                        structure_stride: stride,
                        raw,
                    },
                )?;
                descriptors.write_view(
                    1,
                    &ViewDesc::BufferUav {
                        resource: resource.raw(),
                        first_element: 0,
                        num_elements: count,
                        structure_stride: stride,
                        raw,
                    },
                )?;
                if raw {
                    BufferViews::ByteAddress(descriptors)
                } else {
                    BufferViews::Structured(descriptors)
                }
            }
            BufferKind::Constant => {
                let descriptors = session.allocate_descriptors(DescriptorHeapType::CbvSrvUav, 1)?;
                descriptors.write_view(
                    0,
                    &ViewDesc::ConstantBuffer {
                        address: resource.gpu_address(),
                        size: size_in_bytes,
                    },
                )?;
                BufferViews::Constant(descriptors)
            }
            BufferKind::Vertex => BufferViews::Vertex(VertexBufferView {
                address: resource.gpu_address(),
                size_in_bytes,
                stride: element_size,
            }),
            BufferKind::Index => BufferViews::Index(IndexBufferView {
                address: resource.gpu_address(),
                size_in_bytes,
                format: if element_size == 2 {
                    Format::R16Uint
                } else {
                    Format::R32Uint
                },
            }),
        };
        Ok(views)
    }

    /// Underlying resource.
    pub fn resource(&self) -> &Resource<D> {
        &self.resource
    }

    /// Buffer kind.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Number of elements.
    pub fn num_elements(&self) -> u32 {
        self.num_elements
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Size of the resource in bytes, including constant buffer padding.
    pub fn size_in_bytes(&self) -> u64 {
        self.resource.desc().buffer_size().unwrap_or_default()
    }

    /// Views of the buffer.
    pub fn views(&self) -> &BufferViews<D> {
        &self.views
    }

    /// Shader resource view, for byte address and structured buffers.
    pub fn srv(&self) -> Option<CpuDescriptorHandle> {
        match &self.views {
            BufferViews::ByteAddress(d) | BufferViews::Structured(d) => Some(d.descriptor_handle(0)),
            _ => None,
        }
    }

    /// Unordered access view, for byte address and structured buffers.
    pub fn uav(&self) -> Option<CpuDescriptorHandle> {
        match &self.views {
            BufferViews::ByteAddress(d) | BufferViews::Structured(d) => Some(d.descriptor_handle(1)),
            _ => None,
        }
    }

    /// Constant buffer view, for constant buffers.
    pub fn cbv(&self) -> Option<CpuDescriptorHandle> {
        match &self.views {
            BufferViews::Constant(d) => Some(d.descriptor_handle(0)),
            _ => None,
        }
    }

    /// Vertex buffer binding, for vertex buffers.
    pub fn vertex_buffer_view(&self) -> Option<VertexBufferView> {
        match self.views {
            BufferViews::Vertex(view) => Some(view),
            _ => None,
        }
    }

    /// Index buffer binding, for index buffers.
    pub fn index_buffer_view(&self) -> Option<IndexBufferView> {
        match self.views {
            BufferViews::Index(view) => Some(view),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use crate::GpuConfig;
    use std::sync::Arc;

    fn session() -> GpuSession<HeadlessDevice> {
        GpuSession::new(Arc::new(HeadlessDevice::new()), GpuConfig::default())
    }

    fn view_at(buffer: &Buffer<HeadlessDevice>, index: u32) -> Option<ViewDesc<crate::headless::HeadlessResourceId>> {
        let (BufferViews::ByteAddress(d) | BufferViews::Structured(d) | BufferViews::Constant(d)) =
            buffer.views()
        else {
            return None;
        };
        d.page()?.heap().view(d.heap_offset() + index)
    }

    #[test]
    fn byte_address_buffer_gets_raw_views() {
        let session = session();
        let buffer = Buffer::new(&session, BufferKind::ByteAddress, 64, 4, "raw").unwrap();

        assert!(buffer.srv().is_some());
        assert!(buffer.uav().is_some());
        assert!(buffer.resource().desc().flags.allow_unordered_access);
        assert_eq!(
            view_at(&buffer, 0),
            Some(ViewDesc::BufferSrv {
                resource: buffer.resource().raw(),
                first_element: 0,
                num_elements: 64,
                structure_stride: 0,
                raw: true,
            })
        );
    }

    #[test]
    fn byte_address_requires_words() {
        let err = Buffer::new(&session(), BufferKind::ByteAddress, 16, 8, "raw").err().unwrap();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn constant_buffer_is_padded() {
        let session = session();
        let buffer = Buffer::new(&session, BufferKind::Constant, 1, 80, "camera").unwrap();

        assert_eq!(buffer.size_in_bytes(), 256);
        assert!(buffer.cbv().is_some());
        assert!(buffer.srv().is_none());
        assert_eq!(
            view_at(&buffer, 0),
            Some(ViewDesc::ConstantBuffer {
                address: buffer.resource().gpu_address(),
                size: 256,
            })
        );
    }

    #[test]
    fn structured_buffer_uses_element_stride() {
        let session = session();
        let buffer = Buffer::new(&session, BufferKind::Structured, 10, 48, "particles").unwrap();

        assert_eq!(
            view_at(&buffer, 1),
            Some(ViewDesc::BufferUav {
                resource: buffer.resource().raw(),
                first_element: 0,
                num_elements: 10,
                structure_stride: 48,
                raw: false,
            })
        );
    }

    #[test]
    fn vertex_buffer_has_no_descriptors() {
        let session = session();
        let buffer = Buffer::new(&session, BufferKind::Vertex, 3, 32, "triangle").unwrap();

        assert_eq!(
            buffer.vertex_buffer_view(),
            Some(VertexBufferView {
                address: buffer.resource().gpu_address(),
                size_in_bytes: 96,
                stride: 32,
            })
        );
        assert_eq!(
            session
                .descriptor_allocator(DescriptorHeapType::CbvSrvUav)
                .num_pages(),
            0
        );
    }

    #[test]
    fn index_format_follows_element_size() {
        let session = session();
        let short = Buffer::new(&session, BufferKind::Index, 6, 2, "short").unwrap();
        let long = Buffer::new(&session, BufferKind::Index, 6, 4, "long").unwrap();

        assert_eq!(short.index_buffer_view().unwrap().format, Format::R16Uint);
        assert_eq!(long.index_buffer_view().unwrap().format, Format::R32Uint);
        assert!(Buffer::new(&session, BufferKind::Index, 6, 1, "bytes")
            .err()
            .unwrap()
            .is_invalid_argument());
    }
}
