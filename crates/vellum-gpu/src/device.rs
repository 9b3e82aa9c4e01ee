//! Native device abstraction.
//!
//! Everything above this module is written once against [`GpuDevice`]. A
//! backend names its native objects through the associated types and
//! implements the handful of native calls the allocators, the state tracker
//! and the command queue need.

use std::fmt::Debug;
use std::hash::Hash;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::Result;
use crate::state::ResourceState;

/// GPU virtual address of a resource or of an offset inside one.
pub type GpuVirtualAddress = u64;

/// CPU-side address of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Handle `count` slots further along a heap with the given stride.
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(count) * u64::from(increment))
    }
}

/// Kinds of descriptor heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource and unordered access views.
    CbvSrvUav,
    /// Samplers.
    Sampler,
    /// Render target views.
    Rtv,
    /// Depth stencil views.
    Dsv,
}

impl DescriptorHeapType {
    /// Number of heap types.
    pub const COUNT: usize = 4;

    /// Every heap type, in [`index`](Self::index) order.
    pub const ALL: [Self; Self::COUNT] = [Self::CbvSrvUav, Self::Sampler, Self::Rtv, Self::Dsv];

    /// Dense index of the heap type.
    pub fn index(self) -> usize {
        match self {
            Self::CbvSrvUav => 0,
            Self::Sampler => 1,
            Self::Rtv => 2,
            Self::Dsv => 3,
        }
    }
}

/// Kinds of command lists and the queues executing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListType {
    /// Graphics, compute and copy.
    Direct,
    /// Compute and copy.
    Compute,
    /// Copy only.
    Copy,
}

/// Memory pool a resource lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HeapKind {
    /// GPU-local memory.
    #[default]
    Default,
    /// CPU-writable, GPU-readable memory.
    Upload,
    /// GPU-writable, CPU-readable memory.
    Readback,
}

/// Texel formats the core needs to know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Typeless or structured data.
    #[default]
    Unknown,
    R16Uint,
    R32Uint,
    R32Typeless,
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    /// Returns `true` for depth formats.
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

/// Usage permissions a resource is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceFlags {
    pub allow_unordered_access: bool,
    pub allow_render_target: bool,
    pub allow_depth_stencil: bool,
}

/// Shape of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    /// Linear buffer of `size` bytes.
    Buffer { size: u64 },
    /// Two-dimensional texture, optionally arrayed and mipmapped.
    Texture2D {
        width: u32,
        height: u32,
        array_size: u16,
        mip_levels: u16,
        format: Format,
    },
}

/// Description of a resource to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub flags: ResourceFlags,
    pub heap: HeapKind,
}

impl ResourceDesc {
    /// A buffer of `size` bytes in GPU-local memory.
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer { size },
            flags: ResourceFlags::default(),
            heap: HeapKind::Default,
        }
    }

    /// A single-layer 2D texture.
    pub fn texture_2d(width: u32, height: u32, mip_levels: u16, format: Format) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D {
                width,
                height,
                array_size: 1,
                mip_levels: mip_levels.max(1),
                format,
            },
            flags: ResourceFlags::default(),
            heap: HeapKind::Default,
        }
    }

    /// Set the array size of a texture description.
    pub fn with_array_size(mut self, layers: u16) -> Self {
        if let ResourceDimension::Texture2D { array_size, .. } = &mut self.dimension {
            *array_size = layers.max(1);
        }
        self
    }

    /// Set the usage flags.
    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the memory pool.
    pub fn with_heap(mut self, heap: HeapKind) -> Self {
        self.heap = heap;
        self
    }

    /// Number of individually transitionable subresources.
    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer { .. } => 1,
            ResourceDimension::Texture2D {
                array_size,
                mip_levels,
                ..
            } => u32::from(array_size) * u32::from(mip_levels),
        }
    }

    /// Size in bytes for buffers, `None` for textures.
    pub fn buffer_size(&self) -> Option<u64> {
        match self.dimension {
            ResourceDimension::Buffer { size } => Some(size),
            ResourceDimension::Texture2D { .. } => None,
        }
    }
}

/// Optimized clear value a render target or depth buffer is created with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color { format: Format, rgba: [f32; 4] },
    DepthStencil { format: Format, depth: f32, stencil: u8 },
}

/// One barrier as understood by the native command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceBarrier<R> {
    /// Usage transition of one subresource, or all of them.
    Transition {
        resource: R,
        subresource: u32,
        before: ResourceState,
        after: ResourceState,
    },
    /// Switch between resources sharing the same memory.
    Aliasing { before: Option<R>, after: Option<R> },
    /// Order unordered-access writes; `None` orders every resource.
    UnorderedAccess { resource: Option<R> },
}

impl<R: Copy> ResourceBarrier<R> {
    /// Transition barrier with an unknown `before` state.
    pub fn transition(resource: R, subresource: u32, after: ResourceState) -> Self {
        Self::Transition {
            resource,
            subresource,
            before: ResourceState::COMMON,
            after,
        }
    }
}

/// Description of a view written into a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDesc<R> {
    /// Constant buffer over `size` bytes starting at `address`.
    ConstantBuffer {
        address: GpuVirtualAddress,
        size: u32,
    },
    /// Shader resource view of a buffer.
    BufferSrv {
        resource: R,
        first_element: u64,
        num_elements: u32,
        /// Zero for raw (byte address) views.
        structure_stride: u32,
        raw: bool,
    },
    /// Unordered access view of a buffer.
    BufferUav {
        resource: R,
        first_element: u64,
        num_elements: u32,
        structure_stride: u32,
        raw: bool,
    },
    /// Shader resource view of every mip of a texture.
    TextureSrv { resource: R, format: Format },
    /// Unordered access view of one mip of a texture.
    TextureUav {
        resource: R,
        format: Format,
        mip_slice: u32,
    },
    /// Render target view of one mip of a texture.
    RenderTarget {
        resource: R,
        format: Format,
        mip_slice: u32,
    },
    /// Depth stencil view of one mip of a texture.
    DepthStencil {
        resource: R,
        format: Format,
        mip_slice: u32,
    },
}

/// The native calls the core is built on.
///
/// Associated types own their native objects and release them on drop. The
/// command list methods mirror an explicit API: recording calls are
/// infallible and must only be made on an open list.
pub trait GpuDevice: Send + Sync + Sized + 'static {
    /// Identity of a resource, used as the state-tracking key.
    type RawResource: Copy + Eq + Hash + Debug + Send + Sync;
    /// An owned resource allocation.
    type Resource: Send + Sync;
    /// A descriptor heap.
    type DescriptorHeap: Send + Sync;
    /// Backing memory for command lists.
    type CommandAllocator: Send + Sync;
    /// A recordable command list.
    type CommandList: Send + Sync;
    /// A hardware submission queue.
    type Queue: Send;
    /// A monotonically increasing GPU counter.
    type Fence: Send + Sync;
    /// A persistently mapped, GPU-readable host buffer.
    type UploadHeap: Send + Sync;

    /// Create a resource in `initial_state`.
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<&ClearValue>,
        name: &str,
    ) -> Result<Self::Resource>;

    /// Identity of a resource.
    fn raw_resource(&self, resource: &Self::Resource) -> Self::RawResource;

    /// GPU address of a buffer resource, 0 for textures.
    fn resource_gpu_address(&self, resource: &Self::Resource) -> GpuVirtualAddress;

    /// Attach a debug name.
    fn set_resource_name(&self, resource: &Self::Resource, name: &str);

    /// Create a descriptor heap of `num_descriptors` slots.
    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<Self::DescriptorHeap>;

    /// Handle of the first slot of a heap.
    fn descriptor_heap_start(&self, heap: &Self::DescriptorHeap) -> CpuDescriptorHandle;

    /// Distance between two consecutive slots of a heap type.
    fn descriptor_increment(&self, heap_type: DescriptorHeapType) -> u32;

    /// Write a view into slot `index` of a heap.
    fn write_descriptor(
        &self,
        heap: &Self::DescriptorHeap,
        index: u32,
        view: &ViewDesc<Self::RawResource>,
    ) -> Result<()>;

    /// Create a submission queue.
    fn create_queue(&self, list_type: CommandListType) -> Result<Self::Queue>;

    /// Create a command allocator.
    fn create_command_allocator(&self, list_type: CommandListType)
        -> Result<Self::CommandAllocator>;

    /// Reclaim the memory of every list recorded from an allocator.
    ///
    /// The GPU must have finished executing those lists.
    fn reset_command_allocator(&self, allocator: &mut Self::CommandAllocator) -> Result<()>;

    /// Create a command list, open for recording into `allocator`.
    fn create_command_list(
        &self,
        list_type: CommandListType,
        allocator: &Self::CommandAllocator,
    ) -> Result<Self::CommandList>;

    /// Reopen a closed command list, recording into `allocator`.
    fn reset_command_list(
        &self,
        list: &mut Self::CommandList,
        allocator: &Self::CommandAllocator,
    ) -> Result<()>;

    /// Finish recording.
    fn close_command_list(&self, list: &mut Self::CommandList) -> Result<()>;

    /// Record a batch of barriers.
    fn cmd_resource_barriers(
        &self,
        list: &mut Self::CommandList,
        barriers: &[ResourceBarrier<Self::RawResource>],
    );

    /// Record a whole-resource copy.
    fn cmd_copy_resource(
        &self,
        list: &mut Self::CommandList,
        dst: Self::RawResource,
        src: Self::RawResource,
    );

    /// Record a byte-range copy between two buffers.
    fn cmd_copy_buffer_region(
        &self,
        list: &mut Self::CommandList,
        dst: Self::RawResource,
        dst_offset: u64,
        src: Self::RawResource,
        src_offset: u64,
        size: u64,
    );

    /// Submit closed command lists in order.
    fn execute_command_lists(
        &self,
        queue: &mut Self::Queue,
        lists: &[&Self::CommandList],
    ) -> Result<()>;

    /// Create a fence holding `initial_value`.
    fn create_fence(&self, initial_value: u64) -> Result<Self::Fence>;

    /// Have the queue set `fence` to `value` once prior work retires.
    fn signal_fence(&self, queue: &mut Self::Queue, fence: &Self::Fence, value: u64)
        -> Result<()>;

    /// Last value the GPU has written to the fence.
    fn fence_completed_value(&self, fence: &Self::Fence) -> Result<u64>;

    /// Block until the fence reaches `value`.
    ///
    /// Returns `Ok(false)` if `timeout` expired first; `None` waits forever.
    fn wait_for_fence(
        &self,
        fence: &Self::Fence,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    /// Create a mapped upload heap of `size` bytes.
    fn create_upload_heap(&self, size: u64) -> Result<Self::UploadHeap>;

    /// CPU address of the first byte of an upload heap.
    fn upload_heap_cpu_ptr(&self, heap: &Self::UploadHeap) -> NonNull<u8>;

    /// GPU address of the first byte of an upload heap.
    fn upload_heap_gpu_address(&self, heap: &Self::UploadHeap) -> GpuVirtualAddress;

    /// Identity of the buffer backing an upload heap, for copy commands.
    fn upload_heap_raw(&self, heap: &Self::UploadHeap) -> Self::RawResource;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subresource_count() {
        assert_eq!(ResourceDesc::buffer(64).subresource_count(), 1);
        let texture = ResourceDesc::texture_2d(64, 64, 4, Format::Rgba8Unorm).with_array_size(6);
        assert_eq!(texture.subresource_count(), 24);
    }

    #[test]
    fn handle_offset() {
        let base = CpuDescriptorHandle(0x1000);
        assert_eq!(base.offset(3, 32), CpuDescriptorHandle(0x1060));
        assert!(CpuDescriptorHandle::NULL.is_null());
    }
}
