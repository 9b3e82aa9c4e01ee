//! GPU resource and descriptor management.
//!
//! This crate provides:
//! - Descriptor allocation from paged heaps with frame-deferred reuse
//! - Per-subresource resource state tracking with automatic barriers
//! - Command queues with fence-gated recycling of lists and allocators
//! - Linear upload buffers for per-frame dynamic data
//!
//! Everything is generic over a [`GpuDevice`]. [`vulkan::VulkanDevice`]
//! drives real hardware; [`headless::HeadlessDevice`] keeps every object in
//! host memory and backs the tests.

pub mod buffer;
pub mod command_list;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod headless;
pub mod queue;
pub mod resource;
pub mod session;
pub mod state;
pub mod tracker;
pub mod upload;
pub mod vulkan;

pub use buffer::{Buffer, BufferKind, BufferViews, IndexBufferView, VertexBufferView};
pub use command_list::{CommandList, CONSTANT_BUFFER_ALIGNMENT};
pub use config::GpuConfig;
pub use descriptors::{DescriptorAllocation, DescriptorAllocator, DescriptorAllocatorPage};
pub use device::{
    ClearValue, CommandListType, CpuDescriptorHandle, DescriptorHeapType, Format, GpuDevice,
    GpuVirtualAddress, HeapKind, ResourceBarrier, ResourceDesc, ResourceDimension, ResourceFlags,
    ViewDesc,
};
pub use error::{GpuError, Result};
pub use frame::FrameClock;
pub use queue::CommandQueue;
pub use resource::Resource;
pub use session::GpuSession;
pub use state::{ResourceState, SubresourceStates, ALL_SUBRESOURCES};
pub use tracker::{GlobalResourceStates, ResourceStateTracker, ResourceStatesGuard};
pub use upload::{UploadAllocation, UploadBuffer};
