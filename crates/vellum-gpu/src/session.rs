//! Process-wide GPU state shared by queues, command lists and resources.

use std::sync::Arc;

use crate::config::GpuConfig;
use crate::descriptors::{DescriptorAllocation, DescriptorAllocator};
use crate::device::{ClearValue, DescriptorHeapType, GpuDevice, ResourceDesc};
use crate::error::Result;
use crate::frame::FrameClock;
use crate::resource::Resource;
use crate::state::ResourceState;
use crate::tracker::{GlobalResourceStates, ResourceStatesGuard};

/// Owner of the device, the global resource states, the descriptor
/// allocators and the frame clock.
///
/// Shared as `Arc<GpuSession<D>>` by everything built on top of it.
pub struct GpuSession<D: GpuDevice> {
    device: Arc<D>,
    config: GpuConfig,
    global_states: Arc<GlobalResourceStates<D::RawResource>>,
    frame_clock: Arc<FrameClock>,
    descriptor_allocators: [DescriptorAllocator<D>; DescriptorHeapType::COUNT],
}

impl<D: GpuDevice> GpuSession<D> {
    /// Create a session over `device`.
    pub fn new(device: Arc<D>, config: GpuConfig) -> Self {
        let frame_clock = Arc::new(FrameClock::new());
        let descriptor_allocators = DescriptorHeapType::ALL.map(|heap_type| {
            DescriptorAllocator::new(
                Arc::clone(&device),
                heap_type,
                config.descriptors_for(heap_type),
                Arc::clone(&frame_clock),
            )
        });

        tracing::info!(
            "GPU session created: {} frames in flight, {} byte upload pages",
            config.frames_in_flight,
            config.upload_page_size
        );

        Self {
            device,
            config,
            global_states: Arc::new(GlobalResourceStates::new()),
            frame_clock,
            descriptor_allocators,
        }
    }

    /// The device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// Create a resource and register its initial state.
    pub fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
        name: &str,
    ) -> Result<Resource<D>> {
        Resource::new(
            Arc::clone(&self.device),
            Arc::clone(&self.global_states),
            desc,
            initial_state,
            clear_value,
            name,
        )
    }

    /// Allocator of one heap type.
    pub fn descriptor_allocator(&self, heap_type: DescriptorHeapType) -> &DescriptorAllocator<D> {
        &self.descriptor_allocators[heap_type.index()]
    }

    /// Allocate `count` contiguous descriptors of one heap type.
    pub fn allocate_descriptors(
        &self,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> Result<DescriptorAllocation<D>> {
        self.descriptor_allocator(heap_type).allocate(count)
    }

    /// Lock the global resource states.
    ///
    /// Hold the guard only for flushing and committing; creating or dropping
    /// resources on the same thread meanwhile deadlocks.
    pub fn lock_resource_states(&self) -> ResourceStatesGuard<'_, D::RawResource> {
        self.global_states.lock()
    }

    /// Last known state of a subresource, `None` for unknown resources.
    pub fn global_state(&self, resource: &Resource<D>, subresource: u32) -> Option<ResourceState> {
        self.global_states.get(resource.raw(), subresource)
    }

    /// Number of resources in the global state table.
    pub fn num_tracked_resources(&self) -> usize {
        self.global_states.len()
    }

    /// Frame descriptors dropped now are tagged with.
    pub fn current_frame(&self) -> u64 {
        self.frame_clock.current()
    }

    /// Move to the next frame and return its number.
    pub fn advance_frame(&self) -> u64 {
        self.frame_clock.advance()
    }

    /// Recycle every descriptor freed at or before `completed_frame`.
    ///
    /// Only call once the GPU is known to have finished that frame.
    pub fn release_stale_descriptors(&self, completed_frame: u64) {
        for allocator in &self.descriptor_allocators {
            allocator.release_stale_descriptors(completed_frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use crate::state::ALL_SUBRESOURCES;

    fn session() -> GpuSession<HeadlessDevice> {
        GpuSession::new(
            Arc::new(HeadlessDevice::new()),
            GpuConfig::default().with_descriptors_per_heap(DescriptorHeapType::Rtv, 8),
        )
    }

    #[test]
    fn heap_types_use_their_own_allocator() {
        let session = session();
        let rtv = session.allocate_descriptors(DescriptorHeapType::Rtv, 2).unwrap();
        let srv = session
            .allocate_descriptors(DescriptorHeapType::CbvSrvUav, 2)
            .unwrap();

        assert_eq!(rtv.heap_type(), Some(DescriptorHeapType::Rtv));
        assert_eq!(srv.heap_type(), Some(DescriptorHeapType::CbvSrvUav));
        assert_eq!(rtv.page().unwrap().num_descriptors(), 8);
        assert_eq!(session.descriptor_allocator(DescriptorHeapType::Sampler).num_pages(), 0);
    }

    #[test]
    fn dropped_descriptors_return_after_their_frame() {
        let session = session();
        let allocation = session.allocate_descriptors(DescriptorHeapType::Rtv, 8).unwrap();
        let page = allocation.page().unwrap().clone();

        session.advance_frame();
        drop(allocation);
        assert_eq!(page.num_stale_handles(), 8);

        session.release_stale_descriptors(0);
        assert_eq!(page.num_free_handles(), 0);
        session.release_stale_descriptors(session.current_frame());
        assert_eq!(page.num_free_handles(), 8);
    }

    #[test]
    fn resources_live_in_global_table() {
        let session = session();
        let resource = session
            .create_resource(
                &ResourceDesc::buffer(16),
                ResourceState::GENERIC_READ,
                None,
                "constants",
            )
            .unwrap();

        assert_eq!(
            session.global_state(&resource, ALL_SUBRESOURCES),
            Some(ResourceState::GENERIC_READ)
        );
        assert_eq!(session.num_tracked_resources(), 1);
        drop(resource);
        assert_eq!(session.num_tracked_resources(), 0);
    }
}
