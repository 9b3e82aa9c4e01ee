//! Full frames driven through a session, a direct queue and command lists.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use vellum_gpu::headless::HeadlessDevice;
use vellum_gpu::{
    Buffer, BufferKind, BufferViews, CommandListType, CommandQueue, DescriptorHeapType, GpuConfig,
    GpuSession, ResourceDesc, ResourceState, ALL_SUBRESOURCES,
};

const FRAMES_IN_FLIGHT: usize = 2;

fn session(device: HeadlessDevice) -> Arc<GpuSession<HeadlessDevice>> {
    Arc::new(GpuSession::new(
        Arc::new(device),
        GpuConfig::default()
            .with_frames_in_flight(FRAMES_IN_FLIGHT as u32)
            .with_upload_page_size(4096),
    ))
}

#[test]
fn frames_recycle_allocators_and_descriptors() {
    let session = session(HeadlessDevice::new());
    let device = Arc::clone(session.device());
    let queue = CommandQueue::new(Arc::clone(&session), CommandListType::Direct).unwrap();

    let mut fences = Vec::new();
    let mut allocator_ids = HashSet::new();
    let mut page = None;

    for frame in 0..6 {
        let mut list = queue.get_command_list().unwrap();
        allocator_ids.insert(list.allocator().unwrap().id());

        let constants = Buffer::new(&session, BufferKind::Constant, 1, 64, "frame constants").unwrap();
        if let BufferViews::Constant(descriptors) = constants.views() {
            page.get_or_insert_with(|| Arc::clone(descriptors.page().unwrap()));
        }
        list.allocate_constants(&[frame as f32; 4]).unwrap();
        list.transition_barrier(
            constants.resource(),
            ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            ALL_SUBRESOURCES,
            true,
        );
        list.track_resource(constants.resource());
        fences.push(queue.execute_command_list(list).unwrap());
        drop(constants);

        // The GPU runs one frame behind the CPU.
        if frame >= 1 {
            device.retire_through(fences[frame - 1]);
        }
        if let Some(old) = frame.checked_sub(FRAMES_IN_FLIGHT) {
            assert!(queue
                .wait_for_fence_value(fences[old], Some(Duration::ZERO))
                .unwrap());
            session.release_stale_descriptors(old as u64);
        }
        session.advance_frame();
    }

    // Two allocators per frame (list and helper), reused from frame 2 on.
    assert_eq!(allocator_ids.len(), 4);

    let page = page.unwrap();
    assert_eq!(session.descriptor_allocator(DescriptorHeapType::CbvSrvUav).num_pages(), 1);
    // Frames 4 and 5 have not been released yet.
    assert_eq!(page.num_stale_handles(), 2);
    assert_eq!(page.num_free_handles() + page.num_stale_handles(), page.num_descriptors());

    device.set_auto_retire(true);
}

#[test]
fn committed_state_carries_into_the_next_frame() {
    let session = session(HeadlessDevice::auto_retire());
    let queue = CommandQueue::new(Arc::clone(&session), CommandListType::Direct).unwrap();
    let target = session
        .create_resource(&ResourceDesc::buffer(256), ResourceState::COMMON, None, "target")
        .unwrap();

    let mut first = queue.get_command_list().unwrap();
    first.copy_buffer(&target, &[7; 256]).unwrap();
    first.transition_barrier(&target, ResourceState::PIXEL_SHADER_RESOURCE, ALL_SUBRESOURCES, false);
    queue.execute_command_list(first).unwrap();
    assert_eq!(
        session.global_state(&target, ALL_SUBRESOURCES),
        Some(ResourceState::PIXEL_SHADER_RESOURCE)
    );

    // A fresh list resolves its first transition against the committed state.
    let mut second = queue.get_command_list().unwrap();
    second.transition_barrier(&target, ResourceState::COPY_DEST, ALL_SUBRESOURCES, false);
    assert_eq!(second.tracker().num_pending_barriers(), 1);
    queue.execute_command_list(second).unwrap();

    let submitted = queue.with_native(|native| native.submitted_barriers());
    let last = submitted.last().copied().unwrap();
    assert_eq!(
        last,
        vellum_gpu::ResourceBarrier::Transition {
            resource: target.raw(),
            subresource: ALL_SUBRESOURCES,
            before: ResourceState::PIXEL_SHADER_RESOURCE,
            after: ResourceState::COPY_DEST,
        }
    );
}

#[test]
fn dropped_resources_leave_the_global_table_once_lists_retire() {
    let session = session(HeadlessDevice::new());
    let device = Arc::clone(session.device());
    let queue = CommandQueue::new(Arc::clone(&session), CommandListType::Direct).unwrap();

    let mut list = queue.get_command_list().unwrap();
    let scratch = session
        .create_resource(&ResourceDesc::buffer(64), ResourceState::COMMON, None, "scratch")
        .unwrap();
    list.transition_barrier(&scratch, ResourceState::UNORDERED_ACCESS, ALL_SUBRESOURCES, true);
    list.track_resource(&scratch);
    let fence = queue.execute_command_list(list).unwrap();
    drop(scratch);

    // Still referenced by the list waiting for its fence.
    assert_eq!(session.num_tracked_resources(), 1);

    device.retire_through(fence);
    // The helper list is reused first, then the list holding the resource.
    let first = queue.get_command_list().unwrap();
    let second = queue.get_command_list().unwrap();
    assert_eq!(session.num_tracked_resources(), 0);

    drop((first, second));
    device.set_auto_retire(true);
}

#[test]
fn resources_dropped_before_submission_stay_out_of_the_global_table() {
    let session = session(HeadlessDevice::auto_retire());
    let queue = CommandQueue::new(Arc::clone(&session), CommandListType::Direct).unwrap();

    let mut list = queue.get_command_list().unwrap();
    let transient = session
        .create_resource(&ResourceDesc::buffer(64), ResourceState::COMMON, None, "transient")
        .unwrap();
    list.transition_barrier(&transient, ResourceState::COPY_DEST, ALL_SUBRESOURCES, true);
    drop(transient);
    assert_eq!(session.num_tracked_resources(), 0);

    queue.execute_command_list(list).unwrap();
    assert_eq!(session.num_tracked_resources(), 0);
}
