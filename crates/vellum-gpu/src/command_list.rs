//! Recording front end over a native command list.

use std::any::Any;
use std::sync::Arc;

use bytemuck::Pod;

use crate::device::{CommandListType, GpuDevice};
use crate::error::{GpuError, Result};
use crate::resource::Resource;
use crate::session::GpuSession;
use crate::state::{ResourceState, ALL_SUBRESOURCES};
use crate::tracker::{ResourceStateTracker, ResourceStatesGuard};
use crate::upload::{UploadAllocation, UploadBuffer};

/// Alignment of constant buffer data.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Alignment of staged copy sources.
const COPY_ALIGNMENT: u64 = 16;

/// A native command list with everything that must live as long as its
/// recording: the command allocator it records into, its barrier tracker,
/// its upload memory and the objects its commands reference.
///
/// Obtained from [`CommandQueue::get_command_list`](crate::CommandQueue::get_command_list)
/// and handed back through `execute_command_list`.
pub struct CommandList<D: GpuDevice> {
    session: Arc<GpuSession<D>>,
    list_type: CommandListType,
    native: D::CommandList,
    allocator: Option<D::CommandAllocator>,
    tracker: ResourceStateTracker<D>,
    upload: UploadBuffer<D>,
    tracked_objects: Vec<Arc<dyn Any + Send + Sync>>,
}

impl<D: GpuDevice> CommandList<D> {
    pub(crate) fn new(
        session: Arc<GpuSession<D>>,
        list_type: CommandListType,
        allocator: D::CommandAllocator,
    ) -> Result<Self> {
        let device = Arc::clone(session.device());
        let native = device
            .create_command_list(list_type, &allocator)
            .inspect_err(|e| tracing::error!("Failed to create {list_type:?} command list: {e}"))?;
        let upload = UploadBuffer::new(device, session.config().upload_page_size);

        Ok(Self {
            session,
            list_type,
            native,
            allocator: Some(allocator),
            tracker: ResourceStateTracker::new(),
            upload,
            tracked_objects: Vec::new(),
        })
    }

    /// Reopen a retired list against `allocator`, dropping everything it
    /// recorded and kept alive.
    pub(crate) fn reset(&mut self, allocator: D::CommandAllocator) -> Result<()> {
        self.session
            .device()
            .reset_command_list(&mut self.native, &allocator)?;
        self.allocator = Some(allocator);
        self.tracker.reset();
        self.upload.reset();
        self.tracked_objects.clear();
        Ok(())
    }

    pub(crate) fn take_allocator(&mut self) -> Option<D::CommandAllocator> {
        self.allocator.take()
    }

    /// Queue type the list records for.
    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    /// Native command list, for recording commands the core does not wrap.
    pub fn native(&self) -> &D::CommandList {
        &self.native
    }

    /// Native command list, mutably.
    ///
    /// Barriers recorded directly are invisible to the state tracker.
    pub fn native_mut(&mut self) -> &mut D::CommandList {
        &mut self.native
    }

    /// Allocator the list records into, `None` once submitted.
    pub fn allocator(&self) -> Option<&D::CommandAllocator> {
        self.allocator.as_ref()
    }

    /// Session the list belongs to.
    pub fn session(&self) -> &Arc<GpuSession<D>> {
        &self.session
    }

    /// Barrier tracker of this list.
    pub fn tracker(&self) -> &ResourceStateTracker<D> {
        &self.tracker
    }

    /// Transition a subresource (or [`ALL_SUBRESOURCES`]) to `after`.
    pub fn transition_barrier(
        &mut self,
        resource: &Resource<D>,
        after: ResourceState,
        subresource: u32,
        flush_barriers: bool,
    ) {
        self.tracker.transition_resource(resource, after, subresource);
        if flush_barriers {
            self.flush_resource_barriers();
        }
    }

    /// Order unordered-access writes to a resource, or to every resource.
    pub fn uav_barrier(&mut self, resource: Option<&Resource<D>>, flush_barriers: bool) {
        self.tracker.uav_barrier(resource);
        if flush_barriers {
            self.flush_resource_barriers();
        }
    }

    /// Switch the memory shared by two placed resources.
    pub fn aliasing_barrier(
        &mut self,
        before: Option<&Resource<D>>,
        after: Option<&Resource<D>>,
        flush_barriers: bool,
    ) {
        self.tracker.aliasing_barrier(before, after);
        if flush_barriers {
            self.flush_resource_barriers();
        }
    }

    /// Record every resolved barrier.
    pub fn flush_resource_barriers(&mut self) -> u32 {
        self.tracker
            .flush_resource_barriers(self.session.device(), &mut self.native)
    }

    /// Copy the whole of `src` into `dst`.
    pub fn copy_resource(&mut self, dst: &Resource<D>, src: &Resource<D>) {
        self.transition_barrier(dst, ResourceState::COPY_DEST, ALL_SUBRESOURCES, false);
        self.transition_barrier(src, ResourceState::COPY_SOURCE, ALL_SUBRESOURCES, true);

        self.session
            .device()
            .cmd_copy_resource(&mut self.native, dst.raw(), src.raw());

        self.track_resource(dst);
        self.track_resource(src);
    }

    /// Stage `data` in upload memory and copy it to the start of buffer `dst`.
    pub fn copy_buffer(&mut self, dst: &Resource<D>, data: &[u8]) -> Result<()> {
        let Some(capacity) = dst.desc().buffer_size() else {
            return Err(GpuError::InvalidArgument(format!(
                "copy_buffer target '{}' is not a buffer",
                dst.name()
            )));
        };
        if data.len() as u64 > capacity {
            return Err(GpuError::InvalidArgument(format!(
                "{} bytes do not fit into buffer '{}' of {capacity} bytes",
                data.len(),
                dst.name()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let size = data.len() as u64;
        let (src, src_offset) = if size <= self.upload.page_size() {
            let mut staging = self.upload.allocate(size, COPY_ALIGNMENT)?;
            staging.write(data)?;
            (staging.raw(), staging.offset())
        } else {
            self.stage_dedicated(data)?
        };

        self.transition_barrier(dst, ResourceState::COPY_DEST, ALL_SUBRESOURCES, true);
        self.session
            .device()
            .cmd_copy_buffer_region(&mut self.native, dst.raw(), 0, src, src_offset, size);
        self.track_resource(dst);
        Ok(())
    }

    /// Copy data too large for an upload page through its own heap.
    fn stage_dedicated(&mut self, data: &[u8]) -> Result<(D::RawResource, u64)> {
        let device = self.session.device();
        let heap = device.create_upload_heap(data.len() as u64)?;
        // SAFETY: the heap was just created with room for `data` and nothing
        // else references it yet.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                device.upload_heap_cpu_ptr(&heap).as_ptr(),
                data.len(),
            );
        }
        let raw = device.upload_heap_raw(&heap);
        self.track_object(Arc::new(heap));
        Ok((raw, 0))
    }

    /// Copy `data` into upload memory valid until the list retires.
    pub fn allocate_dynamic(&mut self, data: &[u8], alignment: u64) -> Result<UploadAllocation<D>> {
        let mut allocation = self.upload.allocate(data.len() as u64, alignment)?;
        allocation.write(data)?;
        Ok(allocation)
    }

    /// Copy a value into constant-buffer-aligned upload memory.
    pub fn allocate_constants<T: Pod>(&mut self, value: &T) -> Result<UploadAllocation<D>> {
        self.allocate_dynamic(bytemuck::bytes_of(value), CONSTANT_BUFFER_ALIGNMENT)
    }

    /// Keep an object alive until the list has retired.
    pub fn track_object(&mut self, object: Arc<dyn Any + Send + Sync>) {
        self.tracked_objects.push(object);
    }

    /// Keep a resource alive until the list has retired.
    pub fn track_resource(&mut self, resource: &Resource<D>) {
        self.track_object(Arc::new(resource.clone()));
    }

    /// Number of objects kept alive by this list.
    pub fn num_tracked_objects(&self) -> usize {
        self.tracked_objects.len()
    }

    /// Finish recording a user list.
    ///
    /// Records the resolved barriers, closes the list, then resolves the
    /// pending barriers against the global table into `pending` and commits
    /// this list's final states. Returns `true` if `pending` received
    /// barriers and must run first.
    pub fn close(
        &mut self,
        global: &mut ResourceStatesGuard<'_, D::RawResource>,
        pending: &mut Self,
    ) -> Result<bool> {
        self.flush_resource_barriers();
        self.session.device().close_command_list(&mut self.native)?;

        let num_pending = self.tracker.flush_pending_resource_barriers(
            global,
            self.session.device(),
            &mut pending.native,
        );
        self.tracker.commit_final_resource_states(global);

        Ok(num_pending > 0)
    }

    /// Finish recording a helper list that only carries resolved barriers.
    pub fn close_helper(&mut self) -> Result<()> {
        self.flush_resource_barriers();
        self.session.device().close_command_list(&mut self.native)
    }
}
