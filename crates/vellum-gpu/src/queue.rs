//! Command submission and fence synchronization.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::command_list::CommandList;
use crate::device::{CommandListType, GpuDevice};
use crate::error::{GpuError, Result};
use crate::session::GpuSession;

/// A hardware queue with its fence and recyclable command lists.
///
/// Command allocators and command lists are handed back to the queue on
/// submission and reused once the fence value they were submitted with has
/// been reached. Both reuse queues are FIFO with non-decreasing fence values.
pub struct CommandQueue<D: GpuDevice> {
    session: Arc<GpuSession<D>>,
    list_type: CommandListType,
    queue: Mutex<D::Queue>,
    fence: D::Fence,
    fence_value: AtomicU64,
    allocator_queue: Mutex<VecDeque<(u64, D::CommandAllocator)>>,
    list_queue: Mutex<VecDeque<(u64, CommandList<D>)>>,
}

impl<D: GpuDevice> CommandQueue<D> {
    /// Create a queue and its fence, starting at 0.
    pub fn new(session: Arc<GpuSession<D>>, list_type: CommandListType) -> Result<Self> {
        let device = session.device();
        let queue = device
            .create_queue(list_type)
            .inspect_err(|e| tracing::error!("Failed to create {list_type:?} queue: {e}"))?;
        let fence = device.create_fence(0)?;

        tracing::debug!("Created {list_type:?} command queue");

        Ok(Self {
            session,
            list_type,
            queue: Mutex::new(queue),
            fence,
            fence_value: AtomicU64::new(0),
            allocator_queue: Mutex::new(VecDeque::new()),
            list_queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue type.
    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    /// Session the queue belongs to.
    pub fn session(&self) -> &Arc<GpuSession<D>> {
        &self.session
    }

    /// Native fence.
    pub fn fence(&self) -> &D::Fence {
        &self.fence
    }

    /// Last fence value signaled from the CPU side.
    pub fn last_signaled_value(&self) -> u64 {
        self.fence_value.load(Ordering::Acquire)
    }

    /// Run `f` with exclusive access to the native queue.
    pub fn with_native<R>(&self, f: impl FnOnce(&mut D::Queue) -> R) -> R {
        f(&mut self.queue.lock())
    }

    /// Get a command list open for recording.
    ///
    /// Reuses the oldest retired command allocator and command list when
    /// their fence values have been reached, otherwise creates new ones.
    pub fn get_command_list(&self) -> Result<CommandList<D>> {
        let allocator = self.acquire_allocator()?;

        let retired = {
            let mut lists = self.list_queue.lock();
            match lists.front() {
                Some(&(value, _)) if self.is_fence_complete(value) => {
                    lists.pop_front().map(|(_, list)| list)
                }
                _ => None,
            }
        };

        match retired {
            Some(mut list) => {
                list.reset(allocator)?;
                Ok(list)
            }
            None => CommandList::new(Arc::clone(&self.session), self.list_type, allocator),
        }
    }

    fn acquire_allocator(&self) -> Result<D::CommandAllocator> {
        let retired = {
            let mut allocators = self.allocator_queue.lock();
            match allocators.front() {
                Some(&(value, _)) if self.is_fence_complete(value) => {
                    allocators.pop_front().map(|(_, allocator)| allocator)
                }
                _ => None,
            }
        };

        let device = self.session.device();
        match retired {
            Some(mut allocator) => {
                device.reset_command_allocator(&mut allocator)?;
                Ok(allocator)
            }
            None => {
                tracing::debug!("Creating {:?} command allocator", self.list_type);
                device.create_command_allocator(self.list_type)
            }
        }
    }

    /// Submit one command list. Returns the fence value that marks its completion.
    pub fn execute_command_list(&self, list: CommandList<D>) -> Result<u64> {
        self.execute_command_lists(vec![list])
    }

    /// Submit command lists in order.
    ///
    /// Every list is closed while the global resource states are locked: its
    /// pending barriers are resolved into a helper list that runs right
    /// before it, and its final states become the new global states.
    /// Returns the fence value that marks completion of the whole batch.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute_command_lists(&self, lists: Vec<CommandList<D>>) -> Result<u64> {
        if let Some(list) = lists.iter().find(|list| list.list_type() != self.list_type) {
            return Err(GpuError::InvalidArgument(format!(
                "{:?} list submitted to a {:?} queue",
                list.list_type(),
                self.list_type
            )));
        }

        // Recycling a list may drop the last reference to a resource, which
        // needs the global state table, so helpers are fetched before locking.
        let helpers = lists
            .iter()
            .map(|_| self.get_command_list())
            .collect::<Result<Vec<_>>>()?;

        let mut batch = Vec::with_capacity(lists.len() * 2);
        let mut submitted = Vec::with_capacity(lists.len() * 2);
        // Lists left over after a failure must outlive the lock as well.
        let mut pairs = lists.into_iter().zip(helpers);
        let mut failure = None;

        {
            let mut global = self.session.lock_resource_states();
            for (mut list, mut helper) in pairs.by_ref() {
                let closed = list
                    .close(&mut global, &mut helper)
                    .and_then(|has_pending| helper.close_helper().map(|()| has_pending));

                match closed {
                    Ok(has_pending) => {
                        if has_pending {
                            submitted.push(batch.len());
                        }
                        batch.push(helper);
                        submitted.push(batch.len());
                        batch.push(list);
                    }
                    Err(e) => {
                        failure = Some(e);
                        batch.push(helper);
                        batch.push(list);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            tracing::error!("Failed to close command list: {e}");
            return Err(e);
        }

        let natives: Vec<&D::CommandList> = submitted.iter().map(|&i| batch[i].native()).collect();
        let mut queue = self.queue.lock();
        self.session
            .device()
            .execute_command_lists(&mut queue, &natives)
            .inspect_err(|e| tracing::error!("Command list submission failed: {e}"))?;
        drop(natives);
        let fence_value = self.signal_locked(&mut queue)?;

        tracing::trace!(
            "Submitted {} command lists, fence value {fence_value}",
            submitted.len()
        );

        // Enqueued before the queue lock is released so fence values stay ordered.
        let mut allocators = self.allocator_queue.lock();
        let mut recycled = self.list_queue.lock();
        for mut list in batch {
            if let Some(allocator) = list.take_allocator() {
                allocators.push_back((fence_value, allocator));
            }
            recycled.push_back((fence_value, list));
        }
        drop((recycled, allocators, queue));

        Ok(fence_value)
    }

    /// Signal the next fence value from the queue.
    pub fn signal(&self) -> Result<u64> {
        self.signal_locked(&mut self.queue.lock())
    }

    fn signal_locked(&self, queue: &mut D::Queue) -> Result<u64> {
        let value = self.fence_value.fetch_add(1, Ordering::AcqRel) + 1;
        self.session
            .device()
            .signal_fence(queue, &self.fence, value)?;
        Ok(value)
    }

    /// Last fence value the GPU has reached.
    pub fn completed_fence_value(&self) -> Result<u64> {
        self.session.device().fence_completed_value(&self.fence)
    }

    /// Returns `true` once the GPU has reached `fence_value`.
    pub fn is_fence_complete(&self, fence_value: u64) -> bool {
        match self.completed_fence_value() {
            Ok(completed) => completed >= fence_value,
            Err(e) => {
                tracing::error!("Failed to query fence: {e}");
                false
            }
        }
    }

    /// Block until the GPU reaches `fence_value`.
    ///
    /// Returns `Ok(false)` if `timeout` expires first; `None` waits forever.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_fence_value(&self, fence_value: u64, timeout: Option<Duration>) -> Result<bool> {
        if self.is_fence_complete(fence_value) {
            return Ok(true);
        }
        let reached = self
            .session
            .device()
            .wait_for_fence(&self.fence, fence_value, timeout)?;
        if !reached {
            tracing::warn!("Timed out waiting for fence value {fence_value} after {timeout:?}");
        }
        Ok(reached)
    }

    /// Wait until every submitted command list has finished.
    pub fn flush(&self) -> Result<()> {
        let value = self.signal()?;
        self.wait_for_fence_value(value, None)?;
        Ok(())
    }

    /// Number of command lists waiting to be reused.
    pub fn num_queued_command_lists(&self) -> usize {
        self.list_queue.lock().len()
    }
}

impl<D: GpuDevice> Drop for CommandQueue<D> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("Failed to flush {:?} queue on drop: {e}", self.list_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ResourceDesc;
    use crate::headless::HeadlessDevice;
    use crate::state::{ResourceState, ALL_SUBRESOURCES};
    use crate::GpuConfig;

    fn queue(device: HeadlessDevice) -> CommandQueue<HeadlessDevice> {
        let session = Arc::new(GpuSession::new(Arc::new(device), GpuConfig::default()));
        CommandQueue::new(session, CommandListType::Direct).unwrap()
    }

    fn allocator_id(list: &CommandList<HeadlessDevice>) -> u64 {
        list.allocator().unwrap().id()
    }

    #[test]
    fn signal_is_strictly_increasing() {
        let queue = queue(HeadlessDevice::auto_retire());
        let a = queue.signal().unwrap();
        let b = queue.signal().unwrap();

        assert!(b > a);
        assert!(queue.is_fence_complete(b));
    }

    #[test]
    fn allocators_wait_for_their_fence() {
        let queue = queue(HeadlessDevice::new());
        let first = queue.get_command_list().unwrap();
        let first_allocator = allocator_id(&first);
        let fence = queue.execute_command_list(first).unwrap();

        let second = queue.get_command_list().unwrap();
        assert_ne!(allocator_id(&second), first_allocator);
        assert!(!queue.is_fence_complete(fence));
        drop(second);

        queue.session().device().retire_through(fence);
        let helper = queue.get_command_list().unwrap();
        let user = queue.get_command_list().unwrap();

        assert_eq!(allocator_id(&user), first_allocator);
        assert_eq!(helper.allocator().unwrap().resets(), 1);
        assert_eq!(user.allocator().unwrap().resets(), 1);
        queue.session().device().set_auto_retire(true);
    }

    #[test]
    fn retired_list_is_reused_and_cleared() {
        let queue = queue(HeadlessDevice::auto_retire());
        let mut list = queue.get_command_list().unwrap();
        let list_id = list.native().id();
        let resource = queue
            .session()
            .create_resource(&ResourceDesc::buffer(64), ResourceState::COMMON, None, "buffer")
            .unwrap();
        list.track_resource(&resource);
        queue.execute_command_list(list).unwrap();
        assert_eq!(queue.num_queued_command_lists(), 2);

        let _helper = queue.get_command_list().unwrap();
        let reused = queue.get_command_list().unwrap();
        assert_eq!(reused.native().id(), list_id);
        assert_eq!(reused.num_tracked_objects(), 0);
        assert!(!reused.native().is_closed());
        assert!(reused.native().commands().is_empty());
    }

    #[test]
    fn pending_barriers_run_in_helper_first() {
        let queue = queue(HeadlessDevice::auto_retire());
        let resource = queue
            .session()
            .create_resource(&ResourceDesc::buffer(64), ResourceState::COMMON, None, "buffer")
            .unwrap();

        let mut list = queue.get_command_list().unwrap();
        list.transition_barrier(&resource, ResourceState::UNORDERED_ACCESS, ALL_SUBRESOURCES, true);
        let list_id = list.native().id();
        queue.execute_command_list(list).unwrap();

        queue.with_native(|native| {
            let submissions = native.submissions();
            assert_eq!(submissions.len(), 2);
            assert_ne!(submissions[0].list_id, list_id);
            assert_eq!(submissions[1].list_id, list_id);
        });
        assert_eq!(
            queue.session().global_state(&resource, 0),
            Some(ResourceState::UNORDERED_ACCESS)
        );
    }

    #[test]
    fn helper_without_barriers_is_not_submitted() {
        let queue = queue(HeadlessDevice::auto_retire());
        let list = queue.get_command_list().unwrap();
        queue.execute_command_list(list).unwrap();

        queue.with_native(|native| assert_eq!(native.submissions().len(), 1));
    }

    #[test]
    fn wait_times_out_while_fence_is_pending() {
        let queue = queue(HeadlessDevice::new());
        let value = queue.signal().unwrap();

        assert!(!queue
            .wait_for_fence_value(value, Some(Duration::from_millis(1)))
            .unwrap());
        queue.session().device().set_auto_retire(true);
        assert!(queue.wait_for_fence_value(value, None).unwrap());
    }

    #[test]
    fn mismatched_list_type_is_rejected() {
        let session = Arc::new(GpuSession::new(
            Arc::new(HeadlessDevice::auto_retire()),
            GpuConfig::default(),
        ));
        let direct = CommandQueue::new(session.clone(), CommandListType::Direct).unwrap();
        let copy = CommandQueue::new(session, CommandListType::Copy).unwrap();

        let list = copy.get_command_list().unwrap();
        assert!(direct
            .execute_command_list(list)
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn concurrent_submissions_keep_reuse_queues_ordered() {
        let device = HeadlessDevice::new();
        let queue = queue(device);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let list = queue.get_command_list().unwrap();
                        queue.execute_command_list(list).unwrap();
                    }
                });
            }
        });

        let lists: Vec<u64> = queue.list_queue.lock().iter().map(|&(value, _)| value).collect();
        let allocators: Vec<u64> = queue
            .allocator_queue
            .lock()
            .iter()
            .map(|&(value, _)| value)
            .collect();
        assert_eq!(lists.len(), 200);
        assert!(lists.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(allocators.windows(2).all(|pair| pair[0] <= pair[1]));

        queue.session().device().set_auto_retire(true);
    }
}
