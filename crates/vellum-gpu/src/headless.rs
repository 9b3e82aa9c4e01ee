//! In-memory device without a GPU.
//!
//! Command lists record what is recorded into them and queues remember what
//! was submitted, so callers can observe barrier counts and object reuse.
//! Fences only advance when the device retires submitted work: immediately
//! with [`HeadlessDevice::auto_retire`], otherwise when asked through
//! [`HeadlessDevice::retire_through`] or [`HeadlessDevice::retire_all`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::{
    ClearValue, CommandListType, CpuDescriptorHandle, DescriptorHeapType, GpuDevice,
    GpuVirtualAddress, ResourceBarrier, ResourceDesc, ViewDesc,
};
use crate::error::{GpuError, Result};
use crate::state::ResourceState;

/// Identity of a headless resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadlessResourceId(pub u64);

/// Stride between descriptor slots of every headless heap.
const DESCRIPTOR_INCREMENT: u32 = 32;

/// Device that keeps every object in host memory.
pub struct HeadlessDevice {
    next_id: AtomicU64,
    auto_retire: AtomicBool,
    fences: Mutex<Vec<Arc<FenceState>>>,
}

impl HeadlessDevice {
    /// Device whose fences only advance when work is retired explicitly.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            auto_retire: AtomicBool::new(false),
            fences: Mutex::new(Vec::new()),
        }
    }

    /// Device whose fences reach every signaled value immediately.
    pub fn auto_retire() -> Self {
        let device = Self::new();
        device.auto_retire.store(true, Ordering::Relaxed);
        device
    }

    /// Switch automatic retirement on or off.
    ///
    /// Switching it on also retires everything signaled so far.
    pub fn set_auto_retire(&self, enabled: bool) {
        self.auto_retire.store(enabled, Ordering::Release);
        if enabled {
            self.retire_all();
        }
    }

    /// Complete every signal up to `value` on every fence.
    pub fn retire_through(&self, value: u64) {
        for fence in self.fences.lock().iter() {
            fence.retire_through(value);
        }
    }

    /// Complete every signal issued so far.
    pub fn retire_all(&self) {
        self.retire_through(u64::MAX);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Headless resource.
#[derive(Debug)]
pub struct HeadlessResource {
    id: HeadlessResourceId,
    desc: ResourceDesc,
    initial_state: ResourceState,
    clear_value: Option<ClearValue>,
    name: Mutex<String>,
}

impl HeadlessResource {
    /// Description the resource was created with.
    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    /// State the resource was created in.
    pub fn initial_state(&self) -> ResourceState {
        self.initial_state
    }

    /// Clear value the resource was created with.
    pub fn clear_value(&self) -> Option<ClearValue> {
        self.clear_value
    }

    /// Current debug name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }
}

/// Headless descriptor heap remembering the view written into each slot.
pub struct HeadlessDescriptorHeap {
    base: CpuDescriptorHandle,
    heap_type: DescriptorHeapType,
    slots: Mutex<Vec<Option<ViewDesc<HeadlessResourceId>>>>,
}

impl HeadlessDescriptorHeap {
    /// View last written into a slot.
    pub fn view(&self, index: u32) -> Option<ViewDesc<HeadlessResourceId>> {
        self.slots.lock().get(index as usize).copied().flatten()
    }

    /// Heap type.
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }
}

/// Headless command allocator.
#[derive(Debug)]
pub struct HeadlessCommandAllocator {
    id: u64,
    list_type: CommandListType,
    resets: u32,
}

impl HeadlessCommandAllocator {
    /// Stable identity, unchanged by resets.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of times the allocator has been reset.
    pub fn resets(&self) -> u32 {
        self.resets
    }
}

/// A command recorded into a headless list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessCommand {
    Barriers(Vec<ResourceBarrier<HeadlessResourceId>>),
    CopyResource {
        dst: HeadlessResourceId,
        src: HeadlessResourceId,
    },
    CopyBufferRegion {
        dst: HeadlessResourceId,
        dst_offset: u64,
        src: HeadlessResourceId,
        src_offset: u64,
        size: u64,
    },
}

/// Headless command list.
#[derive(Debug)]
pub struct HeadlessCommandList {
    id: u64,
    list_type: CommandListType,
    allocator_id: u64,
    closed: bool,
    commands: Vec<HeadlessCommand>,
}

impl HeadlessCommandList {
    /// Stable identity, unchanged by resets.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Allocator the list currently records into.
    pub fn allocator_id(&self) -> u64 {
        self.allocator_id
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    /// Every barrier recorded since the last reset, in order.
    pub fn barriers(&self) -> Vec<ResourceBarrier<HeadlessResourceId>> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                HeadlessCommand::Barriers(batch) => Some(batch.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of native barrier calls (batches) recorded.
    pub fn barrier_calls(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, HeadlessCommand::Barriers(_)))
            .count()
    }

    fn record(&mut self, command: HeadlessCommand) {
        debug_assert!(!self.closed, "recording into a closed command list");
        self.commands.push(command);
    }
}

/// A list as it was when submitted.
#[derive(Debug, Clone)]
pub struct HeadlessSubmission {
    pub list_id: u64,
    pub commands: Vec<HeadlessCommand>,
}

/// Headless queue recording every submission.
#[derive(Debug)]
pub struct HeadlessQueue {
    list_type: CommandListType,
    submissions: Vec<HeadlessSubmission>,
}

impl HeadlessQueue {
    /// Queue type.
    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    /// Every list submitted so far, in submission order.
    pub fn submissions(&self) -> &[HeadlessSubmission] {
        &self.submissions
    }

    /// Every barrier submitted so far, in execution order.
    pub fn submitted_barriers(&self) -> Vec<ResourceBarrier<HeadlessResourceId>> {
        self.submissions
            .iter()
            .flat_map(|submission| submission.commands.iter())
            .filter_map(|command| match command {
                HeadlessCommand::Barriers(batch) => Some(batch.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[derive(Debug, Default)]
struct FenceValues {
    signaled: u64,
    completed: u64,
}

#[derive(Debug, Default)]
struct FenceState {
    values: Mutex<FenceValues>,
    retired: Condvar,
}

impl FenceState {
    fn retire_through(&self, value: u64) {
        let mut values = self.values.lock();
        let target = value.min(values.signaled);
        if target > values.completed {
            values.completed = target;
            self.retired.notify_all();
        }
    }
}

/// Headless fence.
#[derive(Debug, Clone)]
pub struct HeadlessFence {
    state: Arc<FenceState>,
}

impl HeadlessFence {
    /// Highest value signaled on the fence, retired or not.
    pub fn signaled_value(&self) -> u64 {
        self.state.values.lock().signaled
    }
}

/// Headless upload heap backed by host memory.
pub struct HeadlessUploadHeap {
    id: HeadlessResourceId,
    ptr: NonNull<u64>,
    words: usize,
    size: u64,
}

// SAFETY: the heap exclusively owns its allocation; the pointer is only
// handed out as the mapped address, like a driver-mapped buffer.
unsafe impl Send for HeadlessUploadHeap {}
unsafe impl Sync for HeadlessUploadHeap {}

impl HeadlessUploadHeap {
    fn new(id: HeadlessResourceId, size: u64) -> Self {
        let words = usize::try_from(size.div_ceil(8)).unwrap_or(usize::MAX).max(1);
        let storage = vec![0u64; words].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(storage)).cast::<u64>();
        Self {
            id,
            ptr,
            words,
            size,
        }
    }

    /// Copy `len` bytes starting at `offset` out of the heap.
    ///
    /// Returns `None` when the range is out of bounds.
    pub fn read(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len as u64)?;
        if end > self.size {
            return None;
        }
        let mut bytes = vec![0u8; len];
        // SAFETY: the range was checked against the allocation above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.cast::<u8>().as_ptr().add(offset as usize),
                bytes.as_mut_ptr(),
                len,
            );
        }
        Some(bytes)
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for HeadlessUploadHeap {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `words` describe the slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

fn synthetic_address(id: u64) -> GpuVirtualAddress {
    id << 32
}

impl GpuDevice for HeadlessDevice {
    type RawResource = HeadlessResourceId;
    type Resource = HeadlessResource;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type UploadHeap = HeadlessUploadHeap;

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<&ClearValue>,
        name: &str,
    ) -> Result<HeadlessResource> {
        if desc.buffer_size() == Some(0) {
            return Err(GpuError::InvalidArgument(
                "buffer size must be non-zero".to_string(),
            ));
        }
        Ok(HeadlessResource {
            id: HeadlessResourceId(self.next_id()),
            desc: *desc,
            initial_state,
            clear_value: clear_value.copied(),
            name: Mutex::new(name.to_string()),
        })
    }

    fn raw_resource(&self, resource: &HeadlessResource) -> HeadlessResourceId {
        resource.id
    }

    fn resource_gpu_address(&self, resource: &HeadlessResource) -> GpuVirtualAddress {
        match resource.desc.buffer_size() {
            Some(_) => synthetic_address(resource.id.0),
            None => 0,
        }
    }

    fn set_resource_name(&self, resource: &HeadlessResource, name: &str) {
        *resource.name.lock() = name.to_string();
    }

    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<HeadlessDescriptorHeap> {
        Ok(HeadlessDescriptorHeap {
            base: CpuDescriptorHandle(synthetic_address(self.next_id())),
            heap_type,
            slots: Mutex::new(vec![None; num_descriptors as usize]),
        })
    }

    fn descriptor_heap_start(&self, heap: &HeadlessDescriptorHeap) -> CpuDescriptorHandle {
        heap.base
    }

    fn descriptor_increment(&self, _heap_type: DescriptorHeapType) -> u32 {
        DESCRIPTOR_INCREMENT
    }

    fn write_descriptor(
        &self,
        heap: &HeadlessDescriptorHeap,
        index: u32,
        view: &ViewDesc<HeadlessResourceId>,
    ) -> Result<()> {
        let mut slots = heap.slots.lock();
        let slot = slots.get_mut(index as usize).ok_or_else(|| {
            GpuError::InvalidArgument(format!("descriptor index {index} out of range"))
        })?;
        *slot = Some(*view);
        Ok(())
    }

    fn create_queue(&self, list_type: CommandListType) -> Result<HeadlessQueue> {
        Ok(HeadlessQueue {
            list_type,
            submissions: Vec::new(),
        })
    }

    fn create_command_allocator(
        &self,
        list_type: CommandListType,
    ) -> Result<HeadlessCommandAllocator> {
        Ok(HeadlessCommandAllocator {
            id: self.next_id(),
            list_type,
            resets: 0,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut HeadlessCommandAllocator) -> Result<()> {
        allocator.resets += 1;
        Ok(())
    }

    fn create_command_list(
        &self,
        list_type: CommandListType,
        allocator: &HeadlessCommandAllocator,
    ) -> Result<HeadlessCommandList> {
        if allocator.list_type != list_type {
            return Err(GpuError::InvalidArgument(format!(
                "{list_type:?} list cannot record into a {:?} allocator",
                allocator.list_type
            )));
        }
        Ok(HeadlessCommandList {
            id: self.next_id(),
            list_type,
            allocator_id: allocator.id,
            closed: false,
            commands: Vec::new(),
        })
    }

    fn reset_command_list(
        &self,
        list: &mut HeadlessCommandList,
        allocator: &HeadlessCommandAllocator,
    ) -> Result<()> {
        if allocator.list_type != list.list_type {
            return Err(GpuError::InvalidArgument(
                "command list and allocator types differ".to_string(),
            ));
        }
        list.allocator_id = allocator.id;
        list.closed = false;
        list.commands.clear();
        Ok(())
    }

    fn close_command_list(&self, list: &mut HeadlessCommandList) -> Result<()> {
        if list.closed {
            return Err(GpuError::InvalidState(
                "command list already closed".to_string(),
            ));
        }
        list.closed = true;
        Ok(())
    }

    fn cmd_resource_barriers(
        &self,
        list: &mut HeadlessCommandList,
        barriers: &[ResourceBarrier<HeadlessResourceId>],
    ) {
        list.record(HeadlessCommand::Barriers(barriers.to_vec()));
    }

    fn cmd_copy_resource(
        &self,
        list: &mut HeadlessCommandList,
        dst: HeadlessResourceId,
        src: HeadlessResourceId,
    ) {
        list.record(HeadlessCommand::CopyResource { dst, src });
    }

    fn cmd_copy_buffer_region(
        &self,
        list: &mut HeadlessCommandList,
        dst: HeadlessResourceId,
        dst_offset: u64,
        src: HeadlessResourceId,
        src_offset: u64,
        size: u64,
    ) {
        list.record(HeadlessCommand::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        });
    }

    fn execute_command_lists(
        &self,
        queue: &mut HeadlessQueue,
        lists: &[&HeadlessCommandList],
    ) -> Result<()> {
        for list in lists {
            if !list.closed {
                return Err(GpuError::InvalidState(
                    "submitted command list is still open".to_string(),
                ));
            }
            queue.submissions.push(HeadlessSubmission {
                list_id: list.id,
                commands: list.commands.clone(),
            });
        }
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<HeadlessFence> {
        let state = Arc::new(FenceState {
            values: Mutex::new(FenceValues {
                signaled: initial_value,
                completed: initial_value,
            }),
            retired: Condvar::new(),
        });
        self.fences.lock().push(state.clone());
        Ok(HeadlessFence { state })
    }

    fn signal_fence(&self, _queue: &mut HeadlessQueue, fence: &HeadlessFence, value: u64) -> Result<()> {
        {
            let mut values = fence.state.values.lock();
            values.signaled = values.signaled.max(value);
        }
        if self.auto_retire.load(Ordering::Acquire) {
            fence.state.retire_through(value);
        }
        Ok(())
    }

    fn fence_completed_value(&self, fence: &HeadlessFence) -> Result<u64> {
        Ok(fence.state.values.lock().completed)
    }

    fn wait_for_fence(
        &self,
        fence: &HeadlessFence,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut values = fence.state.values.lock();
        while values.completed < value {
            match deadline {
                Some(deadline) => {
                    if fence
                        .state
                        .retired
                        .wait_until(&mut values, deadline)
                        .timed_out()
                    {
                        return Ok(values.completed >= value);
                    }
                }
                None => fence.state.retired.wait(&mut values),
            }
        }
        Ok(true)
    }

    fn create_upload_heap(&self, size: u64) -> Result<HeadlessUploadHeap> {
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "upload heap size must be non-zero".to_string(),
            ));
        }
        Ok(HeadlessUploadHeap::new(
            HeadlessResourceId(self.next_id()),
            size,
        ))
    }

    fn upload_heap_cpu_ptr(&self, heap: &HeadlessUploadHeap) -> NonNull<u8> {
        heap.ptr.cast()
    }

    fn upload_heap_gpu_address(&self, heap: &HeadlessUploadHeap) -> GpuVirtualAddress {
        synthetic_address(heap.id.0)
    }

    fn upload_heap_raw(&self, heap: &HeadlessUploadHeap) -> HeadlessResourceId {
        heap.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_waits_for_retirement() {
        let device = HeadlessDevice::new();
        let mut queue = device.create_queue(CommandListType::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();

        device.signal_fence(&mut queue, &fence, 1).unwrap();
        assert_eq!(device.fence_completed_value(&fence).unwrap(), 0);
        assert!(!device
            .wait_for_fence(&fence, 1, Some(Duration::from_millis(1)))
            .unwrap());

        device.retire_through(1);
        assert!(device.wait_for_fence(&fence, 1, None).unwrap());
    }

    #[test]
    fn retire_never_passes_signaled_value() {
        let device = HeadlessDevice::new();
        let mut queue = device.create_queue(CommandListType::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();

        device.signal_fence(&mut queue, &fence, 2).unwrap();
        device.retire_all();
        assert_eq!(device.fence_completed_value(&fence).unwrap(), 2);
        assert_eq!(fence.signaled_value(), 2);
    }

    #[test]
    fn wait_wakes_from_other_thread() {
        let device = Arc::new(HeadlessDevice::new());
        let mut queue = device.create_queue(CommandListType::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();
        device.signal_fence(&mut queue, &fence, 1).unwrap();

        let retirer = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                device.retire_all();
            })
        };

        assert!(device.wait_for_fence(&fence, 1, None).unwrap());
        retirer.join().unwrap();
    }

    #[test]
    fn upload_heap_round_trips_bytes() {
        let device = HeadlessDevice::new();
        let heap = device.create_upload_heap(16).unwrap();
        let ptr = device.upload_heap_cpu_ptr(&heap);
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3].as_ptr(), ptr.as_ptr().add(4), 3) };

        assert_eq!(heap.read(4, 3).unwrap(), vec![1, 2, 3]);
        assert!(heap.read(15, 2).is_none());
    }

    #[test]
    fn closed_list_rejects_second_close() {
        let device = HeadlessDevice::new();
        let allocator = device
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let mut list = device
            .create_command_list(CommandListType::Direct, &allocator)
            .unwrap();

        device.close_command_list(&mut list).unwrap();
        assert!(device.close_command_list(&mut list).is_err());
    }
}
