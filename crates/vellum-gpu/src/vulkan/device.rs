//! [`GpuDevice`] implementation on top of Vulkan 1.3.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::{
    ClearValue, CommandListType, CpuDescriptorHandle, DescriptorHeapType, GpuDevice,
    GpuVirtualAddress, ResourceBarrier, ResourceDesc, ResourceDimension, ViewDesc,
};
use crate::error::{GpuError, Result};
use crate::state::{ResourceState, ALL_SUBRESOURCES};
use crate::vulkan::barrier::{state_access, subresource_range, BarrierBatch};
use crate::vulkan::command::{
    begin_command_buffer, end_command_buffer, execute_single_time_commands, CommandPool,
};
use crate::vulkan::context::VulkanContext;
use crate::vulkan::descriptor::{DescriptorRecord, VulkanDescriptorHeap, DESCRIPTOR_STRIDE};
use crate::vulkan::memory::VulkanBuffer;
use crate::vulkan::resource::VulkanResource;
use crate::vulkan::sync::{create_timeline_semaphore, signal_info, timeline_value, wait_for_timeline};
use crate::vulkan::VulkanResourceId;

/// Usage of upload heap buffers.
const UPLOAD_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// Vulkan device driving the core.
///
/// Created through [`VulkanDeviceBuilder`](crate::vulkan::VulkanDeviceBuilder).
pub struct VulkanDevice {
    context: Arc<VulkanContext>,
    /// Records the initial layout transitions of new images.
    setup_pool: Mutex<CommandPool>,
}

impl VulkanDevice {
    pub(crate) fn new(context: Arc<VulkanContext>) -> Result<Self> {
        let family = context.queue_family(CommandListType::Direct);
        let setup_pool = unsafe {
            CommandPool::new(
                Arc::clone(&context),
                family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };
        Ok(Self {
            context,
            setup_pool: Mutex::new(setup_pool),
        })
    }

    /// Shared Vulkan objects.
    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.context
    }

    fn buffer_address(&self, buffer: vk::Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.context.device.get_buffer_device_address(&info) }
    }

    /// Move a new image from `UNDEFINED` into the layout of its initial state.
    fn initialize_layout(&self, id: VulkanResourceId, state: ResourceState) -> Result<()> {
        let VulkanResourceId::Image {
            image,
            aspect,
            mip_levels,
            array_layers,
            ..
        } = id
        else {
            return Ok(());
        };

        let dst = state_access(state);
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(dst.stages)
            .dst_access_mask(dst.access)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(dst.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range(
                aspect,
                mip_levels,
                array_layers,
                ALL_SUBRESOURCES,
            ));
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);

        let pool = self.setup_pool.lock();
        let slot = self.context.queue_slot(CommandListType::Direct);
        unsafe {
            execute_single_time_commands(&self.context, &pool, slot, |cmd| {
                self.context.device.cmd_pipeline_barrier2(cmd, &dependency);
            })
        }
    }
}

/// Command pool backing Vulkan command lists.
pub struct VulkanCommandAllocator {
    pool: Arc<CommandPool>,
    list_type: CommandListType,
}

impl VulkanCommandAllocator {
    /// Type of lists recorded from this allocator.
    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    /// Number of command buffers the pool has allocated.
    pub fn num_command_buffers(&self) -> usize {
        self.pool.num_allocated()
    }
}

/// A primary command buffer and the pool it was taken from.
pub struct VulkanCommandList {
    /// Keeps the pool owning `buffer` alive.
    pool: Arc<CommandPool>,
    buffer: vk::CommandBuffer,
    list_type: CommandListType,
    recording: bool,
}

impl VulkanCommandList {
    /// Native command buffer, for recording commands the core does not wrap.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Type of the list.
    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    /// Returns `true` while the list is open for recording.
    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

/// Submission target of a command queue.
pub struct VulkanQueue {
    slot: usize,
    list_type: CommandListType,
}

impl VulkanQueue {
    /// Type of lists the queue executes.
    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }
}

/// Fence backed by a timeline semaphore.
pub struct VulkanFence {
    context: Arc<VulkanContext>,
    semaphore: vk::Semaphore,
}

impl VulkanFence {
    /// Native semaphore, for cross-queue waits.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Persistently mapped host buffer with a device address.
pub struct VulkanUploadHeap {
    context: Arc<VulkanContext>,
    buffer: VulkanBuffer,
    ptr: NonNull<u8>,
}

// SAFETY: `ptr` points into the mapped allocation owned by `buffer`, which
// lives as long as the heap. Disjoint ranges are handed to disjoint writers.
unsafe impl Send for VulkanUploadHeap {}
unsafe impl Sync for VulkanUploadHeap {}

impl Drop for VulkanUploadHeap {
    fn drop(&mut self) {
        self.context.allocator.lock().free_buffer(&mut self.buffer);
    }
}

impl GpuDevice for VulkanDevice {
    type RawResource = VulkanResourceId;
    type Resource = VulkanResource;
    type DescriptorHeap = VulkanDescriptorHeap;
    type CommandAllocator = VulkanCommandAllocator;
    type CommandList = VulkanCommandList;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
    type UploadHeap = VulkanUploadHeap;

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<&ClearValue>,
        name: &str,
    ) -> Result<VulkanResource> {
        let resource = VulkanResource::new(Arc::clone(&self.context), desc, name)?;
        if matches!(desc.dimension, ResourceDimension::Texture2D { .. }) {
            self.initialize_layout(resource.id(), initial_state)?;
        }
        if clear_value.is_some() {
            tracing::trace!("'{name}': clear values are supplied when rendering begins");
        }
        Ok(resource)
    }

    fn raw_resource(&self, resource: &VulkanResource) -> VulkanResourceId {
        resource.id()
    }

    fn resource_gpu_address(&self, resource: &VulkanResource) -> GpuVirtualAddress {
        resource.address()
    }

    fn set_resource_name(&self, resource: &VulkanResource, name: &str) {
        resource.set_name(name);
    }

    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<VulkanDescriptorHeap> {
        VulkanDescriptorHeap::new(Arc::clone(&self.context), heap_type, num_descriptors)
    }

    fn descriptor_heap_start(&self, heap: &VulkanDescriptorHeap) -> CpuDescriptorHandle {
        CpuDescriptorHandle(heap.cpu_base().as_ptr() as u64)
    }

    fn descriptor_increment(&self, _heap_type: DescriptorHeapType) -> u32 {
        DESCRIPTOR_STRIDE
    }

    fn write_descriptor(
        &self,
        heap: &VulkanDescriptorHeap,
        index: u32,
        view: &ViewDesc<VulkanResourceId>,
    ) -> Result<()> {
        let record = DescriptorRecord::encode(view, |buffer| self.buffer_address(buffer))?;
        heap.write(index, &record)
    }

    fn create_queue(&self, list_type: CommandListType) -> Result<VulkanQueue> {
        Ok(VulkanQueue {
            slot: self.context.queue_slot(list_type),
            list_type,
        })
    }

    fn create_command_allocator(&self, list_type: CommandListType) -> Result<VulkanCommandAllocator> {
        let pool = unsafe {
            CommandPool::new(
                Arc::clone(&self.context),
                self.context.queue_family(list_type),
                vk::CommandPoolCreateFlags::empty(),
            )?
        };
        Ok(VulkanCommandAllocator {
            pool: Arc::new(pool),
            list_type,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut VulkanCommandAllocator) -> Result<()> {
        unsafe { allocator.pool.reset() }
    }

    fn create_command_list(
        &self,
        list_type: CommandListType,
        allocator: &VulkanCommandAllocator,
    ) -> Result<VulkanCommandList> {
        let buffer = allocator.pool.acquire_command_buffer()?;
        unsafe {
            begin_command_buffer(
                &self.context.device,
                buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }
        Ok(VulkanCommandList {
            pool: Arc::clone(&allocator.pool),
            buffer,
            list_type,
            recording: true,
        })
    }

    fn reset_command_list(
        &self,
        list: &mut VulkanCommandList,
        allocator: &VulkanCommandAllocator,
    ) -> Result<()> {
        if list.recording {
            return Err(GpuError::InvalidState(
                "command list reset while still recording".to_string(),
            ));
        }
        let buffer = allocator.pool.acquire_command_buffer()?;
        unsafe {
            begin_command_buffer(
                &self.context.device,
                buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }
        list.pool = Arc::clone(&allocator.pool);
        list.buffer = buffer;
        list.recording = true;
        Ok(())
    }

    fn close_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        if !list.recording {
            return Err(GpuError::InvalidState("command list already closed".to_string()));
        }
        unsafe { end_command_buffer(&self.context.device, list.buffer)? };
        list.recording = false;
        Ok(())
    }

    fn cmd_resource_barriers(
        &self,
        list: &mut VulkanCommandList,
        barriers: &[ResourceBarrier<VulkanResourceId>],
    ) {
        let batch = BarrierBatch::new(barriers);
        unsafe { batch.record(&self.context.device, list.buffer) };
    }

    fn cmd_copy_resource(
        &self,
        list: &mut VulkanCommandList,
        dst: VulkanResourceId,
        src: VulkanResourceId,
    ) {
        let device = &self.context.device;
        match (dst, src) {
            (
                VulkanResourceId::Buffer {
                    buffer: dst,
                    size: dst_size,
                },
                VulkanResourceId::Buffer {
                    buffer: src,
                    size: src_size,
                },
            ) => {
                let region = vk::BufferCopy::default().size(dst_size.min(src_size));
                unsafe { device.cmd_copy_buffer(list.buffer, src, dst, &[region]) };
            }
            (
                VulkanResourceId::Image {
                    image: dst,
                    aspect,
                    mip_levels,
                    array_layers,
                    width,
                    height,
                },
                VulkanResourceId::Image { image: src, .. },
            ) => {
                let regions: Vec<vk::ImageCopy> = (0..mip_levels)
                    .map(|mip| {
                        let layers = vk::ImageSubresourceLayers::default()
                            .aspect_mask(aspect)
                            .mip_level(mip)
                            .base_array_layer(0)
                            .layer_count(array_layers);
                        vk::ImageCopy::default()
                            .src_subresource(layers)
                            .dst_subresource(layers)
                            .extent(vk::Extent3D {
                                width: (width >> mip).max(1),
                                height: (height >> mip).max(1),
                                depth: 1,
                            })
                    })
                    .collect();
                unsafe {
                    device.cmd_copy_image(
                        list.buffer,
                        src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    );
                }
            }
            _ => tracing::error!("copy between a buffer and an image skipped: {dst:?} <- {src:?}"),
        }
    }

    fn cmd_copy_buffer_region(
        &self,
        list: &mut VulkanCommandList,
        dst: VulkanResourceId,
        dst_offset: u64,
        src: VulkanResourceId,
        src_offset: u64,
        size: u64,
    ) {
        let (
            VulkanResourceId::Buffer { buffer: dst, .. },
            VulkanResourceId::Buffer { buffer: src, .. },
        ) = (dst, src)
        else {
            tracing::error!("buffer region copy on an image skipped: {dst:?} <- {src:?}");
            return;
        };
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.context
                .device
                .cmd_copy_buffer(list.buffer, src, dst, &[region]);
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn execute_command_lists(
        &self,
        queue: &mut VulkanQueue,
        lists: &[&VulkanCommandList],
    ) -> Result<()> {
        if let Some(open) = lists.iter().find(|list| list.recording) {
            return Err(GpuError::InvalidState(format!(
                "command buffer {:?} submitted while recording",
                open.buffer
            )));
        }
        let cmd_infos: Vec<vk::CommandBufferSubmitInfo> = lists
            .iter()
            .map(|list| vk::CommandBufferSubmitInfo::default().command_buffer(list.buffer))
            .collect();
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        unsafe {
            self.context
                .submit(queue.slot, std::slice::from_ref(&submit), vk::Fence::null())
        }
    }

    fn create_fence(&self, initial_value: u64) -> Result<VulkanFence> {
        let semaphore = unsafe { create_timeline_semaphore(&self.context.device, initial_value)? };
        Ok(VulkanFence {
            context: Arc::clone(&self.context),
            semaphore,
        })
    }

    fn signal_fence(&self, queue: &mut VulkanQueue, fence: &VulkanFence, value: u64) -> Result<()> {
        let signals = [signal_info(fence.semaphore, value)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signals);
        unsafe {
            self.context
                .submit(queue.slot, std::slice::from_ref(&submit), vk::Fence::null())
        }
    }

    fn fence_completed_value(&self, fence: &VulkanFence) -> Result<u64> {
        unsafe { timeline_value(&self.context.device, fence.semaphore) }
    }

    fn wait_for_fence(
        &self,
        fence: &VulkanFence,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        unsafe { wait_for_timeline(&self.context.device, fence.semaphore, value, timeout) }
    }

    fn create_upload_heap(&self, size: u64) -> Result<VulkanUploadHeap> {
        let mut buffer = self.context.allocator.lock().create_buffer(
            size,
            UPLOAD_USAGE,
            MemoryLocation::CpuToGpu,
            "upload heap",
        )?;
        let Some(ptr) = buffer.mapped_ptr() else {
            self.context.allocator.lock().free_buffer(&mut buffer);
            return Err(GpuError::InvalidState(
                "upload heap memory is not host visible".to_string(),
            ));
        };
        Ok(VulkanUploadHeap {
            context: Arc::clone(&self.context),
            buffer,
            ptr,
        })
    }

    fn upload_heap_cpu_ptr(&self, heap: &VulkanUploadHeap) -> NonNull<u8> {
        heap.ptr
    }

    fn upload_heap_gpu_address(&self, heap: &VulkanUploadHeap) -> GpuVirtualAddress {
        heap.buffer.address
    }

    fn upload_heap_raw(&self, heap: &VulkanUploadHeap) -> VulkanResourceId {
        VulkanResourceId::Buffer {
            buffer: heap.buffer.buffer,
            size: heap.buffer.size,
        }
    }
}
