//! Command pool and command buffer management.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::Result;
use crate::vulkan::context::VulkanContext;

/// Command pool that owns and recycles its command buffers.
///
/// Buffers handed out by [`acquire_command_buffer`](Self::acquire_command_buffer)
/// stay allocated until the pool is destroyed; [`reset`](Self::reset) makes
/// all of them available again.
pub struct CommandPool {
    context: Arc<VulkanContext>,
    pool: vk::CommandPool,
    queue_family: u32,
    buffers: Mutex<PoolBuffers>,
}

#[derive(Default)]
struct PoolBuffers {
    allocated: Vec<vk::CommandBuffer>,
    next: usize,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The queue family must exist on the context's device.
    pub unsafe fn new(
        context: Arc<VulkanContext>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = context.device.create_command_pool(&create_info, None)?;

        Ok(Self {
            context,
            pool,
            queue_family,
            buffers: Mutex::new(PoolBuffers::default()),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Number of command buffers allocated from the pool so far.
    pub fn num_allocated(&self) -> usize {
        self.buffers.lock().allocated.len()
    }

    /// Next unused primary command buffer, allocating one if all are in use.
    pub fn acquire_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let mut buffers = self.buffers.lock();
        if let Some(&cmd) = buffers.allocated.get(buffers.next) {
            buffers.next += 1;
            return Ok(cmd);
        }

        let cmd = unsafe { self.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)? };
        buffers.allocated.push(cmd);
        buffers.next = buffers.allocated.len();
        Ok(cmd)
    }

    /// Allocate a single command buffer outside the recycling list.
    ///
    /// # Safety
    /// Access to the pool must be externally synchronized.
    pub unsafe fn allocate_command_buffer(
        &self,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = self.context.device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers[0])
    }

    /// Reset the pool and every command buffer allocated from it.
    ///
    /// # Safety
    /// None of the pool's command buffers may be pending execution.
    pub unsafe fn reset(&self) -> Result<()> {
        let mut buffers = self.buffers.lock();
        self.context
            .device
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        buffers.next = 0;
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Record with `f`, submit to the queue at `slot` and wait for completion.
///
/// # Safety
/// The pool must belong to the queue's family and must not be used by any
/// other thread meanwhile.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn execute_single_time_commands<F>(
    context: &VulkanContext,
    pool: &CommandPool,
    slot: usize,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let device = &context.device;
    let cmd = pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

    let result = (|| {
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        f(cmd);
        end_command_buffer(device, cmd)?;

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        context.submit_and_wait(slot, std::slice::from_ref(&submit))
    })();

    device.free_command_buffers(pool.handle(), &[cmd]);
    result
}
