//! Timeline semaphore helpers.

use std::time::Duration;

use ash::vk;

use crate::error::{GpuError, Result};

/// Create a timeline semaphore holding `initial_value`.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    Ok(device.create_semaphore(&create_info, None)?)
}

/// Current counter value of a timeline semaphore.
///
/// # Safety
/// The device and semaphore must be valid.
pub unsafe fn timeline_value(device: &ash::Device, semaphore: vk::Semaphore) -> Result<u64> {
    match device.get_semaphore_counter_value(semaphore) {
        Ok(value) => Ok(value),
        Err(vk::Result::ERROR_DEVICE_LOST) => Err(GpuError::DeviceLost),
        Err(e) => Err(e.into()),
    }
}

/// Nanosecond timeout for `vkWaitSemaphores`; `None` waits forever.
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

/// Block until the semaphore reaches `value`.
///
/// Returns `Ok(false)` on timeout.
///
/// # Safety
/// The device and semaphore must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_timeline(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout: Option<Duration>,
) -> Result<bool> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);

    match device.wait_semaphores(&wait_info, timeout_ns(timeout)) {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(vk::Result::ERROR_DEVICE_LOST) => Err(GpuError::DeviceLost),
        Err(e) => Err(e.into()),
    }
}

/// Submission that only signals `semaphore` to `value`.
pub fn signal_info(semaphore: vk::Semaphore, value: u64) -> vk::SemaphoreSubmitInfo<'static> {
    vk::SemaphoreSubmitInfo::default()
        .semaphore(semaphore)
        .value(value)
        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
}
