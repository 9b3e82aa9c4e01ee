//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory or descriptor heap allocation failed.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Request rejected before touching any state.
    ///
    /// Retrying the same request will fail again; split it or take another path.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device was lost or removed.
    #[error("Device lost")]
    DeviceLost,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Returns `true` for errors caused by the request itself rather than the device.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
