//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::device::DescriptorHeapType;

/// Tunables for a [`GpuSession`](crate::GpuSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Descriptors per page, indexed by [`DescriptorHeapType::index`].
    pub descriptors_per_heap: [u32; DescriptorHeapType::COUNT],
    /// Size in bytes of every upload buffer page.
    pub upload_page_size: u64,
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            descriptors_per_heap: [256; DescriptorHeapType::COUNT],
            upload_page_size: 2 * 1024 * 1024,
            frames_in_flight: 3,
        }
    }
}

impl GpuConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size for one descriptor heap type.
    pub fn with_descriptors_per_heap(mut self, heap_type: DescriptorHeapType, count: u32) -> Self {
        self.descriptors_per_heap[heap_type.index()] = count;
        self
    }

    /// Set the upload page size in bytes.
    pub fn with_upload_page_size(mut self, size: u64) -> Self {
        self.upload_page_size = size;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Page size for a descriptor heap type.
    pub fn descriptors_for(&self, heap_type: DescriptorHeapType) -> u32 {
        self.descriptors_per_heap[heap_type.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_single_heap() {
        let config = GpuConfig::new().with_descriptors_per_heap(DescriptorHeapType::Sampler, 16);

        assert_eq!(config.descriptors_for(DescriptorHeapType::Sampler), 16);
        assert_eq!(config.descriptors_for(DescriptorHeapType::CbvSrvUav), 256);
    }

    #[test]
    fn frames_in_flight_never_zero() {
        assert_eq!(GpuConfig::new().with_frames_in_flight(0).frames_in_flight, 1);
    }

    #[test]
    fn serialized_config_keeps_overrides() {
        let config = GpuConfig::new()
            .with_upload_page_size(64 * 1024)
            .with_descriptors_per_heap(DescriptorHeapType::Dsv, 4);

        let bytes = bincode::serialize(&config).unwrap();
        let decoded: GpuConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}
