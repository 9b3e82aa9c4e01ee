//! Owned runs of descriptor slots.

use std::fmt;
use std::sync::Arc;

use crate::descriptors::page::DescriptorAllocatorPage;
use crate::device::{CpuDescriptorHandle, DescriptorHeapType, GpuDevice, ViewDesc};
use crate::error::{GpuError, Result};

/// A contiguous run of descriptors inside one page.
///
/// Dropping the allocation returns the run to its page tagged with the
/// current frame; the page only reuses it once that frame has retired. The
/// allocation keeps its page alive.
pub struct DescriptorAllocation<D: GpuDevice> {
    handle: CpuDescriptorHandle,
    offset: u32,
    num_handles: u32,
    increment: u32,
    page: Option<Arc<DescriptorAllocatorPage<D>>>,
}

impl<D: GpuDevice> DescriptorAllocation<D> {
    pub(crate) fn new(
        page: Arc<DescriptorAllocatorPage<D>>,
        handle: CpuDescriptorHandle,
        offset: u32,
        num_handles: u32,
        increment: u32,
    ) -> Self {
        Self {
            handle,
            offset,
            num_handles,
            increment,
            page: Some(page),
        }
    }

    /// An allocation that owns nothing.
    pub fn null() -> Self {
        Self {
            handle: CpuDescriptorHandle::NULL,
            offset: 0,
            num_handles: 0,
            increment: 0,
            page: None,
        }
    }

    /// Returns `true` if the allocation owns no descriptors.
    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }

    /// Handle of the descriptor at `offset` within the run.
    pub fn descriptor_handle(&self, offset: u32) -> CpuDescriptorHandle {
        debug_assert!(
            offset < self.num_handles,
            "descriptor offset {offset} out of range for {} handles",
            self.num_handles
        );
        self.handle.offset(offset, self.increment)
    }

    /// Number of descriptors in the run.
    pub fn num_handles(&self) -> u32 {
        self.num_handles
    }

    /// Slot index of the first descriptor within its heap.
    pub fn heap_offset(&self) -> u32 {
        self.offset
    }

    /// Heap type of the owning page, `None` for a null allocation.
    pub fn heap_type(&self) -> Option<DescriptorHeapType> {
        self.page.as_ref().map(|page| page.heap_type())
    }

    /// Page the run was carved from.
    pub fn page(&self) -> Option<&Arc<DescriptorAllocatorPage<D>>> {
        self.page.as_ref()
    }

    /// Write a view into the descriptor at `offset` within the run.
    pub fn write_view(&self, offset: u32, view: &ViewDesc<D::RawResource>) -> Result<()> {
        let page = self.page.as_ref().ok_or_else(|| {
            GpuError::InvalidState("cannot write a view into a null allocation".to_string())
        })?;
        if offset >= self.num_handles {
            return Err(GpuError::InvalidArgument(format!(
                "descriptor offset {offset} out of range for {} handles",
                self.num_handles
            )));
        }
        page.write_descriptor(self.offset + offset, view)
    }

    /// Return the run to its page, reusable once `frame_number` has retired.
    pub fn free(mut self, frame_number: u64) {
        self.release(frame_number);
    }

    fn release(&mut self, frame_number: u64) {
        if let Some(page) = self.page.take() {
            page.free(self.offset, self.num_handles, frame_number);
            self.handle = CpuDescriptorHandle::NULL;
            self.num_handles = 0;
        }
    }
}

impl<D: GpuDevice> Default for DescriptorAllocation<D> {
    fn default() -> Self {
        Self::null()
    }
}

impl<D: GpuDevice> Drop for DescriptorAllocation<D> {
    fn drop(&mut self) {
        if let Some(frame) = self.page.as_ref().map(|page| page.frame_clock().current()) {
            self.release(frame);
        }
    }
}

impl<D: GpuDevice> fmt::Debug for DescriptorAllocation<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorAllocation")
            .field("handle", &self.handle)
            .field("offset", &self.offset)
            .field("num_handles", &self.num_handles)
            .finish()
    }
}
