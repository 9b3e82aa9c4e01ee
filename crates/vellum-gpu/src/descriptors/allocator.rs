//! Growable pool of descriptor pages of one heap type.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptors::allocation::DescriptorAllocation;
use crate::descriptors::page::DescriptorAllocatorPage;
use crate::device::{DescriptorHeapType, GpuDevice};
use crate::error::{GpuError, Result};
use crate::frame::FrameClock;

struct PagePool<D: GpuDevice> {
    pages: Vec<Arc<DescriptorAllocatorPage<D>>>,
    /// Indices of pages that may still have free handles.
    available: BTreeSet<usize>,
}

/// Routes descriptor requests to pages, creating pages on demand.
pub struct DescriptorAllocator<D: GpuDevice> {
    device: Arc<D>,
    heap_type: DescriptorHeapType,
    descriptors_per_heap: u32,
    frame_clock: Arc<FrameClock>,
    pool: Mutex<PagePool<D>>,
}

impl<D: GpuDevice> DescriptorAllocator<D> {
    /// Create an empty allocator; pages are created on first use.
    pub fn new(
        device: Arc<D>,
        heap_type: DescriptorHeapType,
        descriptors_per_heap: u32,
        frame_clock: Arc<FrameClock>,
    ) -> Self {
        Self {
            device,
            heap_type,
            descriptors_per_heap,
            frame_clock,
            pool: Mutex::new(PagePool {
                pages: Vec::new(),
                available: BTreeSet::new(),
            }),
        }
    }

    /// Heap type served by this allocator.
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// Number of pages created so far.
    pub fn num_pages(&self) -> usize {
        self.pool.lock().pages.len()
    }

    /// Allocate `num_descriptors` contiguous descriptors.
    ///
    /// Grows the pool when no existing page can satisfy the request; only
    /// fails if creating a new heap fails.
    pub fn allocate(&self, num_descriptors: u32) -> Result<DescriptorAllocation<D>> {
        if num_descriptors == 0 {
            return Err(GpuError::InvalidArgument(
                "cannot allocate zero descriptors".to_string(),
            ));
        }

        let mut pool = self.pool.lock();
        let PagePool { pages, available } = &mut *pool;

        let candidates: Vec<usize> = available.iter().copied().collect();
        for index in candidates {
            let page = &pages[index];
            let allocation = page.allocate(num_descriptors);
            if page.num_free_handles() == 0 {
                available.remove(&index);
            }
            if let Some(allocation) = allocation {
                return Ok(allocation);
            }
        }

        let page_size = self.descriptors_per_heap.max(num_descriptors);
        let page = Arc::new(
            DescriptorAllocatorPage::new(
                self.device.clone(),
                self.heap_type,
                page_size,
                self.frame_clock.clone(),
            )
            .inspect_err(|e| {
                tracing::error!("Failed to create {:?} descriptor heap: {e}", self.heap_type)
            })?,
        );
        tracing::debug!(
            "Created {:?} descriptor page #{} with {} descriptors",
            self.heap_type,
            pages.len(),
            page_size
        );

        let allocation = page.allocate(num_descriptors).ok_or_else(|| {
            GpuError::InvalidState("fresh descriptor page could not satisfy request".to_string())
        })?;
        let index = pages.len();
        pages.push(page);
        available.insert(index);

        Ok(allocation)
    }

    /// Release descriptors freed at or before `frame_number` on every page.
    pub fn release_stale_descriptors(&self, frame_number: u64) {
        let mut pool = self.pool.lock();
        let PagePool { pages, available } = &mut *pool;

        for (index, page) in pages.iter().enumerate() {
            page.release_stale_descriptors(frame_number);
            if page.num_free_handles() > 0 {
                available.insert(index);
            }
        }
    }
}
