//! A single descriptor heap with a coalescing free list.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptors::allocation::DescriptorAllocation;
use crate::device::{CpuDescriptorHandle, DescriptorHeapType, GpuDevice, ViewDesc};
use crate::error::Result;
use crate::frame::FrameClock;

/// A freed run waiting for its frame to retire.
#[derive(Debug, Clone, Copy)]
struct StaleDescriptors {
    offset: u32,
    size: u32,
    frame: u64,
}

/// Free blocks indexed by offset (for coalescing) and by size (for best fit).
///
/// Both indices always hold exactly the same blocks.
#[derive(Debug, Default)]
struct FreeList {
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
}

impl FreeList {
    fn insert(&mut self, offset: u32, size: u32) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove(&mut self, offset: u32, size: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    /// Carve `count` slots from the smallest block that fits.
    fn take_best_fit(&mut self, count: u32) -> Option<u32> {
        let &(size, offset) = self.by_size.range((count, 0)..).next()?;
        self.remove(offset, size);
        if size > count {
            self.insert(offset + count, size - count);
        }
        Some(offset)
    }

    /// Return a run, merging it with adjacent free blocks.
    fn release(&mut self, offset: u32, size: u32) {
        let mut start = offset;
        let mut len = size;

        let prev = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev {
            debug_assert!(prev_offset + prev_size <= offset, "double free of descriptors");
            if prev_offset + prev_size == offset {
                self.remove(prev_offset, prev_size);
                start = prev_offset;
                len += prev_size;
            }
        }

        let next = self.by_offset.range(offset..).next().map(|(&o, &s)| (o, s));
        if let Some((next_offset, next_size)) = next {
            debug_assert!(offset + size <= next_offset, "double free of descriptors");
            if offset + size == next_offset {
                self.remove(next_offset, next_size);
                len += next_size;
            }
        }

        self.insert(start, len);
    }
}

struct PageState {
    free_list: FreeList,
    num_free_handles: u32,
    stale: VecDeque<StaleDescriptors>,
}

/// One descriptor heap sub-allocated into contiguous runs.
pub struct DescriptorAllocatorPage<D: GpuDevice> {
    device: Arc<D>,
    heap: D::DescriptorHeap,
    heap_type: DescriptorHeapType,
    base: CpuDescriptorHandle,
    increment: u32,
    num_descriptors: u32,
    frame_clock: Arc<FrameClock>,
    state: Mutex<PageState>,
}

impl<D: GpuDevice> DescriptorAllocatorPage<D> {
    /// Create a page backed by a new heap of `num_descriptors` slots.
    pub fn new(
        device: Arc<D>,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
        frame_clock: Arc<FrameClock>,
    ) -> Result<Self> {
        let heap = device.create_descriptor_heap(heap_type, num_descriptors)?;
        let base = device.descriptor_heap_start(&heap);
        let increment = device.descriptor_increment(heap_type);

        let mut free_list = FreeList::default();
        free_list.insert(0, num_descriptors);

        Ok(Self {
            device,
            heap,
            heap_type,
            base,
            increment,
            num_descriptors,
            frame_clock,
            state: Mutex::new(PageState {
                free_list,
                num_free_handles: num_descriptors,
                stale: VecDeque::new(),
            }),
        })
    }

    /// Heap type of the page.
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// Native heap backing the page.
    pub fn heap(&self) -> &D::DescriptorHeap {
        &self.heap
    }

    /// Total number of slots.
    pub fn num_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    /// Slots currently in the free list.
    pub fn num_free_handles(&self) -> u32 {
        self.state.lock().num_free_handles
    }

    /// Slots freed but still waiting for their frame to retire.
    pub fn num_stale_handles(&self) -> u32 {
        self.state.lock().stale.iter().map(|stale| stale.size).sum()
    }

    /// Free blocks as `(offset, size)` in offset order.
    pub fn free_blocks(&self) -> Vec<(u32, u32)> {
        let state = self.state.lock();
        state
            .free_list
            .by_offset
            .iter()
            .map(|(&offset, &size)| (offset, size))
            .collect()
    }

    /// Returns `true` if a single free block holds at least
    /// `num_descriptors` slots, so an allocation of that size succeeds.
    pub fn has_space(&self, num_descriptors: u32) -> bool {
        self.state.lock().free_list.by_size.range((num_descriptors, 0)..).next().is_some()
    }

    /// Allocate a contiguous run of `num_descriptors` slots.
    ///
    /// Returns `None` when no free block is large enough.
    pub fn allocate(self: &Arc<Self>, num_descriptors: u32) -> Option<DescriptorAllocation<D>> {
        let mut state = self.state.lock();
        if num_descriptors == 0 || num_descriptors > state.num_free_handles {
            return None;
        }

        let offset = state.free_list.take_best_fit(num_descriptors)?;
        state.num_free_handles -= num_descriptors;
        drop(state);

        Some(DescriptorAllocation::new(
            Arc::clone(self),
            self.base.offset(offset, self.increment),
            offset,
            num_descriptors,
            self.increment,
        ))
    }

    /// Queue a run for release once `frame_number` has retired.
    pub(crate) fn free(&self, offset: u32, num_descriptors: u32, frame_number: u64) {
        debug_assert!(offset + num_descriptors <= self.num_descriptors);
        self.state.lock().stale.push_back(StaleDescriptors {
            offset,
            size: num_descriptors,
            frame: frame_number,
        });
    }

    /// Return every run freed at or before `frame_number` to the free list.
    pub fn release_stale_descriptors(&self, frame_number: u64) {
        let mut state = self.state.lock();
        let PageState {
            free_list,
            num_free_handles,
            stale,
        } = &mut *state;

        // Frames are tagged in order, so only the front can be retired.
        while let Some(entry) = stale.front().copied() {
            if entry.frame > frame_number {
                break;
            }
            stale.pop_front();
            free_list.release(entry.offset, entry.size);
            *num_free_handles += entry.size;
        }
    }

    pub(crate) fn frame_clock(&self) -> &FrameClock {
        &self.frame_clock
    }

    pub(crate) fn write_descriptor(&self, index: u32, view: &ViewDesc<D::RawResource>) -> Result<()> {
        self.device.write_descriptor(&self.heap, index, view)
    }
}
