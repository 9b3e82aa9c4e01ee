//! Linear allocator for per-frame upload data.
//!
//! Memory comes from fixed-size, persistently mapped pages. Allocations bump
//! an offset through the current page and spill into the next one; nothing is
//! freed individually. [`UploadBuffer::reset`] rewinds every page once the
//! GPU has consumed the frame that used them.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::RwLock;

use crate::device::{GpuDevice, GpuVirtualAddress};
use crate::error::{GpuError, Result};

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// A region of upload memory valid until the owning buffer is reset.
///
/// Writes through a handle that outlived a reset fail with
/// [`GpuError::InvalidState`].
pub struct UploadAllocation<D: GpuDevice> {
    heap: Arc<D::UploadHeap>,
    cpu: NonNull<u8>,
    gpu: GpuVirtualAddress,
    size: u64,
    offset: u64,
    raw: D::RawResource,
    /// Reset count of the page at allocation time.
    generation: u64,
    page_generation: Arc<RwLock<u64>>,
}

// SAFETY: the pointer targets a sub-range of a mapped heap that `heap` keeps
// alive. Writes hold the page generation lock for reading and only proceed
// while the generation matches, and a reset takes that lock for writing, so
// no two live allocations from the same buffer write an overlapping range.
unsafe impl<D: GpuDevice> Send for UploadAllocation<D> {}
unsafe impl<D: GpuDevice> Sync for UploadAllocation<D> {}

impl<D: GpuDevice> UploadAllocation<D> {
    /// CPU address of the first byte.
    #[must_use]
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu
    }

    /// GPU address of the first byte.
    #[must_use]
    pub fn gpu_address(&self) -> GpuVirtualAddress {
        self.gpu
    }

    /// Requested size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Byte offset inside the backing page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Identity of the page buffer, for copy commands.
    #[must_use]
    pub fn raw(&self) -> D::RawResource {
        self.raw
    }

    /// Backing page.
    pub fn heap(&self) -> &Arc<D::UploadHeap> {
        &self.heap
    }

    /// Returns `true` until the owning buffer is reset.
    pub fn is_valid(&self) -> bool {
        *self.page_generation.read() == self.generation
    }

    /// Copy `bytes` to the start of the allocation.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.size {
            return Err(GpuError::InvalidArgument(format!(
                "{} bytes do not fit into an upload allocation of {} bytes",
                bytes.len(),
                self.size
            )));
        }
        let generation = self.page_generation.read();
        if *generation != self.generation {
            return Err(GpuError::InvalidState(format!(
                "upload allocation at offset {} was reset",
                self.offset
            )));
        }
        // SAFETY: the destination holds at least `size` bytes owned by this
        // allocation until the page is reset, which waits for this guard.
        // It cannot overlap a Rust-owned slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cpu.as_ptr(), bytes.len());
        }
        drop(generation);
        Ok(())
    }

    /// Copy a plain-old-data value to the start of the allocation.
    pub fn write_pod<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.write(bytemuck::bytes_of(value))
    }
}

impl<D: GpuDevice> fmt::Debug for UploadAllocation<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadAllocation")
            .field("gpu", &self.gpu)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("generation", &self.generation)
            .finish()
    }
}

struct UploadPage<D: GpuDevice> {
    heap: Arc<D::UploadHeap>,
    cpu_base: NonNull<u8>,
    gpu_base: GpuVirtualAddress,
    raw: D::RawResource,
    offset: u64,
    generation: Arc<RwLock<u64>>,
}

// SAFETY: `cpu_base` is derived from `heap`, which is Send + Sync and outlives it.
unsafe impl<D: GpuDevice> Send for UploadPage<D> {}
unsafe impl<D: GpuDevice> Sync for UploadPage<D> {}

impl<D: GpuDevice> UploadPage<D> {
    fn new(device: &D, page_size: u64) -> Result<Self> {
        let heap = device
            .create_upload_heap(page_size)
            .inspect_err(|e| tracing::error!("Failed to create upload page: {e}"))?;
        Ok(Self {
            cpu_base: device.upload_heap_cpu_ptr(&heap),
            gpu_base: device.upload_heap_gpu_address(&heap),
            raw: device.upload_heap_raw(&heap),
            heap: Arc::new(heap),
            offset: 0,
            generation: Arc::new(RwLock::new(0)),
        })
    }

    fn has_space(&self, size: u64, alignment: u64, page_size: u64) -> bool {
        align_up(self.offset, alignment) + align_up(size, alignment) <= page_size
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> UploadAllocation<D> {
        let offset = align_up(self.offset, alignment);
        self.offset = offset + align_up(size, alignment);

        UploadAllocation {
            heap: Arc::clone(&self.heap),
            // SAFETY: `offset + size` stays within the mapped page.
            cpu: unsafe { NonNull::new_unchecked(self.cpu_base.as_ptr().add(offset as usize)) },
            gpu: self.gpu_base + offset,
            size,
            offset,
            raw: self.raw,
            generation: *self.generation.read(),
            page_generation: Arc::clone(&self.generation),
        }
    }

    /// Rewind the page, invalidating every allocation taken from it.
    fn rewind(&mut self) {
        *self.generation.write() += 1;
        self.offset = 0;
    }
}

/// Bump allocator over a growing pool of upload pages.
pub struct UploadBuffer<D: GpuDevice> {
    device: Arc<D>,
    page_size: u64,
    pages: Vec<UploadPage<D>>,
    /// Pool indices of pages not used since the last reset.
    available: Vec<usize>,
    current: Option<usize>,
}

impl<D: GpuDevice> UploadBuffer<D> {
    /// Empty buffer; pages of `page_size` bytes are created on demand.
    pub fn new(device: Arc<D>, page_size: u64) -> Self {
        Self {
            device,
            page_size,
            pages: Vec::new(),
            available: Vec::new(),
            current: None,
        }
    }

    /// Size of every page.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of pages created so far.
    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// Fails without side effects if the request could never fit into a
    /// page or the alignment is not a power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<UploadAllocation<D>> {
        if !alignment.is_power_of_two() {
            return Err(GpuError::InvalidArgument(format!(
                "upload alignment {alignment} is not a power of two"
            )));
        }
        if size == 0 || align_up(size, alignment) > self.page_size {
            return Err(GpuError::InvalidArgument(format!(
                "upload of {size} bytes does not fit into a {} byte page",
                self.page_size
            )));
        }

        let index = match self.current {
            Some(index) if self.pages[index].has_space(size, alignment, self.page_size) => index,
            _ => {
                let index = self.next_page()?;
                self.current = Some(index);
                index
            }
        };

        Ok(self.pages[index].allocate(size, alignment))
    }

    /// Make every page available again with its offset rewound.
    ///
    /// The GPU must be done with every allocation handed out so far.
    pub fn reset(&mut self) {
        self.current = None;
        self.available = (0..self.pages.len()).rev().collect();
        for page in &mut self.pages {
            page.rewind();
        }
    }

    fn next_page(&mut self) -> Result<usize> {
        if let Some(index) = self.available.pop() {
            return Ok(index);
        }
        let page = UploadPage::new(&*self.device, self.page_size)?;
        tracing::debug!(
            "Created upload page #{} of {} bytes",
            self.pages.len(),
            self.page_size
        );
        self.pages.push(page);
        Ok(self.pages.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn buffer(page_size: u64) -> UploadBuffer<HeadlessDevice> {
        UploadBuffer::new(Arc::new(HeadlessDevice::new()), page_size)
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(100, 4), 100);
    }

    #[test]
    fn allocations_bump_through_page() {
        let mut upload = buffer(1024);
        let a = upload.allocate(100, 4).unwrap();
        let b = upload.allocate(64, 256).unwrap();

        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(b.gpu_address(), a.gpu_address() + 256);
        assert_eq!(upload.num_pages(), 1);
    }

    #[test]
    fn oversized_request_leaves_offset_unchanged() {
        let mut upload = buffer(1024);
        upload.allocate(100, 4).unwrap();

        let err = upload.allocate(2048, 4).unwrap_err();
        assert!(err.is_invalid_argument());

        let next = upload.allocate(4, 4).unwrap();
        assert_eq!(next.offset(), 100);
        assert_eq!(upload.num_pages(), 1);
    }

    #[test]
    fn bad_alignment_is_invalid() {
        let mut upload = buffer(1024);
        assert!(upload.allocate(16, 3).unwrap_err().is_invalid_argument());
        assert!(upload.allocate(0, 4).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn full_page_spills_into_new_page() {
        let mut upload = buffer(256);
        let a = upload.allocate(200, 16).unwrap();
        let b = upload.allocate(100, 16).unwrap();

        assert_eq!(upload.num_pages(), 2);
        assert_eq!(b.offset(), 0);
        assert!(!Arc::ptr_eq(a.heap(), b.heap()));
    }

    #[test]
    fn reset_reuses_pages() {
        let mut upload = buffer(256);
        let first = upload.allocate(200, 16).unwrap();
        upload.allocate(200, 16).unwrap();
        upload.reset();

        let again = upload.allocate(64, 16).unwrap();
        assert_eq!(upload.num_pages(), 2);
        assert_eq!(again.offset(), 0);
        assert!(Arc::ptr_eq(first.heap(), again.heap()));
    }

    #[test]
    fn writes_land_in_the_page() {
        let mut upload = buffer(256);
        upload.allocate(8, 4).unwrap();
        let mut allocation = upload.allocate(16, 16).unwrap();

        allocation.write_pod(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let bytes = allocation.heap().read(16, 16).unwrap();
        assert_eq!(bytes, bytemuck::bytes_of(&[1.0f32, 2.0, 3.0, 4.0]));

        assert!(allocation.write(&[0; 17]).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn handles_from_before_a_reset_cannot_write() {
        let mut upload = buffer(256);
        let mut stale = upload.allocate(16, 16).unwrap();
        upload.reset();
        let mut fresh = upload.allocate(16, 16).unwrap();

        // Both handles point at the same bytes of the same page.
        assert_eq!(stale.cpu_ptr(), fresh.cpu_ptr());
        assert!(!stale.is_valid());
        assert!(fresh.is_valid());

        fresh.write(&[1; 16]).unwrap();
        let err = stale.write(&[9; 16]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert_eq!(fresh.heap().read(0, 16).unwrap(), vec![1; 16]);
    }
}
