//! Descriptor heap management.
//!
//! Descriptors are handed out as contiguous runs carved from fixed-size
//! pages. Freed runs are not reusable right away: the GPU may still read
//! them through command lists in flight, so they wait in a per-page queue
//! until the frame that dropped them is known to have retired.

mod allocation;
mod allocator;
mod page;

pub use allocation::DescriptorAllocation;
pub use allocator::DescriptorAllocator;
pub use page::DescriptorAllocatorPage;
