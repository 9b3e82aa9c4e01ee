//! Frame counter shared by everything that defers work to frame retirement.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic CPU frame counter.
///
/// Descriptor ranges dropped during frame `n` are tagged with `n` and only
/// reused once the renderer confirms frame `n` has retired on the GPU.
#[derive(Debug, Default)]
pub struct FrameClock {
    frame: AtomicU64,
}

impl FrameClock {
    /// Clock starting at frame 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame currently being recorded.
    pub fn current(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Move to the next frame and return its number.
    pub fn advance(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let clock = FrameClock::new();
        assert_eq!(clock.current(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.current(), 2);
    }
}
