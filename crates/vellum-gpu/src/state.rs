//! Resource usage states and per-subresource state maps.

use std::collections::BTreeMap;

use bitflags::bitflags;

/// Subresource index meaning "every subresource of the resource".
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

bitflags! {
    /// How the GPU is allowed to access a resource.
    ///
    /// The empty set is the common state, which every resource can be
    /// promoted from and decayed to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 0x0001;
        const INDEX_BUFFER               = 0x0002;
        const RENDER_TARGET              = 0x0004;
        const UNORDERED_ACCESS           = 0x0008;
        const DEPTH_WRITE                = 0x0010;
        const DEPTH_READ                 = 0x0020;
        const NON_PIXEL_SHADER_RESOURCE  = 0x0040;
        const PIXEL_SHADER_RESOURCE      = 0x0080;
        const INDIRECT_ARGUMENT          = 0x0200;
        const COPY_DEST                  = 0x0400;
        const COPY_SOURCE                = 0x0800;
        const RESOLVE_DEST               = 0x1000;
        const RESOLVE_SOURCE             = 0x2000;

        /// Every read-only state an upload heap resource may be in.
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    /// The common state.
    pub const COMMON: Self = Self::empty();
    /// Presentation uses the common state.
    pub const PRESENT: Self = Self::empty();

    /// Returns `true` if this state permits GPU writes.
    pub fn is_write(self) -> bool {
        self.intersects(
            Self::RENDER_TARGET
                | Self::UNORDERED_ACCESS
                | Self::DEPTH_WRITE
                | Self::COPY_DEST
                | Self::RESOLVE_DEST,
        )
    }
}

/// Known state of one resource, either uniform or split per subresource.
///
/// Explicit subresource entries only exist while subresources have diverged;
/// setting [`ALL_SUBRESOURCES`] collapses them back into the uniform state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubresourceStates {
    state: ResourceState,
    subresource_count: u32,
    subresources: BTreeMap<u32, ResourceState>,
}

impl SubresourceStates {
    /// Create a map where all `subresource_count` subresources are in `state`.
    pub fn new(state: ResourceState, subresource_count: u32) -> Self {
        Self {
            state,
            subresource_count: subresource_count.max(1),
            subresources: BTreeMap::new(),
        }
    }

    /// Record the state of one subresource, or of all of them.
    pub fn set(&mut self, subresource: u32, state: ResourceState) {
        if subresource == ALL_SUBRESOURCES {
            self.state = state;
            self.subresources.clear();
        } else {
            debug_assert!(
                subresource < self.subresource_count,
                "subresource {subresource} out of range for {} subresources",
                self.subresource_count
            );
            self.subresources.insert(subresource, state);
        }
    }

    /// Number of subresources of the resource.
    pub fn subresource_count(&self) -> u32 {
        self.subresource_count
    }

    /// State of a subresource, falling back to the uniform state.
    pub fn get(&self, subresource: u32) -> ResourceState {
        self.subresources
            .get(&subresource)
            .copied()
            .unwrap_or(self.state)
    }

    /// State of a subresource only if it carries its own entry.
    pub fn explicit(&self, subresource: u32) -> Option<ResourceState> {
        self.subresources.get(&subresource).copied()
    }

    /// Subresources carrying their own entry, in ascending order.
    pub fn explicit_subresources(&self) -> impl Iterator<Item = (u32, ResourceState)> + '_ {
        self.subresources.iter().map(|(&index, &state)| (index, state))
    }

    /// Uniform state shared by every subresource without an explicit entry.
    pub fn uniform(&self) -> ResourceState {
        self.state
    }

    /// Returns `true` while individual subresources carry their own state.
    pub fn is_split(&self) -> bool {
        !self.subresources.is_empty()
    }

    /// State of every subresource in ascending subresource order.
    pub fn subresources(&self) -> impl Iterator<Item = (u32, ResourceState)> + '_ {
        (0..self.subresource_count).map(|index| (index, self.get(index)))
    }
}
