//! Resource state tracking and barrier minimization.
//!
//! Each command list owns a [`ResourceStateTracker`]. While recording, the
//! tracker knows the state a resource will be in at the end of the list
//! (its "final" state) but not the state it is in when the list starts
//! executing. Transitions of resources the list has already touched are
//! resolved immediately; the first transition of every other resource is
//! kept pending and resolved against the session-wide table right before
//! submission, while [`GlobalResourceStates`] is locked.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::{Mutex, MutexGuard};

use crate::device::{GpuDevice, ResourceBarrier};
use crate::resource::Resource;
use crate::state::{ResourceState, SubresourceStates, ALL_SUBRESOURCES};

/// Last known state of every live resource, as seen by submitted work.
pub struct GlobalResourceStates<R> {
    table: Mutex<HashMap<R, SubresourceStates>>,
}

impl<R: Copy + Eq + Hash> GlobalResourceStates<R> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the table for flushing and committing.
    ///
    /// Not reentrant: registering or removing resources while the guard is
    /// held on the same thread deadlocks.
    pub fn lock(&self) -> ResourceStatesGuard<'_, R> {
        ResourceStatesGuard {
            table: self.table.lock(),
        }
    }

    /// Register a new resource with every subresource in `state`.
    pub fn add(&self, resource: R, state: ResourceState, subresource_count: u32) {
        self.table
            .lock()
            .insert(resource, SubresourceStates::new(state, subresource_count));
    }

    /// Forget a destroyed resource.
    pub fn remove(&self, resource: R) {
        self.table.lock().remove(&resource);
    }

    /// Known state of a subresource.
    pub fn get(&self, resource: R, subresource: u32) -> Option<ResourceState> {
        self.table
            .lock()
            .get(&resource)
            .map(|states| states.get(subresource))
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns `true` if no resource is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Copy + Eq + Hash> Default for GlobalResourceStates<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to [`GlobalResourceStates`].
///
/// Flushing pending barriers and committing final states both require it,
/// so several command lists can be reconciled as one atomic step.
pub struct ResourceStatesGuard<'a, R> {
    table: MutexGuard<'a, HashMap<R, SubresourceStates>>,
}

impl<R: Copy + Eq + Hash> ResourceStatesGuard<'_, R> {
    /// Known states of a resource.
    pub fn get(&self, resource: &R) -> Option<&SubresourceStates> {
        self.table.get(resource)
    }
}

/// Push `subresource -> after` against `known` into `out`.
///
/// A whole-resource transition of a split resource becomes one barrier per
/// subresource; every subresource already in `after` is skipped.
fn resolve_transition<R: Copy>(
    known: &SubresourceStates,
    resource: R,
    subresource: u32,
    after: ResourceState,
    out: &mut Vec<ResourceBarrier<R>>,
) {
    if subresource == ALL_SUBRESOURCES && known.is_split() {
        for (index, before) in known.subresources() {
            if before != after {
                out.push(ResourceBarrier::Transition {
                    resource,
                    subresource: index,
                    before,
                    after,
                });
            }
        }
    } else {
        let before = known.get(subresource);
        if before != after {
            out.push(ResourceBarrier::Transition {
                resource,
                subresource,
                before,
                after,
            });
        }
    }
}

/// States a command list leaves a resource in.
struct FinalStates {
    states: SubresourceStates,
    /// Set once the whole resource has been transitioned by this list;
    /// until then subresources without an entry are in an unknown state.
    whole: bool,
}

/// Per-command-list barrier log.
pub struct ResourceStateTracker<D: GpuDevice> {
    /// Transitions whose `before` state needs the global table.
    pending_barriers: Vec<ResourceBarrier<D::RawResource>>,
    /// Barriers whose `before` state is already known.
    resource_barriers: Vec<ResourceBarrier<D::RawResource>>,
    final_states: HashMap<D::RawResource, FinalStates>,
}

impl<D: GpuDevice> ResourceStateTracker<D> {
    /// Empty tracker.
    pub fn new() -> Self {
        Self {
            pending_barriers: Vec::new(),
            resource_barriers: Vec::new(),
            final_states: HashMap::new(),
        }
    }

    /// Record a barrier.
    ///
    /// The `before` state of a transition is ignored and recomputed from the
    /// tracked states; `subresource_count` is the number of subresources of
    /// the transitioned resource and is unused for other barriers.
    pub fn resource_barrier(&mut self, barrier: ResourceBarrier<D::RawResource>, subresource_count: u32) {
        let ResourceBarrier::Transition {
            resource,
            subresource,
            after,
            ..
        } = barrier
        else {
            self.resource_barriers.push(barrier);
            return;
        };

        let Some(local) = self.final_states.get_mut(&resource) else {
            self.pending_barriers.push(barrier);
            let mut states = SubresourceStates::new(ResourceState::COMMON, subresource_count);
            states.set(subresource, after);
            self.final_states.insert(
                resource,
                FinalStates {
                    states,
                    whole: subresource == ALL_SUBRESOURCES,
                },
            );
            return;
        };

        if local.whole {
            resolve_transition(&local.states, resource, subresource, after, &mut self.resource_barriers);
        } else if subresource == ALL_SUBRESOURCES {
            // Touched subresources resolve locally, the rest against the global table.
            for index in 0..local.states.subresource_count() {
                match local.states.explicit(index) {
                    Some(before) if before != after => {
                        self.resource_barriers.push(ResourceBarrier::Transition {
                            resource,
                            subresource: index,
                            before,
                            after,
                        })
                    }
                    Some(_) => {}
                    None => self
                        .pending_barriers
                        .push(ResourceBarrier::transition(resource, index, after)),
                }
            }
            local.whole = true;
        } else if local.states.explicit(subresource).is_some() {
            resolve_transition(&local.states, resource, subresource, after, &mut self.resource_barriers);
        } else {
            self.pending_barriers.push(barrier);
        }

        local.states.set(subresource, after);
    }

    /// Transition a subresource (or all of them) to `after`.
    pub fn transition_resource(&mut self, resource: &Resource<D>, after: ResourceState, subresource: u32) {
        let count = resource.desc().subresource_count();
        debug_assert!(
            subresource == ALL_SUBRESOURCES || subresource < count,
            "subresource {subresource} out of range"
        );
        self.resource_barrier(ResourceBarrier::transition(resource.raw(), subresource, after), count);
    }

    /// Order unordered-access writes to a resource, or to all resources.
    pub fn uav_barrier(&mut self, resource: Option<&Resource<D>>) {
        self.resource_barriers.push(ResourceBarrier::UnorderedAccess {
            resource: resource.map(Resource::raw),
        });
    }

    /// Switch the memory shared by two placed resources.
    pub fn aliasing_barrier(&mut self, before: Option<&Resource<D>>, after: Option<&Resource<D>>) {
        self.resource_barriers.push(ResourceBarrier::Aliasing {
            before: before.map(Resource::raw),
            after: after.map(Resource::raw),
        });
    }

    /// Resolve pending barriers against the global table and record them.
    ///
    /// Records at most one native barrier call and returns the number of
    /// barriers in it. The global table is not updated here; that happens in
    /// [`commit_final_resource_states`](Self::commit_final_resource_states).
    pub fn flush_pending_resource_barriers(
        &mut self,
        global: &mut ResourceStatesGuard<'_, D::RawResource>,
        device: &D,
        list: &mut D::CommandList,
    ) -> u32 {
        let mut barriers = Vec::with_capacity(self.pending_barriers.len());

        for pending in self.pending_barriers.drain(..) {
            let ResourceBarrier::Transition {
                resource,
                subresource,
                after,
                ..
            } = pending
            else {
                continue;
            };

            match global.get(&resource) {
                Some(known) => resolve_transition(known, resource, subresource, after, &mut barriers),
                None => tracing::warn!("Dropping pending transition of untracked resource {resource:?}"),
            }
        }

        if !barriers.is_empty() {
            tracing::trace!("Flushing {} resolved pending barriers", barriers.len());
            device.cmd_resource_barriers(list, &barriers);
        }
        barriers.len() as u32
    }

    /// Record every already-resolved barrier.
    pub fn flush_resource_barriers(&mut self, device: &D, list: &mut D::CommandList) -> u32 {
        let count = self.resource_barriers.len() as u32;
        if count > 0 {
            device.cmd_resource_barriers(list, &self.resource_barriers);
            self.resource_barriers.clear();
        }
        count
    }

    /// Publish this list's final states to the global table.
    ///
    /// Resources dropped since they were recorded are no longer in the table
    /// and are skipped.
    pub fn commit_final_resource_states(&mut self, global: &mut ResourceStatesGuard<'_, D::RawResource>) {
        for (resource, local) in self.final_states.drain() {
            let Some(known) = global.table.get_mut(&resource) else {
                continue;
            };
            if local.whole {
                *known = local.states;
                continue;
            }
            for (index, state) in local.states.explicit_subresources() {
                known.set(index, state);
            }
        }
    }

    /// Forget everything recorded so far.
    pub fn reset(&mut self) {
        self.pending_barriers.clear();
        self.resource_barriers.clear();
        self.final_states.clear();
    }

    /// Number of barriers waiting for the global table.
    pub fn num_pending_barriers(&self) -> usize {
        self.pending_barriers.len()
    }

    /// Number of resolved barriers not yet recorded.
    pub fn num_resource_barriers(&self) -> usize {
        self.resource_barriers.len()
    }

    /// State of a subresource at the end of the list, if this list decided it.
    pub fn final_state(&self, resource: D::RawResource, subresource: u32) -> Option<ResourceState> {
        let local = self.final_states.get(&resource)?;
        if local.whole {
            Some(local.states.get(subresource))
        } else {
            local.states.explicit(subresource)
        }
    }
}

impl<D: GpuDevice> Default for ResourceStateTracker<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandListType, Format, ResourceDesc};
    use crate::headless::{HeadlessCommandList, HeadlessDevice};
    use crate::session::GpuSession;
    use crate::GpuConfig;
    use std::sync::Arc;

    fn setup() -> (Arc<GpuSession<HeadlessDevice>>, HeadlessCommandList) {
        let session = Arc::new(GpuSession::new(
            Arc::new(HeadlessDevice::new()),
            GpuConfig::default(),
        ));
        let device = session.device();
        let allocator = device
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let list = device
            .create_command_list(CommandListType::Direct, &allocator)
            .unwrap();
        (session, list)
    }

    fn texture(session: &GpuSession<HeadlessDevice>, mips: u16) -> Resource<HeadlessDevice> {
        session
            .create_resource(
                &ResourceDesc::texture_2d(64, 64, mips, Format::Rgba8Unorm),
                ResourceState::COMMON,
                None,
                "texture",
            )
            .unwrap()
    }

    #[test]
    fn first_transition_is_pending() {
        let (session, _) = setup();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::RENDER_TARGET, ALL_SUBRESOURCES);

        assert_eq!(tracker.num_pending_barriers(), 1);
        assert_eq!(tracker.num_resource_barriers(), 0);
        assert_eq!(
            tracker.final_state(resource.raw(), 0),
            Some(ResourceState::RENDER_TARGET)
        );
    }

    #[test]
    fn repeated_transition_is_elided() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COPY_DEST, ALL_SUBRESOURCES);
        tracker.transition_resource(&resource, ResourceState::PIXEL_SHADER_RESOURCE, ALL_SUBRESOURCES);
        tracker.transition_resource(&resource, ResourceState::PIXEL_SHADER_RESOURCE, ALL_SUBRESOURCES);

        assert_eq!(tracker.flush_resource_barriers(device, &mut list), 1);
        assert_eq!(
            list.barriers(),
            vec![ResourceBarrier::Transition {
                resource: resource.raw(),
                subresource: ALL_SUBRESOURCES,
                before: ResourceState::COPY_DEST,
                after: ResourceState::PIXEL_SHADER_RESOURCE,
            }]
        );

        tracker.transition_resource(&resource, ResourceState::PIXEL_SHADER_RESOURCE, ALL_SUBRESOURCES);
        assert_eq!(tracker.flush_resource_barriers(device, &mut list), 0);
        assert_eq!(list.barrier_calls(), 1);
    }

    #[test]
    fn whole_resource_transition_expands_split_states() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 3);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COPY_DEST, ALL_SUBRESOURCES);
        tracker.transition_resource(&resource, ResourceState::PIXEL_SHADER_RESOURCE, 0);
        tracker.transition_resource(&resource, ResourceState::UNORDERED_ACCESS, 1);
        tracker.flush_resource_barriers(device, &mut list);
        let before = list.barriers().len();

        tracker.transition_resource(&resource, ResourceState::UNORDERED_ACCESS, ALL_SUBRESOURCES);
        tracker.flush_resource_barriers(device, &mut list);
        let emitted = &list.barriers()[before..];

        assert_eq!(
            emitted,
            &[
                ResourceBarrier::Transition {
                    resource: resource.raw(),
                    subresource: 0,
                    before: ResourceState::PIXEL_SHADER_RESOURCE,
                    after: ResourceState::UNORDERED_ACCESS,
                },
                ResourceBarrier::Transition {
                    resource: resource.raw(),
                    subresource: 2,
                    before: ResourceState::COPY_DEST,
                    after: ResourceState::UNORDERED_ACCESS,
                },
            ]
        );
        assert_eq!(
            tracker.final_state(resource.raw(), 2),
            Some(ResourceState::UNORDERED_ACCESS)
        );
    }

    #[test]
    fn untouched_subresources_stay_pending() {
        let (session, _) = setup();
        let resource = texture(&session, 2);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::RENDER_TARGET, 1);
        assert_eq!(tracker.num_pending_barriers(), 1);
        assert_eq!(tracker.final_state(resource.raw(), 0), None);

        tracker.transition_resource(&resource, ResourceState::PIXEL_SHADER_RESOURCE, ALL_SUBRESOURCES);
        assert_eq!(tracker.num_pending_barriers(), 2);
        assert_eq!(tracker.num_resource_barriers(), 1);
        assert_eq!(
            tracker.final_state(resource.raw(), 0),
            Some(ResourceState::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn partial_commit_merges_into_global() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 2);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COPY_DEST, 1);
        let mut global = session.lock_resource_states();
        tracker.flush_pending_resource_barriers(&mut global, device, &mut list);
        tracker.commit_final_resource_states(&mut global);
        drop(global);

        assert_eq!(session.global_state(&resource, 0), Some(ResourceState::COMMON));
        assert_eq!(session.global_state(&resource, 1), Some(ResourceState::COPY_DEST));
    }

    #[test]
    fn commit_skips_resources_dropped_since_recording() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COPY_DEST, ALL_SUBRESOURCES);
        drop(resource);
        assert_eq!(session.num_tracked_resources(), 0);

        let mut global = session.lock_resource_states();
        assert_eq!(tracker.flush_pending_resource_barriers(&mut global, device, &mut list), 0);
        tracker.commit_final_resource_states(&mut global);
        drop(global);

        assert_eq!(session.num_tracked_resources(), 0);
    }

    #[test]
    fn pending_resolves_against_global_state() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 1);

        let mut first = ResourceStateTracker::new();
        first.transition_resource(&resource, ResourceState::RENDER_TARGET, ALL_SUBRESOURCES);
        {
            let mut global = session.lock_resource_states();
            assert_eq!(first.flush_pending_resource_barriers(&mut global, device, &mut list), 1);
            first.commit_final_resource_states(&mut global);
        }
        first.reset();

        let mut second = ResourceStateTracker::new();
        second.transition_resource(&resource, ResourceState::PIXEL_SHADER_RESOURCE, ALL_SUBRESOURCES);
        let mut global = session.lock_resource_states();
        assert_eq!(second.flush_pending_resource_barriers(&mut global, device, &mut list), 1);

        assert_eq!(
            list.barriers().last(),
            Some(&ResourceBarrier::Transition {
                resource: resource.raw(),
                subresource: ALL_SUBRESOURCES,
                before: ResourceState::RENDER_TARGET,
                after: ResourceState::PIXEL_SHADER_RESOURCE,
            })
        );
    }

    #[test]
    fn pending_noop_emits_nothing() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COMMON, ALL_SUBRESOURCES);
        let mut global = session.lock_resource_states();

        assert_eq!(tracker.flush_pending_resource_barriers(&mut global, device, &mut list), 0);
        assert_eq!(list.barrier_calls(), 0);
        assert_eq!(tracker.num_pending_barriers(), 0);
    }

    #[test]
    fn flush_does_not_touch_global_table() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COPY_SOURCE, ALL_SUBRESOURCES);
        {
            let mut global = session.lock_resource_states();
            tracker.flush_pending_resource_barriers(&mut global, device, &mut list);
        }
        assert_eq!(
            session.global_state(&resource, 0),
            Some(ResourceState::COMMON)
        );

        let mut global = session.lock_resource_states();
        tracker.commit_final_resource_states(&mut global);
        drop(global);
        assert_eq!(
            session.global_state(&resource, 0),
            Some(ResourceState::COPY_SOURCE)
        );
    }

    #[test]
    fn pending_against_split_global_state_expands() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 2);

        let mut first = ResourceStateTracker::new();
        first.transition_resource(&resource, ResourceState::RENDER_TARGET, 1);
        {
            let mut global = session.lock_resource_states();
            first.flush_pending_resource_barriers(&mut global, device, &mut list);
            first.commit_final_resource_states(&mut global);
        }

        let mut second = ResourceStateTracker::new();
        second.transition_resource(&resource, ResourceState::COMMON, ALL_SUBRESOURCES);
        let mut global = session.lock_resource_states();
        let before = list.barriers().len();
        assert_eq!(second.flush_pending_resource_barriers(&mut global, device, &mut list), 1);

        assert_eq!(
            list.barriers()[before],
            ResourceBarrier::Transition {
                resource: resource.raw(),
                subresource: 1,
                before: ResourceState::RENDER_TARGET,
                after: ResourceState::COMMON,
            }
        );
    }

    #[test]
    fn uav_and_aliasing_barriers_pass_through() {
        let (session, mut list) = setup();
        let device = session.device();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.uav_barrier(Some(&resource));
        tracker.uav_barrier(Some(&resource));
        tracker.aliasing_barrier(None, Some(&resource));

        assert_eq!(tracker.num_pending_barriers(), 0);
        assert_eq!(tracker.flush_resource_barriers(device, &mut list), 3);
    }

    #[test]
    fn reset_clears_everything() {
        let (session, _) = setup();
        let resource = texture(&session, 1);
        let mut tracker = ResourceStateTracker::new();

        tracker.transition_resource(&resource, ResourceState::COPY_DEST, ALL_SUBRESOURCES);
        tracker.transition_resource(&resource, ResourceState::COPY_SOURCE, ALL_SUBRESOURCES);
        tracker.reset();

        assert_eq!(tracker.num_pending_barriers(), 0);
        assert_eq!(tracker.num_resource_barriers(), 0);
        assert_eq!(tracker.final_state(resource.raw(), 0), None);
    }
}
