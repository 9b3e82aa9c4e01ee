//! Translation of resource states and barriers to synchronization2.

use ash::vk;

use crate::device::ResourceBarrier;
use crate::state::{ResourceState, ALL_SUBRESOURCES};
use crate::vulkan::VulkanResourceId;

/// Pipeline stages, access mask and image layout of a resource state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateAccess {
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
);

fn single_state_access(state: ResourceState) -> StateAccess {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let (stages, access, layout) = match state {
        s if s == ResourceState::VERTEX_AND_CONSTANT_BUFFER => (
            S::VERTEX_ATTRIBUTE_INPUT | SHADER_STAGES,
            A::VERTEX_ATTRIBUTE_READ | A::UNIFORM_READ,
            L::GENERAL,
        ),
        s if s == ResourceState::INDEX_BUFFER => (S::INDEX_INPUT, A::INDEX_READ, L::GENERAL),
        s if s == ResourceState::RENDER_TARGET => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        s if s == ResourceState::UNORDERED_ACCESS => (
            SHADER_STAGES,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
            L::GENERAL,
        ),
        s if s == ResourceState::DEPTH_WRITE => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        s if s == ResourceState::DEPTH_READ => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ,
            L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        s if s == ResourceState::NON_PIXEL_SHADER_RESOURCE => (
            S::VERTEX_SHADER | S::COMPUTE_SHADER,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        s if s == ResourceState::PIXEL_SHADER_RESOURCE => (
            S::FRAGMENT_SHADER,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        s if s == ResourceState::INDIRECT_ARGUMENT => (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::GENERAL),
        s if s == ResourceState::COPY_DEST => (S::COPY, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        s if s == ResourceState::COPY_SOURCE => (S::COPY, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        s if s == ResourceState::RESOLVE_DEST => (S::RESOLVE, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        s if s == ResourceState::RESOLVE_SOURCE => (S::RESOLVE, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        _ => (
            S::ALL_COMMANDS,
            A::MEMORY_READ | A::MEMORY_WRITE,
            L::GENERAL,
        ),
    };

    StateAccess {
        stages,
        access,
        layout,
    }
}

/// Synchronization scope of a (possibly combined) resource state.
///
/// Combined states take the union of their stages and accesses; they keep a
/// specialized layout only if every component agrees on it.
pub fn state_access(state: ResourceState) -> StateAccess {
    if state.is_empty() {
        return single_state_access(ResourceState::COMMON);
    }

    let mut flags = state.iter();
    let Some(first) = flags.next() else {
        return single_state_access(ResourceState::COMMON);
    };
    flags.fold(single_state_access(first), |combined, flag| {
        let next = single_state_access(flag);
        StateAccess {
            stages: combined.stages | next.stages,
            access: combined.access | next.access,
            layout: if combined.layout == next.layout {
                combined.layout
            } else {
                vk::ImageLayout::GENERAL
            },
        }
    })
}

/// Image subresource range addressed by a subresource index.
///
/// Subresource `n` is mip `n % mip_levels` of array layer `n / mip_levels`.
pub fn subresource_range(
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_layers: u32,
    subresource: u32,
) -> vk::ImageSubresourceRange {
    if subresource == ALL_SUBRESOURCES {
        return vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(0)
            .level_count(mip_levels)
            .base_array_layer(0)
            .layer_count(array_layers);
    }
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(subresource % mip_levels)
        .level_count(1)
        .base_array_layer(subresource / mip_levels)
        .layer_count(1)
}

/// Barriers of one native barrier call, split by kind.
#[derive(Default)]
pub struct BarrierBatch {
    pub memory: Vec<vk::MemoryBarrier2<'static>>,
    pub buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
    pub images: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl BarrierBatch {
    /// Translate core barriers.
    pub fn new(barriers: &[ResourceBarrier<VulkanResourceId>]) -> Self {
        let mut batch = Self::default();
        for barrier in barriers {
            batch.push(barrier);
        }
        batch
    }

    fn push(&mut self, barrier: &ResourceBarrier<VulkanResourceId>) {
        match *barrier {
            ResourceBarrier::Transition {
                resource,
                subresource,
                before,
                after,
            } => {
                let src = state_access(before);
                let dst = state_access(after);
                match resource {
                    VulkanResourceId::Buffer { buffer, .. } => self.buffers.push(
                        vk::BufferMemoryBarrier2::default()
                            .src_stage_mask(src.stages)
                            .src_access_mask(src.access)
                            .dst_stage_mask(dst.stages)
                            .dst_access_mask(dst.access)
                            .buffer(buffer)
                            .offset(0)
                            .size(vk::WHOLE_SIZE),
                    ),
                    VulkanResourceId::Image {
                        image,
                        aspect,
                        mip_levels,
                        array_layers,
                        ..
                    } => self.images.push(
                        vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(src.stages)
                            .src_access_mask(src.access)
                            .dst_stage_mask(dst.stages)
                            .dst_access_mask(dst.access)
                            .old_layout(src.layout)
                            .new_layout(dst.layout)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .image(image)
                            .subresource_range(subresource_range(
                                aspect,
                                mip_levels,
                                array_layers,
                                subresource,
                            )),
                    ),
                }
            }
            ResourceBarrier::UnorderedAccess { .. } => self.memory.push(
                vk::MemoryBarrier2::default()
                    .src_stage_mask(SHADER_STAGES)
                    .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
                    .dst_stage_mask(SHADER_STAGES)
                    .dst_access_mask(
                        vk::AccessFlags2::SHADER_STORAGE_READ
                            | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    ),
            ),
            ResourceBarrier::Aliasing { .. } => self.memory.push(
                vk::MemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE),
            ),
        }
    }

    /// Returns `true` if there is nothing to record.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }

    /// Record the batch as one `vkCmdPipelineBarrier2`.
    ///
    /// # Safety
    /// The command buffer must be recording and every handle must be valid.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&self.memory)
            .buffer_memory_barriers(&self.buffers)
            .image_memory_barriers(&self.images);
        device.cmd_pipeline_barrier2(cmd, &dependency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_is_general_and_all_commands() {
        let access = state_access(ResourceState::COMMON);
        assert_eq!(access.layout, vk::ImageLayout::GENERAL);
        assert_eq!(access.stages, vk::PipelineStageFlags2::ALL_COMMANDS);
    }

    #[test]
    fn combined_read_states_fall_back_to_general() {
        let access = state_access(ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::COPY_SOURCE);
        assert_eq!(access.layout, vk::ImageLayout::GENERAL);
        assert!(access.stages.contains(vk::PipelineStageFlags2::COPY));
        assert!(access.access.contains(vk::AccessFlags2::TRANSFER_READ));

        let shader_read =
            state_access(ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE);
        assert_eq!(shader_read.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn subresource_index_maps_to_mip_and_layer() {
        let range = subresource_range(vk::ImageAspectFlags::COLOR, 4, 6, 9);
        assert_eq!(range.base_mip_level, 1);
        assert_eq!(range.base_array_layer, 2);
        assert_eq!(range.level_count, 1);

        let all = subresource_range(vk::ImageAspectFlags::COLOR, 4, 6, ALL_SUBRESOURCES);
        assert_eq!((all.level_count, all.layer_count), (4, 6));
    }

    #[test]
    fn transitions_split_by_resource_kind() {
        let image = VulkanResourceId::Image {
            image: vk::Image::null(),
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            array_layers: 1,
            width: 4,
            height: 4,
        };
        let buffer = VulkanResourceId::Buffer {
            buffer: vk::Buffer::null(),
            size: 64,
        };

        let batch = BarrierBatch::new(&[
            ResourceBarrier::Transition {
                resource: image,
                subresource: ALL_SUBRESOURCES,
                before: ResourceState::COPY_DEST,
                after: ResourceState::PIXEL_SHADER_RESOURCE,
            },
            ResourceBarrier::transition(buffer, ALL_SUBRESOURCES, ResourceState::UNORDERED_ACCESS),
            ResourceBarrier::UnorderedAccess { resource: None },
        ]);

        assert_eq!(batch.images.len(), 1);
        assert_eq!(batch.buffers.len(), 1);
        assert_eq!(batch.memory.len(), 1);
        assert_eq!(batch.images[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(batch.images[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}
