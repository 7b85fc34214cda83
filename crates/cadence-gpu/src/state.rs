//! Resource state tracking and barrier construction.
//!
//! Every image and buffer remembers the stage, access and layout it was last
//! transitioned to. A transition builds one barrier from that state to the
//! requested one and stores the request as the new state.

use ash::vk;

/// The last synchronization scope a resource was left in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    /// Ignored for buffers.
    pub layout: vk::ImageLayout,
}

impl ResourceState {
    /// State of a freshly created or wrapped resource.
    pub const INITIAL: Self = Self {
        stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
        layout: vk::ImageLayout::UNDEFINED,
    };

    /// A state with the given scope.
    pub const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
        }
    }

    /// Move to `next`, returning the `(src, dst)` pair the barrier must carry.
    pub fn transition_to(&mut self, next: Self) -> (Self, Self) {
        let src = std::mem::replace(self, next);
        (src, next)
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// Ownership of the memory behind a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created and freed by this crate.
    Owned,
    /// Created elsewhere; destroying it is a no-op.
    Wrapped,
}

/// Build the barrier for an image transition and update its state.
pub fn image_barrier(
    state: &mut ResourceState,
    next: ResourceState,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src, dst) = state.transition_to(next);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .old_layout(src.layout)
        .new_layout(dst.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// Build the barrier for a whole-buffer transition and update its state.
pub fn buffer_barrier(
    state: &mut ResourceState,
    next: ResourceState,
    buffer: vk::Buffer,
) -> vk::BufferMemoryBarrier2<'static> {
    let (src, dst) = state.transition_to(next);
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Full single-mip, single-layer range over `aspects`.
pub fn full_range(aspects: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFER_DST: ResourceState = ResourceState::new(
        vk::PipelineStageFlags2::TRANSFER,
        vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    const SHADER_READ: ResourceState = ResourceState::new(
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::SHADER_SAMPLED_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );

    #[test]
    fn initial_state_is_conservative() {
        let state = ResourceState::default();
        assert_eq!(state.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(state.stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert!(state.access.contains(vk::AccessFlags2::MEMORY_READ));
        assert!(state.access.contains(vk::AccessFlags2::MEMORY_WRITE));
    }

    #[test]
    fn image_barrier_uses_stored_source() {
        let mut state = ResourceState::INITIAL;
        let range = full_range(vk::ImageAspectFlags::COLOR);

        let first = image_barrier(&mut state, TRANSFER_DST, vk::Image::null(), range);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(first.src_stage_mask, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(state, TRANSFER_DST);

        let second = image_barrier(&mut state, SHADER_READ, vk::Image::null(), range);
        assert_eq!(second.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(second.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(second.dst_access_mask, vk::AccessFlags2::SHADER_SAMPLED_READ);
        assert_eq!(state, SHADER_READ);
    }

    #[test]
    fn same_state_transition_keeps_state() {
        let mut state = SHADER_READ;
        let barrier = image_barrier(
            &mut state,
            SHADER_READ,
            vk::Image::null(),
            full_range(vk::ImageAspectFlags::COLOR),
        );
        assert_eq!(state, SHADER_READ);
        assert_eq!(barrier.old_layout, barrier.new_layout);
        assert_eq!(barrier.src_stage_mask, barrier.dst_stage_mask);
        assert_eq!(barrier.subresource_range.level_count, 1);
    }

    #[test]
    fn buffer_barrier_covers_whole_buffer() {
        let mut state = ResourceState::INITIAL;
        let next = ResourceState::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ,
            vk::ImageLayout::UNDEFINED,
        );
        let barrier = buffer_barrier(&mut state, next, vk::Buffer::null());
        assert_eq!(barrier.size, vk::WHOLE_SIZE);
        assert_eq!(barrier.offset, 0);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(state, next);
    }
}
