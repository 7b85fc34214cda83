//! Command pools and command buffer recording helpers.

use crate::error::{GpuError, Result};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn null() -> Self {
        Self {
            pool: vk::CommandPool::null(),
        }
    }

    /// Allocate one primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        device
            .allocate_command_buffers(&alloc_info)?
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".to_string()))
    }

    /// Return a command buffer to the pool.
    ///
    /// # Safety
    /// The buffer must come from this pool and must not be pending.
    pub unsafe fn free(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.free_command_buffers(self.pool, &[cmd]);
    }

    /// Reset the command pool, returning every buffer to the initial state.
    ///
    /// # Safety
    /// No command buffer from this pool may be pending.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        Ok(())
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer for a single submission.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit one command buffer.
///
/// Every wait semaphore is waited at `wait_stage`.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    wait_semaphores: &[vk::Semaphore],
    wait_stage: vk::PipelineStageFlags,
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let wait_stages = wait_stage_masks(wait_semaphores.len(), wait_stage);
    let command_buffers = [cmd];
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(&command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

/// Stage mask list matching a wait semaphore list.
fn wait_stage_masks(count: usize, stage: vk::PipelineStageFlags) -> Vec<vk::PipelineStageFlags> {
    vec![stage; count]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_stages_match_semaphores() {
        let stages = wait_stage_masks(2, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(stages.len(), 2);
        assert!(stages
            .iter()
            .all(|&s| s == vk::PipelineStageFlags::TOP_OF_PIPE));
        assert!(wait_stage_masks(0, vk::PipelineStageFlags::ALL_COMMANDS).is_empty());
    }
}
