//! Queue roles and their transient command pools.

use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;

/// Classes of GPU work a queue is acquired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Graphics, compute and transfer on one queue.
    Universal,
    Graphics,
    Compute,
    Transfer,
}

impl QueueRole {
    /// Number of roles.
    pub const COUNT: usize = 4;

    /// Every role, in index order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Universal,
        Self::Graphics,
        Self::Compute,
        Self::Transfer,
    ];

    /// Position of this role in per-role arrays.
    pub const fn index(self) -> usize {
        match self {
            Self::Universal => 0,
            Self::Graphics => 1,
            Self::Compute => 2,
            Self::Transfer => 3,
        }
    }

    /// Capability mask requested for this role unless overridden.
    pub fn default_mask(self) -> vk::QueueFlags {
        match self {
            Self::Universal => {
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER
            }
            Self::Graphics => vk::QueueFlags::GRAPHICS,
            Self::Compute => vk::QueueFlags::COMPUTE,
            Self::Transfer => vk::QueueFlags::TRANSFER,
        }
    }
}

/// A device queue together with a pool for short-lived command buffers.
pub struct Queue {
    /// Queue handle.
    pub handle: vk::Queue,
    /// Family the queue was taken from.
    pub family: u32,
    pub(crate) transient_pool: Mutex<CommandPool>,
}

/// The four role queues of a logical device.
///
/// Roles resolved to the same family share one queue handle but each keeps
/// its own transient pool.
pub struct Queues {
    queues: [Queue; QueueRole::COUNT],
}

impl Queues {
    /// Fetch queue handles and create a transient pool per role.
    ///
    /// # Safety
    /// The device must have been created with one queue for every family in
    /// `families`.
    pub(crate) unsafe fn new(device: &ash::Device, families: [u32; QueueRole::COUNT]) -> Result<Self> {
        let mut queues = Vec::with_capacity(QueueRole::COUNT);
        for family in families {
            let pool = CommandPool::new(
                device,
                family,
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
            let pool = match pool {
                Ok(pool) => pool,
                Err(e) => {
                    for queue in &queues {
                        Self::destroy_queue(device, queue);
                    }
                    return Err(e);
                }
            };
            queues.push(Queue {
                handle: device.get_device_queue(family, 0),
                family,
                transient_pool: Mutex::new(pool),
            });
        }

        let queues = queues
            .try_into()
            .map_err(|_| GpuError::InvalidState("queue count does not match roles".to_string()))?;
        Ok(Self { queues })
    }

    /// The queue serving `role`.
    pub fn get(&self, role: QueueRole) -> &Queue {
        &self.queues[role.index()]
    }

    unsafe fn destroy_queue(device: &ash::Device, queue: &Queue) {
        queue.transient_pool.lock().destroy(device);
    }

    /// Destroy the transient pools.
    ///
    /// # Safety
    /// No command buffer from these pools may be pending.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        for queue in &self.queues {
            Self::destroy_queue(device, queue);
        }
    }
}

/// Deduplicate family indices keeping first occurrence order.
pub fn unique_families(families: &[u32]) -> Vec<u32> {
    let mut unique = Vec::with_capacity(families.len());
    for &family in families {
        if !unique.contains(&family) {
            unique.push(family);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_indices_match_order() {
        for (i, role) in QueueRole::ALL.iter().enumerate() {
            assert_eq!(role.index(), i);
        }
    }

    #[test]
    fn universal_mask_covers_other_roles() {
        let universal = QueueRole::Universal.default_mask();
        for role in &QueueRole::ALL[1..] {
            assert!(universal.contains(role.default_mask()));
        }
    }

    #[test]
    fn unique_families_keep_order() {
        assert_eq!(unique_families(&[0, 0, 2, 1]), vec![0, 2, 1]);
        assert_eq!(unique_families(&[3, 3, 3, 3]), vec![3]);
    }
}
