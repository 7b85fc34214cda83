//! Synchronization primitives and per-frame command resources.

use crate::command::CommandPool;
use crate::error::Result;
use ash::vk;

/// Timeout for a single fence wait before it is logged and retried.
pub const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence, retrying for as long as the wait times out.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence_forever(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    loop {
        match device.wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS) {
            Ok(()) => return Ok(()),
            Err(vk::Result::TIMEOUT) => {
                tracing::warn!("Fence wait timed out after {FENCE_TIMEOUT_NS} ns, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Command resources for one frame in flight.
pub struct FrameSlot {
    /// Pool owning `cmd`; reset as a whole before each recording.
    pub pool: CommandPool,
    pub cmd: vk::CommandBuffer,
    /// Signaled when the slot's previous submission has finished.
    pub ready_to_record: vk::Fence,
    /// Signaled when the acquired surface image may be written.
    pub ready_to_write: vk::Semaphore,
    /// Signaled when the surface image may be presented.
    pub ready_to_read: vk::Semaphore,
}

impl FrameSlot {
    /// Create a slot whose fence starts signaled.
    ///
    /// Anything created before a failure is destroyed again.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let pool = CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let mut slot = Self {
            pool,
            cmd: vk::CommandBuffer::null(),
            ready_to_record: vk::Fence::null(),
            ready_to_write: vk::Semaphore::null(),
            ready_to_read: vk::Semaphore::null(),
        };
        if let Err(e) = slot.create_handles(device) {
            slot.destroy(device);
            return Err(e);
        }
        Ok(slot)
    }

    unsafe fn create_handles(&mut self, device: &ash::Device) -> Result<()> {
        self.cmd = self.pool.allocate(device)?;
        self.ready_to_record = create_fence(device, true)?;
        self.ready_to_write = create_semaphore(device)?;
        self.ready_to_read = create_semaphore(device)?;
        Ok(())
    }

    /// Destroy synchronization resources. Null handles are skipped.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.pool.destroy(device);
        if self.ready_to_record != vk::Fence::null() {
            device.destroy_fence(self.ready_to_record, None);
        }
        for semaphore in self.created_semaphores() {
            device.destroy_semaphore(semaphore, None);
        }
    }

    fn created_semaphores(&self) -> impl Iterator<Item = vk::Semaphore> {
        [self.ready_to_write, self.ready_to_read]
            .into_iter()
            .filter(|&semaphore| semaphore != vk::Semaphore::null())
    }
}

/// Rotating index over a fixed number of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRing {
    len: usize,
    next: u64,
}

impl SlotRing {
    /// Ring over `len` slots starting at slot 0.
    pub fn new(len: usize) -> Self {
        Self { len, next: 0 }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the ring has no slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index the next call to [`Self::advance`] returns.
    pub fn peek(&self) -> usize {
        if self.len == 0 {
            0
        } else {
            (self.next % self.len as u64) as usize
        }
    }

    /// Take the current slot index and step forward.
    pub fn advance(&mut self) -> usize {
        let index = self.peek();
        self.next = self.next.wrapping_add(1);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_after_full_rotation() {
        let mut ring = SlotRing::new(3);
        let taken: Vec<usize> = (0..3).map(|_| ring.advance()).collect();
        assert_eq!(taken, vec![0, 1, 2]);
        assert_eq!(ring.peek(), 0);
        assert_eq!(ring.advance(), 0);
    }

    #[test]
    fn ring_visits_each_slot_once_per_rotation() {
        let mut ring = SlotRing::new(4);
        for _ in 0..5 {
            let mut seen = [0u32; 4];
            for _ in 0..4 {
                seen[ring.advance()] += 1;
            }
            assert_eq!(seen, [1, 1, 1, 1]);
        }
    }

    #[test]
    fn partially_built_slot_skips_missing_semaphores() {
        use ash::vk::Handle;

        let slot = FrameSlot {
            pool: CommandPool::null(),
            cmd: vk::CommandBuffer::null(),
            ready_to_record: vk::Fence::null(),
            ready_to_write: vk::Semaphore::from_raw(7),
            ready_to_read: vk::Semaphore::null(),
        };
        let live: Vec<vk::Semaphore> = slot.created_semaphores().collect();
        assert_eq!(live, vec![vk::Semaphore::from_raw(7)]);
    }

    #[test]
    fn empty_ring_does_not_divide_by_zero() {
        let mut ring = SlotRing::new(0);
        assert!(ring.is_empty());
        assert_eq!(ring.advance(), 0);
    }
}
