//! GPU buffers with tracked synchronization state.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::state::{buffer_barrier, Ownership, ResourceState};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

/// Parameters for [`Buffer::new`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    /// Minimum alignment of the backing memory; 0 keeps the driver's.
    pub alignment: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// More than one family selects concurrent sharing.
    pub queue_families: &'a [u32],
    /// Request host-visible memory.
    pub host_accessible: bool,
}

impl<'a> BufferDesc<'a> {
    /// Exclusive, device-local buffer.
    pub fn new(name: &'a str, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name,
            size,
            alignment: 0,
            usage,
            queue_families: &[],
            host_accessible: false,
        }
    }

    /// Request host-visible memory.
    pub fn host_accessible(mut self) -> Self {
        self.host_accessible = true;
        self
    }

    /// Minimum alignment of the backing memory.
    pub fn alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Families that access the buffer.
    pub fn queue_families(mut self, families: &'a [u32]) -> Self {
        self.queue_families = families;
        self
    }
}

/// A buffer and its memory.
pub struct Buffer {
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    name: String,
    state: ResourceState,
    allocation: Option<Allocation>,
    ownership: Ownership,
    requires_staging: bool,
    requires_flushing: bool,
    atom_size: vk::DeviceSize,
}

impl Buffer {
    /// Create a buffer and bind memory to it.
    pub fn new(gpu: &GpuContext, desc: &BufferDesc<'_>) -> Result<Self> {
        let sharing_mode = if desc.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let mut buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing_mode);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            buffer_info = buffer_info.queue_family_indices(desc.queue_families);
        }

        let device = gpu.device();
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let location = if desc.host_accessible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation =
            match gpu
                .allocator()
                .lock()
                .allocate_buffer(buffer, location, desc.alignment, desc.name)
            {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };

        let properties = allocation.memory_properties();
        let requires_staging = !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let requires_flushing =
            !requires_staging && !properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if desc.host_accessible && requires_staging {
            tracing::warn!("Buffer '{}' did not receive host-visible memory", desc.name);
        }

        Ok(Self {
            buffer,
            size: desc.size,
            name: desc.name.to_string(),
            state: ResourceState::INITIAL,
            allocation: Some(allocation),
            ownership: Ownership::Owned,
            requires_staging,
            requires_flushing,
            atom_size: gpu.non_coherent_atom_size(),
        })
    }

    /// Track a buffer created elsewhere. Host access is unavailable.
    pub fn wrap(buffer: vk::Buffer, size: vk::DeviceSize) -> Self {
        Self {
            buffer,
            size,
            name: String::from("wrapped"),
            state: ResourceState::INITIAL,
            allocation: None,
            ownership: Ownership::Wrapped,
            requires_staging: true,
            requires_flushing: false,
            atom_size: 1,
        }
    }

    /// Raw handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Last transitioned state.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Host access needs a staging copy, which is not implemented.
    pub fn requires_staging(&self) -> bool {
        self.requires_staging
    }

    /// Host writes must be flushed explicitly.
    pub fn requires_flushing(&self) -> bool {
        self.requires_flushing
    }

    /// Record a barrier from the stored state to `stage`/`access`.
    pub fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) {
        let next = ResourceState::new(stage, access, vk::ImageLayout::UNDEFINED);
        let barrier = buffer_barrier(&mut self.state, next, self.buffer);
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn check_range(&self, offset: vk::DeviceSize, len: usize) -> Result<()> {
        let end = offset.saturating_add(len as vk::DeviceSize);
        if end > self.size {
            return Err(GpuError::OutOfRange {
                offset,
                end,
                size: self.size,
            });
        }
        Ok(())
    }

    fn mapped(&self) -> Result<(&Allocation, *mut u8)> {
        if self.requires_staging {
            tracing::error!(
                "Host access to buffer '{}' requires staging, which is not implemented",
                self.name
            );
            return Err(GpuError::StagingRequired(self.name.clone()));
        }
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState(format!("Buffer '{}' has no memory", self.name)))?;
        let ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState(format!("Buffer '{}' is not mapped", self.name)))?;
        Ok((allocation, ptr.as_ptr().cast::<u8>()))
    }

    fn mapped_range(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        len: usize,
    ) -> vk::MappedMemoryRange<'static> {
        let (start, size) = flush_range(
            allocation.offset() + offset,
            len as vk::DeviceSize,
            self.atom_size,
            allocation.offset() + allocation.size(),
        );
        vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(start)
            .size(size)
    }

    /// Copy `bytes` into the buffer at `offset`, flushing if required.
    pub fn write_bytes(&self, device: &ash::Device, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        let (allocation, ptr) = self.mapped()?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len());
            if self.requires_flushing && !bytes.is_empty() {
                device.flush_mapped_memory_ranges(&[self.mapped_range(allocation, offset, bytes.len())])?;
            }
        }
        Ok(())
    }

    /// Copy `data` to the start of the buffer.
    pub fn write<T: Pod>(&self, device: &ash::Device, data: &[T]) -> Result<()> {
        self.write_bytes(device, 0, bytemuck::cast_slice(data))
    }

    /// Copy from the buffer at `offset` into `out`, invalidating first if required.
    pub fn read(&self, device: &ash::Device, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        let (allocation, ptr) = self.mapped()?;
        unsafe {
            if self.requires_flushing && !out.is_empty() {
                device.invalidate_mapped_memory_ranges(&[self.mapped_range(allocation, offset, out.len())])?;
            }
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Free the buffer and its memory. Does nothing for wrapped buffers.
    pub fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        if self.ownership == Ownership::Wrapped {
            return Ok(());
        }
        unsafe { gpu.device().destroy_buffer(self.buffer, None) };
        self.buffer = vk::Buffer::null();
        if let Some(allocation) = self.allocation.take() {
            gpu.allocator().lock().free(allocation)?;
        }
        Ok(())
    }
}

/// Expand `[start, start + len)` to whole multiples of `atom`.
///
/// `limit` is the end of the allocation in its memory object. When the
/// rounded end passes it the size becomes `VK_WHOLE_SIZE`, which stays
/// inside the mapping. Returns the aligned offset and size.
pub fn flush_range(
    start: vk::DeviceSize,
    len: vk::DeviceSize,
    atom: vk::DeviceSize,
    limit: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom.max(1);
    let begin = start / atom * atom;
    let end = (start + len).div_ceil(atom) * atom;
    if end > limit {
        (begin, vk::WHOLE_SIZE)
    } else {
        (begin, end - begin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_range_rounds_to_atoms() {
        assert_eq!(flush_range(0, 100, 64, 4096), (0, 128));
        assert_eq!(flush_range(0, 128, 64, 4096), (0, 128));
        assert_eq!(flush_range(70, 10, 64, 4096), (64, 64));
        assert_eq!(flush_range(60, 10, 64, 4096), (0, 128));
    }

    #[test]
    fn flush_range_stays_inside_the_allocation() {
        // A dedicated 100 byte allocation cannot be flushed up to 128.
        assert_eq!(flush_range(0, 100, 64, 100), (0, vk::WHOLE_SIZE));
        assert_eq!(flush_range(40, 20, 64, 100), (0, 64));
        assert_eq!(flush_range(70, 30, 64, 100), (64, vk::WHOLE_SIZE));
        // An exactly aligned end is kept.
        assert_eq!(flush_range(64, 64, 64, 128), (64, 64));
    }

    #[test]
    fn flush_range_tolerates_zero_atom() {
        assert_eq!(flush_range(5, 3, 0, 8), (5, 3));
    }

    #[test]
    fn wrapped_buffer_refuses_host_access() {
        let buffer = Buffer::wrap(vk::Buffer::null(), 256);
        assert!(buffer.requires_staging());
        assert_eq!(buffer.ownership(), Ownership::Wrapped);
        assert!(matches!(buffer.mapped(), Err(GpuError::StagingRequired(_))));
    }

    #[test]
    fn range_check_rejects_overflow() {
        let buffer = Buffer::wrap(vk::Buffer::null(), 16);
        assert!(buffer.check_range(8, 8).is_ok());
        assert!(matches!(
            buffer.check_range(8, 9),
            Err(GpuError::OutOfRange { end: 17, size: 16, .. })
        ));
    }

    #[test]
    fn desc_builder_defaults_to_exclusive_device_memory() {
        let desc = BufferDesc::new("vertices", 1024, vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(!desc.host_accessible);
        assert!(desc.queue_families.is_empty());
        let desc = desc.host_accessible().alignment(256).queue_families(&[0, 2]);
        assert!(desc.host_accessible);
        assert_eq!(desc.alignment, 256);
        assert_eq!(desc.queue_families.len(), 2);
    }
}
