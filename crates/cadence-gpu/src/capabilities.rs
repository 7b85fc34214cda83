//! Physical device capability queries.

use crate::error::Result;
use crate::features::FeatureSet;
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Everything the selector needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    /// Physical device handle.
    pub handle: vk::PhysicalDevice,
    /// Device name
    pub name: String,
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Discrete, integrated, virtual, CPU or other.
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Available device extensions
    pub extensions: HashSet<String>,
    /// Supported core and per-version features.
    pub features: FeatureSet,
    /// Capability flags of each queue family, indexed by family.
    pub queue_families: Vec<vk::QueueFlags>,
    /// Sizes of heaps flagged DEVICE_LOCAL, in bytes.
    pub device_local_heaps: Vec<vk::DeviceSize>,
    /// Alignment for flushing non-coherent mapped memory.
    pub non_coherent_atom_size: vk::DeviceSize,
}

impl DeviceCandidate {
    /// Query a physical device.
    ///
    /// Per-version feature structs are only chained when the device reports
    /// an API version that defines them.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .filter_map(|name| name.to_str().ok().map(String::from))
            .collect();

        let api_version = properties.api_version;
        let mut vk11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
        let core = {
            let mut features2 = vk::PhysicalDeviceFeatures2::default();
            if api_version >= vk::API_VERSION_1_2 {
                features2 = features2.push_next(&mut vk11).push_next(&mut vk12);
            }
            if api_version >= vk::API_VERSION_1_3 {
                features2 = features2.push_next(&mut vk13);
            }
            instance.get_physical_device_features2(physical_device, &mut features2);
            features2.features
        };

        let queue_families = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .map(|family| family.queue_flags)
            .collect();

        let device_local_heaps = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .collect();

        let name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            handle: physical_device,
            name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_type: properties.device_type,
            api_version,
            extensions,
            features: FeatureSet::from_parts(core, vk11, vk12, vk13),
            queue_families,
            device_local_heaps,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
        })
    }

    /// Total size of device-local heaps.
    pub fn device_local_memory(&self) -> vk::DeviceSize {
        self.device_local_heaps
            .iter()
            .fold(0, |sum, &size| sum.saturating_add(size))
    }

    /// Whether an extension is advertised.
    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .is_ok_and(|name| self.extensions.contains(name))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB device-local",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory() / (1024 * 1024),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Other(0x5143));
    }

    #[test]
    fn device_local_memory_saturates() {
        let candidate = DeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: "big".into(),
            vendor: GpuVendor::Other(0),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_3,
            extensions: HashSet::new(),
            features: FeatureSet::default(),
            queue_families: vec![],
            device_local_heaps: vec![u64::MAX, 1 << 30],
            non_coherent_atom_size: 64,
        };
        assert_eq!(candidate.device_local_memory(), u64::MAX);
    }
}
