//! Device feature sets.
//!
//! Feature structs are compared structurally: every `Bool32` field that is set
//! in the required struct must also be set in the available one. Optional
//! features are a closed list of kinds, each guarded by the extension that
//! introduces it, and are spliced into the device creation chain internally.

use ash::vk;
use std::ffi::CStr;
use std::mem::{offset_of, size_of};

/// Access to the contiguous run of `Bool32` flags inside a Vulkan feature struct.
pub trait FeatureFlags {
    /// Short label used in diagnostics.
    const LABEL: &'static str;

    /// All boolean feature fields, in declaration order.
    fn flags(&self) -> &[vk::Bool32];
}

/// Slice `count` consecutive `Bool32` fields starting at byte offset `first`.
///
/// # Safety
/// `first..first + count * 4` must lie inside `T` and contain only `Bool32` fields.
unsafe fn bool_run<T>(value: &T, first: usize, count: usize) -> &[vk::Bool32] {
    let base = (value as *const T).cast::<u8>().add(first).cast::<vk::Bool32>();
    std::slice::from_raw_parts(base, count)
}

macro_rules! feature_flags {
    ($ty:ty, $label:literal, $first:ident, $last:ident) => {
        impl FeatureFlags for $ty {
            const LABEL: &'static str = $label;

            fn flags(&self) -> &[vk::Bool32] {
                let first = offset_of!(Self, $first);
                let last = offset_of!(Self, $last);
                let count = (last - first) / size_of::<vk::Bool32>() + 1;
                // SAFETY: the range spans declared Bool32 fields of the struct only.
                unsafe { bool_run(self, first, count) }
            }
        }
    };
}

feature_flags!(
    vk::PhysicalDeviceFeatures,
    "core",
    robust_buffer_access,
    inherited_queries
);
feature_flags!(
    vk::PhysicalDeviceVulkan11Features<'_>,
    "vulkan 1.1",
    storage_buffer16_bit_access,
    shader_draw_parameters
);
feature_flags!(
    vk::PhysicalDeviceVulkan12Features<'_>,
    "vulkan 1.2",
    sampler_mirror_clamp_to_edge,
    subgroup_broadcast_dynamic_id
);
feature_flags!(
    vk::PhysicalDeviceVulkan13Features<'_>,
    "vulkan 1.3",
    robust_image_access,
    maintenance4
);

/// Indices of flags required but not available.
pub fn missing_flags<T: FeatureFlags>(required: &T, available: &T) -> Vec<usize> {
    required
        .flags()
        .iter()
        .zip(available.flags())
        .enumerate()
        .filter(|(_, (&req, &avail))| req == vk::TRUE && avail != vk::TRUE)
        .map(|(i, _)| i)
        .collect()
}

/// Core and per-version feature structs for one device.
///
/// The `p_next` pointers are always null while stored here; chains are only
/// built transiently when querying or creating a device.
#[derive(Clone, Copy, Default)]
pub struct FeatureSet {
    pub core: vk::PhysicalDeviceFeatures,
    pub vk11: vk::PhysicalDeviceVulkan11Features<'static>,
    pub vk12: vk::PhysicalDeviceVulkan12Features<'static>,
    pub vk13: vk::PhysicalDeviceVulkan13Features<'static>,
}

impl FeatureSet {
    /// Collect queried structs, clearing any chain pointers left by the query.
    pub fn from_parts(
        core: vk::PhysicalDeviceFeatures,
        mut vk11: vk::PhysicalDeviceVulkan11Features<'static>,
        mut vk12: vk::PhysicalDeviceVulkan12Features<'static>,
        mut vk13: vk::PhysicalDeviceVulkan13Features<'static>,
    ) -> Self {
        vk11.p_next = std::ptr::null_mut();
        vk12.p_next = std::ptr::null_mut();
        vk13.p_next = std::ptr::null_mut();
        Self {
            core,
            vk11,
            vk12,
            vk13,
        }
    }

    /// Describe every required flag missing from `available`.
    ///
    /// An empty result means `available` satisfies `self`.
    pub fn missing_from(&self, available: &Self) -> Vec<String> {
        let mut missing = Vec::new();
        describe(&mut missing, &self.core, &available.core);
        describe(&mut missing, &self.vk11, &available.vk11);
        describe(&mut missing, &self.vk12, &available.vk12);
        describe(&mut missing, &self.vk13, &available.vk13);
        missing
    }
}

fn describe<T: FeatureFlags>(out: &mut Vec<String>, required: &T, available: &T) {
    out.extend(
        missing_flags(required, available)
            .into_iter()
            .map(|i| format!("{} feature #{i}", T::LABEL)),
    );
}

impl std::fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = |flags: &[vk::Bool32]| flags.iter().filter(|&&b| b == vk::TRUE).count();
        f.debug_struct("FeatureSet")
            .field("core", &count(self.core.flags()))
            .field("vk11", &count(self.vk11.flags()))
            .field("vk12", &count(self.vk12.flags()))
            .field("vk13", &count(self.vk13.flags()))
            .finish()
    }
}

/// Extension features that are enabled only when their extension is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalFeature {
    /// `VK_KHR_maintenance5`, also enabling inline shader module creation.
    Maintenance5,
    /// `VK_EXT_memory_priority`.
    MemoryPriority,
    /// `VK_EXT_pageable_device_local_memory`.
    PageableDeviceLocalMemory,
}

impl OptionalFeature {
    /// The extension that must be enabled for this feature to be requested.
    pub fn extension(self) -> &'static CStr {
        match self {
            Self::Maintenance5 => ash::khr::maintenance5::NAME,
            Self::MemoryPriority => ash::ext::memory_priority::NAME,
            Self::PageableDeviceLocalMemory => ash::ext::pageable_device_local_memory::NAME,
        }
    }
}

/// Storage for optional feature structs while a device create chain is alive.
#[derive(Default)]
pub(crate) struct OptionalFeatureChain {
    maintenance5: vk::PhysicalDeviceMaintenance5FeaturesKHR<'static>,
    memory_priority: vk::PhysicalDeviceMemoryPriorityFeaturesEXT<'static>,
    pageable: vk::PhysicalDevicePageableDeviceLocalMemoryFeaturesEXT<'static>,
}

impl OptionalFeatureChain {
    /// Append the structs for `enabled` features to `features2`.
    pub(crate) fn link<'a>(
        &'a mut self,
        mut features2: vk::PhysicalDeviceFeatures2<'a>,
        enabled: &[OptionalFeature],
    ) -> vk::PhysicalDeviceFeatures2<'a> {
        let Self {
            maintenance5,
            memory_priority,
            pageable,
        } = self;
        if enabled.contains(&OptionalFeature::Maintenance5) {
            maintenance5.maintenance5 = vk::TRUE;
            features2 = features2.push_next(maintenance5);
        }
        if enabled.contains(&OptionalFeature::MemoryPriority) {
            memory_priority.memory_priority = vk::TRUE;
            features2 = features2.push_next(memory_priority);
        }
        if enabled.contains(&OptionalFeature::PageableDeviceLocalMemory) {
            pageable.pageable_device_local_memory = vk::TRUE;
            features2 = features2.push_next(pageable);
        }
        features2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_flags_cover_whole_struct() {
        let features = vk::PhysicalDeviceFeatures::default();
        assert_eq!(
            features.flags().len(),
            size_of::<vk::PhysicalDeviceFeatures>() / size_of::<vk::Bool32>()
        );
    }

    #[test]
    fn flags_track_named_fields() {
        let features = vk::PhysicalDeviceVulkan13Features::default().maintenance4(true);
        assert_eq!(features.flags().last(), Some(&vk::TRUE));
        assert_eq!(features.flags()[0], vk::FALSE);

        let features = vk::PhysicalDeviceVulkan12Features::default().sampler_mirror_clamp_to_edge(true);
        assert_eq!(features.flags()[0], vk::TRUE);
    }

    #[test]
    fn required_subset_passes() {
        let mut required = FeatureSet::default();
        required.vk12.buffer_device_address = vk::TRUE;
        required.vk13.synchronization2 = vk::TRUE;

        let mut available = required;
        available.vk13.dynamic_rendering = vk::TRUE;
        available.core.sampler_anisotropy = vk::TRUE;

        assert!(required.missing_from(&available).is_empty());
    }

    #[test]
    fn missing_flag_is_reported() {
        let mut required = FeatureSet::default();
        required.vk13.dynamic_rendering = vk::TRUE;
        required.core.geometry_shader = vk::TRUE;

        let available = FeatureSet::default();
        let missing = required.missing_from(&available);
        assert_eq!(missing.len(), 2);
        assert!(missing[0].starts_with("core"));
        assert!(missing[1].starts_with("vulkan 1.3"));
    }

    #[test]
    fn unrequested_flags_are_ignored() {
        let required = FeatureSet::default();
        let mut available = FeatureSet::default();
        available.vk11.multiview = vk::TRUE;
        assert!(required.missing_from(&available).is_empty());
    }
}
