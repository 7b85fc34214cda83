//! Capability-based physical device selection.
//!
//! Every candidate runs four independent checks (API version, extensions,
//! features, presentation). Survivors are scored by device-local memory with a
//! fixed bonus for the preferred device type, and the best one wins a stable
//! sort. Queue roles resolve to the least capable family that still covers
//! each requested capability mask.

use crate::capabilities::DeviceCandidate;
use crate::error::{GpuError, Result};
use crate::features::{FeatureSet, OptionalFeature};
use crate::queues::QueueRole;
use ash::vk;
use std::ffi::CStr;

/// Score bonus for devices matching the preferred type.
pub const PREFERRED_TYPE_BONUS: u64 = 1 << 63;

/// What a device must (and may) provide.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Minimum Vulkan major version.
    pub api_major: u32,
    /// Minimum Vulkan minor version; also bounds the feature chain depth.
    pub api_minor: u32,
    /// Device type that receives the scoring bonus.
    pub preferred_type: vk::PhysicalDeviceType,
    /// Extensions the device must support.
    pub required_extensions: Vec<&'static CStr>,
    /// Extensions enabled when available.
    pub optional_extensions: Vec<&'static CStr>,
    /// Feature flags the device must support.
    pub features: FeatureSet,
    /// Extension features enabled when their extension is enabled.
    pub optional_features: Vec<OptionalFeature>,
    /// Capability mask for each queue role, indexed by [`QueueRole::index`].
    pub queue_masks: [vk::QueueFlags; QueueRole::COUNT],
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            api_major: 1,
            api_minor: 0,
            preferred_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            required_extensions: Vec::new(),
            optional_extensions: Vec::new(),
            features: FeatureSet::default(),
            optional_features: Vec::new(),
            queue_masks: QueueRole::ALL.map(QueueRole::default_mask),
        }
    }
}

impl DeviceRequirements {
    /// Set the minimum API version.
    pub fn api_version(mut self, major: u32, minor: u32) -> Self {
        self.api_major = major;
        self.api_minor = minor;
        self
    }

    /// Set the preferred device type.
    pub fn prefer(mut self, device_type: vk::PhysicalDeviceType) -> Self {
        self.preferred_type = device_type;
        self
    }

    /// Add a mandatory extension.
    pub fn require_extension(mut self, name: &'static CStr) -> Self {
        self.required_extensions.push(name);
        self
    }

    /// Add an extension that is enabled when present.
    pub fn optional_extension(mut self, name: &'static CStr) -> Self {
        self.optional_extensions.push(name);
        self
    }

    /// Request an optional extension feature.
    ///
    /// Its guarding extension is added to the optional extensions.
    pub fn optional_feature(mut self, feature: OptionalFeature) -> Self {
        if !self.optional_extensions.contains(&feature.extension()) {
            self.optional_extensions.push(feature.extension());
        }
        self.optional_features.push(feature);
        self
    }

    /// Modify the mandatory feature set in place.
    pub fn features(mut self, f: impl FnOnce(&mut FeatureSet)) -> Self {
        f(&mut self.features);
        self
    }

    /// Override the capability mask of a queue role.
    pub fn queue_mask(mut self, role: QueueRole, mask: vk::QueueFlags) -> Self {
        self.queue_masks[role.index()] = mask;
        self
    }

    /// The minimum API version packed as a Vulkan version number.
    pub fn packed_version(&self) -> u32 {
        vk::make_api_version(0, self.api_major, self.api_minor, 0)
    }
}

/// The outcome of a successful selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Index of the winning candidate in the input slice.
    pub candidate: usize,
    /// Queue family resolved for each role, indexed by [`QueueRole::index`].
    pub queue_families: [u32; QueueRole::COUNT],
}

/// Resolve each capability mask to the family with the fewest capability bits
/// that still contains it. Ties go to the lower family index.
///
/// Returns `None` if any mask cannot be satisfied.
pub fn resolve_queue_families(
    families: &[vk::QueueFlags],
    masks: &[vk::QueueFlags; QueueRole::COUNT],
) -> Option<[u32; QueueRole::COUNT]> {
    let mut resolved = [0; QueueRole::COUNT];
    for (slot, &mask) in resolved.iter_mut().zip(masks) {
        let (index, _) = families
            .iter()
            .enumerate()
            .filter(|(_, flags)| flags.contains(mask))
            .min_by_key(|(_, flags)| flags.as_raw().count_ones())?;
        *slot = u32::try_from(index).ok()?;
    }
    Some(resolved)
}

/// Selection score: summed device-local memory plus the preferred type bonus.
pub fn score(candidate: &DeviceCandidate, preferred: vk::PhysicalDeviceType) -> u64 {
    let bonus = if candidate.device_type == preferred {
        PREFERRED_TYPE_BONUS
    } else {
        0
    };
    candidate.device_local_memory().saturating_add(bonus)
}

/// Run every check against one candidate, collecting what is missing.
fn check<F>(
    candidate: &DeviceCandidate,
    requirements: &DeviceRequirements,
    presentable: Option<&F>,
) -> (Vec<String>, Option<[u32; QueueRole::COUNT]>)
where
    F: Fn(&DeviceCandidate, u32) -> bool,
{
    let mut missing = Vec::new();

    if candidate.api_version < requirements.packed_version() {
        missing.push(format!(
            "Vulkan {}.{} support",
            requirements.api_major, requirements.api_minor
        ));
    }

    for ext in &requirements.required_extensions {
        if !candidate.has_extension(ext) {
            missing.push(format!("device extension {}", ext.to_string_lossy()));
        }
    }

    missing.extend(requirements.features.missing_from(&candidate.features));

    let families = resolve_queue_families(&candidate.queue_families, &requirements.queue_masks);
    match (families, presentable) {
        (None, _) => missing.push("queue families for every requested role".to_string()),
        (Some(families), Some(presentable)) => {
            if !families.iter().any(|&family| presentable(candidate, family)) {
                missing.push("presentation capabilities".to_string());
            }
        }
        (Some(_), None) => {}
    }

    (missing, families)
}

/// Pick the best candidate meeting `requirements`.
///
/// `presentable` answers whether a queue family can present to the target
/// surface; pass `None` when no surface is involved.
pub fn select<F>(
    candidates: &[DeviceCandidate],
    requirements: &DeviceRequirements,
    presentable: Option<&F>,
) -> Result<Selection>
where
    F: Fn(&DeviceCandidate, u32) -> bool,
{
    let mut passing = Vec::new();
    let mut report = String::new();

    tracing::info!("Available devices:");
    for (index, candidate) in candidates.iter().enumerate() {
        let (missing, families) = check(candidate, requirements, presentable);
        for item in &missing {
            tracing::info!("\tMissing {item}");
        }
        match families {
            Some(families) if missing.is_empty() => {
                tracing::info!("-> passed: {}", candidate.name);
                passing.push((index, families, score(candidate, requirements.preferred_type)));
            }
            _ => {
                tracing::info!("-> failed: {}", candidate.name);
                report.push_str(&format!("{}: missing {}\n", candidate.name, missing.join(", ")));
            }
        }
    }

    if candidates.is_empty() {
        report.push_str("no device with Vulkan support found\n");
    }

    // Stable: equal scores keep enumeration order.
    passing.sort_by(|a, b| b.2.cmp(&a.2));
    let (candidate, queue_families, _) = passing
        .first()
        .copied()
        .ok_or(GpuError::NoSuitableDevice(report))?;

    tracing::info!("Picked device: {}", candidates[candidate].name);
    Ok(Selection {
        candidate,
        queue_families,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GpuVendor;
    use std::collections::HashSet;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    fn all(flags: &[vk::QueueFlags]) -> vk::QueueFlags {
        flags.iter().fold(vk::QueueFlags::empty(), |acc, &f| acc | f)
    }

    fn candidate(name: &str, device_type: vk::PhysicalDeviceType, heap_gb: u64) -> DeviceCandidate {
        let mut features = FeatureSet::default();
        features.vk13.synchronization2 = vk::TRUE;
        features.vk13.dynamic_rendering = vk::TRUE;
        DeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            vendor: GpuVendor::Other(0),
            device_type,
            api_version: vk::API_VERSION_1_3,
            extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
            features,
            queue_families: vec![all(&[G, C, T]), all(&[C, T]), T],
            device_local_heaps: vec![heap_gb << 30],
            non_coherent_atom_size: 64,
        }
    }

    fn requirements() -> DeviceRequirements {
        DeviceRequirements::default()
            .api_version(1, 3)
            .require_extension(ash::khr::swapchain::NAME)
            .features(|f| f.vk13.synchronization2 = vk::TRUE)
    }

    type Presentable = fn(&DeviceCandidate, u32) -> bool;

    #[test]
    fn queue_roles_use_least_capable_family() {
        let families = [all(&[G, C, T]), all(&[C, T]), T];
        let masks = QueueRole::ALL.map(QueueRole::default_mask);
        let resolved = resolve_queue_families(&families, &masks).unwrap();
        assert_eq!(resolved, [0, 0, 1, 2]);
    }

    #[test]
    fn queue_roles_alias_universal_without_dedicated_families() {
        let families = [all(&[G, C, T])];
        let masks = QueueRole::ALL.map(QueueRole::default_mask);
        assert_eq!(resolve_queue_families(&families, &masks), Some([0, 0, 0, 0]));
    }

    #[test]
    fn queue_resolution_is_deterministic_on_ties() {
        let families = [all(&[G, C, T]), all(&[C, T]), all(&[C, T]), T, T];
        let masks = QueueRole::ALL.map(QueueRole::default_mask);
        let first = resolve_queue_families(&families, &masks);
        for _ in 0..8 {
            assert_eq!(resolve_queue_families(&families, &masks), first);
        }
        assert_eq!(first, Some([0, 0, 1, 3]));
    }

    #[test]
    fn unsatisfiable_mask_fails() {
        let families = [all(&[C, T])];
        let masks = QueueRole::ALL.map(QueueRole::default_mask);
        assert_eq!(resolve_queue_families(&families, &masks), None);
    }

    #[test]
    fn preferred_type_outranks_memory() {
        let candidates = [
            candidate("discrete", vk::PhysicalDeviceType::DISCRETE_GPU, 16),
            candidate("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, 2),
        ];
        let req = requirements().prefer(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let selection = select::<Presentable>(&candidates, &req, None).unwrap();
        assert_eq!(selection.candidate, 1);
    }

    #[test]
    fn larger_memory_wins_among_equals() {
        let candidates = [
            candidate("small", vk::PhysicalDeviceType::DISCRETE_GPU, 4),
            candidate("large", vk::PhysicalDeviceType::DISCRETE_GPU, 8),
        ];
        let selection = select::<Presentable>(&candidates, &requirements(), None).unwrap();
        assert_eq!(selection.candidate, 1);
        assert_eq!(selection.queue_families, [0, 0, 1, 2]);
    }

    #[test]
    fn equal_scores_keep_enumeration_order() {
        let candidates = [
            candidate("first", vk::PhysicalDeviceType::DISCRETE_GPU, 8),
            candidate("second", vk::PhysicalDeviceType::DISCRETE_GPU, 8),
        ];
        let selection = select::<Presentable>(&candidates, &requirements(), None).unwrap();
        assert_eq!(selection.candidate, 0);
    }

    #[test]
    fn each_check_rejects_independently() {
        let mut old = candidate("old", vk::PhysicalDeviceType::DISCRETE_GPU, 32);
        old.api_version = vk::API_VERSION_1_1;
        let mut no_ext = candidate("no-ext", vk::PhysicalDeviceType::DISCRETE_GPU, 32);
        no_ext.extensions.clear();
        let mut no_feat = candidate("no-feat", vk::PhysicalDeviceType::DISCRETE_GPU, 32);
        no_feat.features.vk13.synchronization2 = vk::FALSE;
        let ok = candidate("ok", vk::PhysicalDeviceType::DISCRETE_GPU, 1);

        let candidates = [old, no_ext, no_feat, ok];
        let selection = select::<Presentable>(&candidates, &requirements(), None).unwrap();
        assert_eq!(selection.candidate, 3);
    }

    #[test]
    fn presentation_check_uses_resolved_families() {
        let candidates = [
            candidate("headless", vk::PhysicalDeviceType::DISCRETE_GPU, 32),
            candidate("display", vk::PhysicalDeviceType::DISCRETE_GPU, 1),
        ];
        let presentable = |c: &DeviceCandidate, family: u32| c.name == "display" && family == 0;
        let selection = select(&candidates, &requirements(), Some(&presentable)).unwrap();
        assert_eq!(selection.candidate, 1);
    }

    #[test]
    fn no_match_reports_every_device() {
        let mut a = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 1);
        a.api_version = vk::API_VERSION_1_0;
        let mut b = candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU, 1);
        b.extensions.clear();

        let err = select::<Presentable>(&[a, b], &requirements(), None).unwrap_err();
        match err {
            GpuError::NoSuitableDevice(report) => {
                assert!(report.contains("a: missing Vulkan 1.3"));
                assert!(report.contains("b: missing device extension VK_KHR_swapchain"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn selected_device_meets_every_check() {
        let candidates = [
            candidate("one", vk::PhysicalDeviceType::DISCRETE_GPU, 2),
            candidate("two", vk::PhysicalDeviceType::INTEGRATED_GPU, 4),
        ];
        let req = requirements();
        let selection = select::<Presentable>(&candidates, &req, None).unwrap();
        let chosen = &candidates[selection.candidate];
        assert!(chosen.api_version >= req.packed_version());
        assert!(req.required_extensions.iter().all(|e| chosen.has_extension(e)));
        assert!(req.features.missing_from(&chosen.features).is_empty());
    }

    #[test]
    fn optional_feature_adds_guarding_extension() {
        let req = DeviceRequirements::default()
            .optional_feature(OptionalFeature::Maintenance5)
            .optional_feature(OptionalFeature::Maintenance5);
        assert_eq!(req.optional_extensions, vec![ash::khr::maintenance5::NAME]);
    }
}
