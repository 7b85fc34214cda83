//! GPU context management.

use crate::capabilities::DeviceCandidate;
use crate::command::{begin_one_time, end_command_buffer, submit};
use crate::error::{GpuError, Result};
use crate::features::{FeatureSet, OptionalFeature, OptionalFeatureChain};
use crate::instance::create_instance;
use crate::memory::GpuAllocator;
use crate::queues::{unique_families, Queue, QueueRole, Queues};
use crate::selector::{select, DeviceRequirements};
use crate::shader::ShaderModuleStrategy;
use crate::surface::SurfaceContext;
use crate::sync::{create_fence, wait_for_fence_forever};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Depth formats in order of preference.
pub const DEPTH_FORMATS: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// Depth-stencil formats in order of preference.
pub const DEPTH_STENCIL_FORMATS: [vk::Format; 3] = [
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// Depth attachment formats chosen for the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthFormats {
    /// `UNDEFINED` if no preferred format is supported.
    pub depth: vk::Format,
    /// `UNDEFINED` if no preferred format is supported.
    pub depth_stencil: vk::Format,
}

impl DepthFormats {
    /// Pick both formats from the preference lists.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let attachable = |format| {
            instance
                .get_physical_device_format_properties(physical_device, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        };
        Self {
            depth: first_supported(&DEPTH_FORMATS, attachable),
            depth_stencil: first_supported(&DEPTH_STENCIL_FORMATS, attachable),
        }
    }
}

/// First format in `preference` accepted by `supported`, or `UNDEFINED`.
pub fn first_supported(preference: &[vk::Format], supported: impl Fn(vk::Format) -> bool) -> vk::Format {
    preference
        .iter()
        .copied()
        .find(|&format| supported(format))
        .unwrap_or(vk::Format::UNDEFINED)
}

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) candidate: DeviceCandidate,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) queues: Queues,
    pub(crate) depth_formats: DepthFormats,
    pub(crate) shader_modules: ShaderModuleStrategy,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Properties of the selected device.
    pub fn device_info(&self) -> &DeviceCandidate {
        &self.candidate
    }

    /// The queue serving `role`.
    pub fn queue(&self, role: QueueRole) -> &Queue {
        self.queues.get(role)
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Depth formats supported by the device.
    pub fn depth_formats(&self) -> DepthFormats {
        self.depth_formats
    }

    /// How shader code is handed to pipeline creation.
    pub fn shader_module_strategy(&self) -> ShaderModuleStrategy {
        self.shader_modules
    }

    /// Alignment for flushing non-coherent host memory.
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.candidate.non_coherent_atom_size
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Allocate a command buffer from the role's transient pool and begin
    /// recording it for a single submission.
    pub fn oneshot_begin(&self, role: QueueRole) -> Result<vk::CommandBuffer> {
        let pool = self.queues.get(role).transient_pool.lock();
        unsafe {
            let cmd = pool.allocate(&self.device)?;
            if let Err(e) = begin_one_time(&self.device, cmd) {
                pool.free(&self.device, cmd);
                return Err(e);
            }
            Ok(cmd)
        }
    }

    /// Finish a buffer from [`Self::oneshot_begin`], submit it and block
    /// until it has executed. The buffer is freed afterwards.
    ///
    /// Wait semaphores are waited at `ALL_COMMANDS`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn oneshot_end(
        &self,
        role: QueueRole,
        cmd: vk::CommandBuffer,
        wait: &[vk::Semaphore],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        let queue = self.queues.get(role);
        let result = unsafe { self.submit_and_wait(queue.handle, cmd, wait, signal) };
        unsafe { queue.transient_pool.lock().free(&self.device, cmd) };
        result
    }

    unsafe fn submit_and_wait(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        wait: &[vk::Semaphore],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        end_command_buffer(&self.device, cmd)?;
        let fence = create_fence(&self.device, false)?;
        let result = submit(
            &self.device,
            queue,
            cmd,
            wait,
            vk::PipelineStageFlags::ALL_COMMANDS,
            signal,
            fence,
        )
        .and_then(|()| wait_for_fence_forever(&self.device, fence));
        self.device.destroy_fence(fence, None);
        result
    }

    /// Record commands with `f` and execute them synchronously on `role`.
    pub fn oneshot<F>(&self, role: QueueRole, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.oneshot_begin(role)?;
        if let Err(e) = f(cmd) {
            unsafe {
                let _ = end_command_buffer(&self.device, cmd);
                self.queues.get(role).transient_pool.lock().free(&self.device, cmd);
            }
            return Err(e);
        }
        self.oneshot_end(role, cmd, &[], &[])
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.queues.destroy(&self.device);

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Requirements used unless the caller supplies its own.
///
/// Vulkan 1.3 with synchronization2 and dynamic rendering; maintenance5 and
/// memory priority when available.
pub fn default_requirements() -> DeviceRequirements {
    DeviceRequirements::default()
        .api_version(1, 3)
        .features(|f| {
            f.vk13.synchronization2 = vk::TRUE;
            f.vk13.dynamic_rendering = vk::TRUE;
        })
        .optional_feature(OptionalFeature::Maintenance5)
        .optional_feature(OptionalFeature::MemoryPriority)
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    requirements: DeviceRequirements,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cadence".to_string(),
            enable_validation: cfg!(debug_assertions),
            requirements: default_requirements(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Replace the device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Build a context without presentation support.
    pub fn build(self) -> Result<GpuContext> {
        let (gpu, _) = self.build_inner(None)?;
        Ok(gpu)
    }

    /// Build a context able to present to `window`.
    ///
    /// Only devices with a queue family that can present to the window's
    /// surface are considered.
    pub fn build_for_window<W>(mut self, window: &W) -> Result<(GpuContext, SurfaceContext)>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?
            .as_raw();

        if !self
            .requirements
            .required_extensions
            .contains(&ash::khr::swapchain::NAME)
        {
            self.requirements = self.requirements.require_extension(ash::khr::swapchain::NAME);
        }

        let (gpu, surface) = self.build_inner(Some((display, handle)))?;
        let surface =
            surface.ok_or_else(|| GpuError::SurfaceCreation("surface was not created".to_string()))?;
        Ok((gpu, surface))
    }

    fn build_inner(
        self,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<(GpuContext, Option<SurfaceContext>)> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.requirements.packed_version(),
                self.enable_validation,
                window.map(|(display, _)| display),
            )
        }?;

        let surface = match window {
            Some((display, handle)) => {
                match unsafe { SurfaceContext::create_surface(&entry, &instance, display, handle) } {
                    Ok(surface) => Some(surface),
                    Err(e) => {
                        unsafe { instance.destroy_instance(None) };
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let opened = match unsafe { self.open_device(&instance, surface.as_ref()) } {
            Ok(opened) => opened,
            Err(e) => {
                unsafe {
                    if let Some((surface, loader)) = &surface {
                        loader.destroy_surface(*surface, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let surface = surface.map(|(surface, surface_loader)| SurfaceContext {
            surface,
            surface_loader,
            swapchain_loader: ash::khr::swapchain::Device::new(&instance, &opened.device),
        });

        let gpu = GpuContext {
            entry,
            instance,
            physical_device: opened.candidate.handle,
            device: opened.device,
            candidate: opened.candidate,
            allocator: Mutex::new(opened.allocator),
            queues: opened.queues,
            depth_formats: opened.depth_formats,
            shader_modules: opened.shader_modules,
        };
        Ok((gpu, surface))
    }

    /// Select a device and create everything that hangs off it.
    ///
    /// # Safety
    /// The instance and surface must be valid.
    unsafe fn open_device(
        &self,
        instance: &ash::Instance,
        surface: Option<&(vk::SurfaceKHR, ash::khr::surface::Instance)>,
    ) -> Result<OpenedDevice> {
        let mut candidates: Vec<DeviceCandidate> = instance
            .enumerate_physical_devices()?
            .into_iter()
            .filter_map(|pd| match DeviceCandidate::query(instance, pd) {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    tracing::warn!("Skipping device that could not be queried: {e}");
                    None
                }
            })
            .collect();

        let presentable = surface.map(|(surface, loader)| {
            move |candidate: &DeviceCandidate, family: u32| {
                loader
                    .get_physical_device_surface_support(candidate.handle, family, *surface)
                    .unwrap_or(false)
            }
        });
        let selection = select(&candidates, &self.requirements, presentable.as_ref())?;
        let candidate = candidates.swap_remove(selection.candidate);
        tracing::info!("Selected GPU: {}", candidate.summary());

        let mut enabled_extensions = self.requirements.required_extensions.clone();
        for &ext in &self.requirements.optional_extensions {
            if enabled_extensions.contains(&ext) {
                continue;
            }
            if candidate.has_extension(ext) {
                enabled_extensions.push(ext);
            } else {
                tracing::debug!("Optional extension {} not available", ext.to_string_lossy());
            }
        }

        let optional_features: Vec<OptionalFeature> = self
            .requirements
            .optional_features
            .iter()
            .copied()
            .filter(|feature| enabled_extensions.contains(&feature.extension()))
            .collect();

        let device = create_device(
            instance,
            candidate.handle,
            &self.requirements,
            selection.queue_families,
            &enabled_extensions,
            &optional_features,
        )?;

        let queues = match Queues::new(&device, selection.queue_families) {
            Ok(queues) => queues,
            Err(e) => {
                device.destroy_device(None);
                return Err(e);
            }
        };
        let device = Arc::new(device);

        let buffer_device_address = self.requirements.features.vk12.buffer_device_address == vk::TRUE;
        let allocator =
            match GpuAllocator::new(instance, device.clone(), candidate.handle, buffer_device_address) {
                Ok(allocator) => allocator,
                Err(e) => {
                    queues.destroy(&device);
                    device.destroy_device(None);
                    return Err(e);
                }
            };

        let depth_formats = DepthFormats::query(instance, candidate.handle);
        let shader_modules =
            ShaderModuleStrategy::detect(optional_features.contains(&OptionalFeature::Maintenance5));
        tracing::debug!(
            "Depth formats {:?}, shader modules {:?}",
            depth_formats,
            shader_modules
        );

        Ok(OpenedDevice {
            candidate,
            device,
            allocator,
            queues,
            depth_formats,
            shader_modules,
        })
    }
}

struct OpenedDevice {
    candidate: DeviceCandidate,
    device: Arc<ash::Device>,
    allocator: GpuAllocator,
    queues: Queues,
    depth_formats: DepthFormats,
    shader_modules: ShaderModuleStrategy,
}

/// Number of per-version feature structs chained for a requested version.
fn chained_feature_levels(major: u32, minor: u32) -> u32 {
    if major > 1 {
        3
    } else {
        minor.min(3)
    }
}

/// Create the logical device with one queue per unique family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    requirements: &DeviceRequirements,
    queue_families: [u32; QueueRole::COUNT],
    extensions: &[&'static CStr],
    optional_features: &[OptionalFeature],
) -> Result<ash::Device> {
    let queue_priority = [1.0_f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families(&queue_families)
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priority)
        })
        .collect();

    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let FeatureSet {
        core,
        mut vk11,
        mut vk12,
        mut vk13,
    } = requirements.features;
    let levels = chained_feature_levels(requirements.api_major, requirements.api_minor);

    let mut optional_chain = OptionalFeatureChain::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(core);
    if levels >= 1 {
        features2 = features2.push_next(&mut vk11);
    }
    if levels >= 2 {
        features2 = features2.push_next(&mut vk12);
    }
    if levels >= 3 {
        features2 = features2.push_next(&mut vk13);
    }
    let mut features2 = optional_chain.link(features2, optional_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    tracing::info!(
        "Created device with {} queue(s), extensions: {:?}",
        queue_create_infos.len(),
        extensions
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_supported_follows_preference() {
        let supported = |f: vk::Format| f == vk::Format::D16_UNORM_S8_UINT || f == vk::Format::D32_SFLOAT_S8_UINT;
        assert_eq!(
            first_supported(&DEPTH_FORMATS, supported),
            vk::Format::D16_UNORM_S8_UINT
        );
        assert_eq!(
            first_supported(&DEPTH_STENCIL_FORMATS, |_| false),
            vk::Format::UNDEFINED
        );
    }

    #[test]
    fn depth_stencil_preferences_carry_stencil() {
        for format in DEPTH_STENCIL_FORMATS {
            assert!(format != vk::Format::D32_SFLOAT);
        }
    }

    #[test]
    fn feature_chain_truncates_to_minor_version() {
        assert_eq!(chained_feature_levels(1, 0), 0);
        assert_eq!(chained_feature_levels(1, 2), 2);
        assert_eq!(chained_feature_levels(1, 3), 3);
        assert_eq!(chained_feature_levels(1, 4), 3);
        assert_eq!(chained_feature_levels(2, 0), 3);
    }

    #[test]
    fn default_requirements_enable_optional_extensions() {
        let req = default_requirements();
        assert_eq!(req.api_major, 1);
        assert_eq!(req.api_minor, 3);
        assert!(req.optional_extensions.contains(&ash::khr::maintenance5::NAME));
        assert_eq!(req.features.vk13.synchronization2, vk::TRUE);
    }
}
