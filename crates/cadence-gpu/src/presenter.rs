//! Frame pacing and presentation.
//!
//! [`Presenter`] owns the swapchain and one [`FrameSlot`] per surface image.
//! Each [`Presenter::present`] call takes the next slot in rotation, waits for
//! its previous submission, blits the caller's image onto the acquired surface
//! image and presents it. Resize conditions never surface as errors: they set
//! [`Presenter::resize_requested`] and the caller rebuilds with
//! [`Presenter::resize`].

use crate::command::{begin_one_time, end_command_buffer, submit};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::queues::QueueRole;
use crate::state::ResourceState;
use crate::surface::SurfaceContext;
use crate::swapchain::{
    calculate_extent, select_present_mode, select_surface_format, srgb_required, Swapchain,
};
use crate::sync::{reset_fence, wait_for_fence_forever, FrameSlot, SlotRing};
use ash::prelude::VkResult;
use ash::vk;
use std::time::{Duration, Instant};

/// Limits how often frames are presented.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl FramePacer {
    /// A pacer targeting `fps` frames per second; 0 means unlimited.
    pub fn new(fps: u32) -> Self {
        let mut pacer = Self::default();
        pacer.set_target_framerate(fps);
        pacer
    }

    /// Change the target; 0 means unlimited.
    pub fn set_target_framerate(&mut self, fps: u32) {
        self.interval = (fps > 0).then(|| Duration::from_nanos(1_000_000_000 / u64::from(fps)));
    }

    /// Minimum spacing between presents, if limited.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Time left until the next present is due.
    pub fn remaining(&self, now: Instant) -> Duration {
        match (self.interval, self.last) {
            (Some(interval), Some(last)) => interval.saturating_sub(now.saturating_duration_since(last)),
            _ => Duration::ZERO,
        }
    }

    /// Sleep until the next present is due and stamp the present time.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn pace(&mut self) {
        let remaining = self.remaining(Instant::now());
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        self.last = Some(Instant::now());
    }
}

/// What happened to a frame handed to [`Presenter::present`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The frame reached the surface.
    Presented,
    /// The frame reached the surface but the swapchain should be rebuilt.
    Suboptimal,
    /// The frame was dropped; a rebuild has been requested or an error logged.
    Skipped,
}

/// Presentation settings.
#[derive(Debug, Clone, Copy)]
pub struct PresenterConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Frames per second; 0 means unlimited.
    pub target_fps: u32,
}

/// Stage at which the blit waits for the acquired surface image and for the
/// caller's `signal_in`.
pub const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

/// Tracked state of a surface image as handed back by acquisition.
///
/// The stage matches [`ACQUIRE_WAIT_STAGE`] so the first barrier on the
/// image chains onto the acquire semaphore wait.
pub const ACQUIRED_STATE: ResourceState = ResourceState::new(
    vk::PipelineStageFlags2::TRANSFER,
    vk::AccessFlags2::NONE,
    vk::ImageLayout::UNDEFINED,
);

/// Result of asking the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
    Failed(vk::Result),
}

impl Acquired {
    fn requests_resize(self) -> bool {
        matches!(self, Self::OutOfDate | Self::Image { suboptimal: true, .. })
    }
}

fn classify_acquire(result: VkResult<(u32, bool)>) -> Acquired {
    match result {
        Ok((index, suboptimal)) => Acquired::Image { index, suboptimal },
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Acquired::OutOfDate,
        Err(e) => Acquired::Failed(e),
    }
}

/// Outcome of a present call. Anything but `Presented` asks for a rebuild.
fn classify_present(result: VkResult<bool>, acquired_suboptimal: bool) -> PresentOutcome {
    match result {
        Ok(false) if !acquired_suboptimal => PresentOutcome::Presented,
        Ok(_) => PresentOutcome::Suboptimal,
        Err(_) => PresentOutcome::Skipped,
    }
}

/// A swapchain with one frame slot per image and the rotation over them.
struct SurfaceFrames {
    swapchain: Swapchain,
    slots: Vec<FrameSlot>,
    ring: SlotRing,
}

impl SurfaceFrames {
    fn new(swapchain: Swapchain, slots: Vec<FrameSlot>) -> Self {
        Self {
            ring: SlotRing::new(slots.len()),
            swapchain,
            slots,
        }
    }

    /// Index of the slot for the next frame.
    fn advance(&mut self) -> Result<usize> {
        if self.slots.is_empty() {
            return Err(GpuError::InvalidState(
                "Presenter has no frame slots".to_string(),
            ));
        }
        Ok(self.ring.advance())
    }

    unsafe fn destroy(&mut self, device: &ash::Device, swapchain_loader: &ash::khr::swapchain::Device) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
        self.ring = SlotRing::new(0);
        self.swapchain.destroy(swapchain_loader);
    }
}

/// Swapchain, frame slots and pacing for one window.
pub struct Presenter {
    surface: SurfaceContext,
    frames: SurfaceFrames,
    pacer: FramePacer,
    present_role: QueueRole,
    vsync: bool,
    srgb_required: bool,
    resize_requested: bool,
}

impl Presenter {
    /// Create the swapchain and frame slots for `surface`.
    pub fn new(gpu: &GpuContext, surface: SurfaceContext, config: PresenterConfig) -> Result<Self> {
        let built = find_present_role(gpu, &surface).and_then(|role| {
            let (swapchain, slots) = build(
                gpu,
                &surface,
                config.width,
                config.height,
                config.vsync,
                vk::SwapchainKHR::null(),
            )?;
            Ok((role, swapchain, slots))
        });
        let (present_role, swapchain, slots) = match built {
            Ok(built) => built,
            Err(e) => {
                unsafe { surface.destroy() };
                return Err(e);
            }
        };

        Ok(Self {
            srgb_required: srgb_required(swapchain.format.format),
            surface,
            frames: SurfaceFrames::new(swapchain, slots),
            pacer: FramePacer::new(config.target_fps),
            present_role,
            vsync: config.vsync,
            resize_requested: false,
        })
    }

    /// Change the pacing target; 0 means unlimited.
    pub fn set_target_framerate(&mut self, fps: u32) {
        self.pacer.set_target_framerate(fps);
    }

    /// Whether the swapchain should be rebuilt before the next frame.
    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    /// Ask for a rebuild, for example after the window was resized.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.frames.swapchain.extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.frames.swapchain.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.frames.swapchain.present_mode
    }

    /// Whether the surface format lacks hardware sRGB encoding.
    pub fn srgb_required(&self) -> bool {
        self.srgb_required
    }

    /// Number of surface images and frame slots.
    pub fn image_count(&self) -> usize {
        self.frames.slots.len()
    }

    /// Blit `src` onto the next surface image and present it.
    ///
    /// The copy waits on `signal_in` and signals `signal_out` when it has
    /// finished reading `src`; either may be null. A skipped frame still
    /// consumes `signal_in` and signals `signal_out`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(
        &mut self,
        gpu: &GpuContext,
        src: &mut Image,
        signal_in: vk::Semaphore,
        signal_out: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let device = gpu.device();
        let queue = gpu.queue(QueueRole::Universal).handle;
        let slot_index = self.frames.advance()?;
        let slot = &self.frames.slots[slot_index];

        // Acquire
        unsafe { wait_for_fence_forever(device, slot.ready_to_record)? };
        let acquired = classify_acquire(unsafe {
            self.frames
                .swapchain
                .acquire_next_image(&self.surface.swapchain_loader, slot.ready_to_write)
        });
        if acquired.requests_resize() {
            self.resize_requested = true;
        }
        let (image_index, suboptimal) = match acquired {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                unsafe { forward_signal(device, queue, signal_in, signal_out)? };
                return Ok(PresentOutcome::Skipped);
            }
            Acquired::Failed(e) => {
                tracing::error!("Failed to acquire surface image: {e}");
                unsafe { forward_signal(device, queue, signal_in, signal_out)? };
                return Ok(PresentOutcome::Skipped);
            }
        };

        // Record
        let cmd = slot.cmd;
        unsafe {
            reset_fence(device, slot.ready_to_record)?;
            slot.pool.reset(device)?;
            begin_one_time(device, cmd)?;
        }
        let target = self
            .frames
            .swapchain
            .images
            .get_mut(image_index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("Surface image {image_index} out of range")))?;
        target.assume_state(ACQUIRED_STATE);
        src.transition(
            device,
            cmd,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::BLIT,
            vk::AccessFlags2::TRANSFER_READ,
        );
        target.transition(
            device,
            cmd,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::BLIT,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        target.blit(device, cmd, src);
        target.transition(
            device,
            cmd,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        );

        // Submit
        let waits = non_null(&[signal_in, slot.ready_to_write]);
        let signals = non_null(&[signal_out, slot.ready_to_read]);
        unsafe {
            end_command_buffer(device, cmd)?;
            submit(
                device,
                queue,
                cmd,
                &waits,
                ACQUIRE_WAIT_STAGE,
                &signals,
                slot.ready_to_record,
            )?;
        }

        // Present
        self.pacer.pace();
        let present_queue = gpu.queue(self.present_role).handle;
        let presented = unsafe {
            self.frames.swapchain.present(
                &self.surface.swapchain_loader,
                present_queue,
                image_index,
                &[slot.ready_to_read],
            )
        };
        if let Err(e) = presented {
            if e != vk::Result::ERROR_OUT_OF_DATE_KHR {
                tracing::warn!("Present failed: {e}");
            }
        }
        let outcome = classify_present(presented, suboptimal);
        if outcome != PresentOutcome::Presented {
            self.resize_requested = true;
        }
        Ok(outcome)
    }

    /// Rebuild the swapchain and every frame slot at the given size.
    ///
    /// A zero-sized window keeps the request pending. If the rebuild fails
    /// the previous swapchain and slots stay in place and the request stays
    /// pending.
    pub fn resize(&mut self, gpu: &GpuContext, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            self.resize_requested = true;
            return Ok(());
        }
        gpu.wait_idle()?;

        let built = build(
            gpu,
            &self.surface,
            width,
            height,
            self.vsync,
            self.frames.swapchain.swapchain,
        );
        let (swapchain, slots) = match built {
            Ok(built) => built,
            Err(e) => {
                self.resize_requested = true;
                return Err(e);
            }
        };

        let mut old = std::mem::replace(&mut self.frames, SurfaceFrames::new(swapchain, slots));
        unsafe { old.destroy(gpu.device(), &self.surface.swapchain_loader) };

        self.srgb_required = srgb_required(self.frames.swapchain.format.format);
        self.resize_requested = false;
        Ok(())
    }

    /// Destroy slots, swapchain and surface.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        let _ = gpu.wait_idle();
        unsafe {
            self.frames
                .destroy(gpu.device(), &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}

/// Create a swapchain and one frame slot per surface image.
fn build(
    gpu: &GpuContext,
    surface: &SurfaceContext,
    width: u32,
    height: u32,
    vsync: bool,
    old_swapchain: vk::SwapchainKHR,
) -> Result<(Swapchain, Vec<FrameSlot>)> {
    let caps = surface.capabilities(gpu)?;
    let format = select_surface_format(&caps.formats)
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))?;
    let present_mode = select_present_mode(&caps.present_modes, vsync);
    let extent = calculate_extent(&caps.capabilities, width, height);

    let mut swapchain = unsafe {
        Swapchain::new(
            &surface.swapchain_loader,
            surface.surface,
            &caps.capabilities,
            format,
            present_mode,
            extent,
            old_swapchain,
        )
    }?;

    tracing::info!(
        "Surface: {:?} {:?}, {:?}, {}x{}, {} images",
        format.format,
        format.color_space,
        present_mode,
        extent.width,
        extent.height,
        swapchain.images.len()
    );

    let device = gpu.device();
    let family = gpu.queue(QueueRole::Universal).family;
    let mut slots = Vec::with_capacity(swapchain.images.len());
    for _ in 0..swapchain.images.len() {
        match unsafe { FrameSlot::new(device, family) } {
            Ok(slot) => slots.push(slot),
            Err(e) => unsafe {
                for slot in slots.drain(..) {
                    slot.destroy(device);
                }
                swapchain.destroy(&surface.swapchain_loader);
                return Err(e);
            },
        }
    }
    Ok((swapchain, slots))
}

/// The first role whose family can present to the surface.
fn find_present_role(gpu: &GpuContext, surface: &SurfaceContext) -> Result<QueueRole> {
    for role in QueueRole::ALL {
        let family = gpu.queue(role).family;
        let supported = unsafe {
            surface.surface_loader.get_physical_device_surface_support(
                gpu.physical_device(),
                family,
                surface.surface,
            )?
        };
        if supported {
            if role != QueueRole::Universal {
                tracing::warn!("Presenting on the {role:?} queue, family {family}");
            }
            return Ok(role);
        }
    }
    Err(GpuError::SurfaceCreation(
        "no acquired queue can present to the surface".to_string(),
    ))
}

/// Keep the caller's semaphore chain intact for a dropped frame.
unsafe fn forward_signal(
    device: &ash::Device,
    queue: vk::Queue,
    signal_in: vk::Semaphore,
    signal_out: vk::Semaphore,
) -> Result<()> {
    if signal_in == vk::Semaphore::null() && signal_out == vk::Semaphore::null() {
        return Ok(());
    }
    let waits = non_null(&[signal_in]);
    let signals = non_null(&[signal_out]);
    let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&waits)
        .wait_dst_stage_mask(&stages)
        .signal_semaphores(&signals);
    device.queue_submit(queue, &[submit_info], vk::Fence::null())?;
    Ok(())
}

fn non_null(semaphores: &[vk::Semaphore]) -> Vec<vk::Semaphore> {
    semaphores
        .iter()
        .copied()
        .filter(|&s| s != vk::Semaphore::null())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::state::{full_range, image_barrier};

    #[test]
    fn zero_fps_is_unlimited() {
        let mut pacer = FramePacer::new(0);
        assert!(pacer.interval().is_none());
        pacer.last = Some(Instant::now());
        assert_eq!(pacer.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn interval_is_one_second_over_fps() {
        let pacer = FramePacer::new(30);
        assert_eq!(pacer.interval(), Some(Duration::from_nanos(33_333_333)));
        let pacer = FramePacer::new(144);
        assert_eq!(pacer.interval(), Some(Duration::from_nanos(6_944_444)));
    }

    #[test]
    fn remaining_counts_from_last_present() {
        let mut pacer = FramePacer::new(10);
        let start = Instant::now();
        assert_eq!(pacer.remaining(start), Duration::ZERO);

        pacer.last = Some(start);
        assert_eq!(
            pacer.remaining(start + Duration::from_millis(40)),
            Duration::from_millis(60)
        );
        assert_eq!(
            pacer.remaining(start + Duration::from_millis(250)),
            Duration::ZERO
        );
    }

    #[test]
    fn thirty_fps_spaces_presents() {
        let mut pacer = FramePacer::new(30);
        pacer.pace();
        let mut stamps = Vec::new();
        for _ in 0..3 {
            pacer.pace();
            stamps.push(Instant::now());
        }
        for pair in stamps.windows(2) {
            let spacing = pair[1] - pair[0];
            assert!(spacing >= Duration::from_millis(33), "spacing {spacing:?}");
        }
    }

    #[test]
    fn out_of_date_acquire_skips_and_requests_resize() {
        let acquired = classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(acquired, Acquired::OutOfDate);
        assert!(acquired.requests_resize());
    }

    #[test]
    fn suboptimal_acquire_continues_and_requests_resize() {
        let acquired = classify_acquire(Ok((2, true)));
        assert_eq!(
            acquired,
            Acquired::Image {
                index: 2,
                suboptimal: true
            }
        );
        assert!(acquired.requests_resize());

        let acquired = classify_acquire(Ok((0, false)));
        assert!(!acquired.requests_resize());
    }

    #[test]
    fn failed_acquire_is_logged_not_resized() {
        let acquired = classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(acquired, Acquired::Failed(vk::Result::ERROR_DEVICE_LOST));
        assert!(!acquired.requests_resize());
    }

    #[test]
    fn present_results_map_to_outcomes() {
        assert_eq!(classify_present(Ok(false), false), PresentOutcome::Presented);
        assert_eq!(classify_present(Ok(true), false), PresentOutcome::Suboptimal);
        assert_eq!(classify_present(Ok(false), true), PresentOutcome::Suboptimal);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), false),
            PresentOutcome::Skipped
        );
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR), false),
            PresentOutcome::Skipped
        );
    }

    #[test]
    fn acquired_image_barrier_waits_on_the_acquire_stage() {
        assert_eq!(
            ACQUIRED_STATE.stage.as_raw(),
            u64::from(ACQUIRE_WAIT_STAGE.as_raw())
        );

        let mut state = ACQUIRED_STATE;
        let next = ResourceState::new(
            vk::PipelineStageFlags2::BLIT,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let barrier = image_barrier(
            &mut state,
            next,
            vk::Image::null(),
            full_range(vk::ImageAspectFlags::COLOR),
        );
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
    }

    fn frames(images: usize, extent: vk::Extent2D) -> SurfaceFrames {
        let wrap = |_| {
            Image::wrap(
                vk::Image::null(),
                vk::ImageView::null(),
                vk::Format::B8G8R8A8_UNORM,
                extent,
                vk::ImageAspectFlags::COLOR,
            )
        };
        let slots = (0..images)
            .map(|_| FrameSlot {
                pool: CommandPool::null(),
                cmd: vk::CommandBuffer::null(),
                ready_to_record: vk::Fence::null(),
                ready_to_write: vk::Semaphore::null(),
                ready_to_read: vk::Semaphore::null(),
            })
            .collect();
        SurfaceFrames::new(
            Swapchain {
                swapchain: vk::SwapchainKHR::null(),
                images: (0..images).map(wrap).collect(),
                format: vk::SurfaceFormatKHR::default(),
                present_mode: vk::PresentModeKHR::FIFO,
                extent,
            },
            slots,
        )
    }

    #[test]
    fn rebuilt_frames_rotate_over_the_new_slot_count() {
        let mut current = frames(3, vk::Extent2D { width: 800, height: 600 });
        let taken: Vec<usize> = (0..2).map(|_| current.advance().unwrap()).collect();
        assert_eq!(taken, vec![0, 1]);

        let resized = vk::Extent2D { width: 1024, height: 768 };
        let old = std::mem::replace(&mut current, frames(2, resized));
        assert_eq!(old.slots.len(), 3);
        assert_eq!(current.swapchain.extent, resized);
        assert_eq!(current.slots.len(), 2);
        let taken: Vec<usize> = (0..3).map(|_| current.advance().unwrap()).collect();
        assert_eq!(taken, vec![0, 1, 0]);
    }

    #[test]
    fn frames_without_slots_refuse_to_present() {
        let mut empty = frames(0, vk::Extent2D { width: 1, height: 1 });
        assert!(matches!(empty.advance(), Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn null_semaphores_are_dropped() {
        let filtered = non_null(&[vk::Semaphore::null(), vk::Semaphore::null()]);
        assert!(filtered.is_empty());
    }
}
