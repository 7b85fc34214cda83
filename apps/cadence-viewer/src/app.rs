//! Viewer application: compute gradient, fullscreen composite, textured overlay.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};
use tracing::info;

use cadence_app::{AppContext, CadenceApp, FrameContext, PresentOutcome};
use cadence_gpu::buffer::{Buffer, BufferDesc};
use cadence_gpu::command::{begin_one_time, end_command_buffer, submit};
use cadence_gpu::image::{Image, ImageDesc};
use cadence_gpu::pipeline::{ComputeDesc, ComputePipeline, DepthState, GraphicsDesc, GraphicsPipeline};
use cadence_gpu::sync::{reset_fence, wait_for_fence_forever, FrameSlot};
use cadence_gpu::{default_sampler_info, GpuContext, QueueRole};

/// Workgroup edge of `gradient.comp`.
const WORKGROUP_SIZE: u32 = 8;

const CANVAS_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
const TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const CHECKER_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;

/// Uniform block shared by every shader stage (`FrameParams`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameParams {
    color_a: Vec4,
    color_b: Vec4,
    resolution: Vec2,
    time: f32,
    srgb_required: u32,
}

/// Interleaved position and texture coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

/// Overlay quad in the lower-right corner, clockwise in framebuffer space.
const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex {
        position: [0.45, 0.45],
        uv: [0.0, 0.0],
    },
    QuadVertex {
        position: [0.9, 0.45],
        uv: [1.0, 0.0],
    },
    QuadVertex {
        position: [0.9, 0.9],
        uv: [1.0, 1.0],
    },
    QuadVertex {
        position: [0.45, 0.9],
        uv: [0.0, 1.0],
    },
];
const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// Viewer application state.
pub struct Viewer {
    gradient: ComputePipeline,
    composite: GraphicsPipeline,
    overlay: GraphicsPipeline,
    params: Buffer,
    vertices: Buffer,
    indices: Buffer,
    /// Written by the compute pass, sampled by the composite pass.
    canvas: Image,
    /// Composite output handed to the presenter.
    target: Image,
    /// Depth attachment for the overlay pass.
    depth: Image,
    checker: Image,
    /// Command buffer, fence and the two semaphores exchanged with the presenter.
    slot: FrameSlot,
    /// The presenter will signal `slot.ready_to_write` once it has read `target`.
    blit_pending: bool,
    time: f32,
}

impl CadenceApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let gpu = &ctx.gpu;
        let extent = ctx.presenter.extent();
        let shader = |name: &str| {
            cadence_shaders::load(name).ok_or_else(|| anyhow::anyhow!("missing shader {name}"))
        };

        let gradient = ComputePipeline::new(gpu, &ComputeDesc::new(shader("gradient.comp")?))?;
        let composite = GraphicsPipeline::new(
            gpu,
            &GraphicsDesc::new(
                extent,
                shader("fullscreen.vert")?,
                shader("composite.frag")?,
                TARGET_FORMAT,
            )
            .dynamic_state(vk::DynamicState::VIEWPORT)
            .dynamic_state(vk::DynamicState::SCISSOR),
        )?;
        let overlay = GraphicsPipeline::new(
            gpu,
            &GraphicsDesc::new(extent, shader("quad.vert")?, shader("quad.frag")?, TARGET_FORMAT)
                .blend(true)
                .depth(DepthState {
                    format: gpu.depth_formats().depth,
                    write: true,
                    test: true,
                })
                .dynamic_state(vk::DynamicState::VIEWPORT)
                .dynamic_state(vk::DynamicState::SCISSOR)
                .sampler(
                    0,
                    0,
                    default_sampler_info()
                        .mag_filter(vk::Filter::NEAREST)
                        .min_filter(vk::Filter::NEAREST),
                ),
        )?;

        let params = Buffer::new(
            gpu,
            &BufferDesc::new(
                "frame params",
                std::mem::size_of::<FrameParams>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )
            .host_accessible(),
        )?;
        let vertices = Buffer::new(
            gpu,
            &BufferDesc::new(
                "quad vertices",
                std::mem::size_of_val(&QUAD_VERTICES) as vk::DeviceSize,
                vk::BufferUsageFlags::VERTEX_BUFFER,
            )
            .host_accessible(),
        )?;
        vertices.write(gpu.device(), &QUAD_VERTICES)?;
        let indices = Buffer::new(
            gpu,
            &BufferDesc::new(
                "quad indices",
                std::mem::size_of_val(&QUAD_INDICES) as vk::DeviceSize,
                vk::BufferUsageFlags::INDEX_BUFFER,
            )
            .host_accessible(),
        )?;
        indices.write(gpu.device(), &QUAD_INDICES)?;
        verify_indices(gpu, &indices)?;

        let checker = create_checker(gpu)?;
        let (canvas, target, depth) = create_targets(gpu, extent)?;

        let slot = unsafe { FrameSlot::new(gpu.device(), gpu.queue(QueueRole::Universal).family)? };

        let viewer = Self {
            gradient,
            composite,
            overlay,
            params,
            vertices,
            indices,
            canvas,
            target,
            depth,
            checker,
            slot,
            blit_pending: false,
            time: 0.0,
        };
        viewer.write_descriptors(gpu)?;

        info!(
            "Viewer ready: {}x{}, srgb encoding in shader: {}",
            extent.width,
            extent.height,
            ctx.srgb_required()
        );
        Ok(viewer)
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
    }

    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        let device = ctx.gpu.device();
        let cmd = self.slot.cmd;
        unsafe {
            wait_for_fence_forever(device, self.slot.ready_to_record)?;
            reset_fence(device, self.slot.ready_to_record)?;
            self.slot.pool.reset(device)?;
        }

        let extent = self.target.extent();
        let params = FrameParams {
            color_a: Vec4::new(0.05, 0.08, 0.2, 1.0),
            color_b: Vec4::new(0.9, 0.45, 0.2, 1.0),
            resolution: Vec2::new(extent.width as f32, extent.height as f32),
            time: self.time,
            srgb_required: u32::from(ctx.srgb_required()),
        };
        self.params.write(device, &[params])?;

        unsafe { begin_one_time(device, cmd)? };

        self.canvas.transition(
            device,
            cmd,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        );
        self.gradient.execute(
            device,
            cmd,
            extent.width.div_ceil(WORKGROUP_SIZE),
            extent.height.div_ceil(WORKGROUP_SIZE),
            1,
        );
        self.canvas.transition(
            device,
            cmd,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        );
        self.target.transition(
            device,
            cmd,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        );
        self.depth.transition(
            device,
            cmd,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        self.composite.execute(device, cmd, &self.target, false, None);
        self.overlay.execute_indexed(
            device,
            cmd,
            &self.target,
            true,
            Some((&self.depth, false)),
            &self.vertices,
            &self.indices,
            QUAD_INDICES.len() as u32,
        );

        let waits: &[vk::Semaphore] = if self.blit_pending {
            std::slice::from_ref(&self.slot.ready_to_write)
        } else {
            &[]
        };
        unsafe {
            end_command_buffer(device, cmd)?;
            submit(
                device,
                ctx.gpu.queue(QueueRole::Universal).handle,
                cmd,
                waits,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &[self.slot.ready_to_read],
                self.slot.ready_to_record,
            )?;
        }
        self.blit_pending = false;

        let outcome = ctx.present(
            &mut self.target,
            self.slot.ready_to_read,
            self.slot.ready_to_write,
        )?;
        self.blit_pending = true;

        if outcome != PresentOutcome::Presented {
            tracing::debug!("Frame {} {:?}", frame.frame_number, outcome);
        }
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        let gpu = &ctx.gpu;
        self.canvas.destroy(gpu)?;
        self.target.destroy(gpu)?;
        self.depth.destroy(gpu)?;
        let (canvas, target, depth) = create_targets(gpu, vk::Extent2D { width, height })?;
        self.canvas = canvas;
        self.target = target;
        self.depth = depth;
        self.write_descriptors(gpu)?;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let gpu = &ctx.gpu;
        let device = gpu.device();
        unsafe {
            self.gradient.destroy(device);
            self.composite.destroy(device);
            self.overlay.destroy(device);
            self.slot.destroy(device);
        }
        for buffer in [&mut self.params, &mut self.vertices, &mut self.indices] {
            if let Err(e) = buffer.destroy(gpu) {
                tracing::error!("Failed to free buffer: {e}");
            }
        }
        for image in [&mut self.canvas, &mut self.target, &mut self.depth, &mut self.checker] {
            if let Err(e) = image.destroy(gpu) {
                tracing::error!("Failed to free image: {e}");
            }
        }
    }
}

impl Viewer {
    fn write_descriptors(&self, gpu: &GpuContext) -> anyhow::Result<()> {
        let device = gpu.device();
        self.gradient
            .write_image(device, 0, 0, &self.canvas, vk::DescriptorType::STORAGE_IMAGE)?;
        self.gradient
            .write_buffer(device, 0, 1, &self.params, vk::DescriptorType::UNIFORM_BUFFER, 0)?;
        self.composite.write_image(
            device,
            0,
            0,
            &self.canvas,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        self.composite
            .write_buffer(device, 0, 1, &self.params, vk::DescriptorType::UNIFORM_BUFFER, 0)?;
        self.overlay.write_image(
            device,
            0,
            0,
            &self.checker,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        Ok(())
    }
}

/// Storage canvas, presentable target and overlay depth at `extent`.
fn create_targets(gpu: &GpuContext, extent: vk::Extent2D) -> anyhow::Result<(Image, Image, Image)> {
    let mut canvas = Image::new(
        gpu,
        &ImageDesc {
            name: "canvas",
            extent,
            format: CANVAS_FORMAT,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            aspects: vk::ImageAspectFlags::COLOR,
        },
    )?;
    let mut target = match Image::new(
        gpu,
        &ImageDesc {
            name: "target",
            extent,
            format: TARGET_FORMAT,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            aspects: vk::ImageAspectFlags::COLOR,
        },
    ) {
        Ok(target) => target,
        Err(e) => {
            canvas.destroy(gpu)?;
            return Err(e.into());
        }
    };
    let depth = match Image::new_depth(gpu, extent) {
        Ok(depth) => depth,
        Err(e) => {
            canvas.destroy(gpu)?;
            target.destroy(gpu)?;
            return Err(e.into());
        }
    };
    Ok((canvas, target, depth))
}

/// Read the index buffer back through the mapping and compare.
fn verify_indices(gpu: &GpuContext, indices: &Buffer) -> anyhow::Result<()> {
    let mut readback = vec![0u8; std::mem::size_of_val(&QUAD_INDICES)];
    indices.read(gpu.device(), 0, &mut readback)?;
    anyhow::ensure!(
        readback.as_slice() == bytemuck::cast_slice::<u32, u8>(&QUAD_INDICES),
        "index buffer readback does not match the uploaded indices"
    );
    Ok(())
}

/// Upload the overlay texture and leave it ready for sampling.
fn create_checker(gpu: &GpuContext) -> anyhow::Result<Image> {
    let mut checker = Image::new(
        gpu,
        &ImageDesc {
            name: "checker",
            extent: vk::Extent2D {
                width: CHECKER_SIZE,
                height: CHECKER_SIZE,
            },
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            aspects: vk::ImageAspectFlags::COLOR,
        },
    )?;
    let uploaded = checker
        .upload(gpu, &checker_texels(CHECKER_SIZE, CHECKER_CELL))
        .and_then(|()| {
            gpu.oneshot(QueueRole::Universal, |cmd| {
                checker.transition(
                    gpu.device(),
                    cmd,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                );
                Ok(())
            })
        });
    if let Err(e) = uploaded {
        checker.destroy(gpu)?;
        return Err(e.into());
    }
    Ok(checker)
}

/// RGBA8 checkerboard, translucent white on translucent black.
fn checker_texels(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    (0..size)
        .flat_map(|y| (0..size).map(move |x| (x, y)))
        .flat_map(|(x, y)| {
            if (x / cell + y / cell) % 2 == 0 {
                [255, 255, 255, 220]
            } else {
                [20, 20, 20, 160]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_params_match_std140_block() {
        assert_eq!(std::mem::size_of::<FrameParams>(), 48);
        assert_eq!(std::mem::offset_of!(FrameParams, resolution), 32);
        assert_eq!(std::mem::offset_of!(FrameParams, time), 40);
        assert_eq!(std::mem::offset_of!(FrameParams, srgb_required), 44);
    }

    #[test]
    fn quad_vertex_matches_reflected_stride() {
        assert_eq!(std::mem::size_of::<QuadVertex>(), 16);
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn checker_alternates_cells() {
        let texels = checker_texels(4, 2);
        assert_eq!(texels.len(), 4 * 4 * 4);
        let pixel = |x: usize, y: usize| &texels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(pixel(0, 0), pixel(1, 1));
        assert_ne!(pixel(0, 0), pixel(2, 0));
        assert_ne!(pixel(0, 0), pixel(0, 2));
        assert_eq!(pixel(0, 0), pixel(2, 2));
    }
}
