//! Pipeline creation and management.
//!
//! Pipeline layouts and descriptor sets are derived from the SPIR-V of each
//! stage, so callers only describe fixed-function state.

use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::descriptors::{DescriptorBundle, SamplerOverrides};
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::reflect::{merge_bindings, reflect_stage, vertex_layout, VertexInput};
use crate::shader::{PreparedStage, ShaderModuleStrategy, ShaderStage};
use ash::vk;

/// Parameters for [`ComputePipeline::new`].
#[derive(Debug, Clone)]
pub struct ComputeDesc<'a> {
    pub shader: ShaderStage<'a>,
    pub samplers: SamplerOverrides,
}

impl<'a> ComputeDesc<'a> {
    pub fn new(code: &'a [u32]) -> Self {
        Self {
            shader: ShaderStage::new(vk::ShaderStageFlags::COMPUTE, code),
            samplers: SamplerOverrides::new(),
        }
    }

    /// Attach specialization constants.
    pub fn specialize(mut self, entries: &'a [vk::SpecializationMapEntry], data: &'a [u8]) -> Self {
        self.shader = self.shader.specialize(entries, data);
        self
    }

    /// Use `info` for the combined image sampler at `(set, binding)`.
    pub fn sampler(mut self, set: u32, binding: u32, info: vk::SamplerCreateInfo<'static>) -> Self {
        self.samplers.insert((set, binding), info);
        self
    }
}

/// Compute pipeline with reflected descriptor sets.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    descriptors: DescriptorBundle,
}

impl ComputePipeline {
    /// Create a compute pipeline from shader code.
    pub fn new(gpu: &GpuContext, desc: &ComputeDesc<'_>) -> Result<Self> {
        let reflection = reflect_stage(desc.shader.code, vk::ShaderStageFlags::COMPUTE)?;
        let bindings = merge_bindings(std::slice::from_ref(&reflection))?;

        let device = gpu.device();
        unsafe {
            let mut descriptors = DescriptorBundle::new(device, &bindings, &desc.samplers)?;
            let layout = match create_pipeline_layout(device, descriptors.layouts()) {
                Ok(layout) => layout,
                Err(e) => {
                    descriptors.destroy(device);
                    return Err(e);
                }
            };
            match Self::create(device, gpu.shader_module_strategy(), &desc.shader, layout) {
                Ok(pipeline) => Ok(Self {
                    pipeline,
                    layout,
                    descriptors,
                }),
                Err(e) => {
                    device.destroy_pipeline_layout(layout, None);
                    descriptors.destroy(device);
                    Err(e)
                }
            }
        }
    }

    unsafe fn create(
        device: &ash::Device,
        strategy: ShaderModuleStrategy,
        shader: &ShaderStage<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut stage = PreparedStage::new(device, strategy, shader)?;
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage.create_info())
            .layout(layout);

        let result = device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);
        stage.release(device);

        let pipelines = result.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
        Ok(pipelines[0])
    }

    /// Descriptor sets, indexed by set number.
    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        self.descriptors.sets()
    }

    /// Bind the pipeline and its sets, then dispatch `x * y * z` workgroups.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute(&self, device: &ash::Device, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            bind_sets(device, cmd, vk::PipelineBindPoint::COMPUTE, self.layout, &self.descriptors);
            device.cmd_dispatch(cmd, x, y, z);
        }
    }

    /// See [`DescriptorBundle::write_image`].
    pub fn write_image(
        &self,
        device: &ash::Device,
        set: u32,
        binding: u32,
        image: &Image,
        descriptor_type: vk::DescriptorType,
    ) -> Result<()> {
        unsafe {
            self.descriptors
                .write_image(device, set, binding, image, descriptor_type)
        }
    }

    /// See [`DescriptorBundle::write_buffer`].
    pub fn write_buffer(
        &self,
        device: &ash::Device,
        set: u32,
        binding: u32,
        buffer: &Buffer,
        descriptor_type: vk::DescriptorType,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        unsafe {
            self.descriptors
                .write_buffer(device, set, binding, buffer, descriptor_type, offset)
        }
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.descriptors.destroy(device);
    }
}

/// Depth attachment state.
#[derive(Debug, Clone, Copy)]
pub struct DepthState {
    pub format: vk::Format,
    pub write: bool,
    pub test: bool,
}

/// Stencil attachment state.
#[derive(Debug, Clone, Copy)]
pub struct StencilState {
    pub format: vk::Format,
    pub test: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

/// Parameters for [`GraphicsPipeline::new`].
#[derive(Debug, Clone)]
pub struct GraphicsDesc<'a> {
    pub extent: vk::Extent2D,
    pub vertex: ShaderStage<'a>,
    pub fragment: ShaderStage<'a>,
    pub color_formats: Vec<vk::Format>,
    /// Alpha blending on every color attachment.
    pub blend: bool,
    pub depth: Option<DepthState>,
    pub stencil: Option<StencilState>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub samplers: SamplerOverrides,
}

impl<'a> GraphicsDesc<'a> {
    /// Single color attachment, no blending, depth or stencil.
    pub fn new(
        extent: vk::Extent2D,
        vertex: &'a [u32],
        fragment: &'a [u32],
        color_format: vk::Format,
    ) -> Self {
        Self {
            extent,
            vertex: ShaderStage::new(vk::ShaderStageFlags::VERTEX, vertex),
            fragment: ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, fragment),
            color_formats: vec![color_format],
            blend: false,
            depth: None,
            stencil: None,
            dynamic_states: Vec::new(),
            samplers: SamplerOverrides::new(),
        }
    }

    pub fn blend(mut self, enable: bool) -> Self {
        self.blend = enable;
        self
    }

    pub fn depth(mut self, depth: DepthState) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn stencil(mut self, stencil: StencilState) -> Self {
        self.stencil = Some(stencil);
        self
    }

    pub fn dynamic_state(mut self, state: vk::DynamicState) -> Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    /// Use `info` for the combined image sampler at `(set, binding)`.
    pub fn sampler(mut self, set: u32, binding: u32, info: vk::SamplerCreateInfo<'static>) -> Self {
        self.samplers.insert((set, binding), info);
        self
    }

    fn depth_enabled(&self) -> bool {
        self.depth.is_some_and(|depth| depth.test || depth.write)
    }

    fn stencil_enabled(&self) -> bool {
        self.stencil.is_some_and(|stencil| stencil.test)
    }
}

/// Graphics pipeline using dynamic rendering.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    descriptors: DescriptorBundle,
    depth_enabled: bool,
    stencil_enabled: bool,
    dynamic_viewport: bool,
    dynamic_scissor: bool,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline from a vertex and a fragment shader.
    ///
    /// Vertex inputs are packed into binding 0 in location order.
    pub fn new(gpu: &GpuContext, desc: &GraphicsDesc<'_>) -> Result<Self> {
        let vertex = reflect_stage(desc.vertex.code, vk::ShaderStageFlags::VERTEX)?;
        let fragment = reflect_stage(desc.fragment.code, vk::ShaderStageFlags::FRAGMENT)?;
        let stages = [vertex, fragment];
        let bindings = merge_bindings(&stages)?;

        let device = gpu.device();
        let pipeline = unsafe {
            let mut descriptors = DescriptorBundle::new(device, &bindings, &desc.samplers)?;
            let layout = match create_pipeline_layout(device, descriptors.layouts()) {
                Ok(layout) => layout,
                Err(e) => {
                    descriptors.destroy(device);
                    return Err(e);
                }
            };
            match Self::create(device, gpu.shader_module_strategy(), desc, &stages[0].inputs, layout) {
                Ok(pipeline) => Self {
                    pipeline,
                    layout,
                    descriptors,
                    depth_enabled: desc.depth_enabled(),
                    stencil_enabled: desc.stencil_enabled(),
                    dynamic_viewport: desc.dynamic_states.contains(&vk::DynamicState::VIEWPORT),
                    dynamic_scissor: desc.dynamic_states.contains(&vk::DynamicState::SCISSOR),
                },
                Err(e) => {
                    device.destroy_pipeline_layout(layout, None);
                    descriptors.destroy(device);
                    return Err(e);
                }
            }
        };
        Ok(pipeline)
    }

    unsafe fn create(
        device: &ash::Device,
        strategy: ShaderModuleStrategy,
        desc: &GraphicsDesc<'_>,
        inputs: &[VertexInput],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut vertex_stage = PreparedStage::new(device, strategy, &desc.vertex)?;
        let mut fragment_stage = match PreparedStage::new(device, strategy, &desc.fragment) {
            Ok(stage) => stage,
            Err(e) => {
                vertex_stage.release(device);
                return Err(e);
            }
        };

        let result = {
            let shader_stages = [vertex_stage.create_info(), fragment_stage.create_info()];

            let vertex_layout = vertex_layout(inputs);
            let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&vertex_layout.bindings)
                .vertex_attribute_descriptions(&vertex_layout.attributes);

            let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
                .primitive_restart_enable(false);

            let viewports = [full_viewport(desc.extent)];
            let scissors = [vk::Rect2D::default().extent(desc.extent)];
            let viewport_state = vk::PipelineViewportStateCreateInfo::default()
                .viewports(&viewports)
                .scissors(&scissors);

            let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
                .depth_clamp_enable(false)
                .rasterizer_discard_enable(false)
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::CLOCKWISE)
                .depth_bias_enable(false)
                .line_width(1.0);

            let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1)
                .sample_shading_enable(false);

            let mut depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
                .depth_bounds_test_enable(false);
            if let Some(depth) = desc.depth {
                depth_stencil = depth_stencil
                    .depth_test_enable(depth.test)
                    .depth_write_enable(depth.write);
            }
            if let Some(stencil) = desc.stencil {
                depth_stencil = depth_stencil
                    .stencil_test_enable(stencil.test)
                    .front(stencil.front)
                    .back(stencil.back);
            }

            let color_blend_attachments: Vec<_> = desc
                .color_formats
                .iter()
                .map(|_| blend_attachment(desc.blend))
                .collect();
            let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
                .logic_op_enable(false)
                .attachments(&color_blend_attachments)
                .blend_constants([1.0; 4]);

            let dynamic_state =
                vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&desc.dynamic_states);

            let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
                .color_attachment_formats(&desc.color_formats);
            if let Some(depth) = desc.depth {
                rendering_info = rendering_info.depth_attachment_format(depth.format);
            }
            if let Some(stencil) = desc.stencil {
                rendering_info = rendering_info.stencil_attachment_format(stencil.format);
            }

            let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
                .stages(&shader_stages)
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterization)
                .multisample_state(&multisampling)
                .depth_stencil_state(&depth_stencil)
                .color_blend_state(&color_blending)
                .dynamic_state(&dynamic_state)
                .layout(layout)
                .push_next(&mut rendering_info);

            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        vertex_stage.release(device);
        fragment_stage.release(device);

        let pipelines = result.map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
        Ok(pipelines[0])
    }

    /// Descriptor sets, indexed by set number.
    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        self.descriptors.sets()
    }

    /// Draw a fullscreen triangle into `color`.
    ///
    /// `load` keeps the previous contents instead of clearing to zero. `depth`
    /// pairs the depth image with its own load flag and is ignored unless the
    /// pipeline tests or writes depth or stencil. Attachments are used in their
    /// stored layouts, and the render area covers `color`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        color: &Image,
        load: bool,
        depth: Option<(&Image, bool)>,
    ) {
        self.render(device, cmd, color, load, depth, || unsafe {
            device.cmd_draw(cmd, 3, 1, 0, 0);
        });
    }

    /// Draw `index_count` indices from `indices` over `vertices`.
    #[allow(clippy::too_many_arguments)]
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute_indexed(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        color: &Image,
        load: bool,
        depth: Option<(&Image, bool)>,
        vertices: &Buffer,
        indices: &Buffer,
        index_count: u32,
    ) {
        self.render(device, cmd, color, load, depth, || unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertices.handle()], &[0]);
            device.cmd_bind_index_buffer(cmd, indices.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
        });
    }

    fn render(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        color: &Image,
        load: bool,
        depth: Option<(&Image, bool)>,
        draw: impl FnOnce(),
    ) {
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(color.view())
            .image_layout(color.layout())
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(load_op(load))
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            });
        let color_attachments = [color_attachment];

        let depth_attachment = depth.map(|(image, load)| {
            vk::RenderingAttachmentInfo::default()
                .image_view(image.view())
                .image_layout(image.layout())
                .resolve_mode(vk::ResolveModeFlags::NONE)
                .load_op(load_op(load))
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                })
        });

        let render_area = vk::Rect2D::default().extent(color.extent());
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(attachment) = &depth_attachment {
            if self.depth_enabled {
                rendering_info = rendering_info.depth_attachment(attachment);
            }
            if self.stencil_enabled {
                rendering_info = rendering_info.stencil_attachment(attachment);
            }
        }

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            bind_sets(device, cmd, vk::PipelineBindPoint::GRAPHICS, self.layout, &self.descriptors);
            if self.dynamic_viewport {
                device.cmd_set_viewport(cmd, 0, &[full_viewport(render_area.extent)]);
            }
            if self.dynamic_scissor {
                device.cmd_set_scissor(cmd, 0, &[render_area]);
            }
        }
        draw();
        unsafe { device.cmd_end_rendering(cmd) };
    }

    /// See [`DescriptorBundle::write_image`].
    pub fn write_image(
        &self,
        device: &ash::Device,
        set: u32,
        binding: u32,
        image: &Image,
        descriptor_type: vk::DescriptorType,
    ) -> Result<()> {
        unsafe {
            self.descriptors
                .write_image(device, set, binding, image, descriptor_type)
        }
    }

    /// See [`DescriptorBundle::write_buffer`].
    pub fn write_buffer(
        &self,
        device: &ash::Device,
        set: u32,
        binding: u32,
        buffer: &Buffer,
        descriptor_type: vk::DescriptorType,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        unsafe {
            self.descriptors
                .write_buffer(device, set, binding, buffer, descriptor_type, offset)
        }
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.descriptors.destroy(device);
    }
}

unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

unsafe fn bind_sets(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    descriptors: &DescriptorBundle,
) {
    if !descriptors.is_empty() {
        device.cmd_bind_descriptor_sets(cmd, bind_point, layout, 0, descriptors.sets(), &[]);
    }
}

fn load_op(load: bool) -> vk::AttachmentLoadOp {
    if load {
        vk::AttachmentLoadOp::LOAD
    } else {
        vk::AttachmentLoadOp::CLEAR
    }
}

fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Source-alpha blending writing RGB only.
fn blend_attachment(blend: bool) -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(blend)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::R | vk::ColorComponentFlags::G | vk::ColorComponentFlags::B)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1280,
        height: 720,
    };

    #[test]
    fn blend_writes_rgb_only() {
        let attachment = blend_attachment(true);
        assert_eq!(attachment.blend_enable, vk::TRUE);
        assert_eq!(attachment.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(attachment.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert!(!attachment.color_write_mask.contains(vk::ColorComponentFlags::A));
        assert_eq!(blend_attachment(false).blend_enable, vk::FALSE);
    }

    #[test]
    fn viewport_covers_extent() {
        let viewport = full_viewport(EXTENT);
        assert_eq!(viewport.width, 1280.0);
        assert_eq!(viewport.height, 720.0);
        assert_eq!(viewport.max_depth, 1.0);
    }

    #[test]
    fn load_flag_selects_op() {
        assert_eq!(load_op(true), vk::AttachmentLoadOp::LOAD);
        assert_eq!(load_op(false), vk::AttachmentLoadOp::CLEAR);
    }

    #[test]
    fn depth_attachment_follows_test_or_write() {
        let desc = GraphicsDesc::new(EXTENT, &[], &[], vk::Format::B8G8R8A8_UNORM);
        assert!(!desc.depth_enabled());
        let read_only = desc.clone().depth(DepthState {
            format: vk::Format::D32_SFLOAT,
            write: false,
            test: true,
        });
        assert!(read_only.depth_enabled());
        let disabled = desc.clone().depth(DepthState {
            format: vk::Format::D32_SFLOAT,
            write: false,
            test: false,
        });
        assert!(!disabled.depth_enabled());

        let stencil = desc.stencil(StencilState {
            format: vk::Format::D24_UNORM_S8_UINT,
            test: true,
            front: vk::StencilOpState::default(),
            back: vk::StencilOpState::default(),
        });
        assert!(stencil.stencil_enabled());
    }

    #[test]
    fn dynamic_states_are_deduplicated() {
        let desc = GraphicsDesc::new(EXTENT, &[], &[], vk::Format::B8G8R8A8_UNORM)
            .dynamic_state(vk::DynamicState::VIEWPORT)
            .dynamic_state(vk::DynamicState::SCISSOR)
            .dynamic_state(vk::DynamicState::VIEWPORT);
        assert_eq!(desc.dynamic_states.len(), 2);
    }

    #[test]
    fn compute_desc_collects_samplers() {
        let desc = ComputeDesc::new(&[]).sampler(0, 1, crate::descriptors::default_sampler_info());
        assert_eq!(desc.shader.stage, vk::ShaderStageFlags::COMPUTE);
        assert!(desc.samplers.contains_key(&(0, 1)));
    }
}
