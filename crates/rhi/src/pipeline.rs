//! Compute and full-screen graphics pipelines.
//!
//! # Overview
//!
//! - [`PipelineLayout`] wraps VkPipelineLayout: descriptor set layouts plus
//!   an optional push constant range
//! - [`Pipeline`] wraps a compute or graphics VkPipeline
//! - [`GraphicsPipelineBuilder`] builds the attribute-less graphics pipelines
//!   used to blit compute output onto the swapchain with dynamic rendering
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use tandem_rhi::device::Device;
//! use tandem_rhi::shader::{Shader, ShaderStage};
//! use tandem_rhi::pipeline::{Pipeline, PipelineLayout, push_constant_range};
//! use ash::vk;
//!
//! # fn example(device: Arc<Device>, set_layout: vk::DescriptorSetLayout) -> Result<(), tandem_rhi::RhiError> {
//! let shader = Shader::from_spirv_file(
//!     device.clone(),
//!     Path::new("shaders/spirv/trace.comp.spv"),
//!     ShaderStage::Compute,
//!     "main",
//! )?;
//! let range = push_constant_range::<[f32; 8]>(vk::ShaderStageFlags::COMPUTE);
//! let layout = PipelineLayout::new(device.clone(), &[set_layout], &[range])?;
//! let pipeline = Pipeline::compute(device, &shader, &layout)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::shader::{Shader, ShaderStage};

/// Push constant range covering a whole `T` at offset zero.
pub fn push_constant_range<T>(stages: vk::ShaderStageFlags) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: stages,
        offset: 0,
        size: std::mem::size_of::<T>() as u32,
    }
}

/// Vulkan pipeline layout wrapper.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Creates a new pipeline layout.
    ///
    /// # Errors
    ///
    /// Returns an error if pipeline layout creation fails.
    pub fn new(
        device: Arc<Device>,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> RhiResult<Self> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

        debug!(
            "Created pipeline layout with {} descriptor set layout(s) and {} push constant range(s)",
            descriptor_set_layouts.len(),
            push_constant_ranges.len()
        );

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
        debug!("Pipeline layout destroyed");
    }
}

/// Vulkan pipeline wrapper for either bind point.
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// Creates a compute pipeline from a compute shader.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if `shader` is not a compute
    /// shader, or the Vulkan error if creation fails.
    pub fn compute(device: Arc<Device>, shader: &Shader, layout: &PipelineLayout) -> RhiResult<Self> {
        if shader.stage() != ShaderStage::Compute {
            return Err(RhiError::PipelineError(format!(
                "Compute pipeline needs a compute shader, got {}",
                shader.stage()
            )));
        }

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(shader.stage_create_info())
            .layout(layout.handle());

        let pipeline = unsafe {
            device
                .handle()
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, result)| result)?[0]
        };

        info!("Compute pipeline created");

        Ok(Self {
            device,
            pipeline,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    fn create_graphics_internal(
        device: Arc<Device>,
        create_info: &vk::GraphicsPipelineCreateInfo,
    ) -> RhiResult<Self> {
        let pipeline = unsafe {
            device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[*create_info], None)
                .map_err(|(_, result)| result)?[0]
        };

        info!("Graphics pipeline created");

        Ok(Self {
            device,
            pipeline,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
        }
        info!("{} pipeline destroyed", bind_point_name(self.bind_point));
    }
}

fn bind_point_name(bind_point: vk::PipelineBindPoint) -> &'static str {
    if bind_point == vk::PipelineBindPoint::GRAPHICS {
        "Graphics"
    } else {
        "Compute"
    }
}

/// Builder for attribute-less graphics pipelines rendering a full-screen
/// triangle with dynamic rendering.
///
/// Viewport and scissor are always dynamic so pipelines survive swapchain
/// recreation. There is no depth attachment and no vertex input.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tandem_rhi::device::Device;
/// use tandem_rhi::shader::Shader;
/// use tandem_rhi::pipeline::{GraphicsPipelineBuilder, PipelineLayout};
/// use ash::vk;
///
/// # fn example(device: Arc<Device>, vert: &Shader, frag: &Shader, layout: &PipelineLayout) -> Result<(), tandem_rhi::RhiError> {
/// let pipeline = GraphicsPipelineBuilder::new()
///     .vertex_shader(vert)
///     .fragment_shader(frag)
///     .color_attachment_format(vk::Format::B8G8R8A8_SRGB)
///     .build(device, layout)?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct GraphicsPipelineBuilder<'a> {
    vertex_shader: Option<&'a Shader>,
    fragment_shader: Option<&'a Shader>,
    color_attachment_format: Option<vk::Format>,
    cull_mode: vk::CullModeFlags,
    alpha_blend: bool,
}

impl<'a> GraphicsPipelineBuilder<'a> {
    pub fn new() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::NONE,
            ..Default::default()
        }
    }

    pub fn vertex_shader(mut self, shader: &'a Shader) -> Self {
        self.vertex_shader = Some(shader);
        self
    }

    pub fn fragment_shader(mut self, shader: &'a Shader) -> Self {
        self.fragment_shader = Some(shader);
        self
    }

    /// Format of the single color attachment (the swapchain format).
    pub fn color_attachment_format(mut self, format: vk::Format) -> Self {
        self.color_attachment_format = Some(format);
        self
    }

    pub fn cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    /// Enables standard source-alpha blending.
    pub fn alpha_blend(mut self, enable: bool) -> Self {
        self.alpha_blend = enable;
        self
    }

    /// Builds the graphics pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if a shader or the color format is
    /// missing, or the Vulkan error if creation fails.
    pub fn build(self, device: Arc<Device>, layout: &PipelineLayout) -> RhiResult<Pipeline> {
        let vertex_shader = self
            .vertex_shader
            .ok_or_else(|| RhiError::PipelineError("Vertex shader is required".to_string()))?;
        let fragment_shader = self
            .fragment_shader
            .ok_or_else(|| RhiError::PipelineError("Fragment shader is required".to_string()))?;
        let color_formats = [self.color_attachment_format.ok_or_else(|| {
            RhiError::PipelineError("A color attachment format is required".to_string())
        })?];

        let shader_stages = [
            vertex_shader.stage_create_info(),
            fragment_shader.stage_create_info(),
        ];

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default();

        let color_blend_attachments = [color_blend_attachment(self.alpha_blend)];
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout.handle())
            .push_next(&mut rendering_info);

        Pipeline::create_graphics_internal(device, &pipeline_info)
    }
}

fn color_blend_attachment(alpha_blend: bool) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    if !alpha_blend {
        return state;
    }
    state
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
}
