//! Vulkan objects behind the window and the two passes drawn each frame.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use tracing::{info, warn};

use tandem_core::{EngineConfig, FrameTime};
use tandem_platform::{Surface, Window};
use tandem_renderer::resource::AllocatedBuffer;
use tandem_renderer::{
    BufferDesc, ComputePass, DeletionQueue, DispatchStrategy, FramePipeline, FrameSelector,
    ImageDecl, ResourceBundle, ResourceBundleBuilder,
};
use tandem_rhi::RhiResult;
use tandem_rhi::device::Device;
use tandem_rhi::instance::Instance;
use tandem_rhi::memory::HOST_MAPPED;
use tandem_rhi::physical_device::select_physical_device;
use tandem_rhi::pipeline::{GraphicsPipelineBuilder, Pipeline, PipelineLayout, push_constant_range};
use tandem_rhi::shader::{Shader, ShaderStage};
use tandem_rhi::swapchain::{Swapchain, SwapchainProvider};

use crate::blit::BlitRecorder;
use crate::scene::{FrameParams, TraceParams, default_spheres, render_extent};

const PARAMS_BINDING: u32 = 0;
const SPHERES_BINDING: u32 = 1;
const OUTPUT_BINDING: u32 = 2;

/// Everything `FramePipeline::new` needs besides the device and swapchain.
struct Passes {
    trace_bundle: ResourceBundle,
    compute_pipeline: Pipeline,
    compute_layout: PipelineLayout,
    recorder: BlitRecorder,
    compute: ComputePass,
    image_extent: vk::Extent2D,
}

/// Device, surface and frame pipeline for one window.
///
/// Fields drop top to bottom: the pipeline drains the device and flushes
/// its deletion queue first, and the instance goes last.
pub struct Gpu {
    pipeline: FramePipeline<Device, Swapchain, BlitRecorder>,
    trace_bundle: ResourceBundle,
    trace_params: TraceParams,
    image_extent: vk::Extent2D,
    _compute_pipeline: Pipeline,
    _compute_layout: PipelineLayout,
    _device: Arc<Device>,
    _surface: Surface,
    _instance: Instance,
}

impl Gpu {
    pub fn new(window: &Window, config: &EngineConfig) -> Result<Self> {
        let extensions = window.required_extensions()?;
        let instance = Instance::new(config.enable_validation, &extensions)?;
        info!("Validation layers enabled: {}", instance.has_validation());
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let physical = select_physical_device(instance.handle(), surface.handle(), &surface_loader)?;
        info!("Using GPU: {}", physical.device_name());

        let device = Device::new(&instance, &physical)?;
        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            window.drawable_extent(),
        )?;

        let mut deletion_queue = DeletionQueue::new();
        let passes = match build_passes(&device, &swapchain, config, &mut deletion_queue) {
            Ok(passes) => passes,
            Err(e) => {
                deletion_queue.flush(&*device);
                return Err(e);
            }
        };
        let Passes {
            trace_bundle,
            compute_pipeline,
            compute_layout,
            recorder,
            compute,
            image_extent,
        } = passes;

        let pipeline = FramePipeline::new(
            device.clone(),
            swapchain,
            recorder,
            compute,
            deletion_queue,
            config,
        )?;

        Ok(Self {
            pipeline,
            trace_params: TraceParams::new(default_spheres().len()),
            trace_bundle,
            image_extent,
            _compute_pipeline: compute_pipeline,
            _compute_layout: compute_layout,
            _device: device,
            _surface: surface,
            _instance: instance,
        })
    }

    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.pipeline.resize(extent);
    }

    /// Updates this frame's parameters and runs one frame.
    ///
    /// Returns `true` when the swapchain was recreated.
    pub fn draw(&mut self, time: FrameTime) -> RhiResult<bool> {
        let traced = render_extent(self.pipeline.swapchain().extent(), self.image_extent);
        self.pipeline
            .set_push_constants(&FrameParams::orbit(time.elapsed, time.frame, traced));

        self.pipeline.wait_for_current_slot()?;
        self.trace_bundle.update(
            PARAMS_BINDING,
            &self.trace_params.with_sun_at(time.elapsed),
            &FrameSelector::frame(self.pipeline.current_slot()),
        )?;

        self.pipeline.run_frame()
    }

    /// Drains the GPU and releases every registered resource.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.pipeline.shutdown() {
            warn!("GPU shutdown was not clean: {}", e);
        }
    }
}

fn build_passes(
    device: &Arc<Device>,
    swapchain: &Swapchain,
    config: &EngineConfig,
    deletion_queue: &mut DeletionQueue,
) -> Result<Passes> {
    let spheres = default_spheres();
    let params = TraceParams::new(spheres.len());

    let trace_bundle = {
        let mut builder = ResourceBundleBuilder::new(&**device, config, deletion_queue);
        builder
            .add_uniform_buffer(
                PARAMS_BINDING,
                vk::ShaderStageFlags::COMPUTE,
                BufferDesc::mapped_for::<TraceParams>(),
            )?
            .add_storage_buffer(
                SPHERES_BINDING,
                vk::ShaderStageFlags::COMPUTE,
                BufferDesc::from_slice(&spheres, false),
            )?
            .add_storage_image(
                OUTPUT_BINDING,
                vk::ShaderStageFlags::COMPUTE,
                ImageDecl::sized(config.width, config.height).sampled(),
            )?;
        builder.build()?
    };
    trace_bundle.update(PARAMS_BINDING, &params, &FrameSelector::All)?;

    let traced_image = trace_bundle
        .shared_image(OUTPUT_BINDING)
        .context("trace bundle has no output image")?;
    let image_extent = traced_image.extent();

    let blit_bundle = {
        let mut builder = ResourceBundleBuilder::new(&**device, config, deletion_queue);
        builder.add_sampled_image(
            0,
            vk::ShaderStageFlags::FRAGMENT,
            ImageDecl::existing(traced_image),
        )?;
        builder.build()?
    };

    let indirect = AllocatedBuffer::new_registered(
        &**device,
        std::mem::size_of::<vk::DispatchIndirectCommand>() as vk::DeviceSize,
        vk::BufferUsageFlags::INDIRECT_BUFFER,
        HOST_MAPPED,
        deletion_queue,
    )?;

    let shader_path = |name: &str| config.shader_dir.join(name);

    let trace_shader = Shader::from_spirv_file(
        device.clone(),
        &shader_path("trace.comp.spv"),
        ShaderStage::Compute,
        "main",
    )?;
    let compute_layout = PipelineLayout::new(
        device.clone(),
        &[trace_bundle.layout()],
        &[push_constant_range::<FrameParams>(vk::ShaderStageFlags::COMPUTE)],
    )?;
    let compute_pipeline = Pipeline::compute(device.clone(), &trace_shader, &compute_layout)?;

    let vertex_shader = Shader::from_spirv_file(
        device.clone(),
        &shader_path("blit.vert.spv"),
        ShaderStage::Vertex,
        "main",
    )?;
    let fragment_shader = Shader::from_spirv_file(
        device.clone(),
        &shader_path("blit.frag.spv"),
        ShaderStage::Fragment,
        "main",
    )?;
    let blit_layout = PipelineLayout::new(
        device.clone(),
        &[blit_bundle.layout()],
        &[BlitRecorder::push_constant_range()],
    )?;
    let blit_pipeline = GraphicsPipelineBuilder::new()
        .vertex_shader(&vertex_shader)
        .fragment_shader(&fragment_shader)
        .color_attachment_format(swapchain.format())
        .cull_mode(vk::CullModeFlags::NONE)
        .build(device.clone(), &blit_layout)?;

    let recorder = BlitRecorder::new(
        device.clone(),
        blit_pipeline,
        blit_layout,
        blit_bundle.sets().to_vec(),
        indirect,
        image_extent,
        swapchain.extent(),
    )?;

    let compute = ComputePass {
        pipeline: compute_pipeline.handle(),
        layout: compute_layout.handle(),
        descriptor_sets: trace_bundle.sets().to_vec(),
        push_constant_stages: vk::ShaderStageFlags::COMPUTE,
        dispatch: DispatchStrategy::Indirect {
            buffer: indirect.buffer,
            offset: 0,
        },
    };

    Ok(Passes {
        trace_bundle,
        compute_pipeline,
        compute_layout,
        recorder,
        compute,
        image_extent,
    })
}
