//! Graphics half of the frame: draws the traced image onto the swapchain.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use tracing::debug;

use tandem_renderer::resource::AllocatedBuffer;
use tandem_renderer::{FrameTarget, GraphicsRecorder, group_counts};
use tandem_rhi::RhiResult;
use tandem_rhi::device::Device;
use tandem_rhi::pipeline::{Pipeline, PipelineLayout, push_constant_range};

use crate::scene::{LOCAL_SIZE, render_extent};

/// Fragment push constants: how much of the image to sample.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct BlitParams {
    uv_scale: Vec2,
}

/// Full-screen triangle sampling the compute output.
///
/// Also keeps the indirect dispatch arguments in step with the window size.
pub struct BlitRecorder {
    device: Arc<Device>,
    pipeline: Pipeline,
    layout: PipelineLayout,
    descriptor_sets: Vec<vk::DescriptorSet>,
    indirect: AllocatedBuffer,
    image_extent: vk::Extent2D,
    params: BlitParams,
}

impl BlitRecorder {
    /// Push constant range the blit pipeline layout must declare.
    pub fn push_constant_range() -> vk::PushConstantRange {
        push_constant_range::<BlitParams>(vk::ShaderStageFlags::FRAGMENT)
    }

    pub fn new(
        device: Arc<Device>,
        pipeline: Pipeline,
        layout: PipelineLayout,
        descriptor_sets: Vec<vk::DescriptorSet>,
        indirect: AllocatedBuffer,
        image_extent: vk::Extent2D,
        window_extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let mut recorder = Self {
            device,
            pipeline,
            layout,
            descriptor_sets,
            indirect,
            image_extent,
            params: BlitParams {
                uv_scale: Vec2::ONE,
            },
        };
        recorder.on_resize(window_extent)?;
        Ok(recorder)
    }

    fn transition(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_stage, src_access, dst_stage, dst_access) = match new_layout {
            vk::ImageLayout::PRESENT_SRC_KHR => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            _ => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            )
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        // SAFETY: `cmd` is in the recording state for this frame.
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl GraphicsRecorder for BlitRecorder {
    fn record(&mut self, cmd: vk::CommandBuffer, target: &FrameTarget) -> RhiResult<()> {
        self.transition(
            cmd,
            target.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            });

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let rendering_info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));

        let device = self.device.handle();
        // SAFETY: the set for `target.slot` samples the image written by this
        // slot's compute submission, which the graphics submit waits on.
        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: target.extent.width as f32,
                height: target.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[area]);

            device.cmd_bind_pipeline(cmd, self.pipeline.bind_point(), self.pipeline.handle());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout.handle(),
                0,
                &[self.descriptor_sets[target.slot]],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.layout.handle(),
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&self.params),
            );
            device.cmd_draw(cmd, 3, 1, 0, 0);

            device.cmd_end_rendering(cmd);
        }

        self.transition(
            cmd,
            target.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        Ok(())
    }

    fn on_resize(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        let traced = render_extent(extent, self.image_extent);
        let groups = group_counts(traced, LOCAL_SIZE);
        // Not bound through a descriptor; binding 0 only labels errors.
        self.indirect
            .write(0, bytemuck::cast_slice(&[groups.x, groups.y, groups.z]))?;

        self.params.uv_scale = Vec2::new(
            traced.width as f32 / self.image_extent.width as f32,
            traced.height as f32 / self.image_extent.height as f32,
        );
        debug!(
            "Tracing {}x{} in {}x{}x{} groups",
            traced.width, traced.height, groups.x, groups.y, groups.z
        );
        Ok(())
    }
}
