//! The per-frame compute then graphics loop.
//!
//! Each call to [`FramePipeline::run_frame`] drives one frame slot through:
//!
//! 1. **Compute**: wait for the slot's compute fence, re-record and submit
//!    the compute pass, signalling `compute_finished`.
//! 2. **Acquire**: wait for the slot's render fence and acquire a swapchain
//!    image. An out-of-date swapchain aborts the frame here and is recreated.
//! 3. **Graphics**: reset the render fence, let the [`GraphicsRecorder`]
//!    record against the acquired image, and submit waiting on both
//!    `compute_finished` and `image_available`.
//! 4. **Present**, then advance to the next slot.
//!
//! A slot's command buffers are only re-recorded after the fence from its
//! previous use has signaled, so frames `N` and `N + 1` overlap on the GPU
//! while frame `N + frames_in_flight` waits for `N`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, error, info, warn};

use tandem_core::EngineConfig;
use tandem_rhi::gpu::{GpuDevice, QueueKind, QueueSubmit, SemaphoreWait};
use tandem_rhi::swapchain::{AcquireOutcome, SwapchainProvider};
use tandem_rhi::{RhiError, RhiResult};

use crate::deletion_queue::DeletionQueue;
use crate::frame::FrameSlot;

/// How the compute pass sizes its dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Group counts fixed when the pass is built.
    Fixed { x: u32, y: u32, z: u32 },
    /// Group counts read from a `vk::DispatchIndirectCommand` in `buffer`.
    Indirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
}

impl DispatchStrategy {
    /// Fixed dispatch with enough `local_size` workgroups to cover `extent`.
    pub fn covering(extent: vk::Extent2D, local_size: (u32, u32)) -> Self {
        let groups = group_counts(extent, local_size);
        DispatchStrategy::Fixed {
            x: groups.x,
            y: groups.y,
            z: groups.z,
        }
    }

    fn record<D: GpuDevice + ?Sized>(&self, device: &D, command_buffer: vk::CommandBuffer) {
        match *self {
            DispatchStrategy::Fixed { x, y, z } => device.cmd_dispatch(command_buffer, x, y, z),
            DispatchStrategy::Indirect { buffer, offset } => {
                device.cmd_dispatch_indirect(command_buffer, buffer, offset)
            }
        }
    }
}

/// Workgroup counts covering `extent` with `local_size` sized groups.
pub fn group_counts(extent: vk::Extent2D, local_size: (u32, u32)) -> vk::DispatchIndirectCommand {
    vk::DispatchIndirectCommand {
        x: extent.width.div_ceil(local_size.0.max(1)),
        y: extent.height.div_ceil(local_size.1.max(1)),
        z: 1,
    }
}

/// The compute work run at the start of every frame.
#[derive(Clone, Debug)]
pub struct ComputePass {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    /// One set per frame in flight, bound at set index 0.
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    /// Stages the push-constant blob is visible to.
    pub push_constant_stages: vk::ShaderStageFlags,
    pub dispatch: DispatchStrategy,
}

/// What the graphics recorder draws into this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTarget {
    /// Frame slot, selects per-frame descriptor sets.
    pub slot: usize,
    pub image_index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Records the graphics half of a frame.
pub trait GraphicsRecorder {
    /// Records into `command_buffer`, which is already begun and is ended
    /// by the caller.
    fn record(&mut self, command_buffer: vk::CommandBuffer, target: &FrameTarget)
    -> RhiResult<()>;

    /// Called after the swapchain was recreated, with the device idle.
    fn on_resize(&mut self, _extent: vk::Extent2D) -> RhiResult<()> {
        Ok(())
    }
}

/// Drives frames through compute, graphics and presentation.
///
/// Owns the per-slot sync objects and command pools, and the deletion queue
/// it flushes on [`FramePipeline::shutdown`].
pub struct FramePipeline<D, S, R>
where
    D: GpuDevice + ?Sized,
    S: SwapchainProvider,
    R: GraphicsRecorder,
{
    device: Arc<D>,
    recorder: R,
    swapchain: S,
    compute: ComputePass,
    deletion_queue: DeletionQueue,
    compute_pool: vk::CommandPool,
    graphics_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    current_slot: usize,
    push_constants: Vec<u8>,
    frame_count: u64,
    fence_timeout_ns: u64,
    fence_timeout: Duration,
    resize_poll_interval: Duration,
    resize_requested: bool,
    minimized: bool,
    shut_down: bool,
}

impl<D, S, R> FramePipeline<D, S, R>
where
    D: GpuDevice + ?Sized,
    S: SwapchainProvider,
    R: GraphicsRecorder,
{
    /// Creates command pools and one [`FrameSlot`] per frame in flight.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PipelineError`] if `compute` does not carry one
    /// descriptor set per frame in flight.
    pub fn new(
        device: Arc<D>,
        swapchain: S,
        recorder: R,
        compute: ComputePass,
        deletion_queue: DeletionQueue,
        config: &EngineConfig,
    ) -> RhiResult<Self> {
        let frames = config.frames_in_flight;
        if compute.descriptor_sets.len() != frames {
            return Err(RhiError::PipelineError(format!(
                "Compute pass has {} descriptor set(s) for {} frame(s) in flight",
                compute.descriptor_sets.len(),
                frames
            )));
        }

        let compute_pool = device.create_command_pool(QueueKind::Compute)?;
        let graphics_pool = match device.create_command_pool(QueueKind::Graphics) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_command_pool(compute_pool);
                return Err(e);
            }
        };

        let mut pipeline = Self {
            device,
            swapchain,
            recorder,
            compute,
            deletion_queue,
            compute_pool,
            graphics_pool,
            slots: Vec::with_capacity(frames),
            current_slot: 0,
            push_constants: Vec::new(),
            frame_count: 0,
            fence_timeout_ns: config.fence_timeout_ns(),
            fence_timeout: config.fence_timeout,
            resize_poll_interval: config.resize_poll_interval,
            resize_requested: false,
            minimized: false,
            shut_down: false,
        };
        // From here on a failure is cleaned up by Drop.
        pipeline.create_slots(frames)?;

        info!("Frame pipeline ready with {} frame(s) in flight", frames);
        Ok(pipeline)
    }

    fn create_slots(&mut self, frames: usize) -> RhiResult<()> {
        let compute_buffers = self
            .device
            .allocate_command_buffers(self.compute_pool, frames as u32)?;
        let graphics_buffers = self
            .device
            .allocate_command_buffers(self.graphics_pool, frames as u32)?;

        for (i, (compute_cb, graphics_cb)) in
            compute_buffers.into_iter().zip(graphics_buffers).enumerate()
        {
            let slot = FrameSlot::new(&*self.device, compute_cb, graphics_cb)?;
            self.slots.push(slot);
            debug!("Created frame slot {}", i);
        }
        Ok(())
    }

    /// Sets the parameter blob pushed to the compute pass every frame.
    pub fn set_push_constants<T: Pod>(&mut self, value: &T) {
        self.push_constants.clear();
        self.push_constants
            .extend_from_slice(bytemuck::bytes_of(value));
    }

    /// Handles a window resize.
    ///
    /// A zero extent pauses rendering until a non-zero one arrives; any
    /// other extent schedules a swapchain recreation after the next present.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        if extent.width == 0 || extent.height == 0 {
            debug!("Window minimized, pausing frames");
            self.minimized = true;
            return;
        }

        self.minimized = false;
        self.swapchain.request_extent(extent);
        if extent != self.swapchain.extent() {
            debug!(
                "Resize triggered: {}x{} -> {}x{}",
                self.swapchain.extent().width,
                self.swapchain.extent().height,
                extent.width,
                extent.height
            );
            self.resize_requested = true;
        }
    }

    /// Runs one frame.
    ///
    /// Returns `Ok(true)` when the swapchain was recreated during the frame,
    /// and for every frame dropped because acquire found it out of date, even
    /// if the surface was still zero-sized and recreation was postponed.
    /// A dropped frame does not advance the slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceTimeout`] if a fence does not signal within
    /// the configured timeout, or any Vulkan failure other than an out-of-date
    /// or suboptimal swapchain.
    pub fn run_frame(&mut self) -> RhiResult<bool> {
        if self.shut_down {
            return Err(RhiError::PipelineError(
                "Frame pipeline already shut down".to_string(),
            ));
        }
        if self.minimized {
            return Ok(false);
        }

        let slot = self.slots[self.current_slot];

        self.submit_compute(&slot)?;

        self.wait_fence(slot.render_fence, "render fence")?;
        let (image_index, suboptimal) = match self
            .swapchain
            .acquire_next_image(slot.image_available, self.fence_timeout_ns)?
        {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                warn!(
                    "Swapchain out of date on acquire, dropping frame {}",
                    self.frame_count
                );
                if !self.recreate_swapchain()? {
                    // compute_finished was signalled above and nothing will
                    // wait on it; the slot must not be resubmitted with it.
                    self.device.wait_idle()?;
                    self.recreate_semaphores()?;
                }
                return Ok(true);
            }
        };

        // Reset only once the graphics submission is certain to happen.
        self.device.reset_fence(slot.render_fence)?;
        self.submit_graphics(&slot, image_index)?;

        let stale = self.swapchain.present(image_index, slot.render_finished)?;

        self.current_slot = (self.current_slot + 1) % self.slots.len();
        self.frame_count += 1;

        if stale || suboptimal || self.resize_requested {
            if stale || suboptimal {
                warn!("Swapchain out of date or suboptimal after present");
            }
            return self.recreate_swapchain();
        }

        Ok(false)
    }

    /// Blocks until the current slot's previous compute submission is done,
    /// so replicas bound to that slot can be rewritten from the host.
    ///
    /// The fence is left signaled; the next [`FramePipeline::run_frame`]
    /// passes straight through its own wait.
    pub fn wait_for_current_slot(&self) -> RhiResult<()> {
        if self.shut_down {
            return Err(RhiError::PipelineError(
                "Frame pipeline already shut down".to_string(),
            ));
        }
        let slot = &self.slots[self.current_slot];
        self.wait_fence(slot.compute_fence, "compute fence")
    }

    fn submit_compute(&self, slot: &FrameSlot) -> RhiResult<()> {
        let device = &*self.device;
        let cb = slot.compute_command_buffer;

        self.wait_fence(slot.compute_fence, "compute fence")?;
        device.reset_fence(slot.compute_fence)?;

        device.reset_command_buffer(cb)?;
        device.begin_command_buffer(cb)?;
        device.cmd_bind_compute(
            cb,
            self.compute.pipeline,
            self.compute.layout,
            self.compute.descriptor_sets[self.current_slot],
        );
        if !self.push_constants.is_empty() {
            device.cmd_push_constants(
                cb,
                self.compute.layout,
                self.compute.push_constant_stages,
                &self.push_constants,
            );
        }
        self.compute.dispatch.record(device, cb);
        device.end_command_buffer(cb)?;

        let signals = [slot.compute_finished];
        device.submit(
            QueueKind::Compute,
            &QueueSubmit {
                command_buffer: cb,
                waits: &[],
                signals: &signals,
                fence: slot.compute_fence,
            },
        )
    }

    fn submit_graphics(&mut self, slot: &FrameSlot, image_index: u32) -> RhiResult<()> {
        let cb = slot.graphics_command_buffer;
        let target = FrameTarget {
            slot: self.current_slot,
            image_index,
            image: self.swapchain.image(image_index),
            view: self.swapchain.image_view(image_index),
            extent: self.swapchain.extent(),
            format: self.swapchain.format(),
        };

        self.device.reset_command_buffer(cb)?;
        self.device.begin_command_buffer(cb)?;
        self.recorder.record(cb, &target)?;
        self.device.end_command_buffer(cb)?;

        let waits = [
            SemaphoreWait {
                semaphore: slot.compute_finished,
                stage: vk::PipelineStageFlags::VERTEX_INPUT,
            },
            SemaphoreWait {
                semaphore: slot.image_available,
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            },
        ];
        let signals = [slot.render_finished];
        self.device.submit(
            QueueKind::Graphics,
            &QueueSubmit {
                command_buffer: cb,
                waits: &waits,
                signals: &signals,
                fence: slot.render_fence,
            },
        )
    }

    fn wait_fence(&self, fence: vk::Fence, what: &'static str) -> RhiResult<()> {
        if self.device.wait_for_fence(fence, self.fence_timeout_ns)? {
            Ok(())
        } else {
            error!(
                "Timed out after {:?} waiting for {} of slot {}",
                self.fence_timeout, what, self.current_slot
            );
            Err(RhiError::DeviceTimeout { what })
        }
    }

    /// Polls until the surface reports a non-zero size, for at most the
    /// fence timeout.
    fn wait_for_drawable_extent(&self) -> RhiResult<Option<vk::Extent2D>> {
        let start = Instant::now();
        loop {
            let extent = self.swapchain.drawable_extent()?;
            if extent.width > 0 && extent.height > 0 {
                return Ok(Some(extent));
            }
            if start.elapsed() >= self.fence_timeout {
                return Ok(None);
            }
            std::thread::sleep(self.resize_poll_interval);
        }
    }

    /// Recreates the swapchain and every slot's semaphores.
    ///
    /// Returns `Ok(false)` if the surface stayed zero-sized, in which case
    /// recreation is retried after the next frame.
    fn recreate_swapchain(&mut self) -> RhiResult<bool> {
        let Some(extent) = self.wait_for_drawable_extent()? else {
            warn!("Surface still has zero size, postponing swapchain recreation");
            self.resize_requested = true;
            return Ok(false);
        };

        self.device.wait_idle()?;

        self.swapchain.recreate(extent)?;
        let extent = self.swapchain.extent();
        self.recorder.on_resize(extent)?;

        self.recreate_semaphores()?;

        self.resize_requested = false;
        info!(
            "Swapchain recreated at {}x{}",
            extent.width, extent.height
        );
        Ok(true)
    }

    fn recreate_semaphores(&mut self) -> RhiResult<()> {
        for slot in &mut self.slots {
            slot.recreate_semaphores(&*self.device)?;
        }
        Ok(())
    }

    /// Drains the device, destroys the slots and command pools, and flushes
    /// the deletion queue. Runs once; later calls do nothing.
    ///
    /// The swapchain and recorder are dropped with the pipeline.
    pub fn shutdown(&mut self) -> RhiResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let idle = self.device.wait_idle();
        if let Err(e) = &idle {
            error!("Failed to wait for device idle during shutdown: {}", e);
        }

        let device = &*self.device;
        for slot in &mut self.slots {
            slot.destroy(device);
        }
        self.slots.clear();
        device.destroy_command_pool(self.graphics_pool);
        device.destroy_command_pool(self.compute_pool);

        self.deletion_queue.flush(device);

        info!("Frame pipeline shut down after {} frame(s)", self.frame_count);
        idle
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Frames presented so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn swapchain(&self) -> &S {
        &self.swapchain
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }
}

impl<D, S, R> Drop for FramePipeline<D, S, R>
where
    D: GpuDevice + ?Sized,
    S: SwapchainProvider,
    R: GraphicsRecorder,
{
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Frame pipeline shutdown failed during drop: {}", e);
        }
    }
}
