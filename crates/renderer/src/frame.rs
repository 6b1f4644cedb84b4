//! Per-slot command buffers and synchronization objects.

use ash::vk;
use tracing::debug;

use tandem_rhi::RhiResult;
use tandem_rhi::gpu::GpuDevice;

/// Everything one frame in flight records into and synchronizes on.
///
/// Both fences are created signaled so the first use of a slot does not
/// block. The slot is re-recorded only after its fences signal again.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    pub compute_command_buffer: vk::CommandBuffer,
    pub graphics_command_buffer: vk::CommandBuffer,
    /// Signaled when this slot's compute submission completes
    pub compute_fence: vk::Fence,
    /// Signaled when this slot's graphics submission completes
    pub render_fence: vk::Fence,
    /// Compute to graphics ordering
    pub compute_finished: vk::Semaphore,
    /// Swapchain image ready to be rendered to
    pub image_available: vk::Semaphore,
    /// Rendering done, image ready to be presented
    pub render_finished: vk::Semaphore,
}

impl FrameSlot {
    pub fn new<D: GpuDevice + ?Sized>(
        device: &D,
        compute_command_buffer: vk::CommandBuffer,
        graphics_command_buffer: vk::CommandBuffer,
    ) -> RhiResult<Self> {
        let compute_fence = device.create_fence(true)?;
        let render_fence = device.create_fence(true)?;
        let compute_finished = device.create_semaphore()?;
        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;

        Ok(Self {
            compute_command_buffer,
            graphics_command_buffer,
            compute_fence,
            render_fence,
            compute_finished,
            image_available,
            render_finished,
        })
    }

    /// Replaces the semaphores with fresh unsignaled ones.
    ///
    /// An aborted frame can leave `compute_finished` signaled with nobody
    /// waiting on it. Only call this with the device idle.
    pub fn recreate_semaphores<D: GpuDevice + ?Sized>(&mut self, device: &D) -> RhiResult<()> {
        self.destroy_semaphores(device);

        self.compute_finished = device.create_semaphore()?;
        self.image_available = device.create_semaphore()?;
        self.render_finished = device.create_semaphore()?;

        debug!("Recreated frame slot semaphores");
        Ok(())
    }

    /// Destroys the fences and semaphores. Command buffers go with their pool.
    pub fn destroy<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        self.destroy_semaphores(device);
        device.destroy_fence(self.render_fence);
        device.destroy_fence(self.compute_fence);
        self.render_fence = vk::Fence::null();
        self.compute_fence = vk::Fence::null();
    }

    fn destroy_semaphores<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        device.destroy_semaphore(self.render_finished);
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.compute_finished);
        self.render_finished = vk::Semaphore::null();
        self.image_available = vk::Semaphore::null();
        self.compute_finished = vk::Semaphore::null();
    }
}
