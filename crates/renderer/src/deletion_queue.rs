//! LIFO teardown of GPU objects.
//!
//! Objects that live until shutdown are registered here as soon as they are
//! created. [`DeletionQueue::flush`] destroys them in reverse registration
//! order, so anything created later (a descriptor pool pointing at a buffer,
//! a view of an image) is gone before what it depends on.

use ash::vk;
use tracing::{debug, info};

use tandem_rhi::gpu::GpuDevice;

/// One deferred destruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionAction {
    DestroyBuffer(vk::Buffer),
    DestroyImage(vk::Image),
    DestroyImageView(vk::ImageView),
    DestroySampler(vk::Sampler),
    FreeMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    /// Also frees every descriptor set allocated from the pool.
    DestroyDescriptorPool(vk::DescriptorPool),
}

impl DeletionAction {
    fn execute<D: GpuDevice + ?Sized>(self, device: &D) {
        match self {
            DeletionAction::DestroyBuffer(buffer) => device.destroy_buffer(buffer),
            DeletionAction::DestroyImage(image) => device.destroy_image(image),
            DeletionAction::DestroyImageView(view) => device.destroy_image_view(view),
            DeletionAction::DestroySampler(sampler) => device.destroy_sampler(sampler),
            DeletionAction::FreeMemory(memory) => device.free_memory(memory),
            DeletionAction::UnmapMemory(memory) => device.unmap_memory(memory),
            DeletionAction::DestroyDescriptorSetLayout(layout) => {
                device.destroy_descriptor_set_layout(layout)
            }
            DeletionAction::DestroyDescriptorPool(pool) => device.destroy_descriptor_pool(pool),
        }
    }
}

/// Stack of pending destructions, flushed once after the device is idle.
#[derive(Debug, Default)]
pub struct DeletionQueue {
    actions: Vec<DeletionAction>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` to run before everything registered earlier.
    pub fn push(&mut self, action: DeletionAction) {
        self.actions.push(action);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pending actions in registration order.
    pub fn pending(&self) -> &[DeletionAction] {
        &self.actions
    }

    /// Runs every pending action, last registered first, and leaves the
    /// queue empty.
    ///
    /// The caller must have waited for the device to go idle.
    pub fn flush<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        let count = self.actions.len();
        while let Some(action) = self.actions.pop() {
            debug!("Deleting {:?}", action);
            action.execute(device);
        }
        info!("Deletion queue flushed ({} action(s))", count);
    }
}
