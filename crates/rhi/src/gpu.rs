//! The device seam used by resource bundles and the frame pipeline.
//!
//! [`GpuDevice`] is a thin, handle-based view of a Vulkan logical device: it
//! creates and destroys objects, records the few compute commands the frame
//! pipeline issues itself, and submits work. Higher layers only talk to the
//! GPU through it, which keeps them independent of `ash::Device` and lets
//! them run against a recording device in tests.
//!
//! [`crate::device::Device`] implements it on top of `ash`.

use std::ptr::NonNull;

use ash::vk;

use crate::descriptor::DescriptorWrite;
use crate::error::RhiResult;

/// Queue a submission targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics queue (also used for one-time transfer commands)
    Graphics,
    /// Compute queue, which may alias the graphics queue
    Compute,
}

/// A semaphore wait together with the stage that waits on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// One command buffer submission.
#[derive(Clone, Copy, Debug)]
pub struct QueueSubmit<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [vk::Semaphore],
    /// Fence signalled on completion, or null.
    pub fence: vk::Fence,
}

/// Parameters for a 2D color image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

/// Handle-based access to a logical device.
///
/// Creation calls return Vulkan handles the caller owns; destruction calls
/// must only be made once per handle and only after the GPU stopped using it.
pub trait GpuDevice {
    /// Memory-type table of the physical device.
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    // Buffers and memory

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RhiResult<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> RhiResult<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Allocates one dedicated memory block.
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> RhiResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps `size` bytes of host-visible memory from offset zero.
    ///
    /// The pointer stays valid until [`GpuDevice::unmap_memory`] or
    /// [`GpuDevice::free_memory`] is called for `memory`.
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize)
    -> RhiResult<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    // Images

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> RhiResult<()>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, image: vk::Image, format: vk::Format)
    -> RhiResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Creates a linear, clamp-to-edge sampler.
    fn create_sampler(&self) -> RhiResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // One-time commands, submitted and waited on before returning

    fn copy_buffer_now(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RhiResult<()>;
    fn transition_image_now(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> RhiResult<()>;

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool>;
    /// Destroys the pool and implicitly frees every set allocated from it.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Synchronization

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    /// Waits up to `timeout_ns`. Returns `Ok(false)` if the fence did not
    /// signal in time.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command buffers

    /// Creates a pool whose buffers can be reset individually.
    fn create_command_pool(&self, queue: QueueKind) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn cmd_bind_compute(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_dispatch_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );

    // Queues

    fn submit(&self, queue: QueueKind, submit: &QueueSubmit<'_>) -> RhiResult<()>;
    /// Blocks until every queue is idle.
    fn wait_idle(&self) -> RhiResult<()>;
}
