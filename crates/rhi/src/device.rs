//! Vulkan logical device and queue management.
//!
//! # Overview
//!
//! [`Device`] owns the `ash::Device`, its graphics, present and compute
//! queues, and a small command pool for one-time upload commands. It is the
//! production implementation of [`GpuDevice`]: every resource is a dedicated
//! allocation, and every call maps one-to-one onto a Vulkan entry point.
//!
//! # Example
//!
//! ```no_run
//! use tandem_rhi::instance::Instance;
//! use tandem_rhi::physical_device::select_physical_device;
//! use tandem_rhi::device::Device;
//! use tandem_rhi::gpu::GpuDevice;
//! use ash::vk;
//!
//! let instance = Instance::new(false, &[]).expect("Failed to create instance");
//! let surface: vk::SurfaceKHR = vk::SurfaceKHR::null(); // placeholder
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//!
//! let info = select_physical_device(instance.handle(), surface, &surface_loader)
//!     .expect("No suitable GPU found");
//! let device = Device::new(&instance, &info).expect("Failed to create logical device");
//! device.wait_idle().expect("device idle");
//! ```

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::descriptor::{self, DescriptorWrite};
use crate::error::{RhiError, RhiResult};
use crate::gpu::{GpuDevice, ImageDesc, QueueKind, QueueSubmit};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices};

/// Required device extensions.
const DEVICE_EXTENSIONS: &[&std::ffi::CStr] =
    &[ash::khr::swapchain::NAME, ash::khr::dynamic_rendering::NAME];

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// `Device` is shared through `Arc`. The upload command pool is the only
/// externally synchronized object it owns and sits behind a `Mutex`.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    compute_queue: vk::Queue,
    queue_families: QueueFamilyIndices,
    /// Families that access shared resources; more than one means concurrent sharing.
    sharing_families: Vec<u32>,
    upload_pool: Mutex<vk::CommandPool>,
}

impl Device {
    /// Creates the logical device, retrieves its queues and the upload pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue families are incomplete or any Vulkan
    /// creation call fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> Result<Arc<Self>, RhiError> {
        let queue_families = physical_device_info.queue_families;
        let (Some(graphics_family), Some(present_family), Some(compute_family)) = (
            queue_families.graphics_family,
            queue_families.present_family,
            queue_families.compute_family,
        ) else {
            return Err(RhiError::NoSuitableGpu);
        };

        let unique_families = queue_families.unique_families();
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        debug!(
            "Creating {} queue(s) for families: {:?}",
            queue_create_infos.len(),
            unique_families
        );

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };

        info!(
            "Logical device created with {} extension(s)",
            DEVICE_EXTENSIONS.len()
        );

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };
        let compute_queue = unsafe { device.get_device_queue(compute_family, 0) };
        debug!(
            "Queues retrieved: graphics={}, present={}, compute={}",
            graphics_family, present_family, compute_family
        );

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(graphics_family);
        let upload_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        let mut sharing_families = vec![graphics_family];
        if compute_family != graphics_family {
            sharing_families.push(compute_family);
        }

        Ok(Arc::new(Self {
            device,
            physical_device: physical_device_info.device,
            memory_properties: physical_device_info.memory_properties,
            graphics_queue,
            present_queue,
            compute_queue,
            queue_families,
            sharing_families,
            upload_pool: Mutex::new(upload_pool),
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the graphics queue handle.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Returns the presentation queue handle.
    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Returns the compute queue handle, possibly equal to the graphics queue.
    #[inline]
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Returns the queue family indices.
    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Compute => self.compute_queue,
        }
    }

    fn queue_family(&self, kind: QueueKind) -> u32 {
        let family = match kind {
            QueueKind::Graphics => self.queue_families.graphics_family,
            QueueKind::Compute => self.queue_families.compute_family,
        };
        family.unwrap_or_default()
    }

    /// Records commands into a fresh primary buffer, submits them to the
    /// graphics queue and waits for the queue to drain.
    fn run_one_time(&self, record: impl FnOnce(vk::CommandBuffer)) -> RhiResult<()> {
        let pool = lock_upload_pool(&self.upload_pool);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)? }[0];

        let result = (|| -> RhiResult<()> {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device
                    .begin_command_buffer(command_buffer, &begin_info)?;
            }
            record(command_buffer);
            unsafe {
                self.device.end_command_buffer(command_buffer)?;
                let command_buffers = [command_buffer];
                let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.graphics_queue, &[submit], vk::Fence::null())?;
                self.device.queue_wait_idle(self.graphics_queue)?;
            }
            Ok(())
        })();

        unsafe {
            self.device.free_command_buffers(*pool, &[command_buffer]);
        }
        result
    }

    fn sharing(&self) -> (vk::SharingMode, &[u32]) {
        if self.sharing_families.len() > 1 {
            (vk::SharingMode::CONCURRENT, &self.sharing_families)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        }
    }
}

impl GpuDevice for Device {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RhiResult<vk::Buffer> {
        let (sharing_mode, families) = self.sharing();
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families);
        Ok(unsafe { self.device.create_buffer(&info, None)? })
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> RhiResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0)? };
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> RhiResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        Ok(unsafe { self.device.allocate_memory(&info, None)? })
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
    ) -> RhiResult<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        let (sharing_mode, families) = self.sharing();
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .samples(vk::SampleCountFlags::TYPE_1);
        Ok(unsafe { self.device.create_image(&info, None)? })
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> RhiResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0)? };
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
    ) -> RhiResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self) -> RhiResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .max_lod(0.0);
        Ok(unsafe { self.device.create_sampler(&info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn copy_buffer_now(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        self.run_one_time(|command_buffer| {
            let region = vk::BufferCopy::default().size(size);
            unsafe {
                self.device
                    .cmd_copy_buffer(command_buffer, src, dst, &[region]);
            }
        })
    }

    fn transition_image_now(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> RhiResult<()> {
        self.run_one_time(|command_buffer| {
            let barrier = vk::ImageMemoryBarrier::default()
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_subresource_range())
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
            unsafe {
                self.device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        Ok(unsafe { self.device.allocate_descriptor_sets(&info)? })
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        descriptor::write_descriptor_sets(&self.device, writes);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, queue: QueueKind) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family(queue));
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&info)? })
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn cmd_bind_compute(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, stages, 0, data);
        }
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) };
    }

    fn cmd_dispatch_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        unsafe {
            self.device
                .cmd_dispatch_indirect(command_buffer, buffer, offset);
        }
    }

    fn submit(&self, queue: QueueKind, submit: &QueueSubmit<'_>) -> RhiResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submit.waits.iter().map(|wait| wait.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submit.waits.iter().map(|wait| wait.stage).collect();
        let command_buffers = [submit.command_buffer];

        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(submit.signals);

        unsafe {
            self.device
                .queue_submit(self.queue(queue), &[info], submit.fence)?;
        }
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            let pool = self
                .upload_pool
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner);
            self.device.destroy_command_pool(*pool, None);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: ash::Device is Send+Sync, the remaining fields are Copy handles or
// plain data, and the upload pool is guarded by a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

/// Locks the upload pool, recovering it if an upload panicked while holding
/// the lock. The pool handle itself cannot be left half-updated.
fn lock_upload_pool(pool: &Mutex<vk::CommandPool>) -> MutexGuard<'_, vk::CommandPool> {
    pool.lock().unwrap_or_else(|poisoned| {
        warn!("Upload pool lock was poisoned by a panicking upload, recovering it");
        poisoned.into_inner()
    })
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poisoned_upload_pool_is_recovered() {
        use ash::vk::Handle;

        let pool = Arc::new(Mutex::new(vk::CommandPool::from_raw(0x42)));
        let held = pool.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("upload failed while recording");
        })
        .join();
        assert!(panicked.is_err());
        assert!(pool.is_poisoned());

        assert_eq!(*lock_upload_pool(&pool), vk::CommandPool::from_raw(0x42));
    }

    #[test]
    fn test_device_extensions_defined() {
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
        assert!(DEVICE_EXTENSIONS.contains(&ash::khr::dynamic_rendering::NAME));
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }

    #[test]
    fn test_color_subresource_range_covers_single_level() {
        let range = color_subresource_range();
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}
