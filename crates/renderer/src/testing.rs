//! Recording doubles for the device, the swapchain and the graphics recorder.
//!
//! Handles come from a counter, host-visible memory is backed by real bytes,
//! and every call that matters for ordering lands in one shared event log.
//! Fences submitted with work signal the first time they are waited on,
//! unless [`MockDevice::hang_fences`] was called.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;

use tandem_rhi::descriptor::DescriptorWrite;
use tandem_rhi::gpu::{GpuDevice, ImageDesc, QueueKind, QueueSubmit, SemaphoreWait};
use tandem_rhi::memory::{DEVICE_LOCAL, HOST_MAPPED};
use tandem_rhi::swapchain::{AcquireOutcome, SwapchainProvider};
use tandem_rhi::{RhiError, RhiResult};

use crate::frame_pipeline::{FrameTarget, GraphicsRecorder};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    DestroyBuffer(vk::Buffer),
    DestroyImage(vk::Image),
    DestroyImageView(vk::ImageView),
    DestroySampler(vk::Sampler),
    FreeMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorPool(vk::DescriptorPool),
    DestroyFence(vk::Fence),
    DestroySemaphore(vk::Semaphore),
    DestroyCommandPool(vk::CommandPool),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    },
    TransitionImage {
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    ResetFence(vk::Fence),
    FenceSignaled(vk::Fence),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    BindCompute {
        command_buffer: vk::CommandBuffer,
        set: vk::DescriptorSet,
    },
    PushConstants {
        command_buffer: vk::CommandBuffer,
        data: Vec<u8>,
    },
    Dispatch {
        command_buffer: vk::CommandBuffer,
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    Submit(QueueKind, SubmitRecord),
    WaitIdle,
    Acquire(vk::Semaphore),
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    RecreateSwapchain(vk::Extent2D),
}

impl Event {
    fn is_destroy(&self) -> bool {
        matches!(
            self,
            Event::DestroyBuffer(_)
                | Event::DestroyImage(_)
                | Event::DestroyImageView(_)
                | Event::DestroySampler(_)
                | Event::FreeMemory(_)
                | Event::UnmapMemory(_)
                | Event::DestroyDescriptorSetLayout(_)
                | Event::DestroyDescriptorPool(_)
                | Event::DestroyFence(_)
                | Event::DestroySemaphore(_)
                | Event::DestroyCommandPool(_)
        )
    }
}

/// Owned copy of a [`QueueSubmit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitRecord {
    pub command_buffer: vk::CommandBuffer,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Clone, Debug)]
pub struct PoolRecord {
    pub max_sets: u32,
    pub sizes: Vec<vk::DescriptorPoolSize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    Pending,
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

#[derive(Default)]
struct State {
    buffers: HashMap<vk::Buffer, vk::DeviceSize>,
    images: HashMap<vk::Image, vk::DeviceSize>,
    image_usage: HashMap<vk::Image, vk::ImageUsageFlags>,
    memory: HashMap<vk::DeviceMemory, Box<[u8]>>,
    pools: HashMap<vk::DescriptorPool, PoolRecord>,
    writes: Vec<DescriptorWrite>,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashSet<vk::Semaphore>,
}

pub struct MockDevice {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    next_handle: Cell<u64>,
    hung: Cell<bool>,
    state: RefCell<State>,
    log: EventLog,
}

impl MockDevice {
    /// One device-local and one host-visible memory type.
    pub fn new() -> Self {
        Self::with_memory_types(&[DEVICE_LOCAL, HOST_MAPPED])
    }

    pub fn without_host_visible_memory() -> Self {
        Self::with_memory_types(&[DEVICE_LOCAL])
    }

    fn with_memory_types(types: &[vk::MemoryPropertyFlags]) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in memory_properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        Self {
            memory_properties,
            next_handle: Cell::new(0x1000),
            hung: Cell::new(false),
            state: RefCell::new(State::default()),
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Makes every fence with outstanding work time out.
    pub fn hang_fences(&self) {
        self.hung.set(true);
    }

    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().clone()
    }

    /// Destruction events in the order they happened.
    pub fn destroyed(&self) -> Vec<Event> {
        self.log
            .borrow()
            .iter()
            .filter(|event| event.is_destroy())
            .cloned()
            .collect()
    }

    pub fn submits(&self) -> Vec<(QueueKind, SubmitRecord)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Submit(queue, record) => Some((*queue, record.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn mapped_bytes(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state
            .borrow()
            .memory
            .get(&memory)
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default()
    }

    pub fn pool(&self, pool: vk::DescriptorPool) -> Option<PoolRecord> {
        self.state.borrow().pools.get(&pool).cloned()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.borrow().writes.clone()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.borrow().fences.get(&fence) == Some(&FenceState::Signaled)
    }

    /// Usage the image was created with.
    pub fn image_usage(&self, image: vk::Image) -> Option<vk::ImageUsageFlags> {
        self.state.borrow().image_usage.get(&image).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_memory(&self) -> usize {
        self.state.borrow().memory.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.borrow().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.borrow().semaphores.len()
    }

    fn next<H: Handle>(&self) -> H {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        H::from_raw(raw)
    }

    fn push(&self, event: Event) {
        self.log.borrow_mut().push(event);
    }

    fn requirements(size: vk::DeviceSize) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: u32::MAX,
        }
    }
}

impl GpuDevice for MockDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> RhiResult<vk::Buffer> {
        let buffer = self.next();
        self.state.borrow_mut().buffers.insert(buffer, size);
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.borrow().buffers.get(&buffer).copied().unwrap_or(0);
        Self::requirements(size)
    }

    fn bind_buffer_memory(&self, _buffer: vk::Buffer, _memory: vk::DeviceMemory) -> RhiResult<()> {
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.borrow_mut().buffers.remove(&buffer);
        self.push(Event::DestroyBuffer(buffer));
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        _memory_type_index: u32,
    ) -> RhiResult<vk::DeviceMemory> {
        let memory = self.next();
        self.state
            .borrow_mut()
            .memory
            .insert(memory, vec![0u8; size as usize].into_boxed_slice());
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.borrow_mut().memory.remove(&memory);
        self.push(Event::FreeMemory(memory));
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
    ) -> RhiResult<NonNull<u8>> {
        let mut state = self.state.borrow_mut();
        let bytes = state
            .memory
            .get_mut(&memory)
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if (bytes.len() as u64) < size {
            return Err(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        NonNull::new(bytes.as_mut_ptr())
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.push(Event::UnmapMemory(memory));
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        let image = self.next();
        let size = u64::from(desc.extent.width) * u64::from(desc.extent.height) * 4;
        let mut state = self.state.borrow_mut();
        state.images.insert(image, size);
        state.image_usage.insert(image, desc.usage);
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self.state.borrow().images.get(&image).copied().unwrap_or(0);
        Self::requirements(size)
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> RhiResult<()> {
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.borrow_mut().images.remove(&image);
        self.push(Event::DestroyImage(image));
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
    ) -> RhiResult<vk::ImageView> {
        Ok(self.next())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.push(Event::DestroyImageView(view));
    }

    fn create_sampler(&self) -> RhiResult<vk::Sampler> {
        Ok(self.next())
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.push(Event::DestroySampler(sampler));
    }

    fn copy_buffer_now(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        self.push(Event::CopyBuffer { src, dst, size });
        Ok(())
    }

    fn transition_image_now(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> RhiResult<()> {
        self.push(Event::TransitionImage {
            image,
            old: old_layout,
            new: new_layout,
        });
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(self.next())
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.push(Event::DestroyDescriptorSetLayout(layout));
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let pool = self.next();
        self.state.borrow_mut().pools.insert(
            pool,
            PoolRecord {
                max_sets,
                sizes: pool_sizes.to_vec(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.push(Event::DestroyDescriptorPool(pool));
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        Ok(layouts.iter().map(|_| self.next()).collect())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.borrow_mut().writes.extend_from_slice(writes);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence = self.next();
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        self.state.borrow_mut().fences.insert(fence, state);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> RhiResult<bool> {
        let mut state = self.state.borrow_mut();
        let current = state
            .fences
            .get_mut(&fence)
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN))?;
        let previous = *current;
        match previous {
            FenceState::Signaled => Ok(true),
            FenceState::Pending if !self.hung.get() => {
                *current = FenceState::Signaled;
                drop(state);
                self.push(Event::FenceSignaled(fence));
                Ok(true)
            }
            // Nothing will ever signal it.
            _ => Ok(false),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        if let Some(state) = self.state.borrow_mut().fences.get_mut(&fence) {
            *state = FenceState::Unsignaled;
        }
        self.push(Event::ResetFence(fence));
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.borrow_mut().fences.remove(&fence);
        self.push(Event::DestroyFence(fence));
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let semaphore = self.next();
        self.state.borrow_mut().semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.borrow_mut().semaphores.remove(&semaphore);
        self.push(Event::DestroySemaphore(semaphore));
    }

    fn create_command_pool(&self, _queue: QueueKind) -> RhiResult<vk::CommandPool> {
        Ok(self.next())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.push(Event::DestroyCommandPool(pool));
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| self.next()).collect())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.push(Event::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.push(Event::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.push(Event::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_bind_compute(
        &self,
        command_buffer: vk::CommandBuffer,
        _pipeline: vk::Pipeline,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.push(Event::BindCompute {
            command_buffer,
            set,
        });
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.push(Event::PushConstants {
            command_buffer,
            data: data.to_vec(),
        });
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.push(Event::Dispatch {
            command_buffer,
            x,
            y,
            z,
        });
    }

    fn cmd_dispatch_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        self.push(Event::DispatchIndirect {
            command_buffer,
            buffer,
            offset,
        });
    }

    fn submit(&self, queue: QueueKind, submit: &QueueSubmit<'_>) -> RhiResult<()> {
        if submit.fence != vk::Fence::null() {
            if let Some(state) = self.state.borrow_mut().fences.get_mut(&submit.fence) {
                *state = FenceState::Pending;
            }
        }
        self.push(Event::Submit(
            queue,
            SubmitRecord {
                command_buffer: submit.command_buffer,
                waits: submit.waits.to_vec(),
                signals: submit.signals.to_vec(),
                fence: submit.fence,
            },
        ));
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.push(Event::WaitIdle);
        let mut state = self.state.borrow_mut();
        let mut signaled = Vec::new();
        for (fence, fence_state) in state.fences.iter_mut() {
            if *fence_state == FenceState::Pending {
                *fence_state = FenceState::Signaled;
                signaled.push(*fence);
            }
        }
        drop(state);
        for fence in signaled {
            self.push(Event::FenceSignaled(fence));
        }
        Ok(())
    }
}

/// Scripted result of the next acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptedAcquire {
    OutOfDate,
    Suboptimal,
    /// No image became available within the timeout.
    Timeout,
}

/// Swapchain double. Acquires cycle through the images unless scripted.
pub struct MockSwapchain {
    log: EventLog,
    extent: vk::Extent2D,
    drawable: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    next_image: u32,
    acquire_script: VecDeque<ScriptedAcquire>,
    present_script: VecDeque<bool>,
    presented: Vec<(u32, vk::Semaphore)>,
    recreations: usize,
    live_swapchains: usize,
    live_views: usize,
}

impl MockSwapchain {
    pub fn new(device: &MockDevice, extent: vk::Extent2D, image_count: u32) -> Self {
        let images = (0..image_count)
            .map(|i| vk::Image::from_raw(0x5000 + u64::from(i)))
            .collect();
        let views = (0..image_count)
            .map(|i| vk::ImageView::from_raw(0x6000 + u64::from(i)))
            .collect();
        Self {
            log: device.log(),
            extent,
            drawable: extent,
            images,
            views,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            presented: Vec::new(),
            recreations: 0,
            live_swapchains: 1,
            live_views: image_count as usize,
        }
    }

    pub fn script_acquire(&mut self, outcome: ScriptedAcquire) {
        self.acquire_script.push_back(outcome);
    }

    /// Queues the stale flag returned by the next present.
    pub fn script_present(&mut self, stale: bool) {
        self.present_script.push_back(stale);
    }

    pub fn set_drawable_extent(&mut self, extent: vk::Extent2D) {
        self.drawable = extent;
    }

    pub fn presented(&self) -> Vec<(u32, vk::Semaphore)> {
        self.presented.clone()
    }

    pub fn recreations(&self) -> usize {
        self.recreations
    }

    pub fn live_swapchains(&self) -> usize {
        self.live_swapchains
    }

    pub fn live_views(&self) -> usize {
        self.live_views
    }

    fn retire_old(&mut self, count: usize) {
        self.live_swapchains -= 1;
        self.live_views -= count;
    }
}

impl SwapchainProvider for MockSwapchain {
    fn drawable_extent(&self) -> RhiResult<vk::Extent2D> {
        Ok(self.drawable)
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_SRGB
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    fn image_view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> RhiResult<AcquireOutcome> {
        self.log.borrow_mut().push(Event::Acquire(semaphore));
        let scripted = self.acquire_script.pop_front();
        match scripted {
            Some(ScriptedAcquire::OutOfDate) => return Ok(AcquireOutcome::OutOfDate),
            Some(ScriptedAcquire::Timeout) => {
                return Err(RhiError::DeviceTimeout {
                    what: "swapchain image acquisition",
                });
            }
            _ => {}
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count();
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: scripted == Some(ScriptedAcquire::Suboptimal),
        })
    }

    fn present(&mut self, image_index: u32, wait_semaphore: vk::Semaphore) -> RhiResult<bool> {
        self.log.borrow_mut().push(Event::Present {
            image_index,
            wait: wait_semaphore,
        });
        self.presented.push((image_index, wait_semaphore));
        Ok(self.present_script.pop_front().unwrap_or(false))
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        // The replacement exists before the old one is retired.
        let count = self.images.len();
        self.live_swapchains += 1;
        self.live_views += count;
        self.retire_old(count);

        self.extent = extent;
        self.next_image = 0;
        self.recreations += 1;
        self.log
            .borrow_mut()
            .push(Event::RecreateSwapchain(extent));
        Ok(())
    }
}

/// Graphics recorder that remembers what it was asked to draw.
#[derive(Default)]
pub struct MockRecorder {
    pub targets: Vec<FrameTarget>,
    pub resizes: Vec<vk::Extent2D>,
    pub fail_next: bool,
}

impl GraphicsRecorder for MockRecorder {
    fn record(
        &mut self,
        _command_buffer: vk::CommandBuffer,
        target: &FrameTarget,
    ) -> RhiResult<()> {
        if std::mem::take(&mut self.fail_next) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
        }
        self.targets.push(*target);
        Ok(())
    }

    fn on_resize(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        self.resizes.push(extent);
        Ok(())
    }
}
