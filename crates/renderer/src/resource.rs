//! Per-frame replicated GPU resources.
//!
//! Every resource exists once per frame in flight so the CPU can write
//! replica `i` while the GPU still reads replica `i - 1`. Each replica gets
//! its own buffer or image and its own dedicated memory block.
//!
//! # Buffers
//!
//! - Host-visible buffers are mapped for their whole lifetime. Initial data
//!   lands in replica 0 only.
//! - Device-local buffers with initial data are filled through one transient
//!   staging buffer, copied into every replica and destroyed right away.
//!
//! # Images
//!
//! Images are 2D `R8G8B8A8_UNORM`, device local, and moved to `GENERAL` once
//! at creation so compute can write them and graphics can sample them.
//!
//! Everything that outlives creation is registered with the
//! [`DeletionQueue`] as soon as it exists.

use std::mem::size_of;
use std::ptr::NonNull;

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, error};

use tandem_rhi::descriptor::DescriptorKind;
use tandem_rhi::gpu::{GpuDevice, ImageDesc};
use tandem_rhi::memory::{DEVICE_LOCAL, HOST_MAPPED, find_memory_type};
use tandem_rhi::{RhiError, RhiResult};

use crate::deletion_queue::{DeletionAction, DeletionQueue};

/// Format of every image a bundle allocates.
pub const IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Layout images are kept in for their whole lifetime.
pub const IMAGE_LAYOUT: vk::ImageLayout = vk::ImageLayout::GENERAL;

/// Size, placement and optional seed data of a buffer declaration.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub host_visible: bool,
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> BufferDesc<'a> {
    /// Host-visible, persistently mapped buffer of `size` bytes.
    pub fn mapped(size: vk::DeviceSize) -> Self {
        Self {
            size,
            host_visible: true,
            initial_data: None,
        }
    }

    /// Device-local buffer of `size` bytes.
    pub fn device_local(size: vk::DeviceSize) -> Self {
        Self {
            size,
            host_visible: false,
            initial_data: None,
        }
    }

    /// Mapped buffer sized for one `T`.
    pub fn mapped_for<T: Pod>() -> Self {
        Self::mapped(size_of::<T>() as vk::DeviceSize)
    }

    /// Buffer sized and seeded from `data`.
    pub fn from_slice<T: Pod>(data: &'a [T], host_visible: bool) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self {
            size: bytes.len() as vk::DeviceSize,
            host_visible,
            initial_data: Some(bytes),
        }
    }

    /// Seeds the buffer with `bytes`.
    pub fn with_data(mut self, bytes: &'a [u8]) -> Self {
        self.initial_data = Some(bytes);
        self
    }
}

/// One buffer with its own memory, mapped when host visible.
#[derive(Clone, Copy, Debug)]
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub mapped: Option<NonNull<u8>>,
}

impl AllocatedBuffer {
    /// Creates a buffer, allocates and binds dedicated memory, and maps it
    /// when `properties` include `HOST_VISIBLE`.
    ///
    /// Nothing is registered for deletion; on failure everything created so
    /// far is destroyed before returning.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &D,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RhiResult<Self> {
        let buffer = device.create_buffer(size, usage)?;
        let requirements = device.buffer_memory_requirements(buffer);

        let memory = match find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            properties,
        )
        .and_then(|type_index| device.allocate_memory(requirements.size, type_index))
        {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let mapped = device.bind_buffer_memory(buffer, memory).and_then(|()| {
            if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                device.map_memory(memory, size).map(Some)
            } else {
                Ok(None)
            }
        });
        let mapped = match mapped {
            Ok(mapped) => mapped,
            Err(e) => {
                device.free_memory(memory);
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        Ok(Self {
            buffer,
            memory,
            size,
            mapped,
        })
    }

    /// Like [`AllocatedBuffer::new`], and registers the teardown so the
    /// flush unmaps, destroys the buffer, then frees the memory.
    pub fn new_registered<D: GpuDevice + ?Sized>(
        device: &D,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        deletion_queue: &mut DeletionQueue,
    ) -> RhiResult<Self> {
        let allocated = Self::new(device, size, usage, properties)?;
        deletion_queue.push(DeletionAction::FreeMemory(allocated.memory));
        deletion_queue.push(DeletionAction::DestroyBuffer(allocated.buffer));
        if allocated.mapped.is_some() {
            deletion_queue.push(DeletionAction::UnmapMemory(allocated.memory));
        }
        Ok(allocated)
    }

    /// Copies `bytes` to the start of the mapping.
    ///
    /// # Errors
    ///
    /// `UpdatingUnmappedResource` for unmapped buffers and `UpdateTooLarge`
    /// when `bytes` does not fit. `binding` is only used in the error.
    pub fn write(&self, binding: u32, bytes: &[u8]) -> RhiResult<()> {
        let ptr = self
            .mapped
            .ok_or(RhiError::UpdatingUnmappedResource { binding })?;
        check_fits(binding, bytes.len(), self.size)?;
        // SAFETY: the mapping covers `size` bytes and `bytes` fits in it.
        unsafe { write_mapped(ptr, bytes) };
        Ok(())
    }

    fn destroy<D: GpuDevice + ?Sized>(self, device: &D) {
        if self.mapped.is_some() {
            device.unmap_memory(self.memory);
        }
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory);
    }
}

/// Replicated uniform or storage buffer owned by a bundle.
#[derive(Debug)]
pub struct BufferResource {
    kind: DescriptorKind,
    size: vk::DeviceSize,
    replicas: Vec<AllocatedBuffer>,
}

impl BufferResource {
    /// Creates `frames` replicas and seeds them from `desc.initial_data`.
    pub(crate) fn new<D: GpuDevice + ?Sized>(
        device: &D,
        frames: usize,
        binding: u32,
        kind: DescriptorKind,
        desc: &BufferDesc<'_>,
        deletion_queue: &mut DeletionQueue,
    ) -> RhiResult<Self> {
        if let Some(data) = desc.initial_data {
            check_fits(binding, data.len(), desc.size)?;
        }

        let base_usage = match kind {
            DescriptorKind::UniformBuffer => vk::BufferUsageFlags::UNIFORM_BUFFER,
            // Storage buffers may also feed a vertex stage directly.
            _ => vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER,
        };
        let staged = !desc.host_visible && desc.initial_data.is_some();
        let (usage, properties) = if desc.host_visible {
            (base_usage, HOST_MAPPED)
        } else if staged {
            (base_usage | vk::BufferUsageFlags::TRANSFER_DST, DEVICE_LOCAL)
        } else {
            (base_usage, DEVICE_LOCAL)
        };

        let mut replicas = Vec::with_capacity(frames);
        for _ in 0..frames {
            replicas.push(AllocatedBuffer::new_registered(
                device,
                desc.size,
                usage,
                properties,
                deletion_queue,
            )?);
        }

        if let Some(data) = desc.initial_data {
            if desc.host_visible {
                replicas[0].write(binding, data)?;
            } else {
                upload_staged(device, binding, data, &replicas)?;
            }
        }

        debug!(
            "Created {} x{} for binding {}: {} bytes, {}",
            kind.name(),
            frames,
            binding,
            desc.size,
            if desc.host_visible { "mapped" } else { "device local" }
        );

        Ok(Self {
            kind,
            size: desc.size,
            replicas,
        })
    }

    #[inline]
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.replicas.iter().all(|replica| replica.mapped.is_some())
    }

    /// Buffer handle of replica `frame`.
    pub fn buffer(&self, frame: usize) -> Option<vk::Buffer> {
        self.replicas.get(frame).map(|replica| replica.buffer)
    }

    pub fn replicas(&self) -> &[AllocatedBuffer] {
        &self.replicas
    }

    /// Copies `bytes` into every replica listed in `frames`.
    ///
    /// The caller has already validated the frame indices.
    pub(crate) fn write_frames(&self, binding: u32, bytes: &[u8], frames: &[usize]) -> RhiResult<()> {
        if !self.is_mapped() {
            return Err(RhiError::UpdatingUnmappedResource { binding });
        }
        check_fits(binding, bytes.len(), self.size)?;
        for &frame in frames {
            self.replicas[frame].write(binding, bytes)?;
        }
        Ok(())
    }
}

/// Fills every replica from one transient staging buffer.
fn upload_staged<D: GpuDevice + ?Sized>(
    device: &D,
    binding: u32,
    data: &[u8],
    replicas: &[AllocatedBuffer],
) -> RhiResult<()> {
    let size = data.len() as vk::DeviceSize;
    let staging = AllocatedBuffer::new(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        HOST_MAPPED,
    )?;

    let result = staging.write(binding, data).and_then(|()| {
        replicas
            .iter()
            .try_for_each(|replica| device.copy_buffer_now(staging.buffer, replica.buffer, size))
    });
    staging.destroy(device);

    if let Err(e) = &result {
        error!("Staging upload for binding {} failed: {}", binding, e);
    }
    result.inspect(|()| debug!("Staged {} bytes into {} replica(s)", size, replicas.len()))
}

/// An image replicated per frame in flight, with one view per replica.
///
/// Cloning does not duplicate GPU objects. The bundle that allocated the
/// image destroys it; bundles that received a clone only bind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedImage {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
}

impl SharedImage {
    /// Wraps images created elsewhere with `usage`.
    pub fn new(
        images: Vec<vk::Image>,
        views: Vec<vk::ImageView>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            images,
            views,
            extent,
            format,
            usage,
        }
    }

    /// Allocates `frames` images with views and moves them to
    /// [`IMAGE_LAYOUT`].
    pub(crate) fn allocate<D: GpuDevice + ?Sized>(
        device: &D,
        frames: usize,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        deletion_queue: &mut DeletionQueue,
    ) -> RhiResult<Self> {
        let desc = ImageDesc {
            extent,
            format: IMAGE_FORMAT,
            usage,
        };

        let mut images = Vec::with_capacity(frames);
        let mut views = Vec::with_capacity(frames);
        for _ in 0..frames {
            let (image, memory) = allocate_image(device, &desc)?;
            deletion_queue.push(DeletionAction::FreeMemory(memory));
            deletion_queue.push(DeletionAction::DestroyImage(image));

            let view = device.create_image_view(image, IMAGE_FORMAT)?;
            deletion_queue.push(DeletionAction::DestroyImageView(view));

            device.transition_image_now(image, vk::ImageLayout::UNDEFINED, IMAGE_LAYOUT)?;

            images.push(image);
            views.push(view);
        }

        debug!(
            "Allocated {} image(s) of {}x{} with usage {:?}",
            frames, extent.width, extent.height, usage
        );

        Ok(Self::new(images, views, extent, IMAGE_FORMAT, usage))
    }

    /// Returns whether every one of `frames` replicas has an image and a view.
    pub fn is_complete(&self, frames: usize) -> bool {
        self.images.len() == frames
            && self.views.len() == frames
            && self.images.iter().all(|image| *image != vk::Image::null())
            && self.views.iter().all(|view| *view != vk::ImageView::null())
    }

    pub fn image(&self, frame: usize) -> Option<vk::Image> {
        self.images.get(frame).copied()
    }

    pub fn view(&self, frame: usize) -> Option<vk::ImageView> {
        self.views.get(frame).copied()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    /// Returns whether the images were created with the usage `kind` needs.
    pub fn supports(&self, kind: DescriptorKind) -> bool {
        match kind {
            DescriptorKind::StorageImage => self.usage.contains(vk::ImageUsageFlags::STORAGE),
            DescriptorKind::CombinedImageSampler => {
                self.usage.contains(vk::ImageUsageFlags::SAMPLED)
            }
            _ => false,
        }
    }
}

/// Image half of a bundle declaration.
///
/// Either `existing` is set, or `extent` sizes a new image. At least one of
/// `sampled` and `storage` must be requested.
#[derive(Clone, Debug, Default)]
pub struct ImageDecl {
    pub existing: Option<SharedImage>,
    pub extent: Option<vk::Extent2D>,
    pub sampled: bool,
    pub storage: bool,
}

impl ImageDecl {
    /// A new image of `width` x `height`.
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            extent: Some(vk::Extent2D { width, height }),
            ..Self::default()
        }
    }

    /// Binds `image` instead of allocating.
    pub fn existing(image: SharedImage) -> Self {
        Self {
            existing: Some(image),
            ..Self::default()
        }
    }

    pub fn sampled(mut self) -> Self {
        self.sampled = true;
        self
    }

    pub fn storage(mut self) -> Self {
        self.storage = true;
        self
    }

    /// Storage images are always sampleable too, so a later bundle can read
    /// them through [`ImageDecl::existing`].
    pub(crate) fn usage(&self) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::empty();
        if self.sampled || self.storage {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.storage {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        usage
    }
}

fn allocate_image<D: GpuDevice + ?Sized>(
    device: &D,
    desc: &ImageDesc,
) -> RhiResult<(vk::Image, vk::DeviceMemory)> {
    let image = device.create_image(desc)?;
    let requirements = device.image_memory_requirements(image);

    let memory = match find_memory_type(
        device.memory_properties(),
        requirements.memory_type_bits,
        DEVICE_LOCAL,
    )
    .and_then(|type_index| device.allocate_memory(requirements.size, type_index))
    {
        Ok(memory) => memory,
        Err(e) => {
            device.destroy_image(image);
            return Err(e);
        }
    };

    if let Err(e) = device.bind_image_memory(image, memory) {
        device.free_memory(memory);
        device.destroy_image(image);
        return Err(e);
    }

    Ok((image, memory))
}

fn check_fits(binding: u32, len: usize, size: vk::DeviceSize) -> RhiResult<()> {
    let len = len as u64;
    if len > size {
        return Err(RhiError::UpdateTooLarge { binding, len, size });
    }
    Ok(())
}

/// # Safety
///
/// `ptr` must point to a live mapping of at least `bytes.len()` bytes.
unsafe fn write_mapped(ptr: NonNull<u8>, bytes: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, MockDevice};

    #[test]
    fn test_buffer_desc_from_slice() {
        let data = [1.0f32, 2.0, 3.0];
        let desc = BufferDesc::from_slice(&data, false);
        assert_eq!(desc.size, 12);
        assert!(!desc.host_visible);
        assert_eq!(desc.initial_data.map(<[u8]>::len), Some(12));
    }

    #[test]
    fn test_mapped_buffer_seeds_replica_zero_only() {
        let device = MockDevice::new();
        let mut queue = DeletionQueue::new();
        let seed = [7u8; 16];

        let resource = BufferResource::new(
            &device,
            2,
            0,
            DescriptorKind::UniformBuffer,
            &BufferDesc::mapped(16).with_data(&seed),
            &mut queue,
        )
        .unwrap();

        assert!(resource.is_mapped());
        assert_eq!(device.mapped_bytes(resource.replicas()[0].memory), seed.to_vec());
        assert_eq!(device.mapped_bytes(resource.replicas()[1].memory), vec![0u8; 16]);
        // free, destroy, unmap per replica
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn test_device_local_upload_goes_through_staging() {
        let device = MockDevice::new();
        let mut queue = DeletionQueue::new();
        let seed = [3u32; 8];

        let resource = BufferResource::new(
            &device,
            2,
            1,
            DescriptorKind::StorageBuffer,
            &BufferDesc::from_slice(&seed, false),
            &mut queue,
        )
        .unwrap();

        assert!(!resource.is_mapped());
        let copies: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::CopyBuffer { src, dst, size } => Some((src, dst, size)),
                _ => None,
            })
            .collect();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].1, resource.replicas()[0].buffer);
        assert_eq!(copies[1].1, resource.replicas()[1].buffer);
        assert!(copies.iter().all(|(_, _, size)| *size == 32));

        // The staging buffer is gone before setup returns.
        let staging = copies[0].0;
        assert!(device.destroyed().contains(&Event::DestroyBuffer(staging)));
        assert!(!queue.pending().contains(&DeletionAction::DestroyBuffer(staging)));
    }

    #[test]
    fn test_initial_data_larger_than_buffer_is_rejected() {
        let device = MockDevice::new();
        let mut queue = DeletionQueue::new();
        let err = BufferResource::new(
            &device,
            2,
            4,
            DescriptorKind::UniformBuffer,
            &BufferDesc::mapped(4).with_data(&[0u8; 8]),
            &mut queue,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RhiError::UpdateTooLarge {
                binding: 4,
                len: 8,
                size: 4
            }
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_missing_memory_type_cleans_up_buffer() {
        let device = MockDevice::without_host_visible_memory();
        let err = AllocatedBuffer::new(
            &device,
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            HOST_MAPPED,
        )
        .unwrap_err();
        assert!(matches!(err, RhiError::NoSuitableMemoryType { .. }));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_registered_buffer_flush_order() {
        let device = MockDevice::new();
        let mut queue = DeletionQueue::new();
        let allocated = AllocatedBuffer::new_registered(
            &device,
            16,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            HOST_MAPPED,
            &mut queue,
        )
        .unwrap();

        queue.flush(&device);
        assert_eq!(
            device.destroyed(),
            vec![
                Event::UnmapMemory(allocated.memory),
                Event::DestroyBuffer(allocated.buffer),
                Event::FreeMemory(allocated.memory),
            ]
        );
    }

    #[test]
    fn test_allocated_images_are_transitioned_to_general() {
        let device = MockDevice::new();
        let mut queue = DeletionQueue::new();
        let image = SharedImage::allocate(
            &device,
            2,
            vk::Extent2D {
                width: 32,
                height: 16,
            },
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            &mut queue,
        )
        .unwrap();

        assert!(image.is_complete(2));
        assert_eq!(image.format(), IMAGE_FORMAT);
        let transitions = device
            .events()
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    Event::TransitionImage {
                        old: vk::ImageLayout::UNDEFINED,
                        new: vk::ImageLayout::GENERAL,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(transitions, 2);
        // memory, image, view per replica
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn test_shared_image_completeness() {
        use ash::vk::Handle;
        let extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        let one = SharedImage::new(
            vec![vk::Image::from_raw(1)],
            vec![vk::ImageView::from_raw(2)],
            extent,
            IMAGE_FORMAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(one.is_complete(1));
        assert!(!one.is_complete(2));

        let null_view = SharedImage::new(
            vec![vk::Image::from_raw(1), vk::Image::from_raw(3)],
            vec![vk::ImageView::from_raw(2), vk::ImageView::null()],
            extent,
            IMAGE_FORMAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(!null_view.is_complete(2));
        assert!(one.supports(DescriptorKind::CombinedImageSampler));
        assert!(!one.supports(DescriptorKind::StorageImage));
    }

    #[test]
    fn test_image_decl_usage() {
        assert!(ImageDecl::sized(4, 4).usage().is_empty());
        assert_eq!(
            ImageDecl::sized(4, 4).storage().usage(),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE
        );
        assert_eq!(
            ImageDecl::sized(4, 4).sampled().usage(),
            vk::ImageUsageFlags::SAMPLED
        );
        assert_eq!(
            ImageDecl::sized(4, 4).sampled().storage().usage(),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE
        );
    }
}
