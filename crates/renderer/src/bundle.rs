//! Resource bundles: one descriptor set per frame in flight over replicated
//! resources.
//!
//! A [`ResourceBundleBuilder`] accumulates binding declarations. Every
//! declaration creates its resource right away, adds to the pool-size table
//! and stages one descriptor write per frame. [`ResourceBundleBuilder::build`]
//! then creates the layout, the pool and the sets, and points set `i` at
//! replica `i` of every resource.
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use tandem_core::EngineConfig;
//! use tandem_renderer::bundle::{FrameSelector, ResourceBundleBuilder};
//! use tandem_renderer::deletion_queue::DeletionQueue;
//! use tandem_renderer::resource::BufferDesc;
//! use tandem_rhi::gpu::GpuDevice;
//!
//! # fn example(device: &impl GpuDevice) -> tandem_rhi::RhiResult<()> {
//! let config = EngineConfig::default();
//! let mut deletion_queue = DeletionQueue::new();
//!
//! let mut builder = ResourceBundleBuilder::new(device, &config, &mut deletion_queue);
//! builder
//!     .add_uniform_buffer(0, vk::ShaderStageFlags::COMPUTE, BufferDesc::mapped(64))?
//!     .add_storage_buffer(1, vk::ShaderStageFlags::COMPUTE, BufferDesc::device_local(1024))?;
//! let bundle = builder.build()?;
//!
//! bundle.update(0, &[0.5f32; 16], &FrameSelector::All)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, info};

use tandem_core::EngineConfig;
use tandem_rhi::descriptor::{DescriptorKind, DescriptorResource, DescriptorWrite, PoolSizes};
use tandem_rhi::gpu::GpuDevice;
use tandem_rhi::{RhiError, RhiResult};

use crate::deletion_queue::{DeletionAction, DeletionQueue};
use crate::resource::{BufferDesc, BufferResource, IMAGE_LAYOUT, ImageDecl, SharedImage};

/// Which replicas an update writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameSelector {
    /// Every frame in flight.
    #[default]
    All,
    /// Only the listed frames. An empty list writes nothing.
    Frames(Vec<usize>),
}

impl FrameSelector {
    /// Single frame.
    pub fn frame(index: usize) -> Self {
        FrameSelector::Frames(vec![index])
    }

    /// Resolves to concrete frame indices, rejecting any index that is not
    /// below `frames_in_flight`.
    pub fn resolve(&self, frames_in_flight: usize) -> RhiResult<Vec<usize>> {
        match self {
            FrameSelector::All => Ok((0..frames_in_flight).collect()),
            FrameSelector::Frames(frames) => {
                if let Some(&index) = frames.iter().find(|&&index| index >= frames_in_flight) {
                    return Err(RhiError::FrameIndexOutOfRange {
                        index,
                        frames_in_flight,
                    });
                }
                Ok(frames.clone())
            }
        }
    }
}

/// Image bound by a bundle.
#[derive(Clone, Debug)]
pub struct BundleImage {
    pub image: SharedImage,
    pub kind: DescriptorKind,
    /// Whether this bundle allocated the image and registered its teardown.
    pub owned: bool,
}

/// Accumulates binding declarations for one descriptor set layout.
///
/// Declaration methods take and return `&mut Self` so they chain with `?`.
/// [`ResourceBundleBuilder::build`] consumes the builder.
pub struct ResourceBundleBuilder<'a, D: GpuDevice + ?Sized> {
    device: &'a D,
    deletion_queue: &'a mut DeletionQueue,
    frames_in_flight: usize,
    layout_bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    pool_sizes: PoolSizes,
    /// Writes staged per frame; the set is filled in by `build`.
    writes: Vec<(usize, DescriptorWrite)>,
    buffers: BTreeMap<u32, BufferResource>,
    images: BTreeMap<u32, BundleImage>,
    sampler: Option<vk::Sampler>,
}

impl<'a, D: GpuDevice + ?Sized> ResourceBundleBuilder<'a, D> {
    pub fn new(
        device: &'a D,
        config: &EngineConfig,
        deletion_queue: &'a mut DeletionQueue,
    ) -> Self {
        let frames_in_flight = config.frames_in_flight;
        Self {
            device,
            deletion_queue,
            frames_in_flight,
            layout_bindings: Vec::new(),
            pool_sizes: PoolSizes::new(frames_in_flight as u32),
            writes: Vec::new(),
            buffers: BTreeMap::new(),
            images: BTreeMap::new(),
            sampler: None,
        }
    }

    /// Declares a uniform buffer at `binding`.
    pub fn add_uniform_buffer(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        desc: BufferDesc<'_>,
    ) -> RhiResult<&mut Self> {
        self.add_buffer(binding, stages, DescriptorKind::UniformBuffer, &desc)
    }

    /// Declares a storage buffer at `binding`.
    pub fn add_storage_buffer(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        desc: BufferDesc<'_>,
    ) -> RhiResult<&mut Self> {
        self.add_buffer(binding, stages, DescriptorKind::StorageBuffer, &desc)
    }

    /// Declares an image read through this bundle's linear sampler.
    pub fn add_sampled_image(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        decl: ImageDecl,
    ) -> RhiResult<&mut Self> {
        self.add_image(binding, stages, decl.sampled())
    }

    /// Declares an image accessed with load/store.
    pub fn add_storage_image(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        decl: ImageDecl,
    ) -> RhiResult<&mut Self> {
        self.add_image(binding, stages, decl.storage())
    }

    /// Declares an image. Storage use wins the descriptor kind when both
    /// uses are requested. New storage images are always created sampleable
    /// so another bundle can bind them as a sampled image.
    pub fn add_image(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        decl: ImageDecl,
    ) -> RhiResult<&mut Self> {
        self.check_unique(binding)?;

        let kind = if decl.storage {
            DescriptorKind::StorageImage
        } else if decl.sampled {
            DescriptorKind::CombinedImageSampler
        } else {
            return Err(RhiError::ImageMustBeSampledOrStorage { binding });
        };

        let usage = decl.usage();
        let (image, owned) = match decl.existing {
            Some(existing) => {
                if !existing.is_complete(self.frames_in_flight) || !existing.supports(kind) {
                    return Err(RhiError::ExistingImageInvalid { binding });
                }
                (existing, false)
            }
            None => {
                let extent = decl
                    .extent
                    .filter(|extent| extent.width > 0 && extent.height > 0)
                    .ok_or(RhiError::ImageNeitherExistingNorSized { binding })?;
                let image = SharedImage::allocate(
                    self.device,
                    self.frames_in_flight,
                    extent,
                    usage,
                    self.deletion_queue,
                )?;
                (image, true)
            }
        };

        let sampler = match kind {
            DescriptorKind::CombinedImageSampler => self.sampler()?,
            _ => vk::Sampler::null(),
        };

        for (frame, &view) in image.views().iter().enumerate() {
            self.writes.push((
                frame,
                DescriptorWrite {
                    set: vk::DescriptorSet::null(),
                    binding,
                    kind,
                    resource: DescriptorResource::Image {
                        view,
                        layout: IMAGE_LAYOUT,
                        sampler,
                    },
                },
            ));
        }

        self.declare(binding, stages, kind);
        self.images.insert(binding, BundleImage { image, kind, owned });
        Ok(self)
    }

    /// Creates the layout, pool and sets and applies every staged write.
    pub fn build(self) -> RhiResult<ResourceBundle> {
        let device = self.device;
        let frames = self.frames_in_flight;

        let layout = device.create_descriptor_set_layout(&self.layout_bindings)?;
        self.deletion_queue
            .push(DeletionAction::DestroyDescriptorSetLayout(layout));

        let pool = device.create_descriptor_pool(frames as u32, self.pool_sizes.as_slice())?;
        self.deletion_queue
            .push(DeletionAction::DestroyDescriptorPool(pool));

        let layouts = vec![layout; frames];
        let sets = device.allocate_descriptor_sets(pool, &layouts)?;

        let writes: Vec<DescriptorWrite> = self
            .writes
            .iter()
            .map(|(frame, write)| DescriptorWrite {
                set: sets[*frame],
                ..*write
            })
            .collect();
        device.update_descriptor_sets(&writes);

        info!(
            "Built resource bundle: {} binding(s), {} set(s)",
            self.layout_bindings.len(),
            sets.len()
        );

        Ok(ResourceBundle {
            frames_in_flight: frames,
            layout,
            pool,
            sets,
            buffers: self.buffers,
            images: self.images,
        })
    }

    fn add_buffer(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        kind: DescriptorKind,
        desc: &BufferDesc<'_>,
    ) -> RhiResult<&mut Self> {
        self.check_unique(binding)?;

        let resource = BufferResource::new(
            self.device,
            self.frames_in_flight,
            binding,
            kind,
            desc,
            self.deletion_queue,
        )?;

        for (frame, replica) in resource.replicas().iter().enumerate() {
            self.writes.push((
                frame,
                DescriptorWrite {
                    set: vk::DescriptorSet::null(),
                    binding,
                    kind,
                    resource: DescriptorResource::Buffer {
                        buffer: replica.buffer,
                        range: resource.size(),
                    },
                },
            ));
        }

        self.declare(binding, stages, kind);
        self.buffers.insert(binding, resource);
        Ok(self)
    }

    fn declare(&mut self, binding: u32, stages: vk::ShaderStageFlags, kind: DescriptorKind) {
        self.layout_bindings.push(kind.layout_binding(binding, stages));
        self.pool_sizes.add(kind);
        debug!("Declared {} at binding {}", kind.name(), binding);
    }

    fn check_unique(&self, binding: u32) -> RhiResult<()> {
        if self.layout_bindings.iter().any(|b| b.binding == binding) {
            return Err(RhiError::DuplicateBinding { binding });
        }
        Ok(())
    }

    fn sampler(&mut self) -> RhiResult<vk::Sampler> {
        if let Some(sampler) = self.sampler {
            return Ok(sampler);
        }
        let sampler = self.device.create_sampler()?;
        self.deletion_queue
            .push(DeletionAction::DestroySampler(sampler));
        self.sampler = Some(sampler);
        Ok(sampler)
    }
}

/// The built bundle. Its GPU objects are torn down by the deletion queue.
#[derive(Debug)]
pub struct ResourceBundle {
    frames_in_flight: usize,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    buffers: BTreeMap<u32, BufferResource>,
    images: BTreeMap<u32, BundleImage>,
}

impl ResourceBundle {
    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Descriptor set bound while recording `frame`.
    pub fn set(&self, frame: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(frame).copied()
    }

    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn buffer(&self, binding: u32) -> Option<&BufferResource> {
        self.buffers.get(&binding)
    }

    pub fn image(&self, binding: u32) -> Option<&BundleImage> {
        self.images.get(&binding)
    }

    /// Non-owning handle to the image at `binding`, for binding it in
    /// another bundle.
    pub fn shared_image(&self, binding: u32) -> Option<SharedImage> {
        self.images.get(&binding).map(|entry| entry.image.clone())
    }

    /// Writes `value` into the mapped buffer at `binding` for the selected
    /// frames.
    ///
    /// # Errors
    ///
    /// - `UnknownBinding` if nothing is declared at `binding`
    /// - `FrameIndexOutOfRange` if a selected frame does not exist; nothing
    ///   is written in that case
    /// - `UpdatingUnmappedResource` for device-local buffers and images
    /// - `UpdateTooLarge` if `value` is larger than the buffer
    pub fn update<T: Pod>(&self, binding: u32, value: &T, frames: &FrameSelector) -> RhiResult<()> {
        self.update_bytes(binding, bytemuck::bytes_of(value), frames)
    }

    /// Byte-level form of [`ResourceBundle::update`].
    pub fn update_bytes(
        &self,
        binding: u32,
        bytes: &[u8],
        frames: &FrameSelector,
    ) -> RhiResult<()> {
        let Some(resource) = self.buffers.get(&binding) else {
            return Err(if self.images.contains_key(&binding) {
                RhiError::UpdatingUnmappedResource { binding }
            } else {
                RhiError::UnknownBinding { binding }
            });
        };
        let frames = frames.resolve(self.frames_in_flight)?;
        if frames.is_empty() {
            return Ok(());
        }
        resource.write_frames(binding, bytes, &frames)
    }
}
