//! Descriptor kinds, pool sizing and backend-neutral descriptor writes.
//!
//! # Overview
//!
//! A resource bundle declares bindings one at a time. Each declaration turns
//! into:
//! 1. a layout binding ([`DescriptorKind::layout_binding`]),
//! 2. a contribution to the pool-size table ([`PoolSizes::add`]),
//! 3. one [`DescriptorWrite`] per frame in flight, applied after the sets exist.
//!
//! Writes carry plain handles so they can be recorded by a test device as
//! easily as they are translated into `vk::WriteDescriptorSet` by
//! [`write_descriptor_sets`].
//!
//! # Example
//!
//! ```
//! use tandem_rhi::descriptor::{DescriptorKind, PoolSizes};
//!
//! let mut sizes = PoolSizes::new(2);
//! sizes.add(DescriptorKind::UniformBuffer);
//! sizes.add(DescriptorKind::UniformBuffer);
//! assert_eq!(sizes.count(DescriptorKind::UniformBuffer), 4);
//! ```

use ash::vk;
use tracing::debug;

/// The descriptor types a bundle can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Read-only uniform buffer
    UniformBuffer,
    /// Read-write storage buffer
    StorageBuffer,
    /// Image read through a sampler
    CombinedImageSampler,
    /// Image read and written with `imageLoad`/`imageStore`
    StorageImage,
}

impl DescriptorKind {
    /// Converts to the Vulkan descriptor type.
    #[inline]
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Returns whether this kind binds a buffer.
    #[inline]
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            DescriptorKind::UniformBuffer | DescriptorKind::StorageBuffer
        )
    }

    /// Returns a human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            DescriptorKind::UniformBuffer => "uniform buffer",
            DescriptorKind::StorageBuffer => "storage buffer",
            DescriptorKind::CombinedImageSampler => "sampled image",
            DescriptorKind::StorageImage => "storage image",
        }
    }

    /// Creates a single-descriptor layout binding of this kind.
    #[inline]
    pub fn layout_binding(
        self,
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(self.to_vk())
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }
}

/// Pool-size table that merges repeated descriptor kinds.
///
/// Every declaration adds one descriptor per frame in flight. A kind seen
/// before grows its existing entry instead of adding a second one.
#[derive(Clone, Debug)]
pub struct PoolSizes {
    frames_in_flight: u32,
    sizes: Vec<vk::DescriptorPoolSize>,
}

impl PoolSizes {
    /// Creates an empty table for `frames_in_flight` replicas.
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight,
            sizes: Vec::new(),
        }
    }

    /// Accounts for one more declaration of `kind`.
    pub fn add(&mut self, kind: DescriptorKind) {
        let ty = kind.to_vk();
        match self.sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += self.frames_in_flight,
            None => self.sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(self.frames_in_flight),
            ),
        }
    }

    /// Descriptor capacity currently reserved for `kind`.
    pub fn count(&self, kind: DescriptorKind) -> u32 {
        let ty = kind.to_vk();
        self.sizes
            .iter()
            .find(|size| size.ty == ty)
            .map_or(0, |size| size.descriptor_count)
    }

    /// The merged entries, in first-seen order.
    #[inline]
    pub fn as_slice(&self) -> &[vk::DescriptorPoolSize] {
        &self.sizes
    }

    /// Returns whether nothing has been declared.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// The resource a descriptor write points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    /// A buffer range starting at offset zero.
    Buffer {
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    /// An image view in `layout`, with `sampler` for combined image samplers
    /// and a null sampler for storage images.
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
}

/// One deferred descriptor update targeting a single binding of a single set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Destination set.
    pub set: vk::DescriptorSet,
    /// Destination binding.
    pub binding: u32,
    /// Descriptor kind of the binding.
    pub kind: DescriptorKind,
    /// What the binding should reference.
    pub resource: DescriptorResource,
}

/// Applies `writes` through `vkUpdateDescriptorSets`.
///
/// The buffer and image infos are collected first so every
/// `vk::WriteDescriptorSet` can borrow from storage that outlives the call.
pub fn write_descriptor_sets(device: &ash::Device, writes: &[DescriptorWrite]) {
    if writes.is_empty() {
        return;
    }

    let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
        .iter()
        .map(|write| match write.resource {
            DescriptorResource::Buffer { buffer, range } => [vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(0)
                .range(range)],
            DescriptorResource::Image { .. } => [vk::DescriptorBufferInfo::default()],
        })
        .collect();

    let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = writes
        .iter()
        .map(|write| match write.resource {
            DescriptorResource::Image {
                view,
                layout,
                sampler,
            } => [vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(view)
                .image_layout(layout)],
            DescriptorResource::Buffer { .. } => [vk::DescriptorImageInfo::default()],
        })
        .collect();

    let vk_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .enumerate()
        .map(|(i, write)| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(0)
                .descriptor_type(write.kind.to_vk());
            match write.resource {
                DescriptorResource::Buffer { .. } => base.buffer_info(&buffer_infos[i]),
                DescriptorResource::Image { .. } => base.image_info(&image_infos[i]),
            }
        })
        .collect();

    unsafe {
        device.update_descriptor_sets(&vk_writes, &[]);
    }

    debug!("Updated {} descriptor binding(s)", vk_writes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_kind_to_vk() {
        assert_eq!(
            DescriptorKind::UniformBuffer.to_vk(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            DescriptorKind::StorageBuffer.to_vk(),
            vk::DescriptorType::STORAGE_BUFFER
        );
        assert_eq!(
            DescriptorKind::CombinedImageSampler.to_vk(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            DescriptorKind::StorageImage.to_vk(),
            vk::DescriptorType::STORAGE_IMAGE
        );
    }

    #[test]
    fn test_descriptor_kind_is_buffer() {
        assert!(DescriptorKind::UniformBuffer.is_buffer());
        assert!(DescriptorKind::StorageBuffer.is_buffer());
        assert!(!DescriptorKind::CombinedImageSampler.is_buffer());
        assert!(!DescriptorKind::StorageImage.is_buffer());
    }

    #[test]
    fn test_layout_binding() {
        let binding =
            DescriptorKind::StorageImage.layout_binding(3, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(binding.binding, 3);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn test_pool_sizes_merge_repeated_kinds() {
        let mut sizes = PoolSizes::new(2);
        sizes.add(DescriptorKind::UniformBuffer);
        sizes.add(DescriptorKind::StorageBuffer);
        sizes.add(DescriptorKind::UniformBuffer);
        sizes.add(DescriptorKind::UniformBuffer);

        assert_eq!(sizes.as_slice().len(), 2);
        assert_eq!(sizes.count(DescriptorKind::UniformBuffer), 6);
        assert_eq!(sizes.count(DescriptorKind::StorageBuffer), 2);
        assert_eq!(sizes.count(DescriptorKind::StorageImage), 0);
    }

    #[test]
    fn test_pool_sizes_scale_with_frames_in_flight() {
        for frames in 1..=4u32 {
            let mut sizes = PoolSizes::new(frames);
            for _ in 0..5 {
                sizes.add(DescriptorKind::CombinedImageSampler);
            }
            assert_eq!(sizes.count(DescriptorKind::CombinedImageSampler), 5 * frames);
        }
    }

    #[test]
    fn test_pool_sizes_keep_first_seen_order() {
        let mut sizes = PoolSizes::new(2);
        assert!(sizes.is_empty());
        sizes.add(DescriptorKind::StorageImage);
        sizes.add(DescriptorKind::UniformBuffer);
        sizes.add(DescriptorKind::StorageImage);

        let order: Vec<_> = sizes.as_slice().iter().map(|s| s.ty).collect();
        assert_eq!(
            order,
            vec![
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::UNIFORM_BUFFER
            ]
        );
    }
}
