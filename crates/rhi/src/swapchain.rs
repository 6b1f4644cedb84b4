//! Swapchain management.
//!
//! This module handles VkSwapchainKHR creation, image acquisition, presentation
//! and recreation for a new drawable extent.
//!
//! # Overview
//!
//! [`SwapchainProvider`] is what the frame pipeline sees: the current extent,
//! format, images and views, plus acquire, present and recreate. [`Swapchain`]
//! implements it on top of `VK_KHR_swapchain`:
//! - Surface capability querying
//! - Format and present mode selection
//! - Image view creation and management
//! - Recreation that retires the old swapchain and its views
//!
//! # Example
//!
//! ```no_run
//! use tandem_rhi::swapchain::{AcquireOutcome, SwapchainProvider};
//! use ash::vk;
//!
//! fn frame(swapchain: &mut impl SwapchainProvider, available: vk::Semaphore, done: vk::Semaphore) {
//!     match swapchain.acquire_next_image(available, 1_000_000_000) {
//!         Ok(AcquireOutcome::Acquired { image_index, .. }) => {
//!             // ... render to swapchain.image(image_index) ...
//!             let _needs_recreate = swapchain.present(image_index, done);
//!         }
//!         Ok(AcquireOutcome::OutOfDate) => {
//!             let extent = swapchain.extent();
//!             let _ = swapchain.recreate(extent);
//!         }
//!         Err(e) => eprintln!("acquire failed: {e}"),
//!     }
//! }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// Result of asking the swapchain for the next image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; `suboptimal` asks for a recreation after present.
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be recreated.
    OutOfDate,
}

/// Presentation surface as seen by the frame pipeline.
pub trait SwapchainProvider {
    /// Size the window surface currently wants, zero while minimized.
    fn drawable_extent(&self) -> RhiResult<vk::Extent2D>;
    /// Extent of the live swapchain images.
    fn extent(&self) -> vk::Extent2D;
    fn format(&self) -> vk::Format;
    fn image_count(&self) -> u32;
    fn image(&self, index: u32) -> vk::Image;
    fn image_view(&self, index: u32) -> vk::ImageView;

    /// Acquires the next image, signalling `semaphore` when it is ready.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceTimeout`] if no image became available in
    /// `timeout_ns`, or the failing Vulkan status.
    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> RhiResult<AcquireOutcome>;

    /// Queues `image_index` for presentation once `wait_semaphore` signals.
    ///
    /// Returns true if the swapchain is out of date or suboptimal.
    fn present(&mut self, image_index: u32, wait_semaphore: vk::Semaphore) -> RhiResult<bool>;

    /// Replaces the swapchain and its views with ones sized for `extent`.
    ///
    /// The caller must make sure no submitted work still uses the old images.
    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()>;

    /// Records the window size for surfaces that leave sizing to the
    /// application.
    fn request_extent(&mut self, _extent: vk::Extent2D) {}
}

/// Swapchain surface support details.
///
/// Contains information about what the surface supports for swapchain creation.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, min image count {}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Vulkan swapchain wrapper.
///
/// Owns the swapchain and its image views. The surface is borrowed by handle
/// and must outlive the swapchain.
pub struct Swapchain {
    device: Arc<Device>,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    /// Last extent asked for; used when the surface leaves the size to us.
    requested: vk::Extent2D,
}

impl Swapchain {
    /// Creates a swapchain for `surface` at the requested extent.
    ///
    /// Prefers B8G8R8A8_SRGB and MAILBOX, falling back to FIFO. Images are
    /// created as color attachments.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface has no usable format or present mode,
    /// or if swapchain or view creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());

        let mut swapchain = Self {
            device,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent,
            requested: extent,
        };
        swapchain.build(extent)?;
        Ok(swapchain)
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Creates a swapchain chained to the current one, then retires the old
    /// handle and its views.
    fn build(&mut self, requested: vk::Extent2D) -> RhiResult<()> {
        let support = SwapchainSupportDetails::query(
            self.device.physical_device(),
            self.surface,
            &self.surface_loader,
        )?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, requested.width, requested.height);
        let image_count = determine_image_count(&support.capabilities);

        info!(
            "Creating swapchain: {}x{}, format {:?}, present mode {:?}, {} images",
            extent.width, extent.height, surface_format.format, present_mode, image_count
        );

        let families = self.device.queue_families();
        let graphics_family = families.graphics_family.unwrap_or_default();
        let present_family = families.present_family.unwrap_or(graphics_family);
        let family_indices = [graphics_family, present_family];
        let (sharing_mode, family_slice) = if graphics_family != present_family {
            debug!(
                "Using CONCURRENT sharing mode between graphics ({}) and present ({}) queues",
                graphics_family, present_family
            );
            (vk::SharingMode::CONCURRENT, family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_slice)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };

        // Views of the old images go before the old swapchain itself.
        self.destroy_image_views();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
            debug!("Retired old swapchain");
        }
        self.swapchain = swapchain;

        self.images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        self.image_views = create_image_views(&self.device, &self.images, surface_format.format)?;
        self.format = surface_format.format;
        self.extent = extent;
        self.requested = requested;

        info!("Swapchain created with {} images", self.images.len());
        Ok(())
    }

    fn destroy_image_views(&mut self) {
        for &image_view in &self.image_views {
            unsafe { self.device.handle().destroy_image_view(image_view, None) };
        }
        self.image_views.clear();
    }
}

impl SwapchainProvider for Swapchain {
    fn request_extent(&mut self, extent: vk::Extent2D) {
        self.requested = extent;
    }

    fn drawable_extent(&self) -> RhiResult<vk::Extent2D> {
        let capabilities = unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                self.device.physical_device(),
                self.surface,
            )?
        };
        if capabilities.current_extent.width == u32::MAX {
            Ok(self.requested)
        } else {
            Ok(capabilities.current_extent)
        }
    }

    #[inline]
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline]
    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    #[inline]
    fn image_view(&self, index: u32) -> vk::ImageView {
        self.image_views[index as usize]
    }

    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> RhiResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(RhiError::DeviceTimeout {
                what: "swapchain image acquisition",
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn present(&mut self, image_index: u32, wait_semaphore: vk::Semaphore) -> RhiResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue(), &present_info)
        };
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        info!(
            "Recreating swapchain for new size: {}x{}",
            extent.width, extent.height
        );
        self.build(extent)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_image_views();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
            info!(
                "Swapchain destroyed (was {}x{}, {} images)",
                self.extent.width,
                self.extent.height,
                self.images.len()
            );
        }
    }
}

/// Chooses the surface format.
///
/// Prefers B8G8R8A8_SRGB with SRGB_NONLINEAR, then B8G8R8A8_UNORM, then
/// whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];
    for wanted in preferred {
        if let Some(&format) = formats
            .iter()
            .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        {
            debug!("Selected surface format {:?}", wanted);
            return format;
        }
    }

    warn!(
        "Using first available surface format: {:?}",
        formats[0].format
    );
    formats[0]
}

/// Prefers MAILBOX, falls back to FIFO which is always available.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        debug!("Selected MAILBOX present mode");
        return vk::PresentModeKHR::MAILBOX;
    }
    debug!("Selected FIFO present mode (vsync)");
    vk::PresentModeKHR::FIFO
}

/// Uses the surface's current extent when defined, otherwise clamps the
/// requested size to the surface limits.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more image than the minimum, capped by the maximum when there is one.
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> RhiResult<Vec<vk::ImageView>> {
    let mut image_views = Vec::with_capacity(images.len());
    for (i, &image) in images.iter().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );

        let view = unsafe { device.handle().create_image_view(&create_info, None) };
        match view {
            Ok(view) => image_views.push(view),
            Err(e) => {
                for &view in &image_views {
                    unsafe { device.handle().destroy_image_view(view, None) };
                }
                return Err(RhiError::SwapchainError(format!(
                    "Failed to create image view {}: {:?}",
                    i, e
                )));
            }
        }
    }
    Ok(image_views)
}
