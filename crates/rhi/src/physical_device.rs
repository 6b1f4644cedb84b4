//! Physical device (GPU) selection.
//!
//! A device qualifies when it exposes Vulkan 1.3, a graphics queue family, a
//! family that can present to the window surface, and a compute-capable
//! family. Among qualifying devices discrete GPUs win.
//!
//! # Example
//!
//! ```no_run
//! use tandem_rhi::instance::Instance;
//! use tandem_rhi::physical_device::select_physical_device;
//! use ash::vk;
//!
//! let instance = Instance::new(false, &[]).expect("Failed to create instance");
//! let surface: vk::SurfaceKHR = vk::SurfaceKHR::null(); // placeholder
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//!
//! let info = select_physical_device(instance.handle(), surface, &surface_loader)
//!     .expect("No suitable GPU found");
//! println!("Selected GPU: {}", info.device_name());
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Queue family indices used by the frame pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family that supports graphics operations.
    pub graphics_family: Option<u32>,
    /// Family that can present to the surface.
    pub present_family: Option<u32>,
    /// Family that supports compute operations.
    pub compute_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Checks that graphics, present and compute families were all found.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some()
            && self.present_family.is_some()
            && self.compute_family.is_some()
    }

    /// Returns the distinct family indices, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for family in [
            self.graphics_family,
            self.present_family,
            self.compute_family,
        ]
        .into_iter()
        .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Information about the selected physical device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory-type and heap table.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices for graphics, present and compute.
    pub queue_families: QueueFamilyIndices,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    /// Returns the Vulkan API version supported by the device.
    pub fn api_version(&self) -> (u32, u32) {
        let version = self.properties.api_version;
        (vk::api_version_major(version), vk::api_version_minor(version))
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("api_version", &format!("{}.{}", major, minor))
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU meets the requirements.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device, surface, surface_loader))
        .max_by_key(|info| device_type_rank(info.properties.device_type));

    match selected {
        Some(info) => {
            let (major, minor) = info.api_version();
            info!(
                "Selected GPU: '{}' - Vulkan {}.{}, queues {:?}",
                info.device_name(),
                major,
                minor,
                info.queue_families
            );
            Ok(info)
        }
        None => {
            warn!("No GPU offers graphics, present and compute on Vulkan 1.3");
            Err(RhiError::NoSuitableGpu)
        }
    }
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let queue_families = find_queue_families(&families, |index| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, index, surface)
            .unwrap_or(false)
    });

    let info = PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
    };

    if !queue_families.is_complete() {
        debug!(
            "GPU '{}' skipped: missing queue families {:?}",
            info.device_name(),
            queue_families
        );
        return None;
    }

    if info.api_version() < (1, 3) {
        debug!("GPU '{}' skipped: Vulkan 1.3 not supported", info.device_name());
        return None;
    }

    Some(info)
}

/// Picks queue families from the device's family table.
///
/// Compute prefers the graphics family so storage images written by compute
/// and sampled by graphics never change queue family ownership.
fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_count == 0 {
            continue;
        }

        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_compute = family.queue_flags.contains(vk::QueueFlags::COMPUTE);

        if has_graphics && indices.graphics_family.is_none() {
            indices.graphics_family = Some(i);
            if has_compute {
                indices.compute_family = Some(i);
            }
        }
        if has_compute && indices.compute_family.is_none() {
            indices.compute_family = Some(i);
        }
        if indices.present_family.is_none() && supports_present(i) {
            indices.present_family = Some(i);
        }
    }

    indices
}

fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_family_indices_default_incomplete() {
        let indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        assert!(indices.unique_families().is_empty());
    }

    #[test]
    fn test_compute_prefers_graphics_family() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = find_queue_families(&families, |i| i == 1);
        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.compute_family, Some(1));
        assert_eq!(indices.present_family, Some(1));
        assert_eq!(indices.unique_families(), vec![1]);
    }

    #[test]
    fn test_compute_falls_back_to_dedicated_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
        ];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.compute_family, Some(1));
        assert_eq!(indices.present_family, Some(0));
        assert!(indices.is_complete());
        assert_eq!(indices.unique_families(), vec![0, 1]);
    }

    #[test]
    fn test_missing_present_is_incomplete() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let indices = find_queue_families(&families, |_| false);
        assert!(!indices.is_complete());
    }

    #[test]
    fn test_empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(1));
    }

    #[test]
    fn test_discrete_ranks_highest() {
        assert!(
            device_type_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_rank(vk::PhysicalDeviceType::CPU)
        );
    }
}
