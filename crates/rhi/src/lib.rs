//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a thin layer over Vulkan using the `ash` crate.
//! It handles:
//! - Instance, physical device and logical device creation
//! - Swapchain management behind [`swapchain::SwapchainProvider`]
//! - Memory-type selection and descriptor bookkeeping
//! - Shader and pipeline creation
//! - The [`gpu::GpuDevice`] seam the renderer is written against

mod error;

pub mod descriptor;
pub mod device;
pub mod gpu;
pub mod instance;
pub mod memory;
pub mod physical_device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
