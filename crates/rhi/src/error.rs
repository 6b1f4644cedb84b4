//! RHI-specific error types.

use thiserror::Error;

/// Error type for every operation on the device seam and above it.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// No memory type satisfies both the type filter and the property flags
    #[error("No memory type matches filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: ash::vk::MemoryPropertyFlags,
    },

    /// An existing image lacks a view for every frame, or the usage the
    /// binding needs
    #[error("Existing image for binding {binding} has no initialized view or lacks the needed usage")]
    ExistingImageInvalid { binding: u32 },

    /// An image declaration gave neither an existing image nor a size
    #[error("Image for binding {binding} needs an existing image or a width and height")]
    ImageNeitherExistingNorSized { binding: u32 },

    /// An image declaration requested neither sampled nor storage use
    #[error("Image for binding {binding} must be sampled, storage, or both")]
    ImageMustBeSampledOrStorage { binding: u32 },

    /// The same binding index was declared twice in one bundle
    #[error("Binding {binding} declared more than once")]
    DuplicateBinding { binding: u32 },

    /// The binding was never declared as a buffer in this bundle
    #[error("Unknown binding {binding}")]
    UnknownBinding { binding: u32 },

    /// The target buffer is device local and has no host mapping
    #[error("Binding {binding} is not host mapped")]
    UpdatingUnmappedResource { binding: u32 },

    /// A frame selector named a slot outside the frames in flight
    #[error("Frame index {index} out of range for {frames_in_flight} frames in flight")]
    FrameIndexOutOfRange {
        index: usize,
        frames_in_flight: usize,
    },

    /// An update value does not fit the buffer it targets
    #[error("Update of {len} bytes exceeds binding {binding} of {size} bytes")]
    UpdateTooLarge { binding: u32, len: u64, size: u64 },

    /// A fence did not signal within the configured timeout
    #[error("Device timed out waiting for {what}")]
    DeviceTimeout { what: &'static str },

    /// Shader loading error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
