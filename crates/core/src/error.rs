//! Errors raised outside the Vulkan layer.

use thiserror::Error;

/// Window, surface and configuration failures.
///
/// Vulkan call failures use `tandem_rhi::RhiError`; the binary folds both
/// into `anyhow::Error`.
#[derive(Error, Debug)]
pub enum Error {
    /// Surface or extension setup failed in the loader
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    #[error("Window error: {0}")]
    Window(String),

    /// A configuration value was malformed or out of range
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
