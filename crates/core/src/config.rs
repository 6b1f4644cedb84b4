//! Engine configuration.
//!
//! [`EngineConfig`] is built once at startup and handed by reference to every
//! component that needs it. Nothing reads configuration from global state.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tandem_core::EngineConfig;
//!
//! let config = EngineConfig::default()
//!     .with_extent(800, 600)
//!     .with_fence_timeout(Duration::from_secs(2));
//! config.validate().expect("valid config");
//! assert_eq!(config.frames_in_flight, 2);
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable settings shared by the bundle builder, the frame pipeline and the app.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Initial window width in pixels.
    pub width: u32,
    /// Initial window height in pixels.
    pub height: u32,
    /// Window title.
    pub title: String,
    /// Upper bound for every fence wait before the device is declared hung.
    pub fence_timeout: Duration,
    /// Enable the Khronos validation layer.
    pub enable_validation: bool,
    /// Directory holding compiled SPIR-V shaders.
    pub shader_dir: PathBuf,
    /// Sleep between surface polls while the window is minimized.
    pub resize_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            width: 1152,
            height: 768,
            title: "Tandem".to_string(),
            fence_timeout: Duration::from_secs(5),
            enable_validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders/spirv"),
            resize_poll_interval: Duration::from_millis(10),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `TANDEM_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlays values found through `lookup` on top of `self`.
    ///
    /// Recognized keys: `TANDEM_WIDTH`, `TANDEM_HEIGHT`, `TANDEM_FRAMES_IN_FLIGHT`,
    /// `TANDEM_FENCE_TIMEOUT_MS`, `TANDEM_VALIDATION`, `TANDEM_SHADER_DIR`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the key whose value failed to parse.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(width) = parse_var(&lookup, "TANDEM_WIDTH")? {
            self.width = width;
        }
        if let Some(height) = parse_var(&lookup, "TANDEM_HEIGHT")? {
            self.height = height;
        }
        if let Some(frames) = parse_var(&lookup, "TANDEM_FRAMES_IN_FLIGHT")? {
            self.frames_in_flight = frames;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TANDEM_FENCE_TIMEOUT_MS")? {
            self.fence_timeout = Duration::from_millis(ms);
        }
        if let Some(validation) = parse_var(&lookup, "TANDEM_VALIDATION")? {
            self.enable_validation = validation;
        }
        if let Some(dir) = lookup("TANDEM_SHADER_DIR") {
            self.shader_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    /// Sets the initial window extent.
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Sets the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Enables or disables validation layers.
    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Sets the SPIR-V shader directory.
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Sets the window title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Fence timeout in nanoseconds, saturating at `u64::MAX`.
    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Checks the values every consumer relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero frames in flight, a zero extent or a
    /// zero fence timeout.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "window extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fence_timeout.is_zero() {
            return Err(Error::Config("fence_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!((config.width, config.height), (1152, 768));
        assert_eq!(config.fence_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay_reads_known_keys() {
        let config = EngineConfig::default()
            .overlay(lookup_from(&[
                ("TANDEM_WIDTH", "640"),
                ("TANDEM_HEIGHT", " 480 "),
                ("TANDEM_FRAMES_IN_FLIGHT", "3"),
                ("TANDEM_FENCE_TIMEOUT_MS", "250"),
                ("TANDEM_VALIDATION", "false"),
                ("TANDEM_SHADER_DIR", "/tmp/spv"),
            ]))
            .unwrap();

        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
        assert!(!config.enable_validation);
        assert_eq!(config.shader_dir, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = EngineConfig::default()
            .overlay(lookup_from(&[("TANDEM_WIDTH", "wide")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("TANDEM_WIDTH")));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(EngineConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(EngineConfig::default().with_extent(0, 10).validate().is_err());
        assert!(
            EngineConfig::default()
                .with_fence_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_fence_timeout_ns_saturates() {
        let config = EngineConfig::default().with_fence_timeout(Duration::MAX);
        assert_eq!(config.fence_timeout_ns(), u64::MAX);

        let config = EngineConfig::default().with_fence_timeout(Duration::from_millis(3));
        assert_eq!(config.fence_timeout_ns(), 3_000_000);
    }
}
