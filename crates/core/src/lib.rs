//! Shared foundations for the tandem crates.
//!
//! - Engine configuration ([`EngineConfig`])
//! - Application-level error type and result alias
//! - Logging initialization
//! - Frame timing

mod config;
mod error;
mod logging;
mod timer;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::{FrameTime, Timer};
