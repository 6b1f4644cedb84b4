//! Frame core shared by the compute and graphics passes.
//!
//! This crate provides:
//! - Replicated per-frame resources and the bundles that bind them
//! - The LIFO deletion queue that tears them down
//! - The frame pipeline that orders compute before graphics and presents

pub mod bundle;
pub mod deletion_queue;
pub mod frame;
pub mod frame_pipeline;
pub mod resource;

#[cfg(test)]
mod testing;

pub use bundle::{FrameSelector, ResourceBundle, ResourceBundleBuilder};
pub use deletion_queue::{DeletionAction, DeletionQueue};
pub use frame_pipeline::{
    ComputePass, DispatchStrategy, FramePipeline, FrameTarget, GraphicsRecorder, group_counts,
};
pub use resource::{BufferDesc, ImageDecl, SharedImage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeletionQueue>();
        assert_send_sync::<SharedImage>();
        assert_send_sync::<DispatchStrategy>();
        assert_send_sync::<FrameSelector>();
    }
}
