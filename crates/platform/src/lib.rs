//! Platform layer: the window and the Vulkan surface behind it.

mod window;

pub use window::{Surface, Window};

// Re-export winit types the app loop needs
pub use winit::application::ApplicationHandler;
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
pub use winit::window::WindowId;
