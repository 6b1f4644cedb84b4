//! Tandem: a compute ray march blitted to a window.
//!
//! The compute pass traces a small sphere scene into a storage image every
//! frame and the graphics pass draws that image onto the swapchain.

mod blit;
mod gpu;
mod scene;

use anyhow::Result;
use ash::vk;
use tracing::{error, info};

use tandem_core::{EngineConfig, Timer};
use tandem_platform::{
    ActiveEventLoop, ApplicationHandler, ControlFlow, EventLoop, Window, WindowEvent, WindowId,
};

use crate::gpu::Gpu;

struct App {
    config: EngineConfig,
    // Dropped before the window it renders to.
    gpu: Option<Gpu>,
    window: Option<Window>,
    timer: Timer,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            gpu: None,
            window: None,
            timer: Timer::new(),
        }
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut gpu) = self.gpu.take() {
            gpu.shutdown();
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, &self.config) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match Gpu::new(&window, &self.config) {
            Ok(gpu) => {
                info!("Initialization complete, entering main loop");
                self.gpu = Some(gpu);
                self.window = Some(window);
                self.timer.reset();
            }
            Err(e) => {
                error!("Failed to initialize GPU: {:?}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.exit(event_loop);
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut gpu) = self.gpu {
                    gpu.resize(vk::Extent2D {
                        width: size.width,
                        height: size.height,
                    });
                }
            }
            WindowEvent::RedrawRequested => {
                let time = self.timer.tick();
                let Some(ref mut gpu) = self.gpu else {
                    return;
                };
                if let Err(e) = gpu.draw(time) {
                    error!("Frame {} failed: {}", time.frame, e);
                    self.exit(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    tandem_core::init_logging();

    let config = EngineConfig::from_env()?;
    config.validate()?;
    info!(
        "Starting {} with {} frame(s) in flight",
        config.title, config.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}
