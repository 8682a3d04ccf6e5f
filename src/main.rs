// =============================================================================
// 2D RENDERING DEMO - Backend-agnostic frame loop over the rendering core
// =============================================================================
//
// Draws an alpha-blended colored quad through the `RenderCore` façade.
// The backend (explicit Vulkan or immediate OpenGL) is picked from
// config.toml; callers never touch backend types directly.
//
// FRAME FLOW:
// 1. winit delivers a redraw request
// 2. Update the transform uniform (slow spin, for visible motion)
// 3. swap_buffers() renders and presents through whichever backend is live
//
// =============================================================================

use anyhow::{Context, Result};
use ember2d::config::Config;
use ember2d::core::{BackendKind, DrawUniforms, RenderCore, Vertex2D};
use glam::{Mat4, Vec2, Vec4};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging();
    log::info!("Starting renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!("Requested backend: {}", config.graphics.backend);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    core: RenderCore,
    is_fullscreen: bool,
    started: Instant,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            core: RenderCore::new(),
            is_fullscreen,
            started: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_rendering(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let backend = BackendKind::from_config(&self.config.graphics.backend)?;

        match backend {
            BackendKind::Explicit => {
                let display = window
                    .display_handle()
                    .context("Failed to get display handle")?
                    .as_raw();
                let handle = window
                    .window_handle()
                    .context("Failed to get window handle")?
                    .as_raw();
                self.core.setup_explicit(
                    display,
                    handle,
                    size.width,
                    size.height,
                    &self.config,
                )?;
                self.core.create_pipeline(
                    Path::new("shaders/quad.vert.spv"),
                    Path::new("shaders/quad.frag.spv"),
                )?;
            }
            BackendKind::Immediate => {
                // The demo window carries no GL context of its own;
                // embedding applications supply the loader and swap hooks.
                anyhow::bail!(
                    "The demo only drives the Vulkan backend; set backend = \"vulkan\""
                );
            }
        }

        // A centered quad with per-corner colors.
        let vertices = [
            Vertex2D {
                position: Vec2::new(-0.5, -0.5),
                color: Vec4::new(1.0, 0.2, 0.2, 1.0),
            },
            Vertex2D {
                position: Vec2::new(0.5, -0.5),
                color: Vec4::new(0.2, 1.0, 0.2, 1.0),
            },
            Vertex2D {
                position: Vec2::new(0.5, 0.5),
                color: Vec4::new(0.2, 0.2, 1.0, 1.0),
            },
            Vertex2D {
                position: Vec2::new(-0.5, 0.5),
                color: Vec4::new(1.0, 1.0, 0.2, 1.0),
            },
        ];
        let indices = [0u32, 1, 2, 2, 3, 0];
        self.core.upload_mesh(&vertices, &indices)?;

        log::info!("Rendering initialized");
        Ok(())
    }

    // =========================================================================
    // FRAME LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let angle = self.started.elapsed().as_secs_f32() * 0.5;
        self.core.set_uniforms(DrawUniforms {
            transform: Mat4::from_rotation_z(angle),
            color: Vec4::ONE,
        })?;
        self.core.swap_buffers()
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_rendering(&window) {
            log::error!("Failed to initialize rendering: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.core.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Err(e) = self.core.framebuffer_resized(size.width, size.height) {
                    log::warn!("Resize notification dropped: {e}");
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                } else {
                    self.update_fps();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for an uncapped frame loop.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
