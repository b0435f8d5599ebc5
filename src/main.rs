// =============================================================================
// VULKAN CUBE - Minimal Vulkan application drawing a static cube
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (ApplicationHandler)                          │
// │    └── Renderer (owns every Vulkan object)                      │
// │          └── Vulkan Device + Swapchain                          │
// │                └── Command Buffers (pre-recorded cube draw)     │
// │                      └── Synchronization (fences, semaphores)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Poll shader watcher (optional hot reload)
// 2. Wait for the frame slot's fence
// 3. Acquire swapchain image
// 4. Submit pre-recorded commands to GPU
// 5. Present rendered image to screen
//
// =============================================================================

mod backend;
mod config;
mod cube;
mod hot_reload;
mod renderer;

use anyhow::{Context, Result};
use config::{Config, KeyBindings};
use hot_reload::ShaderWatcher;
use renderer::{FrameStatus, Renderer, RendererSettings};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::PhysicalKey,
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml; problems are reported once logging is up
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Initialize logging
    init_logging(&config)?;
    match load_error {
        Some(e) => log::warn!("{:#}. Using defaults.", e),
        None => log::debug!("Config: {:?}", config),
    }
    log::info!("Starting Vulkan cube");
    log::info!("Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}, buffering: {}",
        config.graphics.present_mode,
        config.graphics.buffering
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Writes every log line to stderr and to the log file
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    // A bad level is reported after the logger is installed
    let (level, level_error) = match config.log_level() {
        Ok(level) => (level, None),
        Err(e) => (log::LevelFilter::Info, Some(e)),
    };

    let mut builder = Builder::new();
    builder.filter_level(level);
    // RUST_LOG still wins over the config file
    builder.parse_default_env();

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;

        writeln!(file, "=== Vulkan Cube Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;

        builder.target(Target::Pipe(Box::new(TeeWriter { file })));
    }

    builder.try_init().context("Failed to initialize logger")?;

    if let Some(e) = level_error {
        log::warn!("{:#}, using info", e);
    }
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus renderer.
///
/// Field order matters for Drop: the renderer (and its surface) must go
/// before the window it was created from.
struct App {
    config: Config,
    bindings: KeyBindings,

    renderer: Option<Renderer>,
    shader_watcher: Option<ShaderWatcher>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let bindings = config.controls.bindings();
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            bindings,
            renderer: None,
            shader_watcher: None,
            window: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let settings = RendererSettings::from_config(&self.config);
        self.renderer = Some(Renderer::new(settings, window, size.width, size.height)?);

        if self.config.shaders.hot_reload {
            match ShaderWatcher::new(Path::new(&self.config.shaders.directory)) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        Ok(())
    }

    fn reload_shaders(&mut self) {
        if let Some(ref mut renderer) = self.renderer {
            if let Err(e) = renderer.reload_shaders() {
                log::error!("{:#}", e);
            }
        }
    }

    fn redraw(&mut self) {
        let shaders_changed = self
            .shader_watcher
            .as_ref()
            .is_some_and(|watcher| watcher.poll());
        if shaders_changed {
            self.reload_shaders();
        }

        let Some(ref mut renderer) = self.renderer else {
            return;
        };

        match renderer.draw_frame() {
            Ok(FrameStatus::Presented) => self.update_fps(),
            Ok(FrameStatus::Skipped) => {}
            Err(e) => log::error!("Render error: {:#}", e),
        }
    }

    fn quit(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(ref renderer) = self.renderer {
            if let Err(e) = renderer.wait_idle() {
                log::error!("{:#}", e);
            }
        }
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            // The Resized event that follows carries the final size
            let size = window.inner_size();
            if let Some(ref mut renderer) = self.renderer {
                renderer.resize(size.width, size.height);
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
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
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
    /// Called when the application is ready to create windows.
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
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize Vulkan: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.quit(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => self.redraw(),

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if key == self.bindings.quit {
                    log::info!("{:?} pressed, exiting...", key);
                    self.quit(event_loop);
                } else if key == self.bindings.fullscreen {
                    self.toggle_fullscreen();
                } else if key == self.bindings.reload_shaders {
                    log::info!("Reloading shaders...");
                    self.reload_shaders();
                }
            }

            _ => {}
        }
    }

    /// Continuous redraws: the cube is drawn as fast as presentation allows.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear down Vulkan while the window is still alive
        self.shader_watcher = None;
        self.renderer = None;
    }
}
