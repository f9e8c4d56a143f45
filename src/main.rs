// =============================================================================
// HOST LOOP - Window, input and the renderer's lifecycle
// =============================================================================
//
//   resumed          create window + renderer (init)
//   RedrawRequested  draw_frame
//   Resized          renderer.resize -> swapchain recreation
//   close / quit key wait idle, drop renderer (deinit)
//   about_to_wait    config hot reload, request next redraw
//
// Any error out of the renderer is fatal: it is logged and the loop exits.

use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::time::Instant;
use vk_frame_engine::backend::FrameOutcome;
use vk_frame_engine::config::{Config, ConfigWatcher, DEFAULT_CONFIG_PATH};
use vk_frame_engine::window::parse_key;
use vk_frame_engine::{Renderer, WindowContext};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::KeyCode,
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Vulkan frame engine");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, {} frames in flight",
        config.graphics.present_mode,
        config.graphics.frames_in_flight()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if let Some(e) = app.fatal.take() {
        return Err(e);
    }
    Ok(())
}

/// Writes every log line to stderr and to the log file
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Vulkan Frame Engine Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(TeeWriter { file })));
            }
            Err(e) => eprintln!(
                "Warning: cannot open log file {}: {}",
                config.debug.log_file, e
            ),
        }
    }

    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Key bindings resolved from the `[controls]` section
#[derive(Debug, Clone, Copy)]
struct Controls {
    quit: KeyCode,
    fullscreen: KeyCode,
}

impl Controls {
    fn from_config(config: &Config) -> Self {
        let resolve = |name: &str, fallback: KeyCode| {
            parse_key(name).unwrap_or_else(|| {
                log::warn!("Unknown key '{}', using {:?}", name, fallback);
                fallback
            })
        };

        Self {
            quit: resolve(&config.controls.quit_key, KeyCode::Escape),
            fullscreen: resolve(&config.controls.fullscreen_key, KeyCode::F11),
        }
    }
}

/// FPS counter shown in the window title
struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Count one presented frame. Returns (fps, frame ms) once per second.
    fn tick(&mut self) -> Option<(f32, f32)> {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.frame_count as f32 / elapsed;
        self.frame_count = 0;
        self.last_update = now;
        Some((fps, frame_time * 1000.0))
    }
}

/// Field order matters for Drop: the renderer owns the surface and must go
/// before the window it was created from.
struct App {
    config: Config,
    controls: Controls,
    renderer: Option<Renderer>,
    window: Option<WindowContext>,
    watcher: Option<ConfigWatcher>,
    fps: FpsCounter,
    /// Error that ended the event loop, reported from main
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let controls = Controls::from_config(&config);

        let watcher = match ConfigWatcher::new(DEFAULT_CONFIG_PATH) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::info!("Config hot reload disabled: {:#}", e);
                None
            }
        };

        Self {
            config,
            controls,
            renderer: None,
            window: None,
            watcher,
            fps: FpsCounter::new(),
            fatal: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal error: {:?}", error);
        self.shutdown(event_loop);
        self.fatal = Some(error);
    }

    /// Wait idle, then tear the renderer down before the window goes
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            if let Err(e) = renderer.wait_idle() {
                log::error!("{:#}", e);
            }
        }
        self.window = None;
        event_loop.exit();
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match renderer.draw_frame() {
            Ok(FrameOutcome::Presented { .. }) => self.update_fps(),
            Ok(FrameOutcome::Recreated | FrameOutcome::Skipped) => {}
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let (Some(window), Some((fps, frame_ms))) = (self.window.as_ref(), self.fps.tick()) else {
            return;
        };

        let mode = if window.is_fullscreen() { "fullscreen" } else { "windowed" };
        window.set_title(&format!(
            "{} - {:.0} FPS ({:.2}ms) [{}]",
            self.config.window.title, fps, frame_ms, mode
        ));
    }

    fn apply_config(&mut self, config: Config) {
        log::info!("Config reloaded");

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.apply_graphics_config(&config.graphics);
        }
        self.controls = Controls::from_config(&config);

        if !config.debug.show_fps {
            if let Some(window) = &self.window {
                window.set_title(&config.window.title);
            }
        }
        self.config = config;
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

        let window = match WindowContext::new(event_loop, &self.config.window) {
            Ok(window) => window,
            Err(e) => return self.fail(event_loop, e),
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.window = Some(window);
                return self.fail(event_loop, e.context("Failed to initialize Vulkan"));
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        let pressed = self
            .window
            .as_mut()
            .and_then(|window| window.input.handle_event(&event));

        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => self.draw(event_loop),

            WindowEvent::KeyboardInput { .. } => match pressed {
                Some(key) if key == self.controls.quit => {
                    log::info!("{:?} pressed, exiting...", key);
                    self.shutdown(event_loop);
                }
                Some(key) if key == self.controls.fullscreen => {
                    if let Some(window) = self.window.as_mut() {
                        window.toggle_fullscreen();
                    }
                }
                _ => {}
            },

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(config) = self.watcher.as_ref().and_then(ConfigWatcher::poll) {
            self.apply_config(config);
        }

        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_fall_back_on_unknown_keys() {
        let mut config = Config::default();
        config.controls.quit_key = "q".to_string();
        config.controls.fullscreen_key = "not-a-key".to_string();

        let controls = Controls::from_config(&config);

        assert_eq!(controls.quit, KeyCode::KeyQ);
        assert_eq!(controls.fullscreen, KeyCode::F11);
    }

    #[test]
    fn fps_counter_waits_a_full_second() {
        let mut fps = FpsCounter::new();
        assert!(fps.tick().is_none());

        fps.last_update = Instant::now()
            .checked_sub(std::time::Duration::from_secs(2))
            .unwrap();
        let (rate, _) = fps.tick().unwrap();
        assert!(rate > 0.0 && rate <= 1.5);
    }
}
