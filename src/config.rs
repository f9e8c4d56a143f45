// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, so a missing or partial file works.
// ConfigWatcher reloads the file when it changes on disk.

use anyhow::{Context, Result};
use ash::vk;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};

use crate::backend::SwapchainPreferences;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Frame Engine".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub surface_format: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            surface_format: "bgra8_srgb".to_string(),
            clear_color: [0.1, 0.1, 0.12, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

impl GraphicsConfig {
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

    /// Frame slot count, clamped to 1..=3
    pub fn frames_in_flight(&self) -> usize {
        self.max_frames_in_flight.clamp(1, Self::MAX_FRAMES_IN_FLIGHT)
    }

    /// Preferred present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Preferred surface format/colorspace pair
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        let format = match self.surface_format.to_lowercase().as_str() {
            "bgra8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "rgba8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "bgra8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "rgba8_unorm" => vk::Format::R8G8B8A8_UNORM,
            _ => {
                log::warn!(
                    "Unknown surface format '{}', defaulting to bgra8_srgb",
                    self.surface_format
                );
                vk::Format::B8G8R8A8_SRGB
            }
        };

        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    pub fn swapchain_preferences(&self) -> SwapchainPreferences {
        SwapchainPreferences {
            surface_format: self.surface_format(),
            present_mode: self.present_mode(),
        }
    }

    /// Whether switching to `other` needs a new swapchain
    pub fn needs_new_swapchain(&self, other: &GraphicsConfig) -> bool {
        self.present_mode() != other.present_mode()
            || self.surface_format().format != other.surface_format().format
    }
}

/// Files loaded at startup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub model: PathBuf,
    pub texture: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("assets/model.obj"),
            texture: PathBuf::from("assets/texture.png"),
            vertex_shader: PathBuf::from("shaders/mesh.vert.spv"),
            fragment_shader: PathBuf::from("shaders/mesh.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Watches the config file and hands back freshly parsed configs
pub struct ConfigWatcher {
    path: PathBuf,
    events: Receiver<notify::Result<notify::Event>>,
    // Dropping the watcher stops the notifications
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (sender, events) = mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = sender.send(event);
        })
        .context("Failed to create config file watcher")?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", path))?;

        log::info!("Watching {:?} for changes", path);
        Ok(Self {
            path,
            events,
            _watcher: watcher,
        })
    }

    /// Non-blocking. Returns the reloaded config when the file changed and
    /// still parses; a broken edit is logged and ignored.
    pub fn poll(&self) -> Option<Config> {
        let mut changed = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => changed = true,
                Ok(_) => {}
                Err(e) => log::warn!("Config watcher error: {}", e),
            }
        }

        if !changed {
            return None;
        }

        match Config::load_from_path(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring config change: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.frames_in_flight(), 2);
        assert_eq!(config.graphics.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.controls.quit_key, "Escape");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            present_mode = "FIFO"
            clear_color = [1.0, 0.0, 0.0, 1.0]

            [assets]
            model = "models/room.obj"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.graphics.surface_format, "bgra8_srgb");
        assert_eq!(config.assets.model, PathBuf::from("models/room.obj"));
        assert_eq!(config.assets.vertex_shader, PathBuf::from("shaders/mesh.vert.spv"));
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut graphics = GraphicsConfig::default();

        graphics.max_frames_in_flight = 0;
        assert_eq!(graphics.frames_in_flight(), 1);

        graphics.max_frames_in_flight = 8;
        assert_eq!(graphics.frames_in_flight(), 3);
    }

    #[test]
    fn unknown_names_fall_back() {
        let graphics = GraphicsConfig {
            present_mode: "vsync-ish".to_string(),
            surface_format: "hdr".to_string(),
            ..Default::default()
        };

        assert_eq!(graphics.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(graphics.surface_format().format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn only_presentation_changes_need_a_new_swapchain() {
        let current = GraphicsConfig::default();

        let recolored = GraphicsConfig {
            clear_color: [0.0; 4],
            ..Default::default()
        };
        assert!(!current.needs_new_swapchain(&recolored));

        let vsync = GraphicsConfig {
            present_mode: "fifo".to_string(),
            ..Default::default()
        };
        assert!(current.needs_new_swapchain(&vsync));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/missing/config.toml").unwrap();
        assert_eq!(config.window.title, WindowConfig::default().title);
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!("vk-frame-engine-{}.toml", std::process::id()));
        std::fs::write(&path, "[window]\ntitle = \"From disk\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.title, "From disk");
    }
}
