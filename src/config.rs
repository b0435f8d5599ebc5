// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to its defaults field by field, so a config file
// only needs the keys it wants to change.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use winit::keyboard::KeyCode;

use crate::backend::swapchain::BufferingMode;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub camera: CameraConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
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
            title: "Vulkan Cube".to_string(),
            width: 640,
            height: 480,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub buffering: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            buffering: "double".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Where the static camera sits
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub eye: [f32; 3],
    pub fov_degrees: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            eye: [2.0, 1.5, 2.5],
            fov_degrees: 45.0,
        }
    }
}

/// Compiled SPIR-V locations, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: String,
    pub vertex: String,
    pub fragment: String,
    pub hot_reload: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: "shaders".to_string(),
            vertex: "cube.vert.spv".to_string(),
            fragment: "cube.frag.spv".to_string(),
            hot_reload: false,
        }
    }
}

impl ShaderConfig {
    pub fn vertex_path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.vertex)
    }

    pub fn fragment_path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.fragment)
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vk_cube.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub quit_key: String,
    pub fullscreen_key: String,
    pub reload_shaders_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            quit_key: "Escape".to_string(),
            fullscreen_key: "F11".to_string(),
            reload_shaders_key: "F5".to_string(),
        }
    }
}

/// Key bindings resolved to winit key codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBindings {
    pub quit: KeyCode,
    pub fullscreen: KeyCode,
    pub reload_shaders: KeyCode,
}

impl ControlsConfig {
    pub fn bindings(&self) -> KeyBindings {
        KeyBindings {
            quit: resolve_key(&self.quit_key, KeyCode::Escape),
            fullscreen: resolve_key(&self.fullscreen_key, KeyCode::F11),
            reload_shaders: resolve_key(&self.reload_shaders_key, KeyCode::F5),
        }
    }
}

fn resolve_key(name: &str, fallback: KeyCode) -> KeyCode {
    parse_key(name).unwrap_or_else(|| {
        log::warn!("Unknown key '{}', defaulting to {:?}", name, fallback);
        fallback
    })
}

/// Parse a key name such as "Escape", "F11", "Q" or "Space"
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.trim().to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "a" => KeyCode::KeyA,
        "b" => KeyCode::KeyB,
        "c" => KeyCode::KeyC,
        "d" => KeyCode::KeyD,
        "e" => KeyCode::KeyE,
        "f" => KeyCode::KeyF,
        "g" => KeyCode::KeyG,
        "h" => KeyCode::KeyH,
        "i" => KeyCode::KeyI,
        "j" => KeyCode::KeyJ,
        "k" => KeyCode::KeyK,
        "l" => KeyCode::KeyL,
        "m" => KeyCode::KeyM,
        "n" => KeyCode::KeyN,
        "o" => KeyCode::KeyO,
        "p" => KeyCode::KeyP,
        "q" => KeyCode::KeyQ,
        "r" => KeyCode::KeyR,
        "s" => KeyCode::KeyS,
        "t" => KeyCode::KeyT,
        "u" => KeyCode::KeyU,
        "v" => KeyCode::KeyV,
        "w" => KeyCode::KeyW,
        "x" => KeyCode::KeyX,
        "y" => KeyCode::KeyY,
        "z" => KeyCode::KeyZ,
        _ => return None,
    };
    Some(key)
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "config.toml";

    /// Load `config.toml` from the working directory.
    ///
    /// Runs before the logger exists, so problems are returned rather than
    /// logged; the caller falls back to defaults and reports them later.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::DEFAULT_PATH)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // No file is not an error
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn buffering_mode(&self) -> BufferingMode {
        match self.graphics.buffering.to_lowercase().as_str() {
            "double" => BufferingMode::Double,
            "triple" => BufferingMode::Triple,
            _ => {
                log::warn!(
                    "Unknown buffering mode '{}', defaulting to double buffering",
                    self.graphics.buffering
                );
                BufferingMode::Double
            }
        }
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    /// Configured log level; errors instead of warning since it is read
    /// while the logger is being set up
    pub fn log_level(&self) -> Result<log::LevelFilter> {
        self.debug
            .log_level
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown log level '{}'", self.debug.log_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hello_cube() {
        let config = Config::default();
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 480);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.buffering_mode(), BufferingMode::Double);
        assert_eq!(config.max_frames_in_flight(), 2);
        assert_eq!(config.shaders.vertex_path(), Path::new("shaders/cube.vert.spv"));
        assert_eq!(config.shaders.fragment_path(), Path::new("shaders/cube.frag.spv"));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [window]
            title = "Cube"

            [graphics]
            buffering = "triple"
            present_mode = "Mailbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Cube");
        assert_eq!(config.window.width, 640);
        assert_eq!(config.buffering_mode(), BufferingMode::Triple);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(config.debug.show_fps);
    }

    #[test]
    fn unknown_names_fall_back() {
        let config = Config::from_toml(
            r#"
            [graphics]
            present_mode = "vsync-please"
            buffering = "quadruple"
            max_frames_in_flight = 0

            [debug]
            log_level = "chatty"
            "#,
        )
        .unwrap();

        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.buffering_mode(), BufferingMode::Double);
        assert_eq!(config.max_frames_in_flight(), 1);
        assert!(config.log_level().is_err());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped = Config::from_toml(include_str!("../config.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(shipped.window.title, defaults.window.title);
        assert_eq!(shipped.present_mode(), defaults.present_mode());
        assert_eq!(shipped.buffering_mode(), defaults.buffering_mode());
        assert_eq!(shipped.camera.eye, defaults.camera.eye);
        assert_eq!(shipped.shaders.vertex_path(), defaults.shaders.vertex_path());
        assert_eq!(shipped.debug.log_file, defaults.debug.log_file);
        assert_eq!(shipped.controls.bindings().reload_shaders, KeyCode::F5);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml("[window\nwidth = ").is_err());
        assert!(Config::from_toml("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn unreadable_config_reaches_the_caller() {
        let path = std::env::temp_dir().join(format!("vk_cube_bad_config_{}.toml", std::process::id()));
        std::fs::write(&path, "[window]\nwidth = \"wide\"\n").unwrap();

        let result = Config::load_from_path(&path);
        std::fs::remove_file(&path).unwrap();

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Failed to parse config file"), "{}", message);
    }

    #[test]
    fn log_level_names() {
        let mut config = Config::default();
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Info);
        config.debug.log_level = "DEBUG".to_string();
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Debug);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.window.title, "Vulkan Cube");
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key("esc"), Some(KeyCode::Escape));
        assert_eq!(parse_key(" F11 "), Some(KeyCode::F11));
        assert_eq!(parse_key("q"), Some(KeyCode::KeyQ));
        assert_eq!(parse_key("Hyper"), None);

        let controls = ControlsConfig {
            quit_key: "Q".to_string(),
            fullscreen_key: "nope".to_string(),
            reload_shaders_key: "r".to_string(),
        };
        let bindings = controls.bindings();
        assert_eq!(bindings.quit, KeyCode::KeyQ);
        assert_eq!(bindings.fullscreen, KeyCode::F11);
        assert_eq!(bindings.reload_shaders, KeyCode::KeyR);
    }
}
