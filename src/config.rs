// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
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
            title: "ember2d".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "vulkan", "opengl" or "auto"
    pub backend: String,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            present_mode: "mailbox".to_string(),
            clear_color: [0.05, 0.05, 0.08, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

impl GraphicsConfig {
    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.present_mode
                );
                ash::vk::PresentModeKHR::MAILBOX
            }
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
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

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.graphics.backend, "auto");
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(
            config.graphics.get_present_mode(),
            ash::vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn partial_file_keeps_missing_sections_at_default() {
        let config: Config = toml::from_str(
            r#"
            [window]
            title = "demo"
            width = 640
            "#,
        )
        .unwrap();
        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 640);
        // Fields absent from the file fall back.
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.backend, "auto");
    }

    #[test]
    fn present_mode_names_map_to_vulkan_enums() {
        let mut graphics = GraphicsConfig::default();
        for (name, mode) in [
            ("immediate", ash::vk::PresentModeKHR::IMMEDIATE),
            ("Mailbox", ash::vk::PresentModeKHR::MAILBOX),
            ("FIFO", ash::vk::PresentModeKHR::FIFO),
            ("fifo_relaxed", ash::vk::PresentModeKHR::FIFO_RELAXED),
            ("bogus", ash::vk::PresentModeKHR::MAILBOX),
        ] {
            graphics.present_mode = name.to_string();
            assert_eq!(graphics.get_present_mode(), mode, "mode name {name}");
        }
    }
}
