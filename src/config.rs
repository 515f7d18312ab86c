// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Missing file or parse errors fall back to defaults with a warning.
// Values the frame loop cannot work with are rejected by validate().

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::error::FrameError;

/// Upper bound on frames in flight; more only adds latency
pub const MAX_FRAMES_IN_FLIGHT_LIMIT: u32 = 4;

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
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "framepace".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: u32,
    /// How long one fence wait blocks before logging and waiting again
    pub fence_timeout_ms: u64,
    /// Acquire taking longer than this is fatal
    pub acquire_timeout_ms: u64,
    /// Produce the per-frame tint on the compute queue and hand it to graphics
    pub compute_lane: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            fence_timeout_ms: 1000,
            acquire_timeout_ms: 5000,
            compute_lane: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
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
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "framepace.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        let config = Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        });
        if let Err(e) = config.validate() {
            log::warn!("{}. Using defaults.", e);
            return Config::default();
        }
        config
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

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        let frames = self.graphics.max_frames_in_flight;
        if !(1..=MAX_FRAMES_IN_FLIGHT_LIMIT).contains(&frames) {
            return Err(FrameError::Config(format!(
                "max_frames_in_flight must be between 1 and {}, got {}",
                MAX_FRAMES_IN_FLIGHT_LIMIT, frames
            )));
        }
        // Zero makes fence waits spin and any NOT_READY acquire fatal
        for (name, value) in [
            ("fence_timeout_ms", self.graphics.fence_timeout_ms),
            ("acquire_timeout_ms", self.graphics.acquire_timeout_ms),
        ] {
            if value == 0 {
                return Err(FrameError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(FrameError::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}
