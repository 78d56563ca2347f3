//! Configuration for the handoff demo host
//!
//! Loads configuration from TOML file at `~/.config/handoff/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use handoff_ipc::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol parameters; both processes read the same file so N agrees
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let config = Self::load_from(&config_path)?;
        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config
            .session
            .validate()
            .context("Invalid session configuration")?;
        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("handoff");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Frames the consumer is assumed to hold before the producer reuses a slot
    pub fn retain_frames(&self) -> usize {
        self.demo
            .retain_frames
            .unwrap_or(self.session.slot_count.saturating_sub(1))
            .max(1)
    }
}

/// Demo pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Frames to produce before exiting (0 = until interrupted)
    pub frames: u64,
    /// Delay between frames in milliseconds
    pub frame_interval_ms: u64,
    /// Fixed consumer latency in frames, used to release slots in `stall` mode
    pub retain_frames: Option<usize>,
    /// How often the consumer reports its frame rate
    pub fps_report_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 600,
            frame_interval_ms: 16,
            retain_frames: None,
            fps_report_ms: 1000,
        }
    }
}
