//! Configuration for the compositing manager
//!
//! Loads configuration from TOML file at `~/.config/scrim/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// X display to attach to (overrides $DISPLAY)
    pub display: Option<String>,
    pub compositor: CompositorConfig,
    pub effects: EffectsConfig,
}

impl Config {
    /// Load configuration from the default location, or use defaults if the file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", config_path))?;
        config.compositor.default_opacity = config.compositor.default_opacity.clamp(0.0, 1.0);

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("scrim");

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

    /// Warn about toggles that are accepted but have no renderer support
    pub fn warn_unsupported(&self) {
        if self.effects.shadow {
            warn!("effects.shadow is enabled but shadows are not available; ignoring");
        }
        if self.effects.blur {
            warn!("effects.blur is enabled but blur is not available; ignoring");
        }
    }
}

/// Compositor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Sync buffer swaps to vertical blank
    pub vsync: bool,
    /// Delay used to batch damage before a frame is rendered
    pub frame_delay_ms: u64,
    /// Redraw at least this often while the frame is dirty
    pub fallback_redraw_ms: u64,
    /// Clear color (RGBA, 0.0-1.0)
    pub background: [f32; 4],
    /// Opacity applied to every window (0.0-1.0)
    pub default_opacity: f32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            frame_delay_ms: 16,
            fallback_redraw_ms: 1000,
            background: [0.1, 0.1, 0.1, 1.0],
            default_opacity: 1.0,
        }
    }
}

impl CompositorConfig {
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms.max(1))
    }

    pub fn fallback_redraw(&self) -> Duration {
        Duration::from_millis(self.fallback_redraw_ms.max(1))
    }
}

/// Visual effect toggles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub shadow: bool,
    pub blur: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrim").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(config.compositor.vsync);
        assert_eq!(config.compositor.frame_delay_ms, 16);
        assert!(path.exists());

        // The generated file parses back to the same values
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.compositor.background, config.compositor.background);
    }

    #[test]
    fn test_partial_file_fills_defaults_and_clamps_opacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "display = \":1\"\n[compositor]\nvsync = false\ndefault_opacity = 3.5\n[effects]\nshadow = true\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.display.as_deref(), Some(":1"));
        assert!(!config.compositor.vsync);
        assert_eq!(config.compositor.default_opacity, 1.0);
        assert_eq!(config.compositor.fallback_redraw_ms, 1000);
        assert!(config.effects.shadow);
        assert!(!config.effects.blur);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[compositor\nvsync = ").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
