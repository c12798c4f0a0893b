//! Configuration file loading
//!
//! Loads user configuration from `~/.config/playout/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::Range;
use crate::error::{PlayoutError, Result};
use crate::formats::{Colorspace, PixelFormat, parse_priority_list};
use crate::hardware::VirtualDeviceSpec;

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Defaults for playback flags left off the command line
    #[serde(default)]
    pub defaults: DefaultSettings,

    /// Devices exposed by the built-in virtual provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<VirtualDeviceSpec>,
}

/// Playback defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultSettings {
    /// Comma-separated pixel format priority, e.g. "10bit_yuv,8bit_yuv"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_format_priority: Option<String>,

    /// Output range: full or legal
    #[serde(default)]
    pub range: Range,

    /// Colorspace: auto, rec601, rec709, rec2020
    #[serde(default = "default_colorspace")]
    pub colorspace: String,
}

fn default_colorspace() -> String {
    "auto".to_string()
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            pixel_format_priority: None,
            range: Range::default(),
            colorspace: default_colorspace(),
        }
    }
}

impl DefaultSettings {
    /// Parsed pixel format priority, empty when unset
    pub fn pixel_formats(&self) -> Result<Vec<PixelFormat>> {
        match self.pixel_format_priority.as_deref() {
            Some(list) => parse_priority_list(list),
            None => Ok(Vec::new()),
        }
    }

    /// Parsed colorspace override
    pub fn colorspace_override(&self) -> Result<Option<Colorspace>> {
        Colorspace::parse_override(&self.colorspace)
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("playout").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("playout")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/playout/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| PlayoutError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)?;
        config.defaults.pixel_formats()?;
        config.defaults.colorspace_override()?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration, logging warnings but returning defaults on error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                PlayoutError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PlayoutError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)
            .map_err(|e| PlayoutError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Write the sample config to `path` unless a file is already there
    pub fn create_default_if_missing(path: PathBuf) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PlayoutError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        std::fs::write(&path, sample_config())
            .map_err(|e| PlayoutError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(true)
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# playout-helper configuration

[defaults]
# Pixel formats to try in order: 8bit_yuv, 10bit_yuv, 8bit_argb, 8bit_bgra
# Without a list only 8bit_argb is tried.
# pixel_format_priority = "10bit_yuv,8bit_yuv"

# RGB output range: full or legal
range = "legal"

# Colorspace: auto, rec601, rec709, rec2020
colorspace = "auto"

# Devices of the built-in virtual provider. Without any entry a single
# two-port card is exposed.
[[devices]]
display_name = "Virtual Duo (1)"
vendor = "Virtual"
model = "Virtual Duo"
persistent_id = 4096
connections = ["sdi", "hdmi"]
external_keying = true
internal_keying = true

[[devices]]
display_name = "Virtual Mini (1)"
model = "Virtual Mini"
device_handle = "virtual:mini/0"
connections = ["hdmi"]
external_keying = false
internal_keying = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.defaults.range, Range::Legal);
        assert_eq!(config.defaults.colorspace, "auto");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = sample_config();
        let config: ConfigFile = toml::from_str(&sample).unwrap();
        assert_eq!(config.defaults.range, Range::Legal);
        assert_eq!(config.defaults.colorspace_override().unwrap(), None);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].persistent_id, Some(4096));
        assert!(!config.devices[1].external_keying);
    }

    #[test]
    fn test_priority_from_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [defaults]
            pixel_format_priority = "10bit_yuv, 8bit_yuv"
            range = "full"
            colorspace = "rec709"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.defaults.pixel_formats().unwrap(),
            vec![PixelFormat::Yuv10, PixelFormat::Yuv8]
        );
        assert_eq!(config.defaults.range, Range::Full);
        assert_eq!(
            config.defaults.colorspace_override().unwrap(),
            Some(Colorspace::Rec709)
        );
    }
}
