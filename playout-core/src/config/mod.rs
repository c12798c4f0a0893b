//! Configuration types for playout
//!
//! Provides the playback and mode-listing requests, the output-port grammar,
//! and the optional config file.

mod file;

pub use file::{ConfigFile, DefaultSettings, sample_config};

use serde::{Deserialize, Serialize};

use crate::error::{PlayoutError, Result};
use crate::formats::{Colorspace, PixelFormat};
use crate::types::Connection;

/// Suffix of a single SDI port, or the fill side of a fill/key pair
pub const SDI_FILL_SUFFIX: &str = "-sdi-a";
/// Suffix of the key side of a fill/key pair
pub const SDI_KEY_SUFFIX: &str = "-sdi-b";
/// Suffix of a single SDI port
pub const SDI_SUFFIX: &str = "-sdi";
/// Suffix of an HDMI port
pub const HDMI_SUFFIX: &str = "-hdmi";

/// Output sample range for RGB targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Range {
    /// 0-255
    Full,
    /// 16-235
    #[default]
    Legal,
}

impl Range {
    /// Whether RGB values are remapped into 16-235
    pub fn is_legal(&self) -> bool {
        *self == Self::Legal
    }

    /// Label used on the command line
    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Legal => "legal",
        }
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for Range {
    type Err = PlayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "legal" => Ok(Self::Legal),
            _ => Err(PlayoutError::config(format!("Unknown range: {}", s))),
        }
    }
}

/// A parsed output port id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPort {
    /// Device part of the id
    pub device_id: String,
    /// Connection selected by the suffix
    pub connection: Connection,
}

impl OutputPort {
    /// Parse `<device>-sdi-a`, `<device>-sdi` or `<device>-hdmi`
    pub fn parse(id: &str) -> Result<Self> {
        let suffixes = [
            (SDI_FILL_SUFFIX, Connection::Sdi),
            (SDI_SUFFIX, Connection::Sdi),
            (HDMI_SUFFIX, Connection::Hdmi),
        ];
        for (suffix, connection) in suffixes {
            if let Some(device) = id.strip_suffix(suffix) {
                if device.is_empty() {
                    return Err(PlayoutError::InvalidPort(id.to_string()));
                }
                return Ok(Self {
                    device_id: device.to_string(),
                    connection,
                });
            }
        }
        Err(PlayoutError::InvalidPort(id.to_string()))
    }

    /// Port id of a single video output
    pub fn id(&self) -> String {
        let suffix = match self.connection {
            Connection::Hdmi => HDMI_SUFFIX,
            _ => SDI_SUFFIX,
        };
        format!("{}{}", self.device_id, suffix)
    }
}

/// Fill and key port ids expected for a device
pub fn fill_key_ports(device_id: &str) -> (String, String) {
    (
        format!("{}{}", device_id, SDI_FILL_SUFFIX),
        format!("{}{}", device_id, SDI_KEY_SUFFIX),
    )
}

/// Where a playback session sends video
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// One video port
    Single(Connection),
    /// Fill on SDI A, key on SDI B, external keyer enabled
    FillKey,
}

impl OutputTarget {
    /// Connection the output is routed to
    pub fn connection(&self) -> Connection {
        match self {
            Self::Single(connection) => *connection,
            Self::FillKey => Connection::Sdi,
        }
    }

    /// Whether the external keyer is required
    pub fn is_keying(&self) -> bool {
        matches!(self, Self::FillKey)
    }
}

/// Request for one playback session; immutable once the session opens
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Stable device id
    pub device_id: String,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame rate
    pub fps: f64,
    /// Single output port id
    pub output_port: Option<String>,
    /// Fill port id
    pub fill_port: Option<String>,
    /// Key port id
    pub key_port: Option<String>,
    /// Pixel formats to try, in order
    pub pixel_format_priority: Vec<PixelFormat>,
    /// RGB sample range
    pub range: Range,
    /// Colorspace override; `None` picks from the display mode
    pub colorspace: Option<Colorspace>,
    /// Shared-memory bus to read instead of stdin
    pub framebus_name: Option<String>,
}

impl PlaybackConfig {
    /// Create a request for `device_id` at a size and rate
    pub fn new(device_id: impl Into<String>, width: u32, height: u32, fps: f64) -> Self {
        Self {
            device_id: device_id.into(),
            width,
            height,
            fps,
            output_port: None,
            fill_port: None,
            key_port: None,
            pixel_format_priority: Vec::new(),
            range: Range::default(),
            colorspace: None,
            framebus_name: None,
        }
    }

    /// Send video to a single port
    pub fn with_output_port(mut self, port: impl Into<String>) -> Self {
        self.output_port = Some(port.into());
        self
    }

    /// Send fill and key to a port pair
    pub fn with_fill_key(mut self, fill: impl Into<String>, key: impl Into<String>) -> Self {
        self.fill_port = Some(fill.into());
        self.key_port = Some(key.into());
        self
    }

    /// Set the pixel format priority list
    pub fn with_pixel_format_priority(mut self, formats: Vec<PixelFormat>) -> Self {
        self.pixel_format_priority = formats;
        self
    }

    /// Use exactly one pixel format
    pub fn with_pixel_format(self, format: PixelFormat) -> Self {
        self.with_pixel_format_priority(vec![format])
    }

    /// Set the RGB sample range
    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    /// Force a colorspace
    pub fn with_colorspace(mut self, colorspace: Option<Colorspace>) -> Self {
        self.colorspace = colorspace;
        self
    }

    /// Read frames from a shared-memory bus
    pub fn with_framebus(mut self, name: impl Into<String>) -> Self {
        self.framebus_name = Some(name.into());
        self
    }

    /// Pixel formats to try, falling back to 8-bit ARGB
    pub fn effective_priority(&self) -> Vec<PixelFormat> {
        if self.pixel_format_priority.is_empty() {
            vec![PixelFormat::FALLBACK]
        } else {
            self.pixel_format_priority.clone()
        }
    }

    /// Resolve the port options into an output target
    ///
    /// Naming either fill or key selects fill/key, which then requires both
    /// to be the `-sdi-a`/`-sdi-b` pair of the selected device.
    pub fn output_target(&self) -> Result<OutputTarget> {
        if self.fill_port.is_some() || self.key_port.is_some() {
            let (fill, key) = fill_key_ports(&self.device_id);
            if self.fill_port.as_deref() != Some(fill.as_str())
                || self.key_port.as_deref() != Some(key.as_str())
            {
                return Err(PlayoutError::InvalidPort(
                    "Fill/key ports do not match the selected device.".to_string(),
                ));
            }
            return Ok(OutputTarget::FillKey);
        }

        let Some(port) = self.output_port.as_deref() else {
            return Err(PlayoutError::config("Output port is required for video playback."));
        };
        let port = OutputPort::parse(port)?;
        if port.device_id != self.device_id {
            return Err(PlayoutError::InvalidPort(
                "Output port does not match the selected device.".to_string(),
            ));
        }
        Ok(OutputTarget::Single(port.connection))
    }

    /// Validate the request and resolve its output target
    pub fn validate(&self) -> Result<OutputTarget> {
        if self.device_id.is_empty() || self.width == 0 || self.height == 0 || !(self.fps > 0.0) {
            return Err(PlayoutError::config("Invalid playback configuration."));
        }
        if self.framebus_name.as_deref() == Some("") {
            return Err(PlayoutError::config("FrameBus name cannot be empty"));
        }
        self.output_target()
    }
}

/// Request for a `--list-modes` listing; zero fields do not filter
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModeListConfig {
    /// Stable device id
    pub device_id: String,
    /// Output port id
    pub output_port: String,
    /// Width filter
    pub width: u32,
    /// Height filter
    pub height: u32,
    /// Frame-rate filter
    pub fps: f64,
    /// Only report formats usable with keying
    pub keying: bool,
}

impl ModeListConfig {
    /// List modes of one device port
    pub fn new(device_id: impl Into<String>, output_port: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            output_port: output_port.into(),
            ..Self::default()
        }
    }

    /// Only list modes of this size
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Only list modes at this rate
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    /// Probe formats with keying enabled
    pub fn with_keying(mut self, keying: bool) -> Self {
        self.keying = keying;
        self
    }

    /// Validate the request and return the port's connection
    pub fn validate(&self) -> Result<Connection> {
        if self.device_id.is_empty() || self.output_port.is_empty() {
            return Err(PlayoutError::config(
                "Device ID and output port are required for list-modes.",
            ));
        }
        let port = OutputPort::parse(&self.output_port)?;
        if port.device_id != self.device_id {
            return Err(PlayoutError::InvalidPort(
                "Output port does not match the selected device.".to_string(),
            ));
        }
        Ok(port.connection)
    }
}
