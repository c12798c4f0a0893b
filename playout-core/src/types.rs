//! Core types for playout
//!
//! These types are the snapshots handed across component boundaries: device
//! and display-mode descriptors, and the RGBA frames moving from ingest to
//! the scheduler.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::formats::{FieldDominance, PixelFormat};

/// Physical output connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    /// SDI (electrical or optical)
    Sdi,
    /// HDMI
    Hdmi,
    /// No specific connection requested
    Unspecified,
}

impl Connection {
    /// Label used in JSON output and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sdi => "sdi",
            Self::Hdmi => "hdmi",
            Self::Unspecified => "unspecified",
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Snapshot of one device, rebuilt on every enumeration or hotplug event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Stable identifier (see [`crate::catalog::stable_id`])
    pub id: String,
    /// Human-readable device name
    pub display_name: String,
    /// Vendor name, omitted when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Model name, omitted when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Output connections, SDI before HDMI
    #[serde(rename = "videoOutputConnections")]
    pub output_connections: Vec<Connection>,
    /// Playback is currently in use by another process
    pub busy: bool,
    /// Device can play video out
    pub supports_playback: bool,
    /// Device can drive separate fill and key outputs
    pub supports_external_keying: bool,
    /// Device can key onboard
    pub supports_internal_keying: bool,
}

impl DeviceDescriptor {
    /// Whether the device offers the given connection
    pub fn has_connection(&self, connection: Connection) -> bool {
        self.output_connections.contains(&connection)
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.id, self.display_name)?;
        if self.busy {
            write!(f, " (busy)")?;
        }
        Ok(())
    }
}

/// One entry of a `--list-modes` listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayModeDescriptor {
    /// Mode name as reported by the device
    pub name: String,
    /// Opaque mode handle
    pub id: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frame rate, rounded to three decimals
    pub fps: f64,
    /// Frame duration in time-scale units
    pub frame_duration: i64,
    /// Time scale (units per second)
    pub time_scale: i64,
    /// Field dominance
    pub field_dominance: FieldDominance,
    /// Connection the formats were checked against
    pub connection: Connection,
    /// Pixel formats supported for this mode and connection
    pub pixel_formats: Vec<PixelFormat>,
}

/// One RGBA8 frame as delivered by a producer
///
/// The payload is reference counted so the scheduler can re-present the
/// last frame without copying it.
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Producer timestamp (opaque, informational)
    pub timestamp: u64,
    data: Arc<[u8]>,
}

impl RgbaFrame {
    /// Wrap a tightly packed RGBA8 buffer
    pub fn new(width: u32, height: u32, timestamp: u64, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            timestamp,
            data: data.into(),
        }
    }

    /// Expected payload size for a frame of this size
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Raw RGBA bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether two frames share the same buffer
    pub fn ptr_eq(&self, other: &RgbaFrame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor = DeviceDescriptor {
            id: "decklink-pid-1a".to_string(),
            display_name: "DeckLink Duo 2 (1)".to_string(),
            vendor: None,
            model: Some("DeckLink Duo 2".to_string()),
            output_connections: vec![Connection::Sdi, Connection::Hdmi],
            busy: false,
            supports_playback: true,
            supports_external_keying: true,
            supports_internal_keying: false,
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["displayName"], "DeckLink Duo 2 (1)");
        assert_eq!(json["videoOutputConnections"][1], "hdmi");
        assert_eq!(json["supportsExternalKeying"], true);
        assert!(json.get("vendor").is_none());
        assert_eq!(json["model"], "DeckLink Duo 2");
    }

    #[test]
    fn test_frame_sharing() {
        let frame = RgbaFrame::new(2, 1, 0, vec![0; 8]);
        let held = frame.clone();
        assert!(frame.ptr_eq(&held));
        assert_eq!(RgbaFrame::expected_len(1920, 1080), 8_294_400);
    }
}
