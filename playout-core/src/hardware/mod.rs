//! Hardware provider interface
//!
//! Object-safe traits over the vendor playback API. Every handle returned by
//! a provider owns one reference to the underlying hardware object and
//! releases it when dropped, so components hold a handle for exactly as long
//! as they need it and nothing else.
//!
//! ```text
//! Driver ──devices()──▶ Device ──output()──▶ VideoOutput ──schedule──▶ clock
//!    │                    └─────keyer()────▶ Keyer
//!    └──create_video_converter()──▶ VideoConverter
//! ```

mod virtual_device;
mod yuv;

pub use virtual_device::{
    ClockMode, HwCall, KeyerState, ScheduledFrame, VirtualDeviceSpec, VirtualDriver,
    VirtualModeSpec, VirtualProbe, default_modes,
};
pub use yuv::SoftwareConverter;

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::ConfigFile;
use crate::formats::{Colorspace, FieldDominance, PixelFormat};
use crate::types::Connection;

/// Result of a hardware call
pub type HwResult<T> = std::result::Result<T, HwError>;

/// Failure reported by the hardware provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HwError {
    /// The object does not implement the requested interface
    #[error("interface not supported")]
    NoInterface,
    /// The attribute or value is not available on this device
    #[error("not available")]
    NotAvailable,
    /// An argument was rejected
    #[error("invalid argument")]
    InvalidArg,
    /// The device is in use or in the wrong state
    #[error("device busy")]
    Busy,
    /// Generic failure with the provider's result code
    #[error("failed (code 0x{0:08x})")]
    Failed(u32),
}

/// Output connection bitmask values
pub mod connection_mask {
    /// Electrical SDI
    pub const SDI: i64 = 1 << 0;
    /// HDMI
    pub const HDMI: i64 = 1 << 1;
    /// Optical SDI
    pub const OPTICAL_SDI: i64 = 1 << 2;
    /// Component analog
    pub const COMPONENT: i64 = 1 << 3;
}

/// Video I/O support bitmask values
pub mod io_support {
    /// Device can capture
    pub const CAPTURE: i64 = 1 << 0;
    /// Device can play back
    pub const PLAYBACK: i64 = 1 << 1;
}

/// Device busy-status bits
pub mod busy_flags {
    /// Capture is in use
    pub const CAPTURE_BUSY: i64 = 1 << 0;
    /// Playback is in use
    pub const PLAYBACK_BUSY: i64 = 1 << 1;
}

/// Integer attributes of a device profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntAttribute {
    /// Persistent hardware id (survives reboots)
    PersistentId,
    /// Topological id of the card
    TopologicalId,
    /// Index of this sub-device on the card
    SubDeviceIndex,
    /// Bitmask of [`connection_mask`] values
    VideoOutputConnections,
    /// Bitmask of [`io_support`] values
    VideoIoSupport,
}

/// Boolean attributes of a device profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagAttribute {
    /// Separate fill and key outputs
    SupportsExternalKeying,
    /// Onboard keying
    SupportsInternalKeying,
}

/// String attributes of a device profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringAttribute {
    /// Platform device handle
    DeviceHandle,
    /// Vendor name
    VendorName,
    /// Model name
    ModelName,
}

/// Profile attribute interface; each query may fail on its own
pub trait ProfileAttributes {
    /// Query an integer attribute
    fn int(&self, id: IntAttribute) -> HwResult<i64>;
    /// Query a boolean attribute
    fn flag(&self, id: FlagAttribute) -> HwResult<bool>;
    /// Query a string attribute
    fn string(&self, id: StringAttribute) -> HwResult<String>;
}

/// Opaque identity of a hardware object, stable for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(pub u64);

/// One hardware device (one sub-device of a card)
pub trait Device: Send + Sync {
    /// Identity used to match hotplug removals against arrivals
    fn identity(&self) -> DeviceIdentity;
    /// Display name
    fn display_name(&self) -> HwResult<String>;
    /// Profile attribute interface
    fn attributes(&self) -> HwResult<&dyn ProfileAttributes>;
    /// Busy-status bitmask ([`busy_flags`])
    fn busy_flags(&self) -> HwResult<i64>;
    /// Route video output to a connection
    fn set_output_connection(&self, connection: Connection) -> HwResult<()>;
    /// Acquire the playback interface
    fn output(&self) -> HwResult<Arc<dyn VideoOutput>>;
    /// Acquire the keyer interface
    fn keyer(&self) -> HwResult<Box<dyn Keyer>>;
}

/// Opaque display mode handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayModeId(pub u32);

/// One row of a device's display-mode table
#[derive(Debug, Clone, PartialEq)]
pub struct HwDisplayMode {
    /// Mode handle
    pub id: DisplayModeId,
    /// Mode name, if the device reports one
    pub name: Option<String>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// `(frame_duration, time_scale)`, if the device reports a rate
    pub frame_rate: Option<(i64, i64)>,
    /// Field dominance
    pub field_dominance: FieldDominance,
    /// [`crate::formats::mode_flags`] bits
    pub flags: u32,
}

impl HwDisplayMode {
    /// Frame rate in frames per second, if known and non-degenerate
    pub fn fps(&self) -> Option<f64> {
        match self.frame_rate {
            Some((duration, scale)) if duration > 0 && scale > 0 => Some(scale as f64 / duration as f64),
            _ => None,
        }
    }
}

/// Options for [`VideoOutput::does_support_video_mode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedModeFlags {
    /// Mode must work with keying enabled
    pub keying: bool,
}

/// A frame in device memory layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row
    pub row_bytes: usize,
    /// Pixel format of `data`
    pub pixel_format: PixelFormat,
    /// Frame bytes, `row_bytes * height` long
    pub data: Vec<u8>,
}

/// Outcome reported for each scheduled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    /// Displayed on time
    Completed,
    /// Displayed, but late
    DisplayedLate,
    /// Never displayed
    Dropped,
    /// Discarded by a stop or flush
    Flushed,
}

/// Receives frame-completion callbacks on the provider's callback thread
pub trait CompletionHandler: Send + Sync {
    /// A scheduled frame finished
    fn scheduled_frame_completed(&self, result: CompletionResult);

    /// Scheduled playback came to a halt
    fn scheduled_playback_stopped(&self) {}
}

/// Playback interface of a device
pub trait VideoOutput: Send + Sync {
    /// Supported display modes, in device order
    fn display_modes(&self) -> HwResult<Vec<HwDisplayMode>>;
    /// Whether a (mode, pixel format) pair works on a connection
    fn does_support_video_mode(
        &self,
        connection: Connection,
        mode: DisplayModeId,
        pixel_format: PixelFormat,
        flags: SupportedModeFlags,
    ) -> HwResult<bool>;
    /// Bytes per row the device expects for a format
    fn row_bytes_for_pixel_format(&self, pixel_format: PixelFormat, width: u32) -> HwResult<usize>;
    /// Allocate a zeroed frame in device layout
    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        pixel_format: PixelFormat,
    ) -> HwResult<VideoFrame>;
    /// Queue a frame for display at `display_time`
    fn schedule_video_frame(
        &self,
        frame: VideoFrame,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> HwResult<()>;
    /// Frames queued on the device and not yet displayed
    fn buffered_video_frame_count(&self) -> HwResult<u32>;
    /// Enable output in a display mode
    fn enable_video_output(&self, mode: DisplayModeId) -> HwResult<()>;
    /// Disable output
    fn disable_video_output(&self) -> HwResult<()>;
    /// Start the playback clock
    fn start_scheduled_playback(&self, start_time: i64, time_scale: i64, speed: f64) -> HwResult<()>;
    /// Stop the playback clock
    fn stop_scheduled_playback(&self, stop_time: i64, time_scale: i64) -> HwResult<()>;
    /// Attach or detach the completion callback
    fn set_scheduled_frame_completion_callback(
        &self,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> HwResult<()>;
}

/// Keyer interface of a device
pub trait Keyer: Send {
    /// Turn keying on; `external` selects fill/key outputs
    fn enable(&mut self, external: bool) -> HwResult<()>;
    /// Set key level, 0..=255
    fn set_level(&mut self, level: u8) -> HwResult<()>;
    /// Turn keying off
    fn disable(&mut self) -> HwResult<()>;
}

/// Color-space converter provided by the hardware library
pub trait VideoConverter: Send {
    /// Convert an RGB-ordered frame into `target` in `colorspace`
    fn convert_new_frame(
        &mut self,
        source: &VideoFrame,
        target: PixelFormat,
        colorspace: Colorspace,
    ) -> HwResult<VideoFrame>;
}

/// Receives hotplug notifications on the provider's notification thread
pub trait DeviceNotificationSink: Send + Sync {
    /// A device appeared; the sink owns the handle
    fn device_arrived(&self, device: Box<dyn Device>);
    /// A previously announced device went away
    fn device_removed(&self, identity: DeviceIdentity);
}

/// Entry point of a hardware provider
pub trait Driver: Send + Sync {
    /// Provider name, for logs
    fn name(&self) -> &str;
    /// Whether devices are simulated rather than attached hardware
    fn is_virtual(&self) -> bool {
        false
    }
    /// Walk the device iterator once
    fn devices(&self) -> HwResult<Vec<Box<dyn Device>>>;
    /// Start hotplug notifications
    fn install_device_notifications(&self, sink: Arc<dyn DeviceNotificationSink>) -> HwResult<()>;
    /// Stop hotplug notifications
    fn uninstall_device_notifications(&self) -> HwResult<()>;
    /// Create a color-space converter
    fn create_video_converter(&self) -> HwResult<Box<dyn VideoConverter>>;
}

/// Open the provider the CLI runs against
///
/// The built-in virtual provider is populated from the `[[devices]]` table of
/// the config file, or with one default card when the table is empty.
pub fn open_driver(config: &ConfigFile) -> Arc<dyn Driver> {
    warn!("No hardware provider compiled in; devices are simulated by the virtual provider");
    let driver = VirtualDriver::new();
    if config.devices.is_empty() {
        driver.add_device(VirtualDeviceSpec::default());
    } else {
        for spec in &config.devices {
            driver.add_device(spec.clone());
        }
    }
    Arc::new(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_driver_is_marked_virtual() {
        let driver = open_driver(&ConfigFile::default());
        assert!(driver.is_virtual());
        assert_eq!(driver.name(), "virtual");
        assert_eq!(driver.devices().unwrap().len(), 1);
    }
}
