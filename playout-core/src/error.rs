//! Error types for playout

use thiserror::Error;

use crate::hardware::HwError;

/// Result type alias using PlayoutError
pub type Result<T> = std::result::Result<T, PlayoutError>;

/// Main error type for playout operations
#[derive(Debug, Error)]
pub enum PlayoutError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pixel format label that is not one of the supported device formats
    #[error("Unknown pixel format: {0}")]
    UnknownPixelFormat(String),

    /// Output port id that does not follow the `<device>-sdi|-sdi-a|-hdmi` grammar
    #[error("Invalid output port: {0}")]
    InvalidPort(String),

    /// No device produced the requested stable id
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Mode negotiation found no (mode, pixel format) pair
    #[error("No supported display mode for {width}x{height} @ {fps:.3}")]
    NoDisplayMode {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Requested frame rate
        fps: f64,
    },

    /// Fill/key requested on a device that cannot key externally
    #[error("External keying not supported by device: {0}")]
    KeyingUnsupported(String),

    /// Shared-memory frame bus could not be opened or does not match the session
    #[error("FrameBus error: {0}")]
    FrameBus(String),

    /// Conversion target the converter cannot produce
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A hardware call failed
    #[error("{operation} failed: {source}")]
    Hardware {
        /// Name of the hardware operation
        operation: &'static str,
        #[source]
        source: HwError,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PlayoutError>,
    },
}

impl PlayoutError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a frame bus error
    pub fn framebus(msg: impl Into<String>) -> Self {
        Self::FrameBus(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Wrap a hardware failure with the name of the failing call
    pub fn hardware(operation: &'static str, source: HwError) -> Self {
        Self::Hardware { operation, source }
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error belongs to the configuration class: it is detected
    /// before any output is enabled and always ends the process with a failure.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Config(_)
            | Self::UnknownPixelFormat(_)
            | Self::InvalidPort(_)
            | Self::DeviceNotFound(_)
            | Self::NoDisplayMode { .. }
            | Self::KeyingUnsupported(_)
            | Self::FrameBus(_) => true,
            Self::WithContext { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// A short hint for the operator, if one applies
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::DeviceNotFound(_) => Some("Run `playout-helper --list` to see available device ids"),
            Self::InvalidPort(_) => {
                Some("Output ports are `<device>-sdi`, `<device>-hdmi` or `<device>-sdi-a`/`-sdi-b` for fill/key")
            }
            Self::UnknownPixelFormat(_) => Some("Valid pixel formats: 8bit_yuv, 10bit_yuv, 8bit_argb, 8bit_bgra"),
            Self::NoDisplayMode { .. } => {
                Some("Run `playout-helper --list-modes` to see the modes the output supports")
            }
            Self::KeyingUnsupported(_) => Some("Use a single output port or a card with external keying"),
            Self::FrameBus(_) => Some("Check that the producer created the bus with the same size and RGBA8 format"),
            Self::Config(_) => Some("Check the command line and ~/.config/playout/config.toml"),
            Self::WithContext { source, .. } => source.user_hint(),
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl From<toml::de::Error> for PlayoutError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Failed to parse config file: {}", err))
    }
}
