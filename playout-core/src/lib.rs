//! Playout Core Library
//!
//! Drives broadcast output cards from a stream of rendered RGBA frames.
//!
//! This library provides:
//! - Device discovery with stable ids and hotplug notifications
//! - Display mode negotiation for SDI/HDMI outputs
//! - Frame ingest over a length-prefixed stream or a shared-memory bus
//! - RGBA to device pixel format conversion (legal range, YUV 4:2:2)
//! - Scheduled playback with preroll and last-frame hold on underrun
//! - External keyer control for fill/key outputs
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────┐    ┌──────────────────┐    ┌──────────────┐
//! │ Stream/Bus   │───▶│ FrameQueue │───▶│ PlaybackScheduler│───▶│ VideoOutput  │
//! │ Ingest       │    │ (4, drop   │    │ + FrameConverter │    │ (device      │
//! │              │    │  oldest)   │    │                  │◀───│  clock)      │
//! └──────────────┘    └────────────┘    └──────────────────┘    └──────────────┘
//! ```

pub mod catalog;
pub mod config;
pub mod convert;
pub mod error;
pub mod formats;
pub mod hardware;
pub mod ingest;
pub mod keyer;
pub mod modes;
pub mod scheduler;
pub mod session;
pub mod types;
pub mod watcher;

pub use catalog::DeviceCatalog;
pub use config::{ConfigFile, ModeListConfig, OutputPort, OutputTarget, PlaybackConfig, Range};
pub use error::{PlayoutError, Result, ResultExt};
pub use formats::{Colorspace, FieldDominance, PixelFormat};
pub use ingest::{CancellationToken, Ingest, IngestExit};
pub use modes::{DisplayModeNegotiator, NegotiatedMode};
pub use scheduler::{PlaybackPhase, PlaybackScheduler, PlaybackStats};
pub use session::PlaybackSession;
pub use types::{Connection, DeviceDescriptor, DisplayModeDescriptor, RgbaFrame};
pub use watcher::{DeviceWatch, NotificationWatcher, WatchEvent};
