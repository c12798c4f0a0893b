//! Playback session lifecycle
//!
//! Opening a session runs the setup sequence up to an enabled output with the
//! completion callback attached. Every failure on the way is reported before
//! output is enabled, or undoes the enable before returning. Teardown runs in
//! one fixed order:
//!
//! ```text
//! stop playback ─▶ disable keyer ─▶ disable output ─▶ detach callback ─▶ release
//! ```

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::{self, DeviceCatalog};
use crate::config::{OutputTarget, PlaybackConfig};
use crate::convert::FrameConverter;
use crate::error::{PlayoutError, Result};
use crate::formats::Colorspace;
use crate::hardware::{CompletionHandler, Device, VideoOutput};
use crate::ingest::{CancellationToken, FrameBusReader, Ingest, IngestExit, PollingReader};
use crate::keyer::KeyerController;
use crate::modes::{DisplayModeNegotiator, ModeRequest, NegotiatedMode, resolve_colorspace};
use crate::scheduler::{PlaybackScheduler, PlaybackStats};

/// Open the frame source a session reads from
///
/// A named bus is opened and checked against the session size here, before
/// any output is enabled; otherwise frames come from standard input.
pub fn open_ingest(config: &PlaybackConfig, cancel: &CancellationToken) -> Result<Ingest> {
    match config.framebus_name.as_deref() {
        Some(name) => {
            let reader = FrameBusReader::open(name)?;
            reader.validate_target(config.width, config.height)?;
            info!(
                "FrameBus {} opened: {} slots of {} bytes",
                name,
                reader.header().slot_count,
                reader.header().frame_size
            );
            Ok(Ingest::Bus(reader))
        }
        None => {
            let stdin = PollingReader::stdin(cancel.clone())?;
            Ok(Ingest::stream(stdin, config.width, config.height))
        }
    }
}

/// A device output running one playback configuration
pub struct PlaybackSession {
    scheduler: Arc<PlaybackScheduler>,
    keyer: Option<KeyerController>,
    output: Arc<dyn VideoOutput>,
    device: Box<dyn Device>,
    mode: NegotiatedMode,
    colorspace: Colorspace,
    target: OutputTarget,
    active: bool,
}

impl PlaybackSession {
    /// Resolve, negotiate and enable the output described by `config`
    pub fn open(catalog: &DeviceCatalog, config: &PlaybackConfig) -> Result<Self> {
        let target = config.validate()?;
        info!(
            "Playback config: device={} output={} keying={} {}x{} fps={:.3}",
            config.device_id,
            target.connection(),
            if target.is_keying() { "external" } else { "none" },
            config.width,
            config.height,
            config.fps
        );

        let device = catalog.find_by_id(&config.device_id)?;
        let output = device
            .output()
            .map_err(|e| PlayoutError::hardware("QueryInterface(Output)", e))?;

        let mut keyer = if target.is_keying() {
            Some(KeyerController::acquire(device.as_ref())?)
        } else {
            None
        };

        let request = ModeRequest {
            width: config.width,
            height: config.height,
            fps: config.fps,
            pixel_formats: config.effective_priority(),
            connection: target.connection(),
            keying: target.is_keying(),
        };
        let mode = DisplayModeNegotiator::new(output.as_ref()).negotiate(&request)?;
        let colorspace = resolve_colorspace(mode.flags, config.height, config.colorspace);
        info!(
            "Selected display mode: {} ({}x{} @ {:.3}, {}, pixelFormat {}, colorspace {}, range {})",
            mode.name.as_deref().unwrap_or("unknown"),
            config.width,
            config.height,
            mode.fps(),
            mode.field_dominance,
            mode.pixel_format,
            colorspace,
            config.range
        );

        let connection = target.connection();
        if !catalog::supports_output_connection(device.as_ref(), connection) {
            return Err(PlayoutError::config(format!(
                "Requested output connection {} not supported by device.",
                connection
            )));
        }
        catalog::configure_output_connection(device.as_ref(), connection)?;

        let video_converter = if mode.pixel_format.is_yuv() {
            Some(
                catalog
                    .driver()
                    .create_video_converter()
                    .map_err(|e| PlayoutError::hardware("CreateVideoConversionInstance", e))?,
            )
        } else {
            None
        };
        let converter = FrameConverter::new(
            output.clone(),
            video_converter,
            mode.pixel_format,
            colorspace,
            config.range.is_legal(),
        )?;

        output
            .enable_video_output(mode.mode)
            .map_err(|e| PlayoutError::hardware("EnableVideoOutput", e))?;

        if let Some(keyer) = keyer.as_mut()
            && let Err(e) = keyer.enable()
        {
            disable_output(output.as_ref());
            return Err(e);
        }

        let scheduler = Arc::new(PlaybackScheduler::new(output.clone(), converter, &mode));
        let handler: Arc<dyn CompletionHandler> = scheduler.clone();
        if let Err(e) = output.set_scheduled_frame_completion_callback(Some(handler)) {
            if let Some(keyer) = keyer.as_mut() {
                keyer.disable();
            }
            disable_output(output.as_ref());
            return Err(PlayoutError::hardware("SetScheduledFrameCompletionCallback", e));
        }

        Ok(Self {
            scheduler,
            keyer,
            output,
            device,
            mode,
            colorspace,
            target,
            active: true,
        })
    }

    /// The negotiated mode
    pub fn mode(&self) -> &NegotiatedMode {
        &self.mode
    }

    /// Colorspace frames are converted in
    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    /// Where video is sent
    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    /// The scheduler, also the frame sink of this session
    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    /// Stable id of the device in use
    pub fn device_id(&self) -> String {
        catalog::device_id(self.device.as_ref())
    }

    /// Snapshot of the playback counters
    pub fn stats(&self) -> PlaybackStats {
        self.scheduler.stats()
    }

    /// Feed the session from `ingest` on a dedicated thread until it ends
    pub fn run(&self, mut ingest: Ingest, cancel: &CancellationToken) -> Result<IngestExit> {
        let scheduler = self.scheduler.clone();
        let cancel = cancel.clone();
        let label = ingest.label();
        let handle = std::thread::Builder::new()
            .name("playout-ingest".to_string())
            .spawn(move || ingest.run(scheduler.as_ref(), &cancel))?;

        match handle.join() {
            Ok(result) => {
                if let Ok(exit) = &result {
                    info!("{} ingest finished: {}", label, exit);
                }
                result
            }
            Err(_) => {
                error!("{} ingest thread panicked", label);
                Err(PlayoutError::Io(std::io::Error::other("ingest thread panicked")))
            }
        }
    }

    /// Tear the session down and return the final counters
    pub fn shutdown(mut self) -> PlaybackStats {
        self.teardown();
        self.scheduler.stats()
    }

    fn teardown(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.scheduler.stop();

        let scale = self.mode.time_scale;
        if let Err(e) = self.output.stop_scheduled_playback(0, scale) {
            warn!("StopScheduledPlayback failed: {}", e);
        }
        if let Some(keyer) = self.keyer.as_mut() {
            keyer.disable();
        }
        disable_output(self.output.as_ref());
        if let Err(e) = self.output.set_scheduled_frame_completion_callback(None) {
            warn!("Detaching completion callback failed: {}", e);
        }
        // Keyer handle goes first, the device handle is dropped with the session
        self.keyer = None;
        debug!("Playback session torn down");
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn disable_output(output: &dyn VideoOutput) {
    if let Err(e) = output.disable_video_output() {
        warn!("DisableVideoOutput failed: {}", e);
    }
}
