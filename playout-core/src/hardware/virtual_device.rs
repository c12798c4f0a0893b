//! Software hardware provider
//!
//! Implements the provider traits entirely in memory: a device table with
//! hotplug simulation, an output that keeps its scheduled frames in a FIFO,
//! and a clock that completes them either in real time (a dedicated thread
//! ticking once per frame duration) or on demand through a [`VirtualProbe`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{
    CompletionHandler, CompletionResult, Device, DeviceIdentity, DeviceNotificationSink,
    DisplayModeId, Driver, FlagAttribute, HwDisplayMode, HwError, HwResult, IntAttribute, Keyer,
    ProfileAttributes, StringAttribute, SupportedModeFlags, VideoConverter, VideoFrame,
    VideoOutput, busy_flags, connection_mask, io_support,
};
use crate::formats::{Colorspace, FieldDominance, PixelFormat, colorspace_flag, four_cc};
use crate::types::Connection;

/// Result code returned by injected failures
const E_FAIL: u32 = 0x8000_4005;

/// Scheduled frames kept for inspection
const RECENT_FRAMES: usize = 8;

/// How the virtual output advances its clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// A thread completes one frame per frame duration
    #[default]
    Realtime,
    /// Frames complete only through [`VirtualProbe::complete_next`]
    Manual,
}

/// One display mode of a virtual device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualModeSpec {
    /// Mode name
    pub name: String,
    /// Four-character mode code, space padded
    pub code: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frame duration in time-scale units (0 = not reported)
    pub frame_duration: i64,
    /// Time-scale units per second (0 = not reported)
    pub time_scale: i64,
    /// Field dominance
    #[serde(default)]
    pub field_dominance: FieldDominance,
    /// Colorspaces advertised in the mode flags
    #[serde(default)]
    pub colorspaces: Vec<Colorspace>,
    /// Pixel formats the mode accepts
    #[serde(default = "all_pixel_formats")]
    pub pixel_formats: Vec<PixelFormat>,
}

fn all_pixel_formats() -> Vec<PixelFormat> {
    PixelFormat::ALL.to_vec()
}

impl VirtualModeSpec {
    fn new(
        name: &str,
        code: &[u8; 4],
        (width, height): (u32, u32),
        (frame_duration, time_scale): (i64, i64),
        field_dominance: FieldDominance,
        colorspaces: &[Colorspace],
    ) -> Self {
        Self {
            name: name.to_string(),
            code: String::from_utf8_lossy(code).into_owned(),
            width,
            height,
            frame_duration,
            time_scale,
            field_dominance,
            colorspaces: colorspaces.to_vec(),
            pixel_formats: all_pixel_formats(),
        }
    }

    /// Restrict the pixel formats this mode accepts
    pub fn with_pixel_formats(mut self, formats: &[PixelFormat]) -> Self {
        self.pixel_formats = formats.to_vec();
        self
    }

    /// Mode handle derived from the four-character code
    pub fn mode_id(&self) -> DisplayModeId {
        let mut bytes = [b' '; 4];
        for (slot, byte) in bytes.iter_mut().zip(self.code.bytes()) {
            *slot = byte;
        }
        DisplayModeId(four_cc(&bytes))
    }

    fn to_hw(&self) -> HwDisplayMode {
        let frame_rate = (self.frame_duration != 0 && self.time_scale != 0)
            .then_some((self.frame_duration, self.time_scale));
        HwDisplayMode {
            id: self.mode_id(),
            name: Some(self.name.clone()),
            width: self.width,
            height: self.height,
            frame_rate,
            field_dominance: self.field_dominance,
            flags: self.colorspaces.iter().fold(0, |acc, cs| acc | colorspace_flag(*cs)),
        }
    }
}

/// Standard SD, HD and UHD broadcast modes
pub fn default_modes() -> Vec<VirtualModeSpec> {
    use Colorspace::{Rec2020, Rec601, Rec709};
    use FieldDominance::{LowerFieldFirst, Progressive, UpperFieldFirst};

    const SD_NTSC: (u32, u32) = (720, 486);
    const SD_PAL: (u32, u32) = (720, 576);
    const HD720: (u32, u32) = (1280, 720);
    const HD1080: (u32, u32) = (1920, 1080);
    const UHD: (u32, u32) = (3840, 2160);

    vec![
        VirtualModeSpec::new("NTSC", b"ntsc", SD_NTSC, (1001, 30000), LowerFieldFirst, &[Rec601]),
        VirtualModeSpec::new("PAL", b"pal ", SD_PAL, (1000, 25000), UpperFieldFirst, &[Rec601]),
        VirtualModeSpec::new("720p50", b"hp50", HD720, (1000, 50000), Progressive, &[Rec709]),
        VirtualModeSpec::new("720p59.94", b"hp59", HD720, (1001, 60000), Progressive, &[Rec709]),
        VirtualModeSpec::new("720p60", b"hp60", HD720, (1000, 60000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080i50", b"Hi50", HD1080, (1000, 25000), UpperFieldFirst, &[Rec709]),
        VirtualModeSpec::new("1080i59.94", b"Hi59", HD1080, (1001, 30000), UpperFieldFirst, &[Rec709]),
        VirtualModeSpec::new("1080p23.98", b"23ps", HD1080, (1001, 24000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p24", b"24ps", HD1080, (1000, 24000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p25", b"Hp25", HD1080, (1000, 25000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p29.97", b"Hp29", HD1080, (1001, 30000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p30", b"Hp30", HD1080, (1000, 30000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p50", b"Hp50", HD1080, (1000, 50000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p59.94", b"Hp59", HD1080, (1001, 60000), Progressive, &[Rec709]),
        VirtualModeSpec::new("1080p60", b"Hp60", HD1080, (1000, 60000), Progressive, &[Rec709]),
        VirtualModeSpec::new("2160p25", b"4k25", UHD, (1000, 25000), Progressive, &[Rec709, Rec2020]),
        VirtualModeSpec::new("2160p29.97", b"4k29", UHD, (1001, 30000), Progressive, &[Rec709, Rec2020]),
        VirtualModeSpec::new("2160p50", b"4k50", UHD, (1000, 50000), Progressive, &[Rec709, Rec2020]),
        VirtualModeSpec::new("2160p59.94", b"4k59", UHD, (1001, 60000), Progressive, &[Rec709, Rec2020]),
        VirtualModeSpec::new("2160p60", b"4k60", UHD, (1000, 60000), Progressive, &[Rec709, Rec2020]),
    ]
}

/// Description of one virtual device, loadable from the `[[devices]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualDeviceSpec {
    /// Display name
    pub display_name: String,
    /// Vendor name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Model name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Persistent hardware id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<i64>,
    /// Platform device handle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_handle: Option<String>,
    /// Topological id of the card
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topological_id: Option<i64>,
    /// Sub-device index on the card
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_device_index: Option<i64>,
    /// Output connections
    pub connections: Vec<Connection>,
    /// Device can play back
    pub supports_playback: bool,
    /// Separate fill and key outputs
    pub external_keying: bool,
    /// Onboard keying
    pub internal_keying: bool,
    /// Playback is held by another process
    pub busy: bool,
    /// Display-mode table, in iterator order
    pub modes: Vec<VirtualModeSpec>,
    /// Clock behaviour
    pub clock: ClockMode,
    /// Number of start-playback calls that fail before one succeeds
    pub fail_start_attempts: u32,
    /// Number of schedule calls that fail
    pub fail_schedule_calls: u32,
    /// The profile attribute interface cannot be acquired
    pub attributes_unavailable: bool,
    /// Keyer enable fails
    pub keyer_enable_fails: bool,
    /// Keyer level change fails
    pub keyer_level_fails: bool,
}

impl Default for VirtualDeviceSpec {
    fn default() -> Self {
        Self {
            display_name: "Virtual Duo (1)".to_string(),
            vendor: Some("Virtual".to_string()),
            model: Some("Virtual Duo".to_string()),
            persistent_id: None,
            device_handle: None,
            topological_id: Some(0x1000),
            sub_device_index: Some(0),
            connections: vec![Connection::Sdi, Connection::Hdmi],
            supports_playback: true,
            external_keying: true,
            internal_keying: true,
            busy: false,
            modes: default_modes(),
            clock: ClockMode::Realtime,
            fail_start_attempts: 0,
            fail_schedule_calls: 0,
            attributes_unavailable: false,
            keyer_enable_fails: false,
            keyer_level_fails: false,
        }
    }
}

impl VirtualDeviceSpec {
    /// Default device with a different display name
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Set the persistent hardware id
    pub fn with_persistent_id(mut self, id: i64) -> Self {
        self.persistent_id = Some(id);
        self
    }

    /// Set the external keying capability
    pub fn with_external_keying(mut self, supported: bool) -> Self {
        self.external_keying = supported;
        self
    }

    /// Replace the display-mode table
    pub fn with_modes(mut self, modes: Vec<VirtualModeSpec>) -> Self {
        self.modes = modes;
        self
    }

    /// Drive completions by hand
    pub fn with_manual_clock(mut self) -> Self {
        self.clock = ClockMode::Manual;
        self
    }
}

/// Hardware call recorded by a virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCall {
    /// Output routed to a connection
    SetOutputConnection(Connection),
    /// Output enabled in a mode
    EnableVideoOutput(DisplayModeId),
    /// Output disabled
    DisableVideoOutput,
    /// Start attempted with `scheduled` frames queued in total
    StartScheduledPlayback {
        /// Frames scheduled so far
        scheduled: u64,
        /// Whether the start was accepted
        accepted: bool,
    },
    /// Playback stopped
    StopScheduledPlayback,
    /// Completion callback attached
    AttachCompletionCallback,
    /// Completion callback detached
    DetachCompletionCallback,
    /// Keyer enabled
    KeyerEnable {
        /// Fill/key outputs
        external: bool,
    },
    /// Keyer level set
    KeyerSetLevel(u8),
    /// Keyer disabled
    KeyerDisable,
    /// An output handle was released
    ReleaseOutput,
    /// A keyer handle was released
    ReleaseKeyer,
}

/// Keyer state of a virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyerState {
    /// Keying is on
    pub enabled: bool,
    /// Fill/key outputs are in use
    pub external: bool,
    /// Current key level
    pub level: u8,
}

/// A frame accepted by [`VideoOutput::schedule_video_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledFrame {
    /// Presentation time in time-scale units
    pub display_time: i64,
    /// Frame duration in time-scale units
    pub duration: i64,
    /// Time scale
    pub time_scale: i64,
    /// Frame contents
    pub frame: VideoFrame,
}

struct ClockThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct OutputState {
    mode: Option<DisplayModeId>,
    playing: bool,
    pending: VecDeque<ScheduledFrame>,
    recent: VecDeque<ScheduledFrame>,
    scheduled: u64,
    displayed: u64,
    handler: Option<Arc<dyn CompletionHandler>>,
    clock: Option<ClockThread>,
}

struct DeviceState {
    identity: DeviceIdentity,
    spec: VirtualDeviceSpec,
    modes: Vec<HwDisplayMode>,
    connection: Mutex<Option<Connection>>,
    calls: Mutex<Vec<HwCall>>,
    output: Mutex<OutputState>,
    keyer: Mutex<KeyerState>,
    start_failures: AtomicU32,
    schedule_failures: AtomicU32,
}

impl DeviceState {
    fn new(identity: DeviceIdentity, spec: VirtualDeviceSpec) -> Self {
        let modes = spec.modes.iter().map(VirtualModeSpec::to_hw).collect();
        Self {
            identity,
            start_failures: AtomicU32::new(spec.fail_start_attempts),
            schedule_failures: AtomicU32::new(spec.fail_schedule_calls),
            spec,
            modes,
            connection: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            output: Mutex::new(OutputState::default()),
            keyer: Mutex::new(KeyerState::default()),
        }
    }

    fn record(&self, call: HwCall) {
        trace!("{:?}: {:?}", self.identity, call);
        self.calls.lock().push(call);
    }

    fn mode_spec(&self, id: DisplayModeId) -> Option<&VirtualModeSpec> {
        self.spec.modes.iter().find(|m| m.mode_id() == id)
    }

    fn has_keyer(&self) -> bool {
        self.spec.external_keying || self.spec.internal_keying
    }

    /// Pop the oldest pending frame and report it to the handler
    fn complete_next(&self, result: CompletionResult) -> bool {
        let handler = {
            let mut output = self.output.lock();
            if output.pending.pop_front().is_none() {
                return false;
            }
            if matches!(result, CompletionResult::Completed | CompletionResult::DisplayedLate) {
                output.displayed += 1;
            }
            output.handler.clone()
        };
        // Callback runs without the output lock so it can schedule again
        if let Some(handler) = handler {
            handler.scheduled_frame_completed(result);
        }
        true
    }

    fn stop_clock(&self) {
        let clock = self.output.lock().clock.take();
        if let Some(clock) = clock {
            clock.running.store(false, Ordering::Release);
            if clock.handle.thread().id() != std::thread::current().id() {
                let _ = clock.handle.join();
            }
        }
    }
}

impl Drop for DeviceState {
    fn drop(&mut self) {
        if let Some(clock) = self.output.get_mut().clock.take() {
            clock.running.store(false, Ordering::Release);
        }
    }
}

fn run_clock(state: Weak<DeviceState>, running: Arc<AtomicBool>, interval: Duration) {
    let mut next = Instant::now() + interval;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        }
        next += interval;

        if !running.load(Ordering::Acquire) {
            break;
        }
        let Some(state) = state.upgrade() else {
            break;
        };
        state.complete_next(CompletionResult::Completed);
    }
    debug!("Virtual clock stopped");
}

/// In-memory hardware provider
#[derive(Clone, Default)]
pub struct VirtualDriver {
    inner: Arc<DriverInner>,
}

#[derive(Default)]
struct DriverInner {
    devices: Mutex<Vec<Arc<DeviceState>>>,
    sink: Mutex<Option<Arc<dyn DeviceNotificationSink>>>,
    next_identity: AtomicU64,
}

impl VirtualDriver {
    /// Create a provider with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in; an installed notification sink sees it arrive
    pub fn add_device(&self, spec: VirtualDeviceSpec) -> VirtualProbe {
        let identity = DeviceIdentity(self.inner.next_identity.fetch_add(1, Ordering::Relaxed) + 1);
        let state = Arc::new(DeviceState::new(identity, spec));
        info!("Virtual device attached: {} ({:?})", state.spec.display_name, identity);
        self.inner.devices.lock().push(state.clone());

        let sink = self.inner.sink.lock().clone();
        if let Some(sink) = sink {
            sink.device_arrived(Box::new(VirtualDevice { state: state.clone() }));
        }
        VirtualProbe { state }
    }

    /// Unplug a device; returns false if it was not attached
    pub fn remove_device(&self, identity: DeviceIdentity) -> bool {
        let removed = {
            let mut devices = self.inner.devices.lock();
            let before = devices.len();
            devices.retain(|d| d.identity != identity);
            devices.len() != before
        };
        if !removed {
            return false;
        }
        info!("Virtual device detached: {:?}", identity);
        let sink = self.inner.sink.lock().clone();
        if let Some(sink) = sink {
            sink.device_removed(identity);
        }
        true
    }

    /// Probe for an attached device
    pub fn probe(&self, identity: DeviceIdentity) -> Option<VirtualProbe> {
        self.inner
            .devices
            .lock()
            .iter()
            .find(|d| d.identity == identity)
            .map(|state| VirtualProbe { state: state.clone() })
    }

    /// Whether a notification sink is installed
    pub fn has_notification_sink(&self) -> bool {
        self.inner.sink.lock().is_some()
    }
}

impl Driver for VirtualDriver {
    fn name(&self) -> &str {
        "virtual"
    }

    fn is_virtual(&self) -> bool {
        true
    }

    fn devices(&self) -> HwResult<Vec<Box<dyn Device>>> {
        Ok(self
            .inner
            .devices
            .lock()
            .iter()
            .map(|state| Box::new(VirtualDevice { state: state.clone() }) as Box<dyn Device>)
            .collect())
    }

    fn install_device_notifications(&self, sink: Arc<dyn DeviceNotificationSink>) -> HwResult<()> {
        {
            let mut slot = self.inner.sink.lock();
            if slot.is_some() {
                return Err(HwError::Busy);
            }
            *slot = Some(sink.clone());
        }
        // Like real discovery, devices already present are announced on install
        let present: Vec<_> = self.inner.devices.lock().clone();
        for state in present {
            sink.device_arrived(Box::new(VirtualDevice { state }));
        }
        Ok(())
    }

    fn uninstall_device_notifications(&self) -> HwResult<()> {
        self.inner.sink.lock().take();
        Ok(())
    }

    fn create_video_converter(&self) -> HwResult<Box<dyn VideoConverter>> {
        Ok(Box::new(super::SoftwareConverter::new()))
    }
}

struct VirtualDevice {
    state: Arc<DeviceState>,
}

impl ProfileAttributes for VirtualDevice {
    fn int(&self, id: IntAttribute) -> HwResult<i64> {
        let spec = &self.state.spec;
        match id {
            IntAttribute::PersistentId => spec.persistent_id.ok_or(HwError::NotAvailable),
            IntAttribute::TopologicalId => spec.topological_id.ok_or(HwError::NotAvailable),
            IntAttribute::SubDeviceIndex => spec.sub_device_index.ok_or(HwError::NotAvailable),
            IntAttribute::VideoOutputConnections => Ok(spec.connections.iter().fold(0, |mask, c| {
                mask | match c {
                    Connection::Sdi => connection_mask::SDI,
                    Connection::Hdmi => connection_mask::HDMI,
                    Connection::Unspecified => 0,
                }
            })),
            IntAttribute::VideoIoSupport => Ok(if spec.supports_playback {
                io_support::PLAYBACK | io_support::CAPTURE
            } else {
                io_support::CAPTURE
            }),
        }
    }

    fn flag(&self, id: FlagAttribute) -> HwResult<bool> {
        match id {
            FlagAttribute::SupportsExternalKeying => Ok(self.state.spec.external_keying),
            FlagAttribute::SupportsInternalKeying => Ok(self.state.spec.internal_keying),
        }
    }

    fn string(&self, id: StringAttribute) -> HwResult<String> {
        let spec = &self.state.spec;
        let value = match id {
            StringAttribute::DeviceHandle => spec.device_handle.clone(),
            StringAttribute::VendorName => spec.vendor.clone(),
            StringAttribute::ModelName => spec.model.clone(),
        };
        value.ok_or(HwError::NotAvailable)
    }
}

impl Device for VirtualDevice {
    fn identity(&self) -> DeviceIdentity {
        self.state.identity
    }

    fn display_name(&self) -> HwResult<String> {
        Ok(self.state.spec.display_name.clone())
    }

    fn attributes(&self) -> HwResult<&dyn ProfileAttributes> {
        if self.state.spec.attributes_unavailable {
            return Err(HwError::NoInterface);
        }
        Ok(self)
    }

    fn busy_flags(&self) -> HwResult<i64> {
        Ok(if self.state.spec.busy { busy_flags::PLAYBACK_BUSY } else { 0 })
    }

    fn set_output_connection(&self, connection: Connection) -> HwResult<()> {
        if connection != Connection::Unspecified && !self.state.spec.connections.contains(&connection) {
            return Err(HwError::InvalidArg);
        }
        *self.state.connection.lock() = Some(connection);
        self.state.record(HwCall::SetOutputConnection(connection));
        Ok(())
    }

    fn output(&self) -> HwResult<Arc<dyn VideoOutput>> {
        if !self.state.spec.supports_playback {
            return Err(HwError::NoInterface);
        }
        Ok(Arc::new(VirtualOutput {
            state: self.state.clone(),
        }))
    }

    fn keyer(&self) -> HwResult<Box<dyn Keyer>> {
        if !self.state.has_keyer() {
            return Err(HwError::NoInterface);
        }
        Ok(Box::new(VirtualKeyer {
            state: self.state.clone(),
        }))
    }
}

struct VirtualOutput {
    state: Arc<DeviceState>,
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        self.state.record(HwCall::ReleaseOutput);
    }
}

impl VideoOutput for VirtualOutput {
    fn display_modes(&self) -> HwResult<Vec<HwDisplayMode>> {
        Ok(self.state.modes.clone())
    }

    fn does_support_video_mode(
        &self,
        connection: Connection,
        mode: DisplayModeId,
        pixel_format: PixelFormat,
        flags: SupportedModeFlags,
    ) -> HwResult<bool> {
        let Some(spec) = self.state.mode_spec(mode) else {
            return Err(HwError::InvalidArg);
        };
        if connection != Connection::Unspecified && !self.state.spec.connections.contains(&connection) {
            return Ok(false);
        }
        if flags.keying && (!self.state.has_keyer() || pixel_format.is_yuv()) {
            return Ok(false);
        }
        Ok(spec.pixel_formats.contains(&pixel_format))
    }

    fn row_bytes_for_pixel_format(&self, pixel_format: PixelFormat, width: u32) -> HwResult<usize> {
        if width == 0 {
            return Err(HwError::InvalidArg);
        }
        Ok(pixel_format.row_bytes(width))
    }

    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        pixel_format: PixelFormat,
    ) -> HwResult<VideoFrame> {
        if width == 0 || height == 0 || row_bytes < pixel_format.row_bytes(width) {
            return Err(HwError::InvalidArg);
        }
        Ok(VideoFrame {
            width,
            height,
            row_bytes,
            pixel_format,
            data: vec![0; row_bytes * height as usize],
        })
    }

    fn schedule_video_frame(
        &self,
        frame: VideoFrame,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> HwResult<()> {
        if frame.data.len() != frame.row_bytes * frame.height as usize {
            return Err(HwError::InvalidArg);
        }
        let failures = &self.state.schedule_failures;
        if failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HwError::Failed(E_FAIL));
        }

        let mut output = self.state.output.lock();
        if output.mode.is_none() {
            return Err(HwError::Busy);
        }
        let scheduled = ScheduledFrame {
            display_time,
            duration,
            time_scale,
            frame,
        };
        // Only hand-driven devices keep copies for inspection
        if self.state.spec.clock == ClockMode::Manual {
            if output.recent.len() == RECENT_FRAMES {
                output.recent.pop_front();
            }
            output.recent.push_back(scheduled.clone());
        }
        output.pending.push_back(scheduled);
        output.scheduled += 1;
        Ok(())
    }

    fn buffered_video_frame_count(&self) -> HwResult<u32> {
        Ok(self.state.output.lock().pending.len() as u32)
    }

    fn enable_video_output(&self, mode: DisplayModeId) -> HwResult<()> {
        if self.state.spec.busy {
            return Err(HwError::Busy);
        }
        if self.state.mode_spec(mode).is_none() {
            return Err(HwError::InvalidArg);
        }
        {
            let mut output = self.state.output.lock();
            if output.mode.is_some() {
                return Err(HwError::Busy);
            }
            output.mode = Some(mode);
        }
        self.state.record(HwCall::EnableVideoOutput(mode));
        Ok(())
    }

    fn disable_video_output(&self) -> HwResult<()> {
        {
            let mut output = self.state.output.lock();
            output.mode = None;
            output.pending.clear();
        }
        self.state.record(HwCall::DisableVideoOutput);
        Ok(())
    }

    fn start_scheduled_playback(&self, _start_time: i64, _time_scale: i64, _speed: f64) -> HwResult<()> {
        let scheduled = self.state.output.lock().scheduled;
        let failures = &self.state.start_failures;
        if failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            self.state.record(HwCall::StartScheduledPlayback {
                scheduled,
                accepted: false,
            });
            return Err(HwError::Failed(E_FAIL));
        }

        let interval = {
            let mut output = self.state.output.lock();
            let Some(mode) = output.mode else {
                return Err(HwError::Busy);
            };
            if output.playing {
                return Err(HwError::Busy);
            }
            output.playing = true;
            self.state
                .mode_spec(mode)
                .filter(|m| m.frame_duration > 0 && m.time_scale > 0)
                .map(|m| Duration::from_secs_f64(m.frame_duration as f64 / m.time_scale as f64))
        };
        self.state.record(HwCall::StartScheduledPlayback {
            scheduled,
            accepted: true,
        });

        if self.state.spec.clock == ClockMode::Realtime {
            let interval = interval.unwrap_or(Duration::from_millis(40));
            let running = Arc::new(AtomicBool::new(true));
            let weak = Arc::downgrade(&self.state);
            let thread_running = running.clone();
            let handle = std::thread::Builder::new()
                .name("playout-virtual-clock".to_string())
                .spawn(move || run_clock(weak, thread_running, interval))
                .map_err(|e| {
                    error!("Failed to spawn virtual clock: {}", e);
                    HwError::Failed(E_FAIL)
                })?;
            self.state.output.lock().clock = Some(ClockThread { running, handle });
        }
        Ok(())
    }

    fn stop_scheduled_playback(&self, _stop_time: i64, _time_scale: i64) -> HwResult<()> {
        self.state.stop_clock();
        let (flushed, handler) = {
            let mut output = self.state.output.lock();
            output.playing = false;
            (std::mem::take(&mut output.pending), output.handler.clone())
        };
        self.state.record(HwCall::StopScheduledPlayback);

        if let Some(handler) = handler {
            for _ in &flushed {
                handler.scheduled_frame_completed(CompletionResult::Flushed);
            }
            handler.scheduled_playback_stopped();
        }
        Ok(())
    }

    fn set_scheduled_frame_completion_callback(
        &self,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> HwResult<()> {
        let call = if handler.is_some() {
            HwCall::AttachCompletionCallback
        } else {
            HwCall::DetachCompletionCallback
        };
        // The previous handler is dropped after the lock is released
        let previous = std::mem::replace(&mut self.state.output.lock().handler, handler);
        drop(previous);
        self.state.record(call);
        Ok(())
    }
}

struct VirtualKeyer {
    state: Arc<DeviceState>,
}

impl Drop for VirtualKeyer {
    fn drop(&mut self) {
        self.state.record(HwCall::ReleaseKeyer);
    }
}

impl Keyer for VirtualKeyer {
    fn enable(&mut self, external: bool) -> HwResult<()> {
        if self.state.spec.keyer_enable_fails {
            return Err(HwError::Failed(E_FAIL));
        }
        if external && !self.state.spec.external_keying {
            return Err(HwError::InvalidArg);
        }
        if !external && !self.state.spec.internal_keying {
            return Err(HwError::InvalidArg);
        }
        {
            let mut keyer = self.state.keyer.lock();
            keyer.enabled = true;
            keyer.external = external;
        }
        self.state.record(HwCall::KeyerEnable { external });
        Ok(())
    }

    fn set_level(&mut self, level: u8) -> HwResult<()> {
        if self.state.spec.keyer_level_fails {
            warn!("Virtual keyer rejecting level {}", level);
            return Err(HwError::Failed(E_FAIL));
        }
        self.state.keyer.lock().level = level;
        self.state.record(HwCall::KeyerSetLevel(level));
        Ok(())
    }

    fn disable(&mut self) -> HwResult<()> {
        *self.state.keyer.lock() = KeyerState::default();
        self.state.record(HwCall::KeyerDisable);
        Ok(())
    }
}

/// Inspection and control handle for one virtual device
#[derive(Clone)]
pub struct VirtualProbe {
    state: Arc<DeviceState>,
}

impl VirtualProbe {
    /// Identity of the device
    pub fn identity(&self) -> DeviceIdentity {
        self.state.identity
    }

    /// Hardware calls recorded so far
    pub fn calls(&self) -> Vec<HwCall> {
        self.state.calls.lock().clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.calls.lock().clear();
    }

    /// Total frames accepted by the output
    pub fn scheduled_count(&self) -> u64 {
        self.state.output.lock().scheduled
    }

    /// Frames completed as displayed
    pub fn displayed_count(&self) -> u64 {
        self.state.output.lock().displayed
    }

    /// Frames queued and not yet completed
    pub fn buffered(&self) -> usize {
        self.state.output.lock().pending.len()
    }

    /// The most recently scheduled frame; always `None` on the realtime clock
    pub fn last_scheduled(&self) -> Option<ScheduledFrame> {
        self.state.output.lock().recent.back().cloned()
    }

    /// The last few scheduled frames, oldest first; manual clock only
    pub fn recent_scheduled(&self) -> Vec<ScheduledFrame> {
        self.state.output.lock().recent.iter().cloned().collect()
    }

    /// Current keyer state
    pub fn keyer_state(&self) -> KeyerState {
        *self.state.keyer.lock()
    }

    /// Connection last configured on the device
    pub fn output_connection(&self) -> Option<Connection> {
        *self.state.connection.lock()
    }

    /// Mode the output is enabled in
    pub fn enabled_mode(&self) -> Option<DisplayModeId> {
        self.state.output.lock().mode
    }

    /// Whether scheduled playback is running
    pub fn is_playing(&self) -> bool {
        self.state.output.lock().playing
    }

    /// Whether a completion callback is attached
    pub fn has_completion_handler(&self) -> bool {
        self.state.output.lock().handler.is_some()
    }

    /// Make the next `count` schedule calls fail
    pub fn fail_next_schedules(&self, count: u32) {
        self.state.schedule_failures.store(count, Ordering::Release);
    }

    /// Complete the oldest pending frame; false if nothing was pending
    pub fn complete_next(&self, result: CompletionResult) -> bool {
        self.state.complete_next(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_device(driver: &VirtualDriver) -> (VirtualProbe, Box<dyn Device>) {
        let probe = driver.add_device(VirtualDeviceSpec::default().with_manual_clock());
        let device = driver.devices().unwrap().pop().unwrap();
        (probe, device)
    }

    fn hd_frame(output: &dyn VideoOutput) -> VideoFrame {
        let row_bytes = output.row_bytes_for_pixel_format(PixelFormat::Bgra8, 1920).unwrap();
        output
            .create_video_frame(1920, 1080, row_bytes, PixelFormat::Bgra8)
            .unwrap()
    }

    #[test]
    fn test_default_mode_ids() {
        let modes = default_modes();
        let p25 = modes.iter().find(|m| m.name == "1080p25").unwrap();
        assert_eq!(p25.mode_id(), DisplayModeId(four_cc(b"Hp25")));
        let pal = modes.iter().find(|m| m.name == "PAL").unwrap();
        assert_eq!(pal.to_hw().fps(), Some(25.0));
    }

    #[test]
    fn test_missing_frame_rate() {
        let mut mode = VirtualModeSpec::new("odd", b"odd ", (10, 10), (0, 25000), FieldDominance::Unknown, &[]);
        assert_eq!(mode.to_hw().frame_rate, None);
        mode.code = "odd".to_string();
        assert_eq!(mode.mode_id(), DisplayModeId(four_cc(b"odd ")));
    }

    #[test]
    fn test_manual_clock_completion() {
        struct Counter(AtomicU32);
        impl CompletionHandler for Counter {
            fn scheduled_frame_completed(&self, _result: CompletionResult) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let driver = VirtualDriver::new();
        let (probe, device) = manual_device(&driver);
        let output = device.output().unwrap();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        output
            .set_scheduled_frame_completion_callback(Some(counter.clone()))
            .unwrap();
        output.enable_video_output(DisplayModeId(four_cc(b"Hp25"))).unwrap();
        output.schedule_video_frame(hd_frame(output.as_ref()), 0, 1000, 25000).unwrap();
        output.start_scheduled_playback(0, 25000, 1.0).unwrap();

        assert_eq!(probe.buffered(), 1);
        assert!(probe.complete_next(CompletionResult::Completed));
        assert!(!probe.complete_next(CompletionResult::Completed));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(probe.displayed_count(), 1);
    }

    #[test]
    fn test_schedule_requires_enabled_output() {
        let driver = VirtualDriver::new();
        let (_probe, device) = manual_device(&driver);
        let output = device.output().unwrap();
        let frame = hd_frame(output.as_ref());
        assert_eq!(output.schedule_video_frame(frame, 0, 1000, 25000), Err(HwError::Busy));
    }

    #[test]
    fn test_keying_excludes_yuv() {
        let driver = VirtualDriver::new();
        let (_probe, device) = manual_device(&driver);
        let output = device.output().unwrap();
        let mode = DisplayModeId(four_cc(b"Hp25"));
        let keying = SupportedModeFlags { keying: true };
        assert!(!output
            .does_support_video_mode(Connection::Sdi, mode, PixelFormat::Yuv8, keying)
            .unwrap());
        assert!(output
            .does_support_video_mode(Connection::Sdi, mode, PixelFormat::Argb8, keying)
            .unwrap());
    }

    #[test]
    fn test_injected_start_failure() {
        let driver = VirtualDriver::new();
        let spec = VirtualDeviceSpec {
            fail_start_attempts: 1,
            ..VirtualDeviceSpec::default().with_manual_clock()
        };
        let probe = driver.add_device(spec);
        let device = driver.devices().unwrap().pop().unwrap();
        let output = device.output().unwrap();
        output.enable_video_output(DisplayModeId(four_cc(b"Hp25"))).unwrap();
        assert!(output.start_scheduled_playback(0, 25000, 1.0).is_err());
        assert!(output.start_scheduled_playback(0, 25000, 1.0).is_ok());
        assert!(probe.is_playing());
    }

    #[test]
    fn test_realtime_clock_keeps_no_frame_copies() {
        let driver = VirtualDriver::new();
        let probe = driver.add_device(VirtualDeviceSpec::default());
        let device = driver.devices().unwrap().pop().unwrap();
        let output = device.output().unwrap();
        output.enable_video_output(DisplayModeId(four_cc(b"Hp25"))).unwrap();
        output.schedule_video_frame(hd_frame(output.as_ref()), 0, 1000, 25000).unwrap();

        assert_eq!(probe.buffered(), 1);
        assert_eq!(probe.scheduled_count(), 1);
        assert!(probe.last_scheduled().is_none());
        assert!(probe.recent_scheduled().is_empty());
    }

    #[test]
    fn test_injected_schedule_failures() {
        let driver = VirtualDriver::new();
        let (probe, device) = manual_device(&driver);
        let output = device.output().unwrap();
        output.enable_video_output(DisplayModeId(four_cc(b"Hp25"))).unwrap();

        probe.fail_next_schedules(2);
        for _ in 0..2 {
            let frame = hd_frame(output.as_ref());
            assert!(output.schedule_video_frame(frame, 0, 1000, 25000).is_err());
        }
        output.schedule_video_frame(hd_frame(output.as_ref()), 0, 1000, 25000).unwrap();
        assert_eq!(probe.scheduled_count(), 1);
        assert_eq!(probe.last_scheduled().unwrap().display_time, 0);
    }

    #[test]
    fn test_realtime_clock_drains_queue() {
        let driver = VirtualDriver::new();
        let probe = driver.add_device(VirtualDeviceSpec::default());
        let device = driver.devices().unwrap().pop().unwrap();
        let output = device.output().unwrap();
        output.enable_video_output(DisplayModeId(four_cc(b"Hp50"))).unwrap();
        for i in 0..2 {
            output.schedule_video_frame(hd_frame(output.as_ref()), i * 1000, 1000, 50000).unwrap();
        }
        output.start_scheduled_playback(0, 50000, 1.0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.buffered() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        output.stop_scheduled_playback(0, 50000).unwrap();
        assert_eq!(probe.displayed_count(), 2);
    }
}
