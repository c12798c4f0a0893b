//! Shared helpers for the integration tests
//!
//! Builds virtual devices with a manual clock, producer byte streams and
//! frame collectors so every test runs without hardware.

#![allow(dead_code)]

use parking_lot::Mutex;
use playout_core::catalog::{self, DeviceCatalog};
use playout_core::hardware::{Driver, VirtualDeviceSpec, VirtualDriver, VirtualProbe};
use playout_core::ingest::{FrameSink, PlaybackFrameHeader};
use playout_core::{PlaybackConfig, RgbaFrame};
use std::sync::Arc;

/// PAL: the smallest default mode, 25 fps
pub const PAL: (u32, u32, f64) = (720, 576, 25.0);

/// One virtual card plugged into its own provider
pub struct TestRig {
    pub driver: VirtualDriver,
    pub probe: VirtualProbe,
    pub catalog: DeviceCatalog,
    pub device_id: String,
}

/// Provider with one device built from `spec`, completions driven by hand
pub fn rig(spec: VirtualDeviceSpec) -> TestRig {
    let driver = VirtualDriver::new();
    let probe = driver.add_device(spec.with_manual_clock());
    let catalog = DeviceCatalog::new(Arc::new(driver.clone()));
    let device_id = device_id_of(&driver, 0);
    TestRig {
        driver,
        probe,
        catalog,
        device_id,
    }
}

/// Stable id of the `index`-th device of a provider
pub fn device_id_of(driver: &VirtualDriver, index: usize) -> String {
    let devices = driver.devices().expect("virtual iterator");
    catalog::device_id(devices[index].as_ref())
}

/// PAL playback on the device's SDI port
pub fn pal_config(device_id: &str) -> PlaybackConfig {
    let (width, height, fps) = PAL;
    PlaybackConfig::new(device_id, width, height, fps).with_output_port(format!("{}-sdi", device_id))
}

/// Solid-color RGBA frame
pub fn solid_frame(width: u32, height: u32, rgba: [u8; 4], timestamp: u64) -> RgbaFrame {
    let data = rgba
        .iter()
        .copied()
        .cycle()
        .take(RgbaFrame::expected_len(width, height))
        .collect();
    RgbaFrame::new(width, height, timestamp, data)
}

/// Builds the byte stream a producer writes to stdin
#[derive(Default)]
pub struct StreamBuilder {
    bytes: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame message whose header matches its payload
    pub fn frame(self, width: u32, height: u32, timestamp: u64, fill: u8) -> Self {
        let len = RgbaFrame::expected_len(width, height);
        let header = PlaybackFrameHeader::frame(width, height, timestamp, len as u32);
        self.message(header, &vec![fill; len])
    }

    /// Any header followed by any payload
    pub fn message(mut self, header: PlaybackFrameHeader, payload: &[u8]) -> Self {
        self.bytes.extend_from_slice(&header.encode());
        self.bytes.extend_from_slice(payload);
        self
    }

    pub fn shutdown(self) -> Self {
        self.message(PlaybackFrameHeader::shutdown(), &[])
    }

    /// Raw bytes, e.g. a truncated tail
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Sink that records every pushed frame
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<RgbaFrame>>,
}

impl CollectingSink {
    pub fn frames(&self) -> Vec<RgbaFrame> {
        self.frames.lock().clone()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.frames.lock().iter().map(|f| f.timestamp).collect()
    }
}

impl FrameSink for CollectingSink {
    fn push_frame(&self, frame: RgbaFrame) {
        self.frames.lock().push(frame);
    }
}

/// Shared-memory name unique to this test process
pub fn unique_bus_name(tag: &str) -> String {
    format!("playout-test-{}-{}", std::process::id(), tag)
}
