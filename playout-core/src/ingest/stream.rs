//! Length-prefixed frame stream
//!
//! Each message is a 28-byte big-endian header followed by `buffer_length`
//! payload bytes:
//!
//! ```text
//! 0      4        6     8       12       16          24             28
//! magic  version  type  width   height   timestamp   buffer_length  payload...
//! ```

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CancellationToken, FrameSink, IngestExit};
use crate::error::Result;
use crate::types::RgbaFrame;

/// Stream magic ("BRGF")
pub const STREAM_MAGIC: u32 = 0x4252_4746;
/// Protocol version
pub const STREAM_VERSION: u16 = 1;
/// Header length in bytes
pub const HEADER_LEN: usize = 28;
/// Message carries one frame
pub const TYPE_FRAME: u16 = 1;
/// Producer is done; no payload
pub const TYPE_SHUTDOWN: u16 = 2;

const DISCARD_CHUNK: usize = 4096;
const MAX_DIAGNOSTIC_LOGS: u32 = 2;

/// Header of one stream message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackFrameHeader {
    /// Must equal [`STREAM_MAGIC`]
    pub magic: u32,
    /// Must equal [`STREAM_VERSION`]
    pub version: u16,
    /// [`TYPE_FRAME`], [`TYPE_SHUTDOWN`] or anything else (skipped)
    pub frame_type: u16,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Producer timestamp
    pub timestamp: u64,
    /// Payload length
    pub buffer_length: u32,
}

impl PlaybackFrameHeader {
    /// Header for a frame payload
    pub fn frame(width: u32, height: u32, timestamp: u64, buffer_length: u32) -> Self {
        Self {
            magic: STREAM_MAGIC,
            version: STREAM_VERSION,
            frame_type: TYPE_FRAME,
            width,
            height,
            timestamp,
            buffer_length,
        }
    }

    /// Shutdown message
    pub fn shutdown() -> Self {
        Self {
            frame_type: TYPE_SHUTDOWN,
            ..Self::frame(0, 0, 0, 0)
        }
    }

    /// Decode from wire bytes
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u16_at = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[16..24]);
        Self {
            magic: u32_at(0),
            version: u16_at(4),
            frame_type: u16_at(6),
            width: u32_at(8),
            height: u32_at(12),
            timestamp: u64::from_be_bytes(timestamp),
            buffer_length: u32_at(24),
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.frame_type.to_be_bytes());
        out[8..12].copy_from_slice(&self.width.to_be_bytes());
        out[12..16].copy_from_slice(&self.height.to_be_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_be_bytes());
        out[24..28].copy_from_slice(&self.buffer_length.to_be_bytes());
        out
    }

    /// Whether magic and version match this protocol
    pub fn is_valid(&self) -> bool {
        self.magic == STREAM_MAGIC && self.version == STREAM_VERSION
    }
}

/// Fill `buf` completely; `Ok(false)` on end of stream
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Stream reader that feeds frames matching one target size
pub struct StreamIngest<R> {
    reader: R,
    width: u32,
    height: u32,
    frames: u64,
    discarded: u64,
    invalid_logs: u32,
    mismatch_logs: u32,
}

impl<R: Read> StreamIngest<R> {
    /// Reader for frames of `width` x `height` RGBA8
    pub fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            width,
            height,
            frames: 0,
            discarded: 0,
            invalid_logs: MAX_DIAGNOSTIC_LOGS,
            mismatch_logs: MAX_DIAGNOSTIC_LOGS,
        }
    }

    /// Frames handed to the sink so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Messages whose payload was skipped
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn expected_len(&self) -> usize {
        RgbaFrame::expected_len(self.width, self.height)
    }

    fn discard(&mut self, mut remaining: usize) -> io::Result<bool> {
        let mut chunk = [0u8; DISCARD_CHUNK];
        while remaining > 0 {
            let n = remaining.min(DISCARD_CHUNK);
            if !read_exact_or_eof(&mut self.reader, &mut chunk[..n])? {
                return Ok(false);
            }
            remaining -= n;
        }
        Ok(true)
    }

    /// Read messages until shutdown, end of stream, cancellation or an invalid header
    pub fn run(&mut self, sink: &dyn FrameSink, cancel: &CancellationToken) -> Result<IngestExit> {
        match self.read_loop(sink, cancel) {
            Ok(exit) => Ok(exit),
            Err(_) if cancel.is_cancelled() => Ok(IngestExit::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    fn read_loop(&mut self, sink: &dyn FrameSink, cancel: &CancellationToken) -> io::Result<IngestExit> {
        let mut header_bytes = [0u8; HEADER_LEN];
        loop {
            if cancel.is_cancelled() {
                return Ok(IngestExit::Cancelled);
            }
            if !read_exact_or_eof(&mut self.reader, &mut header_bytes)? {
                return Ok(IngestExit::EndOfStream);
            }

            let header = PlaybackFrameHeader::parse(&header_bytes);
            if !header.is_valid() {
                if self.invalid_logs > 0 {
                    warn!(
                        "Invalid frame header. magic=0x{:x} version={}",
                        header.magic, header.version
                    );
                    self.invalid_logs -= 1;
                }
                return Ok(IngestExit::InvalidHeader);
            }

            match header.frame_type {
                TYPE_SHUTDOWN => {
                    info!("Producer requested shutdown");
                    return Ok(IngestExit::Shutdown);
                }
                TYPE_FRAME => {}
                other => {
                    debug!("Skipping message type {} ({} bytes)", other, header.buffer_length);
                    self.discarded += 1;
                    if !self.discard(header.buffer_length as usize)? {
                        return Ok(IngestExit::EndOfStream);
                    }
                    continue;
                }
            }

            let expected = self.expected_len();
            if header.width != self.width
                || header.height != self.height
                || header.buffer_length as usize != expected
            {
                if self.mismatch_logs > 0 {
                    warn!(
                        "Frame header mismatch. expected={}x{} bytes={} got={}x{} bytes={}",
                        self.width, self.height, expected, header.width, header.height, header.buffer_length
                    );
                    self.mismatch_logs -= 1;
                }
                self.discarded += 1;
                if !self.discard(header.buffer_length as usize)? {
                    return Ok(IngestExit::EndOfStream);
                }
                continue;
            }

            let mut payload = vec![0u8; expected];
            if !read_exact_or_eof(&mut self.reader, &mut payload)? {
                return Ok(IngestExit::EndOfStream);
            }
            self.frames += 1;
            sink.push_frame(RgbaFrame::new(self.width, self.height, header.timestamp, payload));
        }
    }
}

/// Reader that waits for input with `poll(2)` so cancellation is seen while idle
pub struct PollingReader<R> {
    inner: R,
    cancel: CancellationToken,
    interval: Duration,
}

impl<R: Read + AsRawFd> PollingReader<R> {
    /// Wrap `inner`, checking `cancel` every `interval`
    pub fn new(inner: R, cancel: CancellationToken, interval: Duration) -> Self {
        Self {
            inner,
            cancel,
            interval,
        }
    }
}

impl PollingReader<std::fs::File> {
    /// Unbuffered handle on the process's standard input
    pub fn stdin(cancel: CancellationToken) -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(std::fs::File::from(fd), cancel, Duration::from_millis(100)))
    }
}

impl<R: Read + AsRawFd> Read for PollingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.interval.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            if self.cancel.is_cancelled() {
                return Err(io::Error::other("ingest cancelled"));
            }
            let mut pfd = libc::pollfd {
                fd: self.inner.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: pfd is a valid pollfd for the duration of the call
            let ready = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 {
                continue;
            }
            // Readable, hung up or errored: read reports which
            return self.inner.read(buf);
        }
    }
}
