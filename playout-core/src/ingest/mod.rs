//! Frame ingest transports
//!
//! Two interchangeable producers feed RGBA8 frames into the same
//! [`FrameSink`]:
//!
//! - [`StreamIngest`]: length-prefixed messages on a byte stream (stdin)
//! - [`FrameBusReader`]: a shared-memory ring buffer polled by sequence number
//!
//! The transport is picked once per session and runs on its own thread
//! until the producer stops or the [`CancellationToken`] fires.

pub mod framebus;
mod queue;
pub mod stream;

pub use framebus::{FrameBusHeader, FrameBusReader, FrameBusWriter, SharedMapping};
pub use queue::{FrameQueue, QUEUE_CAPACITY};
pub use stream::{PlaybackFrameHeader, PollingReader, StreamIngest};

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::types::RgbaFrame;

/// Destination of ingested frames; must never block
pub trait FrameSink: Send + Sync {
    /// Accept one frame
    fn push_frame(&self, frame: RgbaFrame);
}

/// Cooperative stop flag shared by the signal handler and ingest loops
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why an ingest loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    /// The stream closed
    EndOfStream,
    /// The producer sent a shutdown message
    Shutdown,
    /// The cancellation token fired
    Cancelled,
    /// A header with the wrong magic or version arrived
    InvalidHeader,
}

impl std::fmt::Display for IngestExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::EndOfStream => "end of stream",
            Self::Shutdown => "producer shutdown",
            Self::Cancelled => "cancelled",
            Self::InvalidHeader => "invalid frame header",
        };
        write!(f, "{}", text)
    }
}

/// The transport selected for a session
pub enum Ingest {
    /// Length-prefixed stream
    Stream(StreamIngest<Box<dyn Read + Send>>),
    /// Shared-memory bus
    Bus(FrameBusReader),
}

impl Ingest {
    /// Stream transport over any reader
    pub fn stream(reader: impl Read + Send + 'static, width: u32, height: u32) -> Self {
        Self::Stream(StreamIngest::new(Box::new(reader), width, height))
    }

    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Bus(_) => "framebus",
        }
    }

    /// Run until the producer stops or `cancel` fires
    pub fn run(&mut self, sink: &dyn FrameSink, cancel: &CancellationToken) -> Result<IngestExit> {
        match self {
            Self::Stream(stream) => stream.run(sink, cancel),
            Self::Bus(bus) => bus.run(sink, cancel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
