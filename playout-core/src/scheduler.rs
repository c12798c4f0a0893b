//! Scheduled playback state machine
//!
//! ```text
//! Prerolling ──3 frames scheduled + start ok──▶ Running ──stop()──▶ Stopped
//!     ▲   │
//!     └───┘ start failed: retried on the next pushed frame
//! ```
//!
//! Ingest pushes frames into the bounded queue and drives preroll. Once the
//! device clock runs, the device is kept [`PREROLL_TARGET`] frames ahead:
//! each completion tops the buffer up again, re-presenting the last frame when
//! the queue is empty. A failed schedule leaves a gap that the next completion
//! or the next pushed frame refills.
//!
//! The scheduler state sits behind its own mutex, which is always taken
//! before the queue lock and never after it.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::convert::FrameConverter;
use crate::hardware::{CompletionHandler, CompletionResult, VideoOutput};
use crate::ingest::{FrameQueue, FrameSink};
use crate::modes::NegotiatedMode;
use crate::types::RgbaFrame;

/// Frames scheduled before the device clock is started
pub const PREROLL_TARGET: u32 = 3;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(1);
const BUFFERED_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// Filling the device buffer before the clock starts
    Prerolling,
    /// Clock running, completions drive scheduling
    Running,
    /// Session is tearing down; nothing more is scheduled
    Stopped,
}

/// Cumulative playback counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStats {
    /// Completion callbacks received
    pub completed: u64,
    /// Frames displayed late
    pub late: u64,
    /// Frames dropped or flushed
    pub dropped: u64,
    /// Frames accepted by the device
    pub scheduled: u64,
    /// Times the last frame was re-presented on underrun
    pub held: u64,
    /// Frames discarded by the ingest queue on overflow
    pub queue_dropped: u64,
}

impl std::fmt::Display for PlaybackStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "completed={} late={} dropped={} scheduled={} held={} queueDropped={}",
            self.completed, self.late, self.dropped, self.scheduled, self.held, self.queue_dropped
        )
    }
}

struct SchedulerState {
    phase: PlaybackPhase,
    next_frame_time: i64,
    preroll_scheduled: u32,
    last_frame: Option<RgbaFrame>,
    converter: FrameConverter,
    stats: PlaybackStats,
    last_stats_log: Instant,
    last_buffered_log: Instant,
}

/// Owns the playback state of one session
pub struct PlaybackScheduler {
    output: Arc<dyn VideoOutput>,
    queue: FrameQueue,
    frame_duration: i64,
    time_scale: i64,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    /// Scheduler for a negotiated mode; frames are converted by `converter`
    pub fn new(output: Arc<dyn VideoOutput>, converter: FrameConverter, mode: &NegotiatedMode) -> Self {
        Self::with_queue(output, converter, mode, FrameQueue::new())
    }

    /// Scheduler fed through a custom queue
    pub fn with_queue(
        output: Arc<dyn VideoOutput>,
        converter: FrameConverter,
        mode: &NegotiatedMode,
        queue: FrameQueue,
    ) -> Self {
        let now = Instant::now();
        Self {
            output,
            queue,
            frame_duration: mode.frame_duration,
            time_scale: mode.time_scale,
            state: Mutex::new(SchedulerState {
                phase: PlaybackPhase::Prerolling,
                next_frame_time: 0,
                preroll_scheduled: 0,
                last_frame: None,
                converter,
                stats: PlaybackStats::default(),
                last_stats_log: now,
                last_buffered_log: now,
            }),
        }
    }

    /// The ingest queue
    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    /// Current phase
    pub fn phase(&self) -> PlaybackPhase {
        self.state.lock().phase
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> PlaybackStats {
        let mut stats = self.state.lock().stats;
        stats.queue_dropped = self.queue.dropped();
        stats
    }

    /// Presentation time of the next scheduled frame
    pub fn next_frame_time(&self) -> i64 {
        self.state.lock().next_frame_time
    }

    /// Stop scheduling; completions arriving afterwards are only counted
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.phase != PlaybackPhase::Stopped {
            debug!("Scheduler stopping in {:?}", state.phase);
            state.phase = PlaybackPhase::Stopped;
        }
    }

    /// Preroll from the queue and start the clock once the target is reached
    ///
    /// While running, refills a device buffer left short by failed schedules.
    pub fn maybe_start(&self) {
        let mut state = self.state.lock();
        match state.phase {
            PlaybackPhase::Prerolling => {}
            PlaybackPhase::Running => {
                self.top_up(&mut state, false);
                return;
            }
            PlaybackPhase::Stopped => return,
        }

        while state.preroll_scheduled < PREROLL_TARGET {
            let Some(frame) = self.queue.try_pop() else {
                break;
            };
            state.last_frame = Some(frame.clone());
            if !self.schedule(&mut state, &frame) {
                break;
            }
            state.preroll_scheduled += 1;
        }

        if state.preroll_scheduled < PREROLL_TARGET {
            return;
        }
        match self.output.start_scheduled_playback(0, self.time_scale, 1.0) {
            Ok(()) => {
                info!(
                    "Scheduled playback started after {} preroll frames",
                    state.preroll_scheduled
                );
                state.phase = PlaybackPhase::Running;
            }
            Err(e) => warn!("StartScheduledPlayback failed: {}", e),
        }
    }

    fn on_completion(&self, result: CompletionResult) {
        let mut state = self.state.lock();
        state.stats.completed += 1;
        match result {
            CompletionResult::DisplayedLate => state.stats.late += 1,
            CompletionResult::Dropped | CompletionResult::Flushed => state.stats.dropped += 1,
            CompletionResult::Completed => {}
        }

        let now = Instant::now();
        if now.duration_since(state.last_stats_log) >= STATS_LOG_INTERVAL {
            info!(
                "Playback stats: completed={} late={} dropped={}",
                state.stats.completed, state.stats.late, state.stats.dropped
            );
            state.last_stats_log = now;
        }

        if state.phase != PlaybackPhase::Running {
            return;
        }

        self.top_up(&mut state, true);
    }

    /// Frames accepted by the device and not yet completed
    pub fn in_flight(&self) -> u64 {
        in_flight(&self.state.lock().stats)
    }

    /// Refill the device buffer up to the preroll target while running
    ///
    /// Queued frames go first; with `hold` set an empty queue re-presents the
    /// last frame. Stops at the first failed schedule; the next completion or
    /// pushed frame tries again.
    fn top_up(&self, state: &mut SchedulerState, hold: bool) {
        while in_flight(&state.stats) < u64::from(PREROLL_TARGET) {
            let (frame, held) = match self.queue.try_pop() {
                Some(frame) => (frame, false),
                None => match state.last_frame.clone() {
                    Some(frame) if hold => (frame, true),
                    _ => return,
                },
            };
            state.last_frame = Some(frame.clone());
            if !self.schedule(state, &frame) {
                return;
            }
            if held {
                state.stats.held += 1;
            }
        }
    }

    fn schedule(&self, state: &mut SchedulerState, frame: &RgbaFrame) -> bool {
        let video = match state.converter.convert(frame) {
            Ok(video) => video,
            Err(e) => {
                error!("Frame conversion failed: {}", e);
                return false;
            }
        };

        if let Err(e) =
            self.output
                .schedule_video_frame(video, state.next_frame_time, self.frame_duration, self.time_scale)
        {
            warn!(
                "ScheduleVideoFrame failed: {} nextFrameTime={} frameDuration={} timeScale={}",
                e, state.next_frame_time, self.frame_duration, self.time_scale
            );
            return false;
        }

        let now = Instant::now();
        if now.duration_since(state.last_buffered_log) >= BUFFERED_LOG_INTERVAL {
            match self.output.buffered_video_frame_count() {
                Ok(count) => debug!("Buffered video frame count: {}", count),
                Err(e) => warn!("GetBufferedVideoFrameCount failed: {}", e),
            }
            state.last_buffered_log = now;
        }

        state.next_frame_time += self.frame_duration;
        state.stats.scheduled += 1;
        true
    }
}

fn in_flight(stats: &PlaybackStats) -> u64 {
    stats.scheduled.saturating_sub(stats.completed)
}

impl FrameSink for PlaybackScheduler {
    fn push_frame(&self, frame: RgbaFrame) {
        if self.queue.push(frame) {
            debug!("Frame queue full, dropped oldest frame");
        }
        self.maybe_start();
    }
}

impl CompletionHandler for PlaybackScheduler {
    fn scheduled_frame_completed(&self, result: CompletionResult) {
        self.on_completion(result);
    }

    fn scheduled_playback_stopped(&self) {
        debug!("Scheduled playback has stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{Colorspace, FieldDominance, PixelFormat};
    use crate::hardware::{Device, Driver, VirtualDeviceSpec, VirtualDriver, VirtualProbe};

    fn setup(spec: VirtualDeviceSpec) -> (VirtualProbe, Arc<dyn VideoOutput>, Arc<PlaybackScheduler>) {
        let driver = VirtualDriver::new();
        let probe = driver.add_device(spec.with_manual_clock());
        let device: Box<dyn Device> = driver.devices().unwrap().remove(0);
        let output = device.output().unwrap();
        let mode = output
            .display_modes()
            .unwrap()
            .into_iter()
            .find(|m| m.width == 720 && m.height == 576)
            .unwrap();
        output.enable_video_output(mode.id).unwrap();
        let (frame_duration, time_scale) = mode.frame_rate.unwrap();
        let negotiated = NegotiatedMode {
            mode: mode.id,
            name: mode.name.clone(),
            width: 720,
            height: 576,
            pixel_format: PixelFormat::Bgra8,
            frame_duration,
            time_scale,
            flags: mode.flags,
            field_dominance: FieldDominance::UpperFieldFirst,
        };
        let converter =
            FrameConverter::new(output.clone(), None, PixelFormat::Bgra8, Colorspace::Rec601, false).unwrap();
        let scheduler = Arc::new(PlaybackScheduler::new(output.clone(), converter, &negotiated));
        output
            .set_scheduled_frame_completion_callback(Some(scheduler.clone() as Arc<dyn CompletionHandler>))
            .unwrap();
        (probe, output, scheduler)
    }

    fn frame(ts: u64) -> RgbaFrame {
        RgbaFrame::new(720, 576, ts, vec![ts as u8; 720 * 576 * 4])
    }

    #[test]
    fn test_start_waits_for_preroll() {
        let (probe, _output, scheduler) = setup(VirtualDeviceSpec::default());
        scheduler.push_frame(frame(1));
        scheduler.push_frame(frame(2));
        assert_eq!(scheduler.phase(), PlaybackPhase::Prerolling);
        assert!(!probe.is_playing());
        scheduler.push_frame(frame(3));
        assert_eq!(scheduler.phase(), PlaybackPhase::Running);
        assert!(probe.is_playing());
        assert_eq!(probe.scheduled_count(), 3);
        assert_eq!(scheduler.next_frame_time(), 3 * 1000);
    }

    #[test]
    fn test_stopped_scheduler_ignores_frames() {
        let (probe, _output, scheduler) = setup(VirtualDeviceSpec::default());
        scheduler.stop();
        for ts in 0..5 {
            scheduler.push_frame(frame(ts));
        }
        assert_eq!(probe.scheduled_count(), 0);
        assert_eq!(scheduler.phase(), PlaybackPhase::Stopped);
    }

    #[test]
    fn test_failed_replacement_is_caught_up() {
        let (probe, _output, scheduler) = setup(VirtualDeviceSpec::default());
        for ts in 1..=3 {
            scheduler.push_frame(frame(ts));
        }

        probe.fail_next_schedules(1);
        assert!(probe.complete_next(CompletionResult::Completed));
        assert_eq!(scheduler.in_flight(), 2);

        // The next completion schedules two frames to get back to three
        assert!(probe.complete_next(CompletionResult::Completed));
        assert_eq!(scheduler.in_flight(), 3);
        assert_eq!(probe.buffered(), 3);
        assert_eq!(scheduler.stats().held, 2);
        assert_eq!(scheduler.next_frame_time(), 5 * 1000);
    }

    #[test]
    fn test_stats_display() {
        let stats = PlaybackStats {
            completed: 3,
            late: 1,
            ..PlaybackStats::default()
        };
        assert!(stats.to_string().starts_with("completed=3 late=1 dropped=0"));
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["queueDropped"], 0);
    }
}
