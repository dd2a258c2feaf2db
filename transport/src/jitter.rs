//! Jitter buffer and playout state machine.
//!
//! The receive thread pushes decoded PCM frames into a shared FIFO; the
//! player thread drains it through a two-threshold state machine that
//! absorbs network delivery-time variance. Frames play strictly in
//! arrival order — reordering correction is out of scope.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use voicelink_common::MetricsContext;

use crate::signals::ShutdownFlag;

/// One decoded PCM frame.
pub type PcmFrame = Vec<i16>;

/// Bounded-in-practice FIFO of decoded frames.
///
/// Single producer (receive thread), single consumer (player thread). The
/// queue's internal lock is the only synchronization the two threads share.
pub struct JitterBuffer {
    // ---
    queue: Mutex<VecDeque<PcmFrame>>,
    available: Condvar,
    max_frames: usize,

    /// Set when the stream has ended and remaining frames should play out
    /// even below the start threshold.
    flush: AtomicBool,
}

impl JitterBuffer {
    // ---
    /// Creates a buffer that holds at most `max_frames` frames; the oldest
    /// frame is dropped on overflow.
    pub fn new(max_frames: usize) -> Self {
        // ---
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            max_frames,
            flush: AtomicBool::new(false),
        }
    }

    /// Enqueues one decoded frame, evicting the oldest on overflow.
    pub fn push(&self, frame: PcmFrame) {
        // ---
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_frames {
            warn!("Jitter buffer overflow, dropping oldest frame");
            queue.pop_front();
        }
        queue.push_back(frame);
        drop(queue);
        self.available.notify_one();
    }

    /// Dequeues one frame without waiting.
    pub fn try_pop(&self) -> Option<PcmFrame> {
        // ---
        self.queue.lock().pop_front()
    }

    /// Dequeues one frame, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<PcmFrame> {
        // ---
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.available.wait_for(&mut queue, timeout);
        }
        queue.pop_front()
    }

    /// Queued frame count.
    pub fn len(&self) -> usize {
        // ---
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.queue.lock().is_empty()
    }

    /// Marks the stream as flushed: the player plays out what remains
    /// even if the start threshold was never reached.
    pub fn flush(&self) {
        // ---
        self.flush.store(true, Ordering::Release);
        self.available.notify_one();
    }

    pub fn flush_pending(&self) -> bool {
        // ---
        self.flush.load(Ordering::Acquire)
    }

    fn clear_flush(&self) {
        // ---
        self.flush.store(false, Ordering::Release);
    }

    /// Discards all queued frames; returns how many were dropped.
    pub fn clear(&self) -> usize {
        // ---
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

/// Destination for decoded audio. A blocking write is acceptable; the
/// player thread owns the pacing.
pub trait AudioSink {
    fn write(&mut self, frame: &[i16]) -> anyhow::Result<()>;
}

/// Playout state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Buffering,
    Playing,
}

/// Player configuration.
///
/// The gap between `min_frames` and `start_frames` provides hysteresis:
/// a single threshold would oscillate, re-triggering immediately after
/// every refill.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    // ---
    /// Playback begins once this many frames are queued.
    pub start_frames: usize,

    /// Dropping below this many queued frames forces a return to buffering.
    pub min_frames: usize,

    /// Sleep between polls while buffering.
    pub poll_interval: Duration,

    /// Buffering longer than this emits a health diagnostic. The timeout
    /// never changes state; it only resets its own window.
    pub buffer_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        // ---
        Self {
            start_frames: 16,
            min_frames: 3,
            poll_interval: Duration::from_millis(50),
            buffer_timeout: Duration::from_secs(5),
        }
    }
}

/// Consumption-driven playout state machine over a [`JitterBuffer`].
pub struct Player {
    // ---
    config: PlayerConfig,
    state: PlayerState,
    buffering_since: Instant,
    metrics: Option<MetricsContext>,
}

impl Player {
    // ---
    pub fn new(config: PlayerConfig) -> Self {
        // ---
        Self {
            config,
            state: PlayerState::Buffering,
            buffering_since: Instant::now(),
            metrics: None,
        }
    }

    /// Attaches a metrics context for rebuffer-event counting.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> PlayerState {
        // ---
        self.state
    }

    /// Advances the state machine one step.
    ///
    /// Returns the next frame to hand to the sink, or `None` when the
    /// caller should wait one poll interval. While playing, the dequeue
    /// waits up to one poll interval for a late frame before declaring
    /// an underrun. All transitions happen here so tests can drive the
    /// machine without threads.
    pub fn poll(&mut self, buffer: &JitterBuffer) -> Option<PcmFrame> {
        // ---
        if self.state == PlayerState::Buffering {
            let queued = buffer.len();
            if queued >= self.config.start_frames || (buffer.flush_pending() && queued > 0) {
                info!("Buffer ready ({queued} frames), starting playback");
                self.state = PlayerState::Playing;
            } else {
                if self.buffering_since.elapsed() > self.config.buffer_timeout {
                    warn!(
                        "Still buffering after {:?} ({queued}/{} frames queued)",
                        self.config.buffer_timeout, self.config.start_frames
                    );
                    self.buffering_since = Instant::now();
                }
                return None;
            }
        }

        match buffer.pop_timeout(self.config.poll_interval) {
            Some(frame) => {
                if buffer.len() < self.config.min_frames {
                    if buffer.flush_pending() && buffer.is_empty() {
                        debug!("Flushed stream fully played out");
                        buffer.clear_flush();
                    } else if !buffer.flush_pending() {
                        warn!(
                            "Playback buffer low ({} frames), re-buffering",
                            buffer.len()
                        );
                        self.rebuffer();
                    }
                    if buffer.is_empty() {
                        self.rebuffer_quietly();
                    }
                }
                Some(frame)
            }
            None => {
                // Ran dry mid-playback.
                buffer.clear_flush();
                self.rebuffer();
                None
            }
        }
    }

    fn rebuffer(&mut self) {
        // ---
        if self.state == PlayerState::Playing {
            if let Some(metrics) = &self.metrics {
                metrics.rebuffer_events_total.inc();
            }
        }
        self.state = PlayerState::Buffering;
        self.buffering_since = Instant::now();
    }

    /// State reset without a rebuffer event: used when a flushed stream
    /// ends cleanly.
    fn rebuffer_quietly(&mut self) {
        // ---
        self.state = PlayerState::Buffering;
        self.buffering_since = Instant::now();
    }

    /// Runs the playout loop until shutdown.
    ///
    /// Remaining frames are abandoned at shutdown (logged, not played);
    /// callers that want a full drain flush the buffer and wait before
    /// raising the flag.
    pub fn run(&mut self, buffer: &JitterBuffer, sink: &mut dyn AudioSink, shutdown: &ShutdownFlag) {
        // ---
        info!("Playback thread started");

        while !shutdown.is_set() {
            match self.poll(buffer) {
                Some(frame) => {
                    if let Err(e) = sink.write(&frame) {
                        warn!("Audio sink write failed: {e}");
                        self.rebuffer();
                    }
                }
                None => std::thread::sleep(self.config.poll_interval),
            }
        }

        let abandoned = buffer.clear();
        if abandoned > 0 {
            debug!("Abandoned {abandoned} buffered frames at shutdown");
        }
        info!("Playback thread stopped");
    }
}
