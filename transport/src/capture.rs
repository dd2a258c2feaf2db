//! Capture pipeline: audio source → Opus → wire packet → UDP.
//!
//! The loop is gated: it idles until the control plane opens the capture
//! gate, streams frames for one turn, and idles again when the gate closes
//! or the source runs out. One failed frame never ends the turn; only a
//! failed setup (encoder, codec, endpoint) is fatal.

use anyhow::{Context, Result};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use voicelink_common::MetricsContext;

use crate::codec::VoiceEncoder;
use crate::packet::PacketCodec;
use crate::session::Session;
use crate::signals::{CaptureGate, ShutdownFlag};

/// Produces raw PCM frames for the capture direction.
///
/// `Ok(None)` means the source is exhausted for this turn (a WAV file
/// reached its end, a push-to-talk key was released). A read error is
/// transient: the pipeline logs it and moves on.
pub trait CaptureSource: Send {
    fn read_frame(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Capture loop tuning.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    // ---
    /// Sleep between gate polls while no turn is active, and backoff
    /// after a failed source read.
    pub idle_poll: Duration,

    /// Interval for the send-rate progress line.
    pub rate_log_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        // ---
        Self {
            idle_poll: Duration::from_millis(50),
            rate_log_interval: Duration::from_secs(1),
        }
    }
}

/// Outbound half of a session: encodes and sends microphone audio.
pub struct CapturePipeline {
    // ---
    session: Arc<Session>,
    socket: Arc<UdpSocket>,
    codec: PacketCodec,
    encoder: VoiceEncoder,
    gate: CaptureGate,
    shutdown: ShutdownFlag,
    config: CaptureConfig,
    metrics: Option<MetricsContext>,
}

impl CapturePipeline {
    // ---
    /// Builds the outbound pipeline.
    ///
    /// # Errors
    ///
    /// Fails when the session carries no UDP endpoint or key material, or
    /// when the Opus encoder rejects the negotiated parameters. All of
    /// these are unrecoverable for the session.
    pub fn new(
        session: Arc<Session>,
        socket: Arc<UdpSocket>,
        gate: CaptureGate,
        shutdown: ShutdownFlag,
        config: CaptureConfig,
    ) -> Result<Self> {
        // ---
        session
            .remote_addr
            .context("session has no UDP endpoint; capture cannot start")?;

        let codec = PacketCodec::for_session(&session).context("failed to build packet codec")?;
        let encoder = VoiceEncoder::new(&session.capture_params)
            .context("failed to initialize Opus encoder")?;

        Ok(Self {
            session,
            socket,
            codec,
            encoder,
            gate,
            shutdown,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    /// Runs the gated capture loop until shutdown.
    pub fn run(&mut self, source: &mut dyn CaptureSource) {
        // ---
        info!("Capture thread started");

        while !self.shutdown.is_set() {
            if !self.gate.is_open() {
                std::thread::sleep(self.config.idle_poll);
                continue;
            }

            self.run_turn(source);
            self.gate.rearm();
        }

        info!("Capture thread stopped");
    }

    /// Streams one capture turn: gate open until gate close or source end.
    fn run_turn(&mut self, source: &mut dyn CaptureSource) {
        // ---
        info!("Capture turn started");
        let turn_started = Instant::now();
        let mut frames_sent: u64 = 0;
        let mut window_started = Instant::now();
        let mut window_frames: u64 = 0;

        while self.gate.is_open() && !self.shutdown.is_set() {
            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Capture source exhausted, ending turn");
                    break;
                }
                Err(e) => {
                    warn!("Capture read failed: {e:#}");
                    // A dead device would otherwise spin this loop flat out.
                    std::thread::sleep(self.config.idle_poll);
                    continue;
                }
            };

            if let Err(e) = self.send_frame(&frame) {
                warn!("Frame send failed: {e:#}");
                continue;
            }

            frames_sent += 1;
            window_frames += 1;
            if window_started.elapsed() >= self.config.rate_log_interval {
                debug!(
                    "Sending audio: {window_frames} packets/s (seq {})",
                    self.session.pending_sequence()
                );
                window_started = Instant::now();
                window_frames = 0;
            }
        }

        info!(
            "Capture turn finished: {frames_sent} frames in {:.1}s",
            turn_started.elapsed().as_secs_f64()
        );
    }

    /// Encodes and transmits a single PCM frame.
    fn send_frame(&mut self, pcm: &[i16]) -> Result<()> {
        // ---
        let encode_timer = self
            .metrics
            .as_ref()
            .map(|m| m.opus_encode_seconds.start_timer());
        let opus = self.encoder.encode(pcm).context("Opus encoding failed")?;
        drop(encode_timer);

        let datagram = self
            .codec
            .encode(&self.session, &opus)
            .context("packet encoding failed")?;

        let remote = self
            .session
            .remote_addr
            .context("session has no UDP endpoint")?;
        self.socket
            .send_to(&datagram, remote)
            .context("UDP send failed")?;

        if let Some(metrics) = &self.metrics {
            metrics.packets_sent_total.inc();
            metrics.bytes_sent_total.inc_by(datagram.len() as u64);
        }

        Ok(())
    }
}
