//! Per-session pipeline runtime.
//!
//! Owns the socket, the shared state, and the three data-plane threads
//! (capture, receive, player). The control plane talks to a spawned set
//! through small, non-blocking methods; teardown is cooperative with a
//! join deadline that logs, rather than hangs on, a stuck thread.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use voicelink_common::MetricsContext;

use crate::capture::{CaptureConfig, CapturePipeline, CaptureSource};
use crate::jitter::{AudioSink, JitterBuffer, Player, PlayerConfig};
use crate::packet::PacketCodec;
use crate::receive::{ReceiveConfig, ReceivePipeline};
use crate::sequence::{SequenceStats, SequenceTracker, SequenceTrackerConfig};
use crate::session::Session;
use crate::signals::{CaptureGate, RxActivity, ShutdownFlag, SilenceWatchdog};

/// Tuning for a whole pipeline set.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // ---
    pub capture: CaptureConfig,
    pub receive: ReceiveConfig,
    pub player: PlayerConfig,
    pub tracker: SequenceTrackerConfig,

    /// Jitter buffer capacity in frames (drop-oldest beyond this).
    pub jitter_capacity: usize,

    /// How long teardown waits for each thread before giving up on it.
    pub join_deadline: Duration,

    /// Silence budget and strike allowance for the watchdog.
    pub silence_budget: Duration,
    pub silence_strikes: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // ---
        Self {
            capture: CaptureConfig::default(),
            receive: ReceiveConfig::default(),
            player: PlayerConfig::default(),
            tracker: SequenceTrackerConfig::default(),
            jitter_capacity: 256,
            join_deadline: Duration::from_secs(2),
            silence_budget: Duration::from_secs(10),
            silence_strikes: 3,
        }
    }
}

/// The three running threads of one session, plus the control surface.
pub struct PipelineSet {
    // ---
    session: Arc<Session>,
    socket: Arc<UdpSocket>,
    codec: PacketCodec,
    buffer: Arc<JitterBuffer>,
    tracker: Arc<Mutex<SequenceTracker>>,
    gate: CaptureGate,
    shutdown: ShutdownFlag,
    activity: RxActivity,
    config: RuntimeConfig,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineSet {
    // ---
    /// Binds a socket, announces the session to the gateway, and spawns
    /// the capture, receive, and player threads.
    ///
    /// The announcement packet consumes outbound sequence 0, so the first
    /// audio frame carries sequence 1 — the value the remote tracker
    /// expects after a reset.
    ///
    /// # Errors
    ///
    /// Fails on any setup step: socket bind, codec construction, Opus
    /// init, thread spawn, or the announcement send.
    pub fn spawn(
        session: Arc<Session>,
        source: Box<dyn CaptureSource>,
        sink: Box<dyn AudioSink + Send>,
        config: RuntimeConfig,
        metrics: Option<MetricsContext>,
    ) -> Result<Self> {
        // ---
        let socket =
            Arc::new(UdpSocket::bind("0.0.0.0:0").context("failed to bind UDP socket")?);
        let codec = PacketCodec::for_session(&session).context("failed to build packet codec")?;

        let buffer = Arc::new(JitterBuffer::new(config.jitter_capacity));
        let tracker = Arc::new(Mutex::new(SequenceTracker::new(config.tracker.clone())));
        let gate = CaptureGate::new();
        let shutdown = ShutdownFlag::new();
        let activity = RxActivity::new();

        let mut set = Self {
            session,
            socket,
            codec,
            buffer,
            tracker,
            gate,
            shutdown,
            activity,
            config,
            handles: Vec::with_capacity(3),
        };

        set.send_control("ping")
            .context("failed to announce session")?;

        let mut capture = CapturePipeline::new(
            Arc::clone(&set.session),
            Arc::clone(&set.socket),
            set.gate.clone(),
            set.shutdown.clone(),
            set.config.capture.clone(),
        )?;
        if let Some(m) = &metrics {
            capture = capture.with_metrics(m.clone());
        }

        let mut receive = ReceivePipeline::new(
            &set.session,
            Arc::clone(&set.socket),
            Arc::clone(&set.tracker),
            Arc::clone(&set.buffer),
            set.activity.clone(),
            set.shutdown.clone(),
            set.config.receive.clone(),
        )?;
        if let Some(m) = &metrics {
            receive = receive.with_metrics(m.clone());
        }

        let mut player = Player::new(set.config.player.clone());
        if let Some(m) = &metrics {
            player = player.with_metrics(m.clone());
        }

        let mut source = source;
        set.spawn_thread("capture", move || capture.run(&mut *source))?;

        set.spawn_thread("receive", move || receive.run())?;

        let player_buffer = Arc::clone(&set.buffer);
        let player_shutdown = set.shutdown.clone();
        let mut sink = sink;
        set.spawn_thread("player", move || {
            player.run(&player_buffer, &mut *sink, &player_shutdown)
        })?;

        info!(
            "Session {} pipelines started ({} -> {})",
            set.session.session_id,
            set.socket.local_addr().map_or_else(|_| "?".into(), |a| a.to_string()),
            set.session
                .remote_addr
                .map_or_else(|| "?".into(), |a| a.to_string()),
        );
        Ok(set)
    }

    fn spawn_thread(
        &mut self,
        name: &'static str,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        // ---
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .with_context(|| format!("failed to spawn {name} thread"))?;
        self.handles.push((name, handle));
        Ok(())
    }

    /// Opens the capture gate: the next microphone turn starts streaming.
    pub fn begin_capture(&self) {
        // ---
        self.gate.begin();
    }

    /// Closes the capture gate, ending the current turn, and logs where
    /// the receive direction stands.
    pub fn end_capture(&self) {
        // ---
        self.gate.end();
        self.tracker.lock().report();
    }

    /// Handles the stream-start control signal: the gateway is about to
    /// speak with sequence numbering restarted at 1.
    pub fn stream_start(&self) {
        // ---
        self.tracker.lock().reset();
        if let Err(e) = self.send_control("keepalive") {
            warn!("Keepalive send failed: {e:#}");
        }
    }

    /// Handles the stream-stop control signal: play out what is buffered
    /// and log the stream summary.
    pub fn stream_stop(&self) {
        // ---
        self.buffer.flush();
        self.tracker.lock().report();
    }

    /// Snapshot of the receive-direction counters.
    pub fn stats(&self) -> SequenceStats {
        // ---
        self.tracker.lock().stats()
    }

    /// Builds a watchdog over this session's receive activity. The caller
    /// polls it and calls [`PipelineSet::shutdown_and_join`] on expiry.
    pub fn watchdog(&self) -> SilenceWatchdog {
        // ---
        SilenceWatchdog::new(
            self.activity.clone(),
            self.config.silence_budget,
            self.config.silence_strikes,
        )
    }

    /// Sends a small encrypted control payload (`<kind>:<session_id>`)
    /// over the audio channel.
    fn send_control(&self, kind: &str) -> Result<()> {
        // ---
        let remote = self
            .session
            .remote_addr
            .context("session has no UDP endpoint")?;
        let payload = format!("{kind}:{}", self.session.session_id);
        let datagram = self
            .codec
            .encode(&self.session, payload.as_bytes())
            .context("failed to encode control packet")?;
        self.socket
            .send_to(&datagram, remote)
            .context("control packet send failed")?;
        Ok(())
    }

    /// Tears the session down: raises the shutdown flag, logs the final
    /// stream summary, and joins each thread with a deadline.
    ///
    /// A thread that misses the deadline is logged and abandoned; teardown
    /// never panics or blocks indefinitely on it.
    pub fn shutdown_and_join(mut self) {
        // ---
        self.shutdown.set();
        self.tracker.lock().report();

        for (name, handle) in self.handles.drain(..) {
            let deadline = Instant::now() + self.config.join_deadline;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }

            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("{name} thread panicked during shutdown");
                }
            } else {
                warn!(
                    "{name} thread did not stop within {:?}, abandoning it",
                    self.config.join_deadline
                );
            }
        }

        info!("Session {} pipelines stopped", self.session.session_id);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::packet::HEADER_LEN;
    use crate::session::SessionDescriptor;

    struct SilentSource;

    impl CaptureSource for SilentSource {
        fn read_frame(&mut self) -> Result<Option<Vec<i16>>> {
            Ok(None)
        }
    }

    struct NullSink;

    impl AudioSink for NullSink {
        fn write(&mut self, _frame: &[i16]) -> Result<()> {
            Ok(())
        }
    }

    fn session_for(port: u16) -> Arc<Session> {
        let json = format!(
            r#"{{
                "session_id": "rt-test",
                "udp": {{
                    "server": "127.0.0.1",
                    "port": {port},
                    "key": "000102030405060708090a0b0c0d0e0f",
                    "nonce": "01000000000000010000000000000000"
                }},
                "audio_params": {{ "sample_rate": 16000, "channels": 1, "frame_duration": 20 }}
            }}"#
        );
        let desc: SessionDescriptor = serde_json::from_str(&json).unwrap();
        Arc::new(Session::from_descriptor(&desc).unwrap())
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            capture: CaptureConfig {
                idle_poll: Duration::from_millis(1),
                ..CaptureConfig::default()
            },
            receive: ReceiveConfig {
                recv_timeout: Duration::from_millis(10),
                log_every_packets: 0,
            },
            player: PlayerConfig {
                poll_interval: Duration::from_millis(1),
                ..PlayerConfig::default()
            },
            join_deadline: Duration::from_millis(500),
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn spawn_announces_the_session_with_sequence_zero() {
        // ---
        let gateway = UdpSocket::bind("127.0.0.1:0").unwrap();
        gateway
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let session = session_for(gateway.local_addr().unwrap().port());

        let set = PipelineSet::spawn(
            Arc::clone(&session),
            Box::new(SilentSource),
            Box::new(NullSink),
            fast_config(),
            None,
        )
        .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = gateway.recv_from(&mut buf).expect("no announcement");
        let codec = PacketCodec::for_session(&session).unwrap();
        let (header, payload) = codec.decode(&buf[..len]).unwrap();

        assert_eq!(header.sequence, 0);
        assert_eq!(payload, b"ping:rt-test");
        // The next outbound packet (first audio frame) will be sequence 1.
        assert_eq!(session.pending_sequence(), 1);

        set.shutdown_and_join();
    }

    #[test]
    fn stream_start_resets_tracker_and_sends_keepalive() {
        // ---
        let gateway = UdpSocket::bind("127.0.0.1:0").unwrap();
        gateway
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let session = session_for(gateway.local_addr().unwrap().port());

        let set = PipelineSet::spawn(
            Arc::clone(&session),
            Box::new(SilentSource),
            Box::new(NullSink),
            fast_config(),
            None,
        )
        .unwrap();

        set.stream_start();

        let codec = PacketCodec::for_session(&session).unwrap();
        let mut buf = [0u8; 256];
        let mut saw_keepalive = false;
        for _ in 0..2 {
            let (len, _) = gateway.recv_from(&mut buf).unwrap();
            assert!(len >= HEADER_LEN);
            let (_, payload) = codec.decode(&buf[..len]).unwrap();
            if payload == b"keepalive:rt-test" {
                saw_keepalive = true;
            }
        }
        assert!(saw_keepalive);
        assert_eq!(set.stats().total_received, 0);

        set.shutdown_and_join();
    }

    #[test]
    fn shutdown_joins_all_threads_promptly() {
        // ---
        let gateway = UdpSocket::bind("127.0.0.1:0").unwrap();
        let session = session_for(gateway.local_addr().unwrap().port());

        let set = PipelineSet::spawn(
            session,
            Box::new(SilentSource),
            Box::new(NullSink),
            fast_config(),
            None,
        )
        .unwrap();

        let started = Instant::now();
        set.shutdown_and_join();

        // Bounded by roughly one receive timeout, not the join deadline.
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
