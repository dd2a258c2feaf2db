//! Receive pipeline: UDP → wire packet → sequence tracking → Opus → jitter buffer.
//!
//! One blocking socket read per iteration with a short timeout so the
//! shutdown flag is observed promptly. Every per-packet failure (short
//! datagram, garbage payload, decode error) is logged and skipped; the
//! loop itself never dies before shutdown.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use voicelink_common::MetricsContext;

use crate::codec::VoiceDecoder;
use crate::jitter::JitterBuffer;
use crate::packet::{PacketCodec, HEADER_LEN};
use crate::sequence::{Classification, SequenceTracker};
use crate::session::Session;
use crate::signals::{RxActivity, ShutdownFlag};

/// Receive loop tuning.
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    // ---
    /// Socket read timeout; bounds how long shutdown can go unobserved.
    pub recv_timeout: Duration,

    /// Emit a progress line every N accepted packets (0 disables).
    pub log_every_packets: u64,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        // ---
        Self {
            recv_timeout: Duration::from_millis(100),
            log_every_packets: 200,
        }
    }
}

/// Inbound half of a session: decrypts, tracks, decodes, and buffers
/// gateway audio.
pub struct ReceivePipeline {
    // ---
    socket: Arc<UdpSocket>,
    codec: PacketCodec,
    decoder: VoiceDecoder,
    tracker: Arc<Mutex<SequenceTracker>>,
    buffer: Arc<JitterBuffer>,
    activity: RxActivity,
    shutdown: ShutdownFlag,
    config: ReceiveConfig,
    metrics: Option<MetricsContext>,
}

impl ReceivePipeline {
    // ---
    /// Builds the inbound pipeline.
    ///
    /// # Errors
    ///
    /// Fails when the session carries no key material, the Opus decoder
    /// rejects the playback parameters, or the socket timeout cannot be
    /// set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &Session,
        socket: Arc<UdpSocket>,
        tracker: Arc<Mutex<SequenceTracker>>,
        buffer: Arc<JitterBuffer>,
        activity: RxActivity,
        shutdown: ShutdownFlag,
        config: ReceiveConfig,
    ) -> Result<Self> {
        // ---
        let codec = PacketCodec::for_session(session).context("failed to build packet codec")?;
        let decoder = VoiceDecoder::new(&session.playback_params)
            .context("failed to initialize Opus decoder")?;

        socket
            .set_read_timeout(Some(config.recv_timeout))
            .context("failed to set socket read timeout")?;

        Ok(Self {
            socket,
            codec,
            decoder,
            tracker,
            buffer,
            activity,
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

    /// Runs the receive loop until shutdown.
    pub fn run(&mut self) {
        // ---
        info!("Receive thread started");
        let mut buf = [0u8; 2048];
        let mut accepted: u64 = 0;

        while !self.shutdown.is_set() {
            let len = match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("UDP receive failed: {e}");
                    continue;
                }
            };

            if len < HEADER_LEN {
                // Not a packet; dropped without touching the tracker.
                if let Some(metrics) = &self.metrics {
                    metrics.short_datagrams_total.inc();
                }
                debug!("Dropping {len}-byte datagram (below header size)");
                continue;
            }

            let Some((header, payload)) = self.codec.decode(&buf[..len]) else {
                continue;
            };
            self.activity.touch();

            let classification = self.tracker.lock().observe(header.sequence);
            if let Some(metrics) = &self.metrics {
                metrics.packets_received_total.inc();
                metrics.bytes_received_total.inc_by(len as u64);
                match classification {
                    Classification::Gap(n) => metrics.packets_missing_total.inc_by(n as u64),
                    Classification::Duplicate => metrics.packets_duplicate_total.inc(),
                    Classification::OutOfOrder => metrics.packets_out_of_order_total.inc(),
                    Classification::InOrder => {}
                }
            }

            let decode_timer = self
                .metrics
                .as_ref()
                .map(|m| m.opus_decode_seconds.start_timer());
            let pcm = match self.decoder.decode(&payload) {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!("Dropping undecodable frame (seq {}): {e:#}", header.sequence);
                    if let Some(metrics) = &self.metrics {
                        metrics.decode_failures_total.inc();
                    }
                    continue;
                }
            };
            drop(decode_timer);

            self.buffer.push(pcm);
            if let Some(metrics) = &self.metrics {
                metrics
                    .jitter_buffer_occupancy_frames
                    .set(self.buffer.len() as i64);
            }

            accepted += 1;
            if self.config.log_every_packets > 0 && accepted % self.config.log_every_packets == 0 {
                debug!(
                    "Receiving audio: {accepted} packets accepted, {} buffered",
                    self.buffer.len()
                );
            }
        }

        info!("Receive thread stopped");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::codec::VoiceEncoder;
    use crate::session::SessionDescriptor;

    fn session_pair(port: u16) -> (Arc<Session>, Arc<Session>) {
        // Same key/nonce on both ends; the "remote" session encodes what
        // the local one receives.
        let json = format!(
            r#"{{
                "session_id": "rx-test",
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
        let a = Arc::new(Session::from_descriptor(&desc).unwrap());
        let b = Arc::new(Session::from_descriptor(&desc).unwrap());
        (a, b)
    }

    fn fast_config() -> ReceiveConfig {
        ReceiveConfig {
            recv_timeout: Duration::from_millis(10),
            log_every_packets: 0,
        }
    }

    struct Harness {
        buffer: Arc<JitterBuffer>,
        tracker: Arc<Mutex<SequenceTracker>>,
        shutdown: ShutdownFlag,
        activity: RxActivity,
        handle: std::thread::JoinHandle<()>,
        peer: UdpSocket,
        target: std::net::SocketAddr,
    }

    fn spawn_receiver() -> (Harness, Arc<Session>) {
        // ---
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let target = socket.local_addr().unwrap();
        let (local, remote) = session_pair(target.port());

        let buffer = Arc::new(JitterBuffer::new(100));
        let tracker = Arc::new(Mutex::new(SequenceTracker::default()));
        let shutdown = ShutdownFlag::new();
        let activity = RxActivity::new();

        let mut pipeline = ReceivePipeline::new(
            &local,
            socket,
            Arc::clone(&tracker),
            Arc::clone(&buffer),
            activity.clone(),
            shutdown.clone(),
            fast_config(),
        )
        .unwrap();
        let handle = std::thread::spawn(move || pipeline.run());

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        (
            Harness {
                buffer,
                tracker,
                shutdown,
                activity,
                handle,
                peer,
                target,
            },
            remote,
        )
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition never met");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn valid_packets_land_in_the_jitter_buffer() {
        // ---
        let (harness, remote) = spawn_receiver();
        let codec = PacketCodec::for_session(&remote).unwrap();
        let mut encoder = VoiceEncoder::new(&remote.capture_params).unwrap();

        remote.next_sequence(); // burn sequence 0 so audio starts at 1
        for _ in 0..3 {
            let opus = encoder.encode(&vec![500i16; 320]).unwrap();
            let datagram = codec.encode(&remote, &opus).unwrap();
            harness.peer.send_to(&datagram, harness.target).unwrap();
        }

        wait_for(|| harness.buffer.len() == 3);
        let stats = harness.tracker.lock().stats();
        assert_eq!(stats.total_received, 3);
        assert_eq!(stats.last_sequence, 3);
        assert_eq!(stats.missing_count, 0);
        assert!(harness.activity.elapsed() < Duration::from_secs(1));

        harness.shutdown.set();
        harness.handle.join().unwrap();
    }

    #[test]
    fn short_datagram_is_ignored_without_tracker_mutation() {
        // ---
        let (harness, remote) = spawn_receiver();
        let codec = PacketCodec::for_session(&remote).unwrap();
        let mut encoder = VoiceEncoder::new(&remote.capture_params).unwrap();

        harness.peer.send_to(&[0xAB; 7], harness.target).unwrap();

        // A real packet after the runt proves the loop survived it.
        remote.next_sequence();
        let opus = encoder.encode(&vec![1i16; 320]).unwrap();
        let datagram = codec.encode(&remote, &opus).unwrap();
        harness.peer.send_to(&datagram, harness.target).unwrap();

        wait_for(|| harness.buffer.len() == 1);
        assert_eq!(harness.tracker.lock().stats().total_received, 1);

        harness.shutdown.set();
        harness.handle.join().unwrap();
    }

    #[test]
    fn undecodable_payload_is_counted_but_not_buffered() {
        // ---
        let (harness, remote) = spawn_receiver();
        let codec = PacketCodec::for_session(&remote).unwrap();
        let mut encoder = VoiceEncoder::new(&remote.capture_params).unwrap();

        // Sequence 1 carries garbage instead of an Opus frame.
        remote.next_sequence();
        let garbage = codec.encode(&remote, &[0xFF; 40]).unwrap();
        harness.peer.send_to(&garbage, harness.target).unwrap();

        let opus = encoder.encode(&vec![2i16; 320]).unwrap();
        let datagram = codec.encode(&remote, &opus).unwrap();
        harness.peer.send_to(&datagram, harness.target).unwrap();

        wait_for(|| harness.buffer.len() == 1);
        // Both packets were observed by the tracker; only one was playable.
        assert_eq!(harness.tracker.lock().stats().total_received, 2);

        harness.shutdown.set();
        harness.handle.join().unwrap();
    }

    #[test]
    fn shutdown_is_observed_within_the_read_timeout() {
        // ---
        let (harness, _remote) = spawn_receiver();

        let started = std::time::Instant::now();
        harness.shutdown.set();
        harness.handle.join().unwrap();

        // One read timeout plus slack.
        assert!(started.elapsed() < Duration::from_millis(150));
    }
}
