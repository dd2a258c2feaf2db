//! Per-session context shared by the pipeline set.
//!
//! A `Session` is built once from the control plane's handshake result and
//! then shared read-mostly across the capture, receive, and player threads.
//! The only mutable field is the outbound send counter, which has a single
//! writer (the capture thread).

use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Length of the session nonce template in bytes.
pub const NONCE_LEN: usize = 16;

/// Errors produced while turning a handshake descriptor into a `Session`.
#[derive(Debug, Error)]
pub enum SessionError {
    // ---
    #[error("invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        source: hex::FromHexError,
    },

    #[error("nonce template must be {NONCE_LEN} bytes, got {0}")]
    BadNonceLength(usize),

    #[error("cannot resolve UDP endpoint {0}")]
    UnresolvableEndpoint(String),

    #[error("io error resolving UDP endpoint: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio stream parameters negotiated by the control plane.
///
/// Outbound (capture) and inbound (playback) parameters are usually equal,
/// but the gateway may synthesize speech at a different rate than it
/// expects from the microphone (e.g. 24 kHz playback vs 16 kHz capture).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AudioParams {
    // ---
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count (1 = mono).
    pub channels: u16,

    /// Frame duration in milliseconds.
    pub frame_duration: u32,

    /// Wire codec name. Only "opus" is supported.
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "opus".to_string()
}

impl AudioParams {
    // ---
    /// PCM samples in one frame (per channel count folded in; mono assumed
    /// by the Opus wrappers, so this is samples * channels).
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration as usize / 1000) * self.channels as usize
    }

    /// One frame's wall-clock duration.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.frame_duration as u64)
    }
}

/// UDP credentials as delivered by the handshake (hex-encoded).
#[derive(Debug, Clone, Deserialize)]
pub struct UdpDescriptor {
    // ---
    pub server: String,
    pub port: u16,
    pub key: String,
    pub nonce: String,
}

/// The handshake result consumed from the control plane.
///
/// The core never produces this; an external collaborator (MQTT/WebSocket
/// signaling, or a descriptor file in the bundled clients) supplies it.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescriptor {
    // ---
    pub session_id: String,

    /// Absent when the control plane has not provisioned the UDP channel;
    /// building a packet codec then fails with a missing-key error.
    pub udp: Option<UdpDescriptor>,

    pub audio_params: AudioParams,

    /// Playback-direction parameters, when they differ from `audio_params`.
    #[serde(default)]
    pub playback_params: Option<AudioParams>,
}

/// Decoded UDP channel material.
#[derive(Debug, Clone)]
pub struct SessionCrypto {
    // ---
    /// 16- or 32-byte AES key (length is validated by the packet codec).
    pub key: Vec<u8>,

    /// 16-byte header template; bytes [4..8] carry the connection id.
    pub nonce_template: [u8; NONCE_LEN],

    /// Big-endian u32 from nonce template bytes [4..8], echoed in every
    /// packet header.
    pub connection_id: u32,
}

/// One authenticated audio-exchange context between client and gateway.
///
/// Created once per handshake, owned by the pipeline set it spawns,
/// destroyed on disconnect.
#[derive(Debug)]
pub struct Session {
    // ---
    /// Opaque token from the control plane.
    pub session_id: String,

    /// UDP peer, when the channel is provisioned.
    pub remote_addr: Option<SocketAddr>,

    /// Key + nonce material, when the channel is provisioned.
    pub crypto: Option<SessionCrypto>,

    /// Outbound (microphone) stream parameters.
    pub capture_params: AudioParams,

    /// Inbound (gateway speech) stream parameters.
    pub playback_params: AudioParams,

    /// Monotonic outbound packet counter. Starts at 0, never reset
    /// mid-session. Written only by the capture thread.
    send_sequence: AtomicU32,
}

impl Session {
    // ---
    /// Builds a session from a handshake descriptor.
    ///
    /// Decodes the hex key/nonce material, extracts the connection id from
    /// nonce bytes [4..8], and resolves the remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the hex material is malformed, the nonce is not
    /// exactly 16 bytes, or the endpoint does not resolve.
    pub fn from_descriptor(desc: &SessionDescriptor) -> Result<Self, SessionError> {
        // ---
        let (remote_addr, crypto) = match &desc.udp {
            Some(udp) => {
                let key = hex::decode(&udp.key).map_err(|source| SessionError::InvalidHex {
                    field: "udp.key",
                    source,
                })?;

                let nonce = hex::decode(&udp.nonce).map_err(|source| SessionError::InvalidHex {
                    field: "udp.nonce",
                    source,
                })?;
                let nonce_template: [u8; NONCE_LEN] = nonce
                    .as_slice()
                    .try_into()
                    .map_err(|_| SessionError::BadNonceLength(nonce.len()))?;

                let connection_id = u32::from_be_bytes([
                    nonce_template[4],
                    nonce_template[5],
                    nonce_template[6],
                    nonce_template[7],
                ]);

                let addr = (udp.server.as_str(), udp.port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        SessionError::UnresolvableEndpoint(format!("{}:{}", udp.server, udp.port))
                    })?;

                (
                    Some(addr),
                    Some(SessionCrypto {
                        key,
                        nonce_template,
                        connection_id,
                    }),
                )
            }
            None => (None, None),
        };

        let playback_params = desc
            .playback_params
            .clone()
            .unwrap_or_else(|| desc.audio_params.clone());

        Ok(Self {
            session_id: desc.session_id.clone(),
            remote_addr,
            crypto,
            capture_params: desc.audio_params.clone(),
            playback_params,
            send_sequence: AtomicU32::new(0),
        })
    }

    /// Claims the next outbound sequence number (pre-increment value).
    ///
    /// Single writer by contract: only the capture thread calls this.
    pub fn next_sequence(&self) -> u32 {
        // ---
        self.send_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Current value of the outbound counter (the sequence the next packet
    /// will carry).
    pub fn pending_sequence(&self) -> u32 {
        // ---
        self.send_sequence.load(Ordering::Relaxed)
    }
}
