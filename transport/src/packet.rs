//! Wire packet framing and AES-CTR payload encryption.
//!
//! Every datagram is a fixed 16-byte big-endian header followed by the
//! AES-CTR ciphertext of one codec frame. The header doubles as the CTR
//! initialization vector: sequence + timestamp + connection id make it
//! unique per packet, so no separate nonce ever crosses the wire. The
//! receiver necessarily trusts the header before decrypting; the protocol
//! accepts this because the UDP channel is scoped to a pre-authenticated
//! session.

use aes::{Aes128, Aes256};
use ctr::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::session::Session;

/// Fixed header length. Anything shorter is not a packet.
pub const HEADER_LEN: usize = 16;

/// Packet type carried by every outbound audio/control datagram.
pub const PACKET_TYPE_AUDIO: u8 = 0x01;

/// Errors from building an outbound packet.
#[derive(Debug, Error)]
pub enum PacketError {
    // ---
    /// The control plane never provisioned a key for this session.
    /// Fatal for the session: nothing can be sent without it.
    #[error("no session key configured")]
    MissingKey,

    #[error("invalid AES key length {0} (expected 16 or 32 bytes)")]
    InvalidKeyLength(usize),

    #[error("frame of {0} bytes does not fit the u16 payload length field")]
    FrameTooLarge(usize),
}

/// Parsed fields of the 16-byte wire header.
///
/// Layout (big-endian):
/// `[type:u8][flags:u8][payload_len:u16][connection_id:u32][timestamp:u32][sequence:u32]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    // ---
    pub packet_type: u8,
    pub flags: u8,
    pub payload_len: u16,
    pub connection_id: u32,
    pub timestamp: u32,
    pub sequence: u32,
}

impl PacketHeader {
    // ---
    /// Serializes the header into its 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        // ---
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.packet_type;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[12..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Parses a header from the start of a datagram.
    ///
    /// Returns `None` when fewer than 16 bytes are available; no other
    /// validation is performed here.
    pub fn parse(data: &[u8]) -> Option<Self> {
        // ---
        if data.len() < HEADER_LEN {
            return None;
        }

        Some(Self {
            packet_type: data[0],
            flags: data[1],
            payload_len: u16::from_be_bytes([data[2], data[3]]),
            connection_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            timestamp: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            sequence: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        })
    }
}

/// AES key sized by what the handshake delivered.
#[derive(Clone)]
enum AesKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

/// Builds and parses wire packets for one session.
///
/// Cheap to clone; holds only the key material and connection id. The
/// send counter lives in the [`Session`] so that every codec clone sees
/// the same monotonic sequence.
#[derive(Clone)]
pub struct PacketCodec {
    // ---
    key: AesKey,
    connection_id: u32,
}

impl PacketCodec {
    // ---
    /// Creates a codec from raw key material and the session connection id.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::InvalidKeyLength`] unless the key is 16 or
    /// 32 bytes (AES-128 / AES-256).
    pub fn new(key: &[u8], connection_id: u32) -> Result<Self, PacketError> {
        // ---
        let key = match key.len() {
            16 => AesKey::Aes128(key.try_into().expect("length checked")),
            32 => AesKey::Aes256(key.try_into().expect("length checked")),
            n => return Err(PacketError::InvalidKeyLength(n)),
        };

        Ok(Self { key, connection_id })
    }

    /// Creates a codec from a session's handshake material.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::MissingKey`] when the session carries no UDP
    /// credentials, or [`PacketError::InvalidKeyLength`] for a malformed key.
    pub fn for_session(session: &Session) -> Result<Self, PacketError> {
        // ---
        let crypto = session.crypto.as_ref().ok_or(PacketError::MissingKey)?;
        Self::new(&crypto.key, crypto.connection_id)
    }

    /// Builds one outbound packet: header followed by the encrypted frame.
    ///
    /// Claims the session's next send sequence (the header carries the
    /// pre-increment value) and stamps the current unix time, truncated
    /// to u32.
    ///
    /// # Errors
    ///
    /// Returns error if the frame exceeds what the u16 length field can
    /// describe.
    pub fn encode(&self, session: &Session, frame: &[u8]) -> Result<Vec<u8>, PacketError> {
        // ---
        let payload_len =
            u16::try_from(frame.len()).map_err(|_| PacketError::FrameTooLarge(frame.len()))?;

        let header = PacketHeader {
            packet_type: PACKET_TYPE_AUDIO,
            flags: 0x00,
            payload_len,
            connection_id: self.connection_id,
            timestamp: unix_seconds(),
            sequence: session.next_sequence(),
        };

        let header_bytes = header.to_bytes();
        let mut out = Vec::with_capacity(HEADER_LEN + frame.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(frame);
        self.apply_keystream(&header_bytes, &mut out[HEADER_LEN..]);

        Ok(out)
    }

    /// Splits and decrypts an inbound datagram.
    ///
    /// Returns `None` for datagrams shorter than the 16-byte header; they
    /// are dropped unparsed. CTR decryption itself cannot fail — a wrong
    /// key produces garbage that surfaces later as a codec decode failure,
    /// not here.
    pub fn decode(&self, datagram: &[u8]) -> Option<(PacketHeader, Vec<u8>)> {
        // ---
        if datagram.len() < HEADER_LEN {
            return None;
        }

        let header = PacketHeader::parse(datagram)?;
        let iv: [u8; HEADER_LEN] = datagram[..HEADER_LEN].try_into().expect("length checked");

        let mut payload = datagram[HEADER_LEN..].to_vec();
        self.apply_keystream(&iv, &mut payload);

        Some((header, payload))
    }

    /// Runs the AES-CTR keystream over `data` in place, using the packet
    /// header as the full 128-bit initial counter block.
    fn apply_keystream(&self, iv: &[u8; HEADER_LEN], data: &mut [u8]) {
        // ---
        match &self.key {
            AesKey::Aes128(key) => {
                let mut cipher = Ctr128BE::<Aes128>::new(
                    GenericArray::from_slice(key),
                    GenericArray::from_slice(iv),
                );
                cipher.apply_keystream(data);
            }
            AesKey::Aes256(key) => {
                let mut cipher = Ctr128BE::<Aes256>::new(
                    GenericArray::from_slice(key),
                    GenericArray::from_slice(iv),
                );
                cipher.apply_keystream(data);
            }
        }
    }
}

/// Current unix time truncated to the header's u32 field.
fn unix_seconds() -> u32 {
    // ---
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
