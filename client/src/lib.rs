//! Voicelink client building blocks.
//!
//! Hosts the audio-device adapters (cpal microphone/speaker, WAV replay)
//! and descriptor loading used by the bundled binaries. The protocol
//! itself lives in `voicelink-transport`; signaling is out of scope, so
//! binaries consume a handshake result saved to a JSON descriptor file.

pub mod audio;
pub mod wav;

pub use audio::{MicSource, NullSink, SpeakerSink};
pub use wav::{WavClip, WavSource};

use anyhow::{Context, Result};
use std::path::Path;
use voicelink_transport::SessionDescriptor;

/// Loads a session descriptor from a JSON file.
///
/// # Errors
///
/// Returns error if the file cannot be read or does not parse as a
/// descriptor.
pub fn load_descriptor<P: AsRef<Path>>(path: P) -> Result<SessionDescriptor> {
    // ---
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session descriptor: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid session descriptor: {}", path.display()))
}
