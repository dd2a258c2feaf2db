//! Opus wire-codec wrappers.
//!
//! Thin wrappers over the Opus encoder/decoder, parameterized by the
//! session's negotiated audio parameters instead of compile-time
//! constants: capture and playback directions may run at different rates.

use anyhow::{Context, Result};
use opus::{Application, Channels, Decoder, Encoder};

use crate::session::AudioParams;

/// Target bitrate in bits per second (voice-optimized).
pub const BITRATE: i32 = 24000;

fn channels_of(params: &AudioParams) -> Result<Channels> {
    // ---
    match params.channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => anyhow::bail!("unsupported channel count: {n}"),
    }
}

/// Opus encoder for the capture direction.
pub struct VoiceEncoder {
    // ---
    encoder: Encoder,
    samples_per_frame: usize,
}

impl VoiceEncoder {
    // ---
    /// Creates a voice-tuned encoder for the given stream parameters.
    ///
    /// # Errors
    ///
    /// Returns error if Opus rejects the parameters or the bitrate. This
    /// failure is fatal for the session: the capture pipeline aborts
    /// without retry.
    pub fn new(params: &AudioParams) -> Result<Self> {
        // ---
        let mut encoder = Encoder::new(params.sample_rate, channels_of(params)?, Application::Voip)
            .context("failed to create Opus encoder")?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(BITRATE))
            .context("failed to set bitrate")?;

        Ok(Self {
            encoder,
            samples_per_frame: params.samples_per_frame(),
        })
    }

    /// Encodes exactly one frame of PCM samples.
    ///
    /// # Errors
    ///
    /// Returns error if the input is not exactly one frame or Opus fails.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        // ---
        if pcm.len() != self.samples_per_frame {
            anyhow::bail!(
                "invalid frame size: expected {}, got {}",
                self.samples_per_frame,
                pcm.len()
            );
        }

        let mut output = vec![0u8; 4000]; // Max Opus frame size
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .context("Opus encoding failed")?;

        output.truncate(len);
        Ok(output)
    }

    pub fn samples_per_frame(&self) -> usize {
        // ---
        self.samples_per_frame
    }
}

/// Opus decoder for the playback direction.
pub struct VoiceDecoder {
    // ---
    decoder: Decoder,
    samples_per_frame: usize,
}

impl VoiceDecoder {
    // ---
    pub fn new(params: &AudioParams) -> Result<Self> {
        // ---
        let decoder = Decoder::new(params.sample_rate, channels_of(params)?)
            .context("failed to create Opus decoder")?;

        Ok(Self {
            decoder,
            samples_per_frame: params.samples_per_frame(),
        })
    }

    /// Decodes one Opus frame to PCM.
    ///
    /// Garbage input (e.g. a payload decrypted with the wrong key) fails
    /// here, not in the packet layer.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        // ---
        let mut output = vec![0i16; self.samples_per_frame];

        let decoded = self
            .decoder
            .decode(data, &mut output, false)
            .context("Opus decoding failed")?;

        if decoded != self.samples_per_frame {
            anyhow::bail!(
                "unexpected decoded frame size: expected {}, got {}",
                self.samples_per_frame,
                decoded
            );
        }

        Ok(output)
    }

    /// Synthesizes a concealment frame for a lost packet using Opus PLC.
    pub fn conceal_loss(&mut self) -> Result<Vec<i16>> {
        // ---
        let mut output = vec![0i16; self.samples_per_frame];

        let decoded = self
            .decoder
            .decode(&[], &mut output, true)
            .context("Opus PLC failed")?;

        if decoded != self.samples_per_frame {
            anyhow::bail!(
                "unexpected PLC frame size: expected {}, got {}",
                self.samples_per_frame,
                decoded
            );
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn params(sample_rate: u32) -> AudioParams {
        AudioParams {
            sample_rate,
            channels: 1,
            frame_duration: 20,
            format: "opus".into(),
        }
    }

    fn sine_frame(params: &AudioParams) -> Vec<i16> {
        let n = params.samples_per_frame();
        (0..n)
            .map(|i| {
                let t = i as f32 * 2.0 * std::f32::consts::PI * 440.0 / params.sample_rate as f32;
                (t.sin() * 10000.0) as i16
            })
            .collect()
    }

    #[test]
    fn encode_decode_roundtrip_16k() {
        // ---
        let p = params(16000);
        let mut encoder = VoiceEncoder::new(&p).expect("encoder creation failed");
        let mut decoder = VoiceDecoder::new(&p).expect("decoder creation failed");

        let input = sine_frame(&p);
        let encoded = encoder.encode(&input).expect("encoding failed");
        assert!(!encoded.is_empty() && encoded.len() < 200);

        let decoded = decoder.decode(&encoded).expect("decoding failed");
        assert_eq!(decoded.len(), p.samples_per_frame());
    }

    #[test]
    fn playback_direction_can_run_at_24k() {
        // ---
        let p = params(24000);
        assert_eq!(p.samples_per_frame(), 480);

        let mut decoder = VoiceDecoder::new(&p).expect("decoder creation failed");
        let concealed = decoder.conceal_loss().expect("PLC failed");
        assert_eq!(concealed.len(), 480);
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        // ---
        let p = params(16000);
        let mut encoder = VoiceEncoder::new(&p).expect("encoder creation failed");

        let result = encoder.encode(&vec![0i16; 160]);
        assert!(result.is_err());
    }

    #[test]
    fn garbage_payload_fails_decode() {
        // ---
        let p = params(16000);
        let mut decoder = VoiceDecoder::new(&p).expect("decoder creation failed");

        let result = decoder.decode(&[0xFF; 10]);
        assert!(result.is_err());
    }

    #[test]
    fn unsupported_channel_count_is_rejected() {
        // ---
        let bad = AudioParams {
            sample_rate: 16000,
            channels: 6,
            frame_duration: 20,
            format: "opus".into(),
        };
        assert!(VoiceEncoder::new(&bad).is_err());
    }
}
