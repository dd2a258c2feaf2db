//! WAV-fed capture source for the device simulator.
//!
//! Reads a WAV file, converts it to the session's capture format (mono,
//! session sample rate), and replays it frame-by-frame at wall-clock
//! speed, as if a microphone were producing it.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec};
use std::path::Path;
use std::time::Instant;
use tracing::info;
use voicelink_transport::{AudioParams, CaptureSource};

/// A WAV file converted to the capture format.
#[derive(Debug)]
pub struct WavClip {
    // ---
    /// PCM samples at the target rate, mono.
    samples: Vec<i16>,

    /// Target format the samples were converted to.
    params: AudioParams,
}

impl WavClip {
    // ---
    /// Reads and converts a WAV file to the given capture parameters.
    ///
    /// Multi-channel input is mixed down to mono and any rate mismatch is
    /// resolved by linear-interpolation resampling — fine for voice, not
    /// for music.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened, is not 16-bit PCM or
    /// 32-bit float, or the capture parameters are not mono.
    pub fn load<P: AsRef<Path>>(path: P, params: &AudioParams) -> Result<Self> {
        // ---
        anyhow::ensure!(
            params.channels == 1,
            "capture format must be mono, got {} channels",
            params.channels
        );

        let path = path.as_ref();
        info!("Reading WAV file: {}", path.display());

        let mut reader = WavReader::open(path)
            .with_context(|| format!("failed to open WAV file: {}", path.display()))?;

        let spec = reader.spec();
        info!(
            "WAV format: {}Hz, {} channels, {} bits",
            spec.sample_rate, spec.channels, spec.bits_per_sample
        );

        let raw_samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read 16-bit PCM WAV samples")?,

            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read 32-bit float WAV samples")?
                .into_iter()
                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect(),

            (SampleFormat::Int, bits) => {
                anyhow::bail!(
                    "unsupported integer PCM WAV format: {bits}-bit (only 16-bit PCM is supported)"
                );
            }

            (SampleFormat::Float, bits) => {
                anyhow::bail!(
                    "unsupported float WAV format: {bits}-bit (only 32-bit float is supported)"
                );
            }
        };

        let samples = convert_to_capture_format(&raw_samples, &spec, params);
        info!(
            "Converted to {}Hz mono: {} samples ({} frames)",
            params.sample_rate,
            samples.len(),
            samples.len().div_ceil(params.samples_per_frame())
        );

        Ok(Self {
            samples,
            params: params.clone(),
        })
    }

    /// Total duration at the target rate.
    pub fn duration_secs(&self) -> f64 {
        // ---
        self.samples.len() as f64 / self.params.sample_rate as f64
    }

    /// Number of frames, counting a padded final partial frame.
    pub fn frame_count(&self) -> usize {
        // ---
        self.samples.len().div_ceil(self.params.samples_per_frame())
    }

    /// Returns frame `index`, zero-padded to full length at the clip end,
    /// or `None` past the end.
    fn frame(&self, index: usize) -> Option<Vec<i16>> {
        // ---
        let frame_samples = self.params.samples_per_frame();
        let start = index.checked_mul(frame_samples)?;
        if start >= self.samples.len() {
            return None;
        }

        let end = (start + frame_samples).min(self.samples.len());
        let mut frame = self.samples[start..end].to_vec();
        frame.resize(frame_samples, 0);
        Some(frame)
    }
}

/// Mixes down and resamples to the capture format.
fn convert_to_capture_format(samples: &[i16], spec: &WavSpec, params: &AudioParams) -> Vec<i16> {
    // ---
    let mono = if spec.channels > 1 {
        info!("Converting {} channels to mono", spec.channels);
        convert_to_mono(samples, spec.channels as usize)
    } else {
        samples.to_vec()
    };

    if spec.sample_rate != params.sample_rate {
        info!(
            "Resampling from {}Hz to {}Hz",
            spec.sample_rate, params.sample_rate
        );
        resample_linear(&mono, spec.sample_rate, params.sample_rate)
    } else {
        mono
    }
}

/// Converts multi-channel audio to mono by averaging channels.
fn convert_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    // ---
    let frame_count = samples.len() / channels;
    let mut mono = Vec::with_capacity(frame_count);

    for frame in samples.chunks(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        mono.push((sum / channels as i32) as i16);
    }

    mono
}

/// Resamples audio using linear interpolation.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let mut resampled = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos as usize;

        if src_idx >= samples.len() - 1 {
            resampled.push(samples[samples.len() - 1]);
        } else {
            let frac = src_pos - src_idx as f64;
            let s0 = samples[src_idx] as f64;
            let s1 = samples[src_idx + 1] as f64;
            resampled.push((s0 + (s1 - s0) * frac) as i16);
        }
    }

    resampled
}

/// Replays a [`WavClip`] at wall-clock speed.
///
/// Each `read_frame` sleeps until the frame's deadline, so the pipeline
/// sends one packet per frame interval, like a live microphone would.
pub struct WavSource {
    // ---
    clip: WavClip,
    next_frame: usize,
    started: Option<Instant>,
    loop_audio: bool,
}

impl WavSource {
    // ---
    pub fn new(clip: WavClip, loop_audio: bool) -> Self {
        // ---
        Self {
            clip,
            next_frame: 0,
            started: None,
            loop_audio,
        }
    }
}

impl CaptureSource for WavSource {
    // ---
    fn read_frame(&mut self) -> Result<Option<Vec<i16>>> {
        // ---
        let frame = match self.clip.frame(self.next_frame) {
            Some(frame) => frame,
            None if self.loop_audio && self.clip.frame_count() > 0 => {
                self.next_frame = 0;
                self.started = None;
                self.clip.frame(0).context("clip became empty")?
            }
            None => return Ok(None),
        };

        let started = *self.started.get_or_insert_with(Instant::now);
        let deadline = started + self.clip.params.frame_interval() * self.next_frame as u32;
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }

        self.next_frame += 1;
        Ok(Some(frame))
    }
}
