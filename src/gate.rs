//! Speech validity gate
//!
//! Cheap local acceptance test applied to a finalized recording before
//! any network round-trip is spent on it. Rejects clips that are too
//! short or too quiet to plausibly contain speech.

use std::io::Cursor;
use tracing::debug;

use crate::capture::AudioSegment;
use crate::config::GateConfig;
use crate::error::VoiceResult;

/// Verdict produced for one audio segment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechEvidence {
    pub is_valid: bool,
    /// RMS-derived confidence, normalized into [0, 1]
    pub confidence: f32,
    pub duration_ms: u32,
}

impl SpeechEvidence {
    /// Evidence for a segment that could not be decoded at all
    pub fn rejected() -> Self {
        Self {
            is_valid: false,
            confidence: 0.0,
            duration_ms: 0,
        }
    }
}

/// Duration + energy acceptance filter for captured segments.
///
/// Pure function of its input; safe to call concurrently.
pub struct SpeechValidityGate {
    config: GateConfig,
}

impl SpeechValidityGate {
    pub fn new(config: GateConfig) -> VoiceResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: GateConfig::default(),
        }
    }

    /// Decode the segment and judge whether it is worth transcribing
    pub fn evaluate(&self, segment: &AudioSegment) -> VoiceResult<SpeechEvidence> {
        let mut reader = hound::WavReader::new(Cursor::new(&segment.bytes))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => reader
                .samples::<i16>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / i16::MAX as f32)
                .collect(),
            hound::SampleFormat::Float => {
                reader.samples::<f32>().filter_map(|s| s.ok()).collect()
            }
        };

        let frames = samples.len() as u64 / spec.channels.max(1) as u64;
        let duration_ms = if spec.sample_rate == 0 {
            0
        } else {
            (frames * 1000 / spec.sample_rate as u64) as u32
        };

        let confidence = (rms(&samples) * self.config.rms_scale).min(1.0);
        let is_valid = duration_ms >= self.config.min_speech_duration_ms
            && confidence >= self.config.min_confidence;

        debug!(
            "Gate verdict: valid={}, confidence={:.2}, duration={}ms",
            is_valid, confidence, duration_ms
        );

        Ok(SpeechEvidence {
            is_valid,
            confidence,
            duration_ms,
        })
    }
}

/// Root-mean-square amplitude of the samples
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
