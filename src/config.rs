//! Voice session configuration
//!
//! Immutable per-session settings for the VAD, the recording lifecycle,
//! and the speech-validity gate. Validated at construction so the engine
//! never has to re-check ranges mid-session.

use serde::{Deserialize, Serialize};

use crate::error::{VoiceError, VoiceResult};

/// Default VAD energy threshold (normalized 0..1)
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.15;

/// Default silence debounce before a recording is finalized
pub const DEFAULT_SILENCE_TIMEOUT_MS: u32 = 1200;

/// Default minimum captured byte size worth transcribing
pub const DEFAULT_MIN_AUDIO_BYTES: u32 = 4000;

/// Default hard cap on a single recording
pub const DEFAULT_MAX_RECORDING_MS: u32 = 15_000;

/// Default capture sample rate (16kHz - optimal for speech transcription)
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;

/// Default delay before the VAD resumes after agent playback ends
pub const DEFAULT_RESUME_DELAY_MS: u32 = 1500;

/// Default grace period after a barge-in before the VAD resumes
pub const DEFAULT_INTERRUPT_GRACE_MS: u32 = 500;

/// Per-session voice pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// VAD energy threshold, normalized into [0, 1]
    pub silence_threshold: f32,
    /// Quiet duration after perceived speech end before finalizing (ms)
    pub silence_timeout_ms: u32,
    /// Recordings smaller than this are discarded without processing
    pub min_audio_bytes: u32,
    /// Hard cap on recording duration (ms)
    pub max_recording_ms: u32,
    /// Capture sample rate in Hz
    pub sample_rate_hz: u32,
    /// Capture channel count (1 = mono)
    pub channels: u8,
    /// Delay before listening resumes after playback ends (echo guard, ms)
    #[serde(default = "default_resume_delay_ms")]
    pub resume_delay_ms: u32,
    /// Delay before listening resumes after a barge-in (ms)
    #[serde(default = "default_interrupt_grace_ms")]
    pub interrupt_grace_ms: u32,
}

fn default_resume_delay_ms() -> u32 {
    DEFAULT_RESUME_DELAY_MS
}

fn default_interrupt_grace_ms() -> u32 {
    DEFAULT_INTERRUPT_GRACE_MS
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_timeout_ms: DEFAULT_SILENCE_TIMEOUT_MS,
            min_audio_bytes: DEFAULT_MIN_AUDIO_BYTES,
            max_recording_ms: DEFAULT_MAX_RECORDING_MS,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            channels: 1,
            resume_delay_ms: DEFAULT_RESUME_DELAY_MS,
            interrupt_grace_ms: DEFAULT_INTERRUPT_GRACE_MS,
        }
    }
}

impl VoiceConfig {
    /// Validate all fields, consuming and returning the config on success
    pub fn validated(self) -> VoiceResult<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> VoiceResult<()> {
        if !(0.0..=1.0).contains(&self.silence_threshold) {
            return Err(VoiceError::Config(format!(
                "silence_threshold must be within [0, 1], got {}",
                self.silence_threshold
            )));
        }
        if self.silence_timeout_ms == 0 {
            return Err(VoiceError::Config("silence_timeout_ms must be > 0".to_string()));
        }
        if self.max_recording_ms == 0 {
            return Err(VoiceError::Config("max_recording_ms must be > 0".to_string()));
        }
        if self.sample_rate_hz == 0 {
            return Err(VoiceError::Config("sample_rate_hz must be > 0".to_string()));
        }
        if self.channels == 0 {
            return Err(VoiceError::Config("channels must be > 0".to_string()));
        }
        Ok(())
    }

    /// Load defaults with environment variable overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(threshold) = std::env::var("VOICE_SILENCE_THRESHOLD") {
            config.silence_threshold = threshold.parse().unwrap_or(DEFAULT_SILENCE_THRESHOLD);
        }
        if let Ok(timeout) = std::env::var("VOICE_SILENCE_TIMEOUT_MS") {
            config.silence_timeout_ms = timeout.parse().unwrap_or(DEFAULT_SILENCE_TIMEOUT_MS);
        }
        if let Ok(min_bytes) = std::env::var("VOICE_MIN_AUDIO_BYTES") {
            config.min_audio_bytes = min_bytes.parse().unwrap_or(DEFAULT_MIN_AUDIO_BYTES);
        }
        if let Ok(max_ms) = std::env::var("VOICE_MAX_RECORDING_MS") {
            config.max_recording_ms = max_ms.parse().unwrap_or(DEFAULT_MAX_RECORDING_MS);
        }
        if let Ok(rate) = std::env::var("VOICE_SAMPLE_RATE_HZ") {
            config.sample_rate_hz = rate.parse().unwrap_or(DEFAULT_SAMPLE_RATE_HZ);
        }

        config
    }
}

/// Speech-validity gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Minimum segment duration considered real speech (ms)
    pub min_speech_duration_ms: u32,
    /// Minimum RMS-derived confidence considered real speech
    pub min_confidence: f32,
    /// Scale applied to raw RMS before clamping into [0, 1]
    pub rms_scale: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_speech_duration_ms: 300,
            min_confidence: 0.6,
            rms_scale: 10.0,
        }
    }
}

impl GateConfig {
    /// Check every field against its allowed range
    pub fn validate(&self) -> VoiceResult<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(VoiceError::Config(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if self.rms_scale <= 0.0 {
            return Err(VoiceError::Config("rms_scale must be > 0".to_string()));
        }
        Ok(())
    }
}
