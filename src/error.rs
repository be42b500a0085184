//! Error types for the voice session core

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone access was denied. Fatal to the session.
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device could be opened.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The capture or output device failed mid-session.
    #[error("Audio device error: {0}")]
    Device(String),

    /// An external service call (transcription, response, synthesis) failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Playback could not be started or completed.
    #[error("Playback error: {0}")]
    Playback(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Captured audio bytes could not be decoded.
    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error ends the session outright (no recovery attempt).
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceError::PermissionDenied(_))
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("device not available".to_string())
            }
            other => VoiceError::Device(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("device not available".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                let description = err.to_string();
                if description.to_lowercase().contains("permission") {
                    VoiceError::PermissionDenied(description)
                } else {
                    VoiceError::Device(description)
                }
            }
            other => VoiceError::Device(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}
