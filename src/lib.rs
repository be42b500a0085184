//! voiceturn - Voice Conversation Engine Library
//!
//! A real-time voice conversation front-end core:
//! - Energy-based voice activity detection with debounced turn endings
//! - Conversation state machine with barge-in and failure recovery
//! - Serialized audio playback queue with observable progress
//! - Speech-validity gate filtering noise before network calls
//! - Pluggable transcription / response / synthesis collaborators
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use voiceturn::capture::MicrophoneSource;
//! use voiceturn::playback::{AudioPlaybackQueue, SpeakerSink};
//! use voiceturn::services::{HttpResponder, HttpSynthesizer, HttpTranscriber};
//! use voiceturn::{ConversationEngine, GateConfig, SpeechMetricsRecorder, VoiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = VoiceConfig::from_env();
//!     let source = Arc::new(MicrophoneSource::new(config.clone()));
//!     let queue = Arc::new(AudioPlaybackQueue::new(Arc::new(SpeakerSink::new()?)));
//!
//!     let engine = ConversationEngine::new(
//!         config,
//!         GateConfig::default(),
//!         source,
//!         queue,
//!         Arc::new(HttpTranscriber::new("https://api.openai.com", "sk-...")),
//!         Arc::new(HttpResponder::new("https://api.openai.com", "sk-...")),
//!         Arc::new(HttpSynthesizer::new("https://api.elevenlabs.io", "xi-...")),
//!         Arc::new(SpeechMetricsRecorder::with_log_sink()),
//!     )?;
//!
//!     engine.start_conversation();
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod playback;
pub mod services;
pub mod vad;

// Re-export commonly used types for convenience
pub use capture::{AudioSegment, AudioSource, MicrophoneSource};
pub use config::{GateConfig, VoiceConfig};
pub use engine::{ConversationEngine, ConversationState, EngineEvent};
pub use error::{VoiceError, VoiceResult};
pub use gate::{SpeechEvidence, SpeechValidityGate};
pub use metrics::{MetricsSink, SessionMetrics, SpeechMetricsRecorder};
pub use playback::{AudioPlaybackQueue, PlaybackItem, PlaybackState};
pub use services::{ResponseGenerator, SpeechSynthesizer, SynthesisOptions, Transcriber};
pub use vad::AudioEnergyMonitor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Voice Conversation Engine Library", NAME, VERSION)
}

/// Truncate a string to at most `max` bytes without splitting a UTF-8
/// character, appending an ellipsis when anything was cut
pub fn truncate_safe(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
