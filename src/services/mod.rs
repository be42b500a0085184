//! External collaborator interfaces
//!
//! The engine reaches transcription, response generation, and speech
//! synthesis through these traits; the surrounding application decides
//! the transport. Default reqwest-backed implementations for
//! OpenAI-compatible and ElevenLabs-style endpoints live in the
//! submodules.

pub mod respond;
pub mod synthesize;
pub mod transcribe;

pub use respond::HttpResponder;
pub use synthesize::HttpSynthesizer;
pub use transcribe::HttpTranscriber;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::AudioSegment;
use crate::error::VoiceResult;

/// Default synthesis voice (Antoni, professional male)
pub const DEFAULT_VOICE: &str = "ErXwobaYiN019PkySvjV";

/// Result of one transcription call
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub detected_language: Option<String>,
    pub confidence: Option<f32>,
}

/// Speaker of one conversation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One prior user or assistant utterance
#[derive(Debug, Clone)]
pub struct Exchange {
    pub role: Role,
    pub content: String,
}

/// A transcribed utterance plus recent conversational context
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub text: String,
    pub history: Vec<Exchange>,
}

/// Voice/style knobs for the synthesis call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOptions {
    /// Voice identity understood by the synthesis backend
    pub voice: String,
    /// 0..1, lower for more variation
    pub stability: f32,
    /// 0..1, higher for closer similarity to the reference voice
    pub clarity: f32,
    /// 0..1, higher for more expressive delivery
    pub style: f32,
    /// 0.5..2.0 speed multiplier
    pub speaking_rate: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self::natural()
    }
}

impl SynthesisOptions {
    /// Relaxed, expressive delivery
    pub fn natural() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            stability: 0.35,
            clarity: 0.75,
            style: 0.7,
            speaking_rate: 1.1,
        }
    }

    /// Steady, restrained delivery
    pub fn formal() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            stability: 0.7,
            clarity: 0.8,
            style: 0.3,
            speaking_rate: 1.0,
        }
    }

    /// Loose, quick delivery
    pub fn casual() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            stability: 0.3,
            clarity: 0.6,
            style: 0.8,
            speaking_rate: 1.2,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

/// Speech-to-text collaborator
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one finalized segment. Empty or unintelligible audio
    /// yields empty text, not an error.
    async fn transcribe(&self, segment: AudioSegment) -> VoiceResult<Transcription>;
}

/// Conversational reply collaborator
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn respond(&self, turn: &TurnContext) -> VoiceResult<String>;
}

/// Text-to-speech collaborator
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize playable audio bytes for the reply text.
    async fn synthesize(&self, text: &str, options: &SynthesisOptions) -> VoiceResult<Vec<u8>>;
}
