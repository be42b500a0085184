//! HTTP speech synthesis client
//!
//! Converts reply text to playable audio through an ElevenLabs-style
//! `/v1/text-to-speech/{voice}` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{VoiceError, VoiceResult};

use super::{SpeechSynthesizer, SynthesisOptions};

/// Default synthesis model
pub const DEFAULT_TTS_MODEL: &str = "eleven_multilingual_v2";

/// Synthesis client for ElevenLabs-style endpoints
pub struct HttpSynthesizer {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_TTS_MODEL.to_string(),
            client: Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    speaking_rate: f32,
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, options: &SynthesisOptions) -> VoiceResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(VoiceError::Transport(
                "cannot synthesize empty text".to_string(),
            ));
        }

        debug!("Synthesizing: \"{}\"", crate::truncate_safe(text, 80));

        let request = SpeechRequest {
            text,
            model_id: &self.model,
            voice_settings: VoiceSettings {
                stability: options.stability,
                similarity_boost: options.clarity,
                style: options.style,
                speaking_rate: options.speaking_rate,
            },
        };

        let response = self
            .client
            .post(format!(
                "{}/v1/text-to-speech/{}",
                self.base_url, options.voice
            ))
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Transport(format!(
                "synthesis failed ({}): {}",
                status,
                crate::truncate_safe(&body, 200)
            )));
        }

        let audio = response.bytes().await?.to_vec();
        if audio.is_empty() {
            return Err(VoiceError::Transport("empty audio response".to_string()));
        }

        info!(
            "Synthesized {} chars into {} audio bytes",
            text.len(),
            audio.len()
        );
        Ok(audio)
    }
}
