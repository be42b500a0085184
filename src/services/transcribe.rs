//! HTTP transcription client
//!
//! Posts finalized WAV segments to an OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint via multipart form upload.

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::capture::AudioSegment;
use crate::error::{VoiceError, VoiceResult};

use super::{Transcriber, Transcription};

/// Default transcription model
pub const DEFAULT_STT_MODEL: &str = "whisper-1";

/// Transcription client for OpenAI-compatible audio endpoints
pub struct HttpTranscriber {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl HttpTranscriber {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_STT_MODEL.to_string(),
            client: Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, segment: AudioSegment) -> VoiceResult<Transcription> {
        if segment.is_empty() {
            return Ok(Transcription::default());
        }

        debug!(
            "Transcribing segment: {} bytes, ~{}ms",
            segment.len(),
            segment.duration_ms
        );

        let part = multipart::Part::bytes(segment.bytes)
            .file_name("audio.wav")
            .mime_str(segment.mime)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Transport(format!(
                "transcription failed ({}): {}",
                status,
                crate::truncate_safe(&body, 200)
            )));
        }

        let parsed: TranscriptionResponse = response.json().await?;
        info!("Transcribed: \"{}\"", crate::truncate_safe(&parsed.text, 80));

        Ok(Transcription {
            text: parsed.text,
            detected_language: parsed.language,
            confidence: parsed.confidence,
        })
    }
}
