//! HTTP response generation client
//!
//! Turns a transcribed utterance plus recent context into a reply via an
//! OpenAI-compatible `/v1/chat/completions` endpoint. The system prompt
//! keeps replies short and speakable since they feed straight into TTS.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{VoiceError, VoiceResult};

use super::{ResponseGenerator, TurnContext};

/// Default chat model
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4-turbo-preview";

/// Exchanges of context sent with each request
const CONTEXT_EXCHANGES: usize = 3;

const VOICE_SYSTEM_PROMPT: &str = "You are a friendly voice assistant in a real-time spoken \
conversation. Be conversational and natural, keep responses concise and direct, and maintain \
context from previous messages. Do not use markdown, bullet points, or code blocks - your \
responses are spoken aloud. Match the user's tone and energy level.";

/// Reply generator for OpenAI-compatible chat endpoints
pub struct HttpResponder {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl HttpResponder {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            client: Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ResponseGenerator for HttpResponder {
    async fn respond(&self, turn: &TurnContext) -> VoiceResult<String> {
        let mut messages = vec![WireMessage {
            role: "system",
            content: VOICE_SYSTEM_PROMPT.to_string(),
        }];

        let context_start = turn.history.len().saturating_sub(CONTEXT_EXCHANGES * 2);
        for exchange in &turn.history[context_start..] {
            messages.push(WireMessage {
                role: exchange.role.as_str(),
                content: exchange.content.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: turn.text.clone(),
        });

        debug!("Requesting reply for: \"{}\"", crate::truncate_safe(&turn.text, 80));

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: 150,
            temperature: 0.7,
            presence_penalty: 0.6,
            frequency_penalty: 0.5,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Transport(format!(
                "response generation failed ({}): {}",
                status,
                crate::truncate_safe(&body, 200)
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| VoiceError::Transport("empty completion response".to_string()))?;

        info!("Reply: \"{}\"", crate::truncate_safe(&reply, 80));
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Exchange, Role};

    #[test]
    fn test_constructor_normalizes_url() {
        let responder = HttpResponder::new("https://api.example.com/", "key");
        assert_eq!(responder.base_url, "https://api.example.com");
        assert_eq!(responder.model, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn test_context_window_keeps_recent_exchanges() {
        // Mirror of the slicing done in respond()
        let history: Vec<Exchange> = (0..10)
            .map(|i| Exchange {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("turn {}", i),
            })
            .collect();

        let start = history.len().saturating_sub(CONTEXT_EXCHANGES * 2);
        let window = &history[start..];
        assert_eq!(window.len(), 6);
        assert_eq!(window[0].content, "turn 4");
        assert_eq!(window[5].content, "turn 9");
    }

    #[test]
    fn test_chat_request_serializes() {
        let request = ChatRequest {
            model: "test".to_string(),
            messages: vec![WireMessage {
                role: "user",
                content: "hello".to_string(),
            }],
            max_tokens: 150,
            temperature: 0.7,
            presence_penalty: 0.6,
            frequency_penalty: 0.5,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"max_tokens\":150"));
        assert!(json.contains("\"role\":\"user\""));
    }
}
