//! Speech session metrics
//!
//! Passive aggregation of validity-gate verdicts and transcription
//! failures for observability. Counters accumulate in memory, are
//! snapshotted into timestamped batch rows on `flush`, and handed to a
//! pluggable sink. A failed sink keeps the batch for the next attempt;
//! nothing here ever gates engine behavior.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::VoiceResult;
use crate::gate::SpeechEvidence;

/// Default interval for the background flusher
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Running per-session counters, reset after each successful flush
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_attempts: u64,
    pub valid: u64,
    pub invalid: u64,
    pub transcription_errors: u64,
    pub confidence_sum: f64,
}

impl SessionMetrics {
    pub fn average_confidence(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.confidence_sum / self.total_attempts as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.valid as f64 / self.total_attempts as f64
        }
    }

    fn is_empty(&self) -> bool {
        self.total_attempts == 0 && self.transcription_errors == 0
    }
}

/// One flushed batch row
#[derive(Debug, Clone, Serialize)]
pub struct MetricsRow {
    pub session_id: String,
    pub total_attempts: u64,
    pub valid_speech: u64,
    pub invalid_speech: u64,
    pub transcription_errors: u64,
    pub average_confidence: f64,
    pub success_rate: f64,
    pub invalid_phrases: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for flushed metric rows
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn store(&self, rows: &[MetricsRow]) -> VoiceResult<()>;
}

/// Sink that reports batches through the tracing subscriber
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn store(&self, rows: &[MetricsRow]) -> VoiceResult<()> {
        for row in rows {
            info!(
                "speech metrics: {}",
                serde_json::to_string(row).unwrap_or_default()
            );
        }
        Ok(())
    }
}

/// Aggregates validity verdicts per session and flushes them in batches
pub struct SpeechMetricsRecorder {
    session_id: String,
    counters: Mutex<SessionMetrics>,
    invalid_phrases: Mutex<Vec<String>>,
    pending: tokio::sync::Mutex<Vec<MetricsRow>>,
    sink: Arc<dyn MetricsSink>,
}

impl SpeechMetricsRecorder {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            counters: Mutex::new(SessionMetrics::default()),
            invalid_phrases: Mutex::new(Vec::new()),
            pending: tokio::sync::Mutex::new(Vec::new()),
            sink,
        }
    }

    pub fn with_log_sink() -> Self {
        Self::new(Arc::new(LogSink))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record one validity-gate verdict
    pub fn record_attempt(&self, evidence: &SpeechEvidence) {
        let mut counters = self.counters.lock().unwrap();
        counters.total_attempts += 1;
        if evidence.is_valid {
            counters.valid += 1;
        } else {
            counters.invalid += 1;
        }
        counters.confidence_sum += evidence.confidence as f64;
    }

    /// Record a transcription call that failed outright
    pub fn record_transcription_error(&self) {
        self.counters.lock().unwrap().transcription_errors += 1;
    }

    /// Record a transcript discarded as filler/boilerplate
    pub fn record_invalid_phrase(&self, phrase: &str) {
        self.invalid_phrases
            .lock()
            .unwrap()
            .push(phrase.to_string());
    }

    /// Current counters without resetting them
    pub fn snapshot(&self) -> SessionMetrics {
        self.counters.lock().unwrap().clone()
    }

    /// Snapshot the counters into a batch row and attempt the sink.
    ///
    /// Counters reset as soon as they are folded into the batch; if the
    /// sink fails, the batch is retained and retried on the next flush.
    pub async fn flush(&self) -> SessionMetrics {
        let snapshot = {
            let mut counters = self.counters.lock().unwrap();
            std::mem::take(&mut *counters)
        };
        let phrases = std::mem::take(&mut *self.invalid_phrases.lock().unwrap());

        let mut pending = self.pending.lock().await;
        if !snapshot.is_empty() {
            pending.push(MetricsRow {
                session_id: self.session_id.clone(),
                total_attempts: snapshot.total_attempts,
                valid_speech: snapshot.valid,
                invalid_speech: snapshot.invalid,
                transcription_errors: snapshot.transcription_errors,
                average_confidence: snapshot.average_confidence(),
                success_rate: snapshot.success_rate(),
                invalid_phrases: phrases,
                timestamp: Utc::now(),
            });
        }

        if pending.is_empty() {
            return snapshot;
        }

        match self.sink.store(&pending).await {
            Ok(()) => {
                debug!("Flushed {} metrics row(s)", pending.len());
                pending.clear();
            }
            Err(e) => {
                warn!("Metrics sink unavailable, retaining {} row(s): {}", pending.len(), e);
            }
        }

        snapshot
    }

    /// Spawn a background task flushing on a fixed interval
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                recorder.flush().await;
            }
        })
    }
}
