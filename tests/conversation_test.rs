//! End-to-end conversation engine scenarios against in-process fakes.
//!
//! Timing-sensitive paths (VAD debounce, max-duration cutoff, resume
//! delays) run under tokio's paused clock, so every scenario is
//! deterministic regardless of host load.

use async_trait::async_trait;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use voiceturn::capture::{AudioSegment, AudioSource};
use voiceturn::engine::{ConversationEngine, ConversationState, EngineEvent};
use voiceturn::error::{VoiceError, VoiceResult};
use voiceturn::metrics::{MetricsSink, MetricsRow, SpeechMetricsRecorder};
use voiceturn::playback::{AudioPlaybackQueue, PlaybackSink};
use voiceturn::services::{
    ResponseGenerator, SpeechSynthesizer, SynthesisOptions, Transcriber, Transcription,
    TurnContext,
};
use voiceturn::config::{GateConfig, VoiceConfig};

// ─── Fakes ───────────────────────────────────────────────────

/// Audio source producing a 125 Hz tone at a settable amplitude, with a
/// test-provided utterance capture
struct ToneSource {
    amplitude: Mutex<f32>,
    capture_result: Mutex<Vec<f32>>,
    open_calls: AtomicU32,
    paused: AtomicBool,
}

impl ToneSource {
    fn new() -> Self {
        Self {
            amplitude: Mutex::new(0.0),
            capture_result: Mutex::new(Vec::new()),
            open_calls: AtomicU32::new(0),
            paused: AtomicBool::new(false),
        }
    }

    fn set_amplitude(&self, amplitude: f32) {
        *self.amplitude.lock().unwrap() = amplitude;
    }

    /// Configure what the next `take_capture` returns
    fn set_capture(&self, samples: Vec<f32>) {
        *self.capture_result.lock().unwrap() = samples;
    }
}

impl AudioSource for ToneSource {
    fn open(&self) -> VoiceResult<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn close(&self) {}
    fn latest(&self, n: usize) -> Vec<f32> {
        let amplitude = *self.amplitude.lock().unwrap();
        (0..n)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                amplitude * (2.0 * PI * 125.0 * t).sin()
            })
            .collect()
    }
    fn begin_capture(&self) {}
    fn take_capture(&self) -> Vec<f32> {
        std::mem::take(&mut *self.capture_result.lock().unwrap())
    }
    fn sample_rate(&self) -> u32 {
        16_000
    }
}

/// A source whose device cannot be opened
struct DeadSource;

impl AudioSource for DeadSource {
    fn open(&self) -> VoiceResult<()> {
        Err(VoiceError::DeviceUnavailable("no microphone".to_string()))
    }
    fn pause(&self) {}
    fn resume(&self) {}
    fn close(&self) {}
    fn latest(&self, _n: usize) -> Vec<f32> {
        Vec::new()
    }
    fn begin_capture(&self) {}
    fn take_capture(&self) -> Vec<f32> {
        Vec::new()
    }
    fn sample_rate(&self) -> u32 {
        16_000
    }
}

struct FakeTranscriber {
    text: Mutex<String>,
    calls: AtomicU32,
    fail: AtomicBool,
}

impl FakeTranscriber {
    fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: Mutex::new(text.to_string()),
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _segment: AudioSegment) -> VoiceResult<Transcription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Transport("stt down".to_string()));
        }
        Ok(Transcription {
            text: self.text.lock().unwrap().clone(),
            detected_language: Some("en".to_string()),
            confidence: Some(0.9),
        })
    }
}

struct FakeResponder {
    reply: String,
    calls: AtomicU32,
    last_history_len: AtomicU32,
}

impl FakeResponder {
    fn returning(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicU32::new(0),
            last_history_len: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for FakeResponder {
    async fn respond(&self, turn: &TurnContext) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_history_len
            .store(turn.history.len() as u32, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

struct FakeSynthesizer {
    calls: AtomicU32,
    fail: AtomicBool,
    delay_ms: u64,
}

impl FakeSynthesizer {
    fn working() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(false),
            delay_ms: 0,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(true),
            delay_ms: 0,
        })
    }

    fn slow(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(false),
            delay_ms,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _options: &SynthesisOptions) -> VoiceResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Transport("tts down".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Playback sink with a fixed virtual clip duration
struct VirtualSink {
    clip_ms: u64,
    played: Mutex<Vec<usize>>,
    stopped: Arc<tokio::sync::Notify>,
}

impl VirtualSink {
    fn new(clip_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            clip_ms,
            played: Mutex::new(Vec::new()),
            stopped: Arc::new(tokio::sync::Notify::new()),
        })
    }

    fn played_count(&self) -> usize {
        self.played.lock().unwrap().len()
    }
}

#[async_trait]
impl PlaybackSink for VirtualSink {
    async fn play(&self, audio: &[u8]) -> VoiceResult<()> {
        self.played.lock().unwrap().push(audio.len());
        let stopped = self.stopped.clone();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.clip_ms)) => {}
            _ = stopped.notified() => {}
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.notify_waiters();
    }
}

struct NullMetricsSink;

#[async_trait]
impl MetricsSink for NullMetricsSink {
    async fn store(&self, _rows: &[MetricsRow]) -> VoiceResult<()> {
        Ok(())
    }
}

// ─── Harness ─────────────────────────────────────────────────

struct Harness {
    engine: ConversationEngine,
    source: Arc<ToneSource>,
    transcriber: Arc<FakeTranscriber>,
    responder: Arc<FakeResponder>,
    sink: Arc<VirtualSink>,
    queue: Arc<AudioPlaybackQueue>,
    events: Mutex<Vec<EngineEvent>>,
    events_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<EngineEvent>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn test_config() -> VoiceConfig {
    VoiceConfig {
        silence_threshold: 0.15,
        silence_timeout_ms: 1200,
        min_audio_bytes: 4000,
        max_recording_ms: 15_000,
        sample_rate_hz: 16_000,
        channels: 1,
        resume_delay_ms: 1500,
        interrupt_grace_ms: 500,
    }
}

impl Harness {
    fn new(
        transcriber: Arc<FakeTranscriber>,
        responder: Arc<FakeResponder>,
        synthesizer: Arc<FakeSynthesizer>,
        clip_ms: u64,
    ) -> Self {
        init_tracing();
        let source = Arc::new(ToneSource::new());
        let sink = VirtualSink::new(clip_ms);
        let queue = Arc::new(AudioPlaybackQueue::new(sink.clone()));
        let metrics = Arc::new(SpeechMetricsRecorder::new(Arc::new(NullMetricsSink)));

        let engine = ConversationEngine::new(
            test_config(),
            GateConfig::default(),
            source.clone(),
            queue.clone(),
            transcriber.clone(),
            responder.clone(),
            synthesizer,
            metrics,
        )
        .expect("engine construction");

        let events_rx = engine.take_events().expect("events receiver");

        Self {
            engine,
            source,
            transcriber,
            responder,
            sink,
            queue,
            events: Mutex::new(Vec::new()),
            events_rx: Mutex::new(events_rx),
        }
    }

    /// Drain pending events into the log and return a copy
    fn events(&self) -> Vec<EngineEvent> {
        let mut rx = self.events_rx.lock().unwrap();
        let mut log = self.events.lock().unwrap();
        while let Ok(event) = rx.try_recv() {
            log.push(event);
        }
        log.clone()
    }

    fn error_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::Error { .. }))
            .count()
    }

    fn saw_state(&self, wanted: &ConversationState) -> bool {
        self.events().iter().any(|e| match e {
            EngineEvent::StateChanged(state) => {
                std::mem::discriminant(state) == std::mem::discriminant(wanted)
            }
            _ => false,
        })
    }

    /// Speak for `speech_ms`, fall silent, and wait out both debounce
    /// layers so the recording finalizes
    async fn run_utterance(&self, speech_ms: u64, capture: Vec<f32>) {
        self.source.set_capture(capture);
        self.source.set_amplitude(0.5);
        tokio::time::sleep(Duration::from_millis(speech_ms)).await;
        self.source.set_amplitude(0.0);
        // VAD silence debounce + engine stop-recording debounce
        tokio::time::sleep(Duration::from_millis(1200 + 1200 + 200)).await;
    }
}

/// One second of confident speech-level samples
fn loud_capture() -> Vec<f32> {
    vec![0.2f32; 16_000]
}

// ─── Scenarios ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn full_turn_reaches_speaking_then_listening() -> anyhow::Result<()> {
    let harness = Harness::new(
        FakeTranscriber::returning("what time is it"),
        FakeResponder::returning("It is noon."),
        FakeSynthesizer::working(),
        500,
    );

    harness.engine.start_conversation();
    assert_eq!(harness.engine.state(), ConversationState::Listening);

    harness.run_utterance(2000, loud_capture()).await;

    assert_eq!(harness.transcriber.calls(), 1);
    assert_eq!(harness.responder.calls(), 1);
    assert_eq!(harness.sink.played_count(), 1);

    // Playback (500ms) ends, then the resume delay (1500ms) hands
    // control back to listening
    tokio::time::sleep(Duration::from_millis(500 + 1500 + 200)).await;
    assert_eq!(harness.engine.state(), ConversationState::Listening);

    assert!(harness.saw_state(&ConversationState::Recording));
    assert!(harness.saw_state(&ConversationState::Processing));
    assert!(harness.saw_state(&ConversationState::Speaking));
    assert!(harness
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Transcript { text, .. } if text == "what time is it")));
    assert!(harness
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Reply { text } if text == "It is noon.")));
    assert_eq!(harness.error_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_conversation_is_idempotent() {
    let harness = Harness::new(
        FakeTranscriber::returning("hello"),
        FakeResponder::returning("hi"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    harness.engine.start_conversation();

    assert_eq!(harness.engine.state(), ConversationState::Listening);
    assert_eq!(harness.source.open_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn tiny_recording_never_reaches_transcription() {
    let harness = Harness::new(
        FakeTranscriber::returning("should never be called"),
        FakeResponder::returning("nope"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    // 1000 samples -> ~2k WAV bytes, below the 4000-byte minimum
    harness.run_utterance(500, vec![0.2f32; 1000]).await;

    assert_eq!(harness.transcriber.calls(), 0);
    assert_eq!(harness.engine.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn short_segment_fails_gate_despite_confidence() {
    let harness = Harness::new(
        FakeTranscriber::returning("should never be called"),
        FakeResponder::returning("nope"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    // 150ms at high amplitude: big enough in bytes, too short for the gate
    harness.run_utterance(500, vec![0.9f32; 2400]).await;

    assert_eq!(harness.transcriber.calls(), 0);
    assert_eq!(harness.engine.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn boilerplate_transcription_is_discarded() {
    let harness = Harness::new(
        FakeTranscriber::returning("thanks for watching"),
        FakeResponder::returning("you're welcome?"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;

    assert_eq!(harness.transcriber.calls(), 1);
    assert_eq!(harness.responder.calls(), 0);
    assert_eq!(harness.engine.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn empty_transcription_resumes_listening() {
    let harness = Harness::new(
        FakeTranscriber::returning("   "),
        FakeResponder::returning("nope"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;

    assert_eq!(harness.responder.calls(), 0);
    assert_eq!(harness.engine.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn synthesis_failure_recovers_to_listening_with_one_error() {
    let harness = Harness::new(
        FakeTranscriber::returning("tell me a story"),
        FakeResponder::returning("Once upon a time."),
        FakeSynthesizer::failing(),
        100,
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;

    assert_eq!(harness.error_count(), 1);
    assert!(harness.saw_state(&ConversationState::Errored(String::new())));
    assert_eq!(harness.engine.state(), ConversationState::Listening);
    assert_eq!(harness.sink.played_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_consecutive_failure_ends_session() {
    let harness = Harness::new(
        FakeTranscriber::returning("hello again"),
        FakeResponder::returning("hi"),
        FakeSynthesizer::failing(),
        100,
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;
    assert_eq!(harness.engine.state(), ConversationState::Listening);

    harness.run_utterance(1000, loud_capture()).await;
    assert_eq!(harness.engine.state(), ConversationState::Idle);
    assert!(!harness.engine.is_active());
    assert_eq!(harness.error_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn interrupt_while_speaking_clears_playback_and_listens() {
    let harness = Harness::new(
        FakeTranscriber::returning("read me the news"),
        FakeResponder::returning("Here is a very long bulletin."),
        FakeSynthesizer::working(),
        60_000, // long enough that playback is still going when we barge in
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;
    assert_eq!(harness.engine.state(), ConversationState::Speaking);
    assert!(harness.queue.is_playing());

    harness.engine.interrupt_agent();
    assert!(!harness.queue.is_playing());
    assert_eq!(harness.engine.state(), ConversationState::Listening);

    // VAD resumes after the grace period
    tokio::time::sleep(Duration::from_millis(500 + 100)).await;
    assert!(!harness.source.paused.load(Ordering::SeqCst));
    assert_eq!(harness.engine.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn interrupt_when_not_speaking_is_a_no_op() {
    let harness = Harness::new(
        FakeTranscriber::returning("hello"),
        FakeResponder::returning("hi"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.interrupt_agent();
    assert_eq!(harness.engine.state(), ConversationState::Idle);

    harness.engine.start_conversation();
    harness.engine.interrupt_agent();
    assert_eq!(harness.engine.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn stale_reply_after_session_end_is_never_played() {
    let harness = Harness::new(
        FakeTranscriber::returning("slow question"),
        FakeResponder::returning("slow answer"),
        FakeSynthesizer::slow(3000),
        100,
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;
    assert_eq!(harness.engine.state(), ConversationState::Processing);

    // End the session while synthesis is still in flight
    harness.engine.end_conversation();
    tokio::time::sleep(Duration::from_millis(4000)).await;

    assert_eq!(harness.sink.played_count(), 0);
    assert_eq!(harness.engine.state(), ConversationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn max_duration_cutoff_finalizes_exactly_once() {
    let harness = Harness::new(
        FakeTranscriber::returning("a very long monologue"),
        FakeResponder::returning("noted"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    harness.source.set_capture(loud_capture());
    harness.source.set_amplitude(0.5);

    // Never stop talking; the 15s hard cap must cut the turn
    tokio::time::sleep(Duration::from_millis(16_000)).await;
    harness.source.set_amplitude(0.0);
    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert_eq!(harness.transcriber.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn end_conversation_is_idempotent_from_any_state() {
    let harness = Harness::new(
        FakeTranscriber::returning("hello"),
        FakeResponder::returning("hi"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.end_conversation();
    assert_eq!(harness.engine.state(), ConversationState::Idle);

    harness.engine.start_conversation();
    harness.engine.end_conversation();
    harness.engine.end_conversation();
    assert_eq!(harness.engine.state(), ConversationState::Idle);
    assert!(!harness.engine.is_active());
}

#[tokio::test(start_paused = true)]
async fn device_failure_surfaces_error_state() {
    let queue = Arc::new(AudioPlaybackQueue::new(VirtualSink::new(100)));
    let engine = ConversationEngine::new(
        test_config(),
        GateConfig::default(),
        Arc::new(DeadSource),
        queue,
        FakeTranscriber::returning("x"),
        FakeResponder::returning("y"),
        FakeSynthesizer::working(),
        Arc::new(SpeechMetricsRecorder::new(Arc::new(NullMetricsSink))),
    )
    .unwrap();

    let mut events = engine.take_events().unwrap();
    engine.start_conversation();

    assert!(matches!(engine.state(), ConversationState::Errored(_)));
    assert!(!engine.is_active());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::Error { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn context_history_grows_across_turns() {
    let harness = Harness::new(
        FakeTranscriber::returning("remember this"),
        FakeResponder::returning("stored"),
        FakeSynthesizer::working(),
        100,
    );

    harness.engine.start_conversation();
    harness.run_utterance(1000, loud_capture()).await;
    // Let playback end and listening resume before the next turn
    tokio::time::sleep(Duration::from_millis(100 + 1500 + 200)).await;
    assert_eq!(harness.responder.last_history_len.load(Ordering::SeqCst), 0);

    harness.run_utterance(1000, loud_capture()).await;
    assert_eq!(harness.responder.last_history_len.load(Ordering::SeqCst), 2);
}
