//! Conversation engine
//!
//! The state machine that owns a voice session. Composes the energy
//! monitor, utterance capture, validity gate, playback queue, and the
//! external transcription/response/synthesis collaborators into one
//! turn-taking loop:
//!
//! ```text
//! Idle → Listening → Recording → Processing → Speaking → Listening ...
//!                        ↑            │ reject/error       │ barge-in
//!                        └────────────┴────────────────────┘
//! ```
//!
//! All transitions funnel through a single internal state cell; timers
//! are named and cancel-then-reschedule so duplicate schedules can never
//! fire against a revoked state. Every collaborator failure is caught at
//! this boundary and turned into an `Error` event plus a recovery
//! attempt - nothing propagates to the caller.
//!
//! Engine methods must be called from within a tokio runtime.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capture::{AudioSegment, AudioSource};
use crate::config::{GateConfig, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::gate::{SpeechEvidence, SpeechValidityGate};
use crate::metrics::SpeechMetricsRecorder;
use crate::playback::{AudioPlaybackQueue, PlaybackItem, PlaybackState, Unsubscribe};
use crate::services::{
    Exchange, ResponseGenerator, Role, SpeechSynthesizer, SynthesisOptions, Transcriber,
    TurnContext,
};
use crate::vad::AudioEnergyMonitor;

/// Window inside which two finalize triggers collapse into one
const DEDUP_WINDOW: Duration = Duration::from_millis(250);

/// Exchanges retained as response-generation context (user + assistant)
const HISTORY_LIMIT: usize = 12;

/// Transcripts shorter than this are discarded as noise
const MIN_TRANSCRIPT_CHARS: usize = 2;

/// Known speech-recognizer filler output, normalized.
/// These show up when models hallucinate closed-caption artifacts over
/// near-silent audio.
static BOILERPLATE_PHRASES: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "thanks for watching",
        "thank you for watching",
        "thank you so much for watching",
        "thanks for listening",
        "please subscribe",
        "subscribe to my channel",
        "see you in the next video",
        "music",
        "applause",
        "blank audio",
    ]
    .iter()
    .map(|phrase| normalize_transcript(phrase))
    .collect()
});

/// Lowercase, strip punctuation, collapse whitespace
fn normalize_transcript(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a transcript is recognizer filler rather than real speech
pub(crate) fn is_boilerplate(text: &str) -> bool {
    let normalized = normalize_transcript(text);
    normalized.chars().count() < MIN_TRANSCRIPT_CHARS
        || BOILERPLATE_PHRASES.iter().any(|phrase| phrase == &normalized)
}

/// Conversation session state; exactly one is active at a time
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationState {
    Idle,
    Listening,
    Recording,
    Processing,
    Speaking,
    Errored(String),
}

/// Notifications published by the engine, in transition order
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(ConversationState),
    Transcript {
        text: String,
        language: Option<String>,
        confidence: Option<f32>,
    },
    Reply {
        text: String,
    },
    Error {
        message: String,
    },
}

/// Named, individually cancellable engine timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    /// Silence debounce before a recording finalizes
    StopRecording,
    /// Hard cap on recording duration
    MaxRecording,
    /// Echo guard before the VAD resumes after speaking
    ResumeListening,
}

/// Why a recording was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeReason {
    SilenceDebounce,
    MaxDuration,
}

/// What a completed turn pipeline produced
enum TurnOutcome {
    /// Reply enqueued, engine is Speaking
    Spoken,
    /// Segment or transcript rejected; resume listening directly
    Rejected,
    /// Session moved on while the turn was in flight; result dropped
    Stale,
}

/// Keyed timer handles. Scheduling a kind always cancels its
/// predecessor first, so at most one timer per purpose is in flight.
struct TimerSet {
    handles: Mutex<HashMap<TimerKind, tokio::task::JoinHandle<()>>>,
}

impl TimerSet {
    fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn schedule<F>(&self, kind: TimerKind, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel(kind);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });
        self.handles.lock().unwrap().insert(kind, handle);
    }

    fn cancel(&self, kind: TimerKind) {
        if let Some(handle) = self.handles.lock().unwrap().remove(&kind) {
            handle.abort();
        }
    }

    fn cancel_all(&self) {
        for (_, handle) in self.handles.lock().unwrap().drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.handles
            .lock()
            .unwrap()
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

struct EngineInner {
    config: VoiceConfig,
    state: Mutex<ConversationState>,
    session_active: AtomicBool,
    turn_generation: AtomicU64,
    recovery_failures: AtomicU32,
    last_finalized: Mutex<Option<Instant>>,
    timers: TimerSet,
    monitor: AudioEnergyMonitor,
    source: Arc<dyn AudioSource>,
    gate: SpeechValidityGate,
    playback: Arc<AudioPlaybackQueue>,
    transcriber: Arc<dyn Transcriber>,
    responder: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    synthesis: Mutex<SynthesisOptions>,
    metrics: Arc<SpeechMetricsRecorder>,
    history: Mutex<Vec<Exchange>>,
    events_tx: UnboundedSender<EngineEvent>,
}

/// An explicitly owned voice session: construct, `start_conversation`,
/// `end_conversation`, drop. Multiple engines can coexist; there is no
/// process-wide state.
pub struct ConversationEngine {
    inner: Arc<EngineInner>,
    events_rx: Mutex<Option<UnboundedReceiver<EngineEvent>>>,
    playback_subscription: Mutex<Option<Unsubscribe>>,
}

impl ConversationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VoiceConfig,
        gate_config: GateConfig,
        source: Arc<dyn AudioSource>,
        playback: Arc<AudioPlaybackQueue>,
        transcriber: Arc<dyn Transcriber>,
        responder: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        metrics: Arc<SpeechMetricsRecorder>,
    ) -> VoiceResult<Self> {
        let config = config.validated()?;
        let gate = SpeechValidityGate::new(gate_config)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = AudioEnergyMonitor::new(config.clone(), source.clone());

        let inner = Arc::new(EngineInner {
            config,
            state: Mutex::new(ConversationState::Idle),
            session_active: AtomicBool::new(false),
            turn_generation: AtomicU64::new(0),
            recovery_failures: AtomicU32::new(0),
            last_finalized: Mutex::new(None),
            timers: TimerSet::new(),
            monitor,
            source,
            gate,
            playback: playback.clone(),
            transcriber,
            responder,
            synthesizer,
            synthesis: Mutex::new(SynthesisOptions::default()),
            metrics,
            history: Mutex::new(Vec::new()),
            events_tx,
        });

        // Playback completion drives the Speaking -> Listening handoff
        let weak = Arc::downgrade(&inner);
        let subscription = playback.subscribe(move |playback_state| {
            if let Some(strong) = weak.upgrade() {
                EngineInner::on_playback_state(&strong, playback_state);
            }
        });

        Ok(Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
            playback_subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Override the voice/style used for synthesis calls
    pub fn set_synthesis_options(&self, options: SynthesisOptions) {
        *self.inner.synthesis.lock().unwrap() = options;
    }

    /// Take the event receiver (once) for consuming engine notifications
    pub fn take_events(&self) -> Option<UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Current session state
    pub fn state(&self) -> ConversationState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Whether a session is currently running
    pub fn is_active(&self) -> bool {
        self.inner.session_active.load(Ordering::SeqCst)
    }

    /// Begin listening. No-op if the session is already active. Device
    /// acquisition failure lands in `Errored` with an `Error` event
    /// rather than returning an error.
    pub fn start_conversation(&self) {
        let inner = &self.inner;
        {
            let state = inner.state.lock().unwrap();
            if inner.session_active.load(Ordering::SeqCst)
                && !matches!(*state, ConversationState::Idle | ConversationState::Errored(_))
            {
                debug!("Conversation already active, ignoring start");
                return;
            }
        }

        inner.session_active.store(true, Ordering::SeqCst);
        inner.recovery_failures.store(0, Ordering::SeqCst);
        *inner.last_finalized.lock().unwrap() = None;

        if let Err(e) = inner.monitor.init() {
            error!("Failed to acquire capture device: {}", e);
            inner.send_event(EngineEvent::Error {
                message: e.to_string(),
            });
            inner.session_active.store(false, Ordering::SeqCst);
            inner.set_state(ConversationState::Errored(e.to_string()));
            return;
        }

        inner.set_state(ConversationState::Listening);

        let start_inner = inner.clone();
        let end_inner = inner.clone();
        inner.monitor.start(
            move || EngineInner::on_speech_start(&start_inner),
            move || EngineInner::on_speech_end(&end_inner),
        );
        info!("Conversation started");
    }

    /// Tear the session down from any state. Fully idempotent.
    pub fn end_conversation(&self) {
        EngineInner::shutdown(&self.inner);
        info!("Conversation ended");
    }

    /// Barge-in: stop agent speech and hand control back to listening.
    /// Silent no-op unless the agent is currently speaking.
    pub fn interrupt_agent(&self) {
        let inner = &self.inner;
        {
            let state = inner.state.lock().unwrap();
            if *state != ConversationState::Speaking {
                debug!("Interrupt ignored in state {:?}", *state);
                return;
            }
        }

        info!("Agent interrupted");
        inner.turn_generation.fetch_add(1, Ordering::SeqCst);
        inner.playback.clear();
        inner.set_state(ConversationState::Listening);

        // Short grace so playback tail energy is not picked up as speech
        let grace = Duration::from_millis(inner.config.interrupt_grace_ms as u64);
        let timer_inner = inner.clone();
        inner.timers.schedule(TimerKind::ResumeListening, grace, move || {
            EngineInner::resume_listening(&timer_inner);
        });
    }

    /// Metrics recorder observing this session
    pub fn metrics(&self) -> Arc<SpeechMetricsRecorder> {
        self.inner.metrics.clone()
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.playback_subscription.lock().unwrap().take() {
            unsubscribe();
        }
        EngineInner::shutdown(&self.inner);
    }
}

impl EngineInner {
    fn set_state(&self, new_state: ConversationState) {
        let mut state = self.state.lock().unwrap();
        if *state == new_state {
            return;
        }
        info!("State: {:?} -> {:?}", *state, new_state);
        *state = new_state.clone();
        // Published while the lock is held so subscribers never observe
        // transitions out of order
        let _ = self.events_tx.send(EngineEvent::StateChanged(new_state));
    }

    fn send_event(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn turn_current(&self, generation: u64) -> bool {
        self.session_active.load(Ordering::SeqCst)
            && self.turn_generation.load(Ordering::SeqCst) == generation
    }

    /// VAD rising edge
    fn on_speech_start(inner: &Arc<Self>) {
        let current = inner.state.lock().unwrap().clone();
        match current {
            ConversationState::Listening => {}
            ConversationState::Recording => {
                // Speech resumed mid-recording: the pending debounce no
                // longer applies
                inner.timers.cancel(TimerKind::StopRecording);
                debug!("Speech resumed, debounce cancelled");
                return;
            }
            other => {
                debug!("Speech start ignored in state {:?}", other);
                return;
            }
        }

        inner.source.begin_capture();
        inner.set_state(ConversationState::Recording);

        let max_duration = Duration::from_millis(inner.config.max_recording_ms as u64);
        let timer_inner = inner.clone();
        inner
            .timers
            .schedule(TimerKind::MaxRecording, max_duration, move || {
                debug!("Max recording duration reached");
                EngineInner::finalize(&timer_inner, FinalizeReason::MaxDuration);
            });
    }

    /// VAD falling edge
    fn on_speech_end(inner: &Arc<Self>) {
        {
            let state = inner.state.lock().unwrap();
            if *state != ConversationState::Recording {
                debug!("Speech end ignored in state {:?}", *state);
                return;
            }
        }

        let debounce = Duration::from_millis(inner.config.silence_timeout_ms as u64);
        let timer_inner = inner.clone();
        inner
            .timers
            .schedule(TimerKind::StopRecording, debounce, move || {
                EngineInner::finalize(&timer_inner, FinalizeReason::SilenceDebounce);
            });
    }

    /// Assemble the captured frames and either discard or process them.
    ///
    /// The max-duration and silence-debounce timers can race; the de-dup
    /// instant collapses both into one finalization, and max-duration
    /// wins the tie because its timer cancels the debounce here first.
    fn finalize(inner: &Arc<Self>, reason: FinalizeReason) {
        {
            let mut last = inner.last_finalized.lock().unwrap();
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < DEDUP_WINDOW {
                    debug!("Duplicate finalization ({:?}) suppressed", reason);
                    return;
                }
            }
            *last = Some(now);
        }
        {
            let state = inner.state.lock().unwrap();
            if *state != ConversationState::Recording {
                debug!("Finalize ignored in state {:?}", *state);
                return;
            }
        }

        inner.timers.cancel(TimerKind::StopRecording);
        inner.timers.cancel(TimerKind::MaxRecording);

        let samples = inner.source.take_capture();
        debug!("Finalizing recording ({:?}): {} samples", reason, samples.len());

        let segment = match AudioSegment::from_samples(&samples, inner.config.sample_rate_hz) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("Could not assemble segment: {}", e);
                inner.set_state(ConversationState::Listening);
                return;
            }
        };

        if segment.len() < inner.config.min_audio_bytes as usize {
            info!(
                "Recording below minimum size ({} < {} bytes), discarding",
                segment.len(),
                inner.config.min_audio_bytes
            );
            inner.set_state(ConversationState::Listening);
            return;
        }

        inner.set_state(ConversationState::Processing);
        inner.monitor.pause();

        let generation = inner.turn_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task_inner = inner.clone();
        tokio::spawn(async move {
            EngineInner::process_turn(task_inner, segment, generation).await;
        });
    }

    async fn process_turn(inner: Arc<Self>, segment: AudioSegment, generation: u64) {
        match EngineInner::run_turn(&inner, segment, generation).await {
            Ok(TurnOutcome::Spoken) => {
                inner.recovery_failures.store(0, Ordering::SeqCst);
            }
            Ok(TurnOutcome::Rejected) => {
                debug!("Turn rejected, resuming listening");
                EngineInner::resume_listening(&inner);
            }
            Ok(TurnOutcome::Stale) => {
                debug!("Turn result stale, dropped");
            }
            Err(e) => EngineInner::handle_turn_error(&inner, e),
        }
    }

    /// One full utterance: gate, transcribe, respond, synthesize, enqueue
    async fn run_turn(
        inner: &Arc<Self>,
        segment: AudioSegment,
        generation: u64,
    ) -> VoiceResult<TurnOutcome> {
        let evidence = match inner.gate.evaluate(&segment) {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!("Segment decode failed, rejecting: {}", e);
                SpeechEvidence::rejected()
            }
        };
        inner.metrics.record_attempt(&evidence);
        if !evidence.is_valid {
            info!(
                "Validity gate rejected segment (confidence={:.2}, {}ms)",
                evidence.confidence, evidence.duration_ms
            );
            return Ok(TurnOutcome::Rejected);
        }

        let transcription = match inner.transcriber.transcribe(segment).await {
            Ok(transcription) => transcription,
            Err(e) => {
                inner.metrics.record_transcription_error();
                return Err(e);
            }
        };

        let text = transcription.text.trim().to_string();
        if text.is_empty() {
            info!("Empty transcription, resuming listening");
            return Ok(TurnOutcome::Rejected);
        }
        if is_boilerplate(&text) {
            info!("Boilerplate transcription discarded: \"{}\"", text);
            inner.metrics.record_invalid_phrase(&text);
            return Ok(TurnOutcome::Rejected);
        }

        inner.send_event(EngineEvent::Transcript {
            text: text.clone(),
            language: transcription.detected_language.clone(),
            confidence: transcription.confidence,
        });

        if !inner.turn_current(generation) {
            return Ok(TurnOutcome::Stale);
        }

        let turn = TurnContext {
            text: text.clone(),
            history: inner.history.lock().unwrap().clone(),
        };
        let reply = inner.responder.respond(&turn).await?.trim().to_string();
        if reply.is_empty() {
            info!("Empty reply, resuming listening");
            return Ok(TurnOutcome::Rejected);
        }

        let options = inner.synthesis.lock().unwrap().clone();
        let audio = inner.synthesizer.synthesize(&reply, &options).await?;

        // A barge-in or session end may have arrived while the calls
        // were in flight; never play a stale reply
        if !inner.turn_current(generation) {
            return Ok(TurnOutcome::Stale);
        }

        {
            let mut history = inner.history.lock().unwrap();
            history.push(Exchange {
                role: Role::User,
                content: text,
            });
            history.push(Exchange {
                role: Role::Assistant,
                content: reply.clone(),
            });
            let excess = history.len().saturating_sub(HISTORY_LIMIT);
            if excess > 0 {
                history.drain(..excess);
            }
        }

        inner.send_event(EngineEvent::Reply {
            text: reply.clone(),
        });
        inner.set_state(ConversationState::Speaking);
        inner.playback.enqueue(PlaybackItem {
            audio,
            label: crate::truncate_safe(&reply, 48),
        });

        Ok(TurnOutcome::Spoken)
    }

    /// Playback queue subscription: a finished reply hands control back
    /// to listening after the echo-guard delay
    fn on_playback_state(inner: &Arc<Self>, playback_state: PlaybackState) {
        if playback_state.is_playing {
            return;
        }
        if !inner.session_active.load(Ordering::SeqCst) {
            return;
        }
        {
            let state = inner.state.lock().unwrap();
            if *state != ConversationState::Speaking {
                return;
            }
        }

        let delay = Duration::from_millis(inner.config.resume_delay_ms as u64);
        let timer_inner = inner.clone();
        inner
            .timers
            .schedule(TimerKind::ResumeListening, delay, move || {
                EngineInner::resume_listening(&timer_inner);
            });
    }

    fn resume_listening(inner: &Arc<Self>) {
        if !inner.session_active.load(Ordering::SeqCst) {
            return;
        }
        inner.set_state(ConversationState::Listening);
        inner.monitor.resume();
    }

    /// Boundary for every collaborator failure: report once, pass
    /// through Errored, then try to keep the session alive
    fn handle_turn_error(inner: &Arc<Self>, error: VoiceError) {
        error!("Turn failed: {}", error);
        inner.send_event(EngineEvent::Error {
            message: error.to_string(),
        });
        inner.set_state(ConversationState::Errored(error.to_string()));

        if error.is_fatal() || !inner.session_active.load(Ordering::SeqCst) {
            EngineInner::shutdown(inner);
            return;
        }

        let failures = inner.recovery_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= 2 {
            warn!("Repeated turn failures ({}), ending session", failures);
            EngineInner::shutdown(inner);
            return;
        }

        EngineInner::resume_listening(inner);
    }

    /// Stop everything and return to Idle. Idempotent.
    fn shutdown(inner: &Arc<Self>) {
        inner.session_active.store(false, Ordering::SeqCst);
        inner.turn_generation.fetch_add(1, Ordering::SeqCst);
        inner.timers.cancel_all();
        let _ = inner.source.take_capture();
        inner.monitor.stop();
        inner.set_state(ConversationState::Idle);
    }
}
