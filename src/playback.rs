//! Audio playback queue
//!
//! Strictly ordered, non-overlapping playback of synthesized audio with
//! observable progress. Items play back-to-back; a failed item is skipped
//! rather than stalling the queue, and `clear` cancels both the in-flight
//! item and everything queued behind it (used for barge-in).
//!
//! The output device sits behind the `PlaybackSink` trait so the queue
//! logic is testable without speakers. The rodio-backed `SpeakerSink`
//! keeps its output stream on a dedicated thread.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{VoiceError, VoiceResult};

/// Retries after a refused playback start before skipping the item
const PLAY_RETRIES: u32 = 2;

/// Backoff between playback start retries
const RETRY_BACKOFF_MS: u64 = 1000;

/// A queued piece of synthesized audio
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    /// Encoded audio bytes (WAV or MP3)
    pub audio: Vec<u8>,
    /// Short label for logs and progress displays
    pub label: String,
}

/// Observable playback state, republished on every change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    pub is_playing: bool,
    /// 0..=100
    pub progress: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            progress: 0.0,
        }
    }
}

/// Handle returned by `subscribe`; call to stop receiving updates
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// An audio output device that plays one clip at a time
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Play the clip to completion. `stop` unblocks an in-flight call.
    async fn play(&self, audio: &[u8]) -> VoiceResult<()>;

    /// Stop any in-flight playback immediately.
    fn stop(&self);
}

type Subscriber = Arc<dyn Fn(PlaybackState) + Send + Sync>;

struct QueueInner {
    sink: Arc<dyn PlaybackSink>,
    queue: Mutex<VecDeque<PlaybackItem>>,
    state: Mutex<PlaybackState>,
    worker_active: AtomicBool,
    epoch: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber_id: AtomicU64,
}

impl QueueInner {
    fn set_state(&self, new_state: PlaybackState) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber(new_state);
        }
    }
}

/// FIFO queue serializing playback of synthesized audio segments
pub struct AudioPlaybackQueue {
    inner: Arc<QueueInner>,
}

impl AudioPlaybackQueue {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                sink,
                queue: Mutex::new(VecDeque::new()),
                state: Mutex::new(PlaybackState::default()),
                worker_active: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    /// Append an item; starts playing immediately if the queue is idle
    pub fn enqueue(&self, item: PlaybackItem) {
        debug!("Audio queued: {}", item.label);
        self.inner.queue.lock().unwrap().push_back(item);
        Self::spawn_worker(self.inner.clone());
    }

    /// Register for state updates. The callback fires once immediately
    /// with the current state, then on every change.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(PlaybackState) + Send + Sync + 'static,
    {
        let callback: Subscriber = Arc::new(callback);
        let current = *self.inner.state.lock().unwrap();
        callback(current);

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().unwrap().insert(id, callback);

        let inner = self.inner.clone();
        Box::new(move || {
            inner.subscribers.lock().unwrap().remove(&id);
        })
    }

    /// Stop in-flight playback, drop all queued items, and publish
    /// `{ is_playing: false, progress: 0 }`. Safe to call when idle.
    pub fn clear(&self) {
        info!("Playback queue cleared");
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.sink.stop();
        self.inner.queue.lock().unwrap().clear();
        self.inner.set_state(PlaybackState {
            is_playing: false,
            progress: 0.0,
        });
    }

    /// Current observable state
    pub fn state(&self) -> PlaybackState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_playing(&self) -> bool {
        self.state().is_playing
    }

    /// Items waiting behind the one currently playing
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    fn spawn_worker(inner: Arc<QueueInner>) {
        if inner.worker_active.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(async move {
            let epoch = inner.epoch.load(Ordering::SeqCst);

            loop {
                if inner.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }

                let item = inner.queue.lock().unwrap().pop_front();
                let Some(item) = item else { break };

                inner.set_state(PlaybackState {
                    is_playing: true,
                    progress: 0.0,
                });
                info!("Playback started: {}", item.label);

                let mut attempt = 0;
                let outcome = loop {
                    match inner.sink.play(&item.audio).await {
                        Ok(()) => break Ok(()),
                        Err(VoiceError::Playback(reason)) if attempt < PLAY_RETRIES => {
                            attempt += 1;
                            warn!(
                                "Playback start refused ({}), retry {}/{}",
                                reason, attempt, PLAY_RETRIES
                            );
                            tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                            if inner.epoch.load(Ordering::SeqCst) != epoch {
                                break Err(VoiceError::Playback(reason));
                            }
                        }
                        Err(e) => break Err(e),
                    }
                };

                if inner.epoch.load(Ordering::SeqCst) != epoch {
                    // Cleared mid-play; clear() already published the reset state
                    break;
                }

                match outcome {
                    Ok(()) => info!("Playback finished: {}", item.label),
                    Err(e) => error!("Playback error, skipping item: {}", e),
                }

                inner.set_state(PlaybackState {
                    is_playing: false,
                    progress: 100.0,
                });
            }

            inner.worker_active.store(false, Ordering::SeqCst);

            // An enqueue may have landed while we were exiting; anything
            // still queued survived (or followed) the clear and must play
            let has_pending = !inner.queue.lock().unwrap().is_empty();
            if has_pending {
                Self::spawn_worker(inner.clone());
            }
        });
    }
}

enum SpeakerCommand {
    Play {
        audio: Vec<u8>,
        done: tokio::sync::oneshot::Sender<VoiceResult<()>>,
    },
}

/// Default-device speaker sink backed by rodio.
///
/// The rodio output stream is not Send, so it lives on a dedicated
/// playback thread; `stop` reaches the active sink through a shared
/// handle.
pub struct SpeakerSink {
    commands: Mutex<mpsc::Sender<SpeakerCommand>>,
    active: Arc<Mutex<Option<Arc<rodio::Sink>>>>,
}

impl SpeakerSink {
    pub fn new() -> VoiceResult<Self> {
        let (commands, command_rx) = mpsc::channel::<SpeakerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();
        let active: Arc<Mutex<Option<Arc<rodio::Sink>>>> = Arc::new(Mutex::new(None));
        let active_worker = active.clone();

        std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match rodio::OutputStream::try_default() {
                    Ok(pair) => {
                        let _ = ready_tx.send(Ok(()));
                        pair
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    match command {
                        SpeakerCommand::Play { audio, done } => {
                            let result = Self::play_clip(&handle, &active_worker, audio);
                            let _ = done.send(result);
                        }
                    }
                }
                drop(stream);
                debug!("Playback thread exiting");
            })
            .map_err(|e| VoiceError::Playback(format!("failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: Mutex::new(commands),
                active,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Playback(
                "playback thread died during startup".to_string(),
            )),
        }
    }

    /// Decode and play one clip on the playback thread, blocking until
    /// it finishes or the shared sink is stopped
    fn play_clip(
        handle: &rodio::OutputStreamHandle,
        active: &Arc<Mutex<Option<Arc<rodio::Sink>>>>,
        audio: Vec<u8>,
    ) -> VoiceResult<()> {
        let sink = rodio::Sink::try_new(handle)
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Arc::new(sink);

        let source = rodio::Decoder::new(Cursor::new(audio))
            .map_err(|e| VoiceError::Decode(e.to_string()))?;
        sink.append(source);

        *active.lock().unwrap() = Some(sink.clone());
        sink.sleep_until_end();
        *active.lock().unwrap() = None;

        Ok(())
    }
}

#[async_trait]
impl PlaybackSink for SpeakerSink {
    async fn play(&self, audio: &[u8]) -> VoiceResult<()> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        self.commands
            .lock()
            .unwrap()
            .send(SpeakerCommand::Play {
                audio: audio.to_vec(),
                done: done_tx,
            })
            .map_err(|_| VoiceError::Playback("playback thread gone".to_string()))?;

        done_rx
            .await
            .map_err(|_| VoiceError::Playback("playback thread gone".to_string()))?
    }

    fn stop(&self) {
        if let Some(sink) = self.active.lock().unwrap().as_ref() {
            sink.stop();
        }
    }
}
