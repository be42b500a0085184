//! Audio capture
//!
//! Provides the `AudioSource` abstraction the VAD and engine consume, plus
//! the cpal-backed microphone implementation. The cpal stream is not Send,
//! so `MicrophoneSource` parks it on a dedicated capture thread and shares
//! samples through a lock-protected tap.
//!
//! ```text
//! Microphone → cpal stream → SampleTap → latest()  → VAD energy window
//!                                      → capture   → finalized AudioSegment
//! ```

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{debug, error, info};

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};

/// Samples retained for energy analysis
const ANALYSIS_WINDOW: usize = 2048;

/// A live microphone-like sample source.
///
/// Implementations must be cheap to pause and resume: `pause` disables the
/// track without releasing the device, which is how the engine mutes itself
/// while the agent is speaking.
pub trait AudioSource: Send + Sync {
    /// Open the device and begin streaming samples. Idempotent.
    fn open(&self) -> VoiceResult<()>;

    /// Disable the track without tearing the stream down.
    fn pause(&self);

    /// Re-enable a paused track.
    fn resume(&self);

    /// Release the device. Idempotent.
    fn close(&self);

    /// The newest `n` mono samples, oldest first. May return fewer.
    fn latest(&self, n: usize) -> Vec<f32>;

    /// Begin buffering an utterance.
    fn begin_capture(&self);

    /// Stop buffering and return everything captured since `begin_capture`.
    fn take_capture(&self) -> Vec<f32>;

    /// Sample rate of the delivered samples.
    fn sample_rate(&self) -> u32;
}

/// A finalized, owned recording ready for validation and transcription
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Encoded audio bytes (16-bit PCM WAV)
    pub bytes: Vec<u8>,
    /// Mime tag describing `bytes`
    pub mime: &'static str,
    /// Estimated duration in milliseconds
    pub duration_ms: u32,
}

impl AudioSegment {
    /// Wrap raw mono samples as a WAV segment
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> VoiceResult<Self> {
        let bytes = encode_wav(samples, sample_rate)?;
        let duration_ms = if sample_rate == 0 {
            0
        } else {
            (samples.len() as u64 * 1000 / sample_rate as u64) as u32
        };
        Ok(Self {
            bytes,
            mime: "audio/wav",
            duration_ms,
        })
    }

    /// Encoded byte length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encode mono f32 samples as 16-bit PCM WAV bytes in memory
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}

/// Shared sample buffer fed by the capture callback
struct SampleTap {
    enabled: AtomicBool,
    window: Mutex<VecDeque<f32>>,
    capture: Mutex<Option<Vec<f32>>>,
    channels: u16,
}

impl SampleTap {
    fn new(channels: u16) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            window: Mutex::new(VecDeque::with_capacity(ANALYSIS_WINDOW)),
            capture: Mutex::new(None),
            channels: channels.max(1),
        }
    }

    /// Push interleaved samples, downmixing to mono
    fn push(&self, data: &[f32]) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let channels = self.channels as usize;
        let mono: Vec<f32> = if channels == 1 {
            data.to_vec()
        } else {
            data.chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        if let Ok(mut window) = self.window.lock() {
            window.extend(mono.iter().copied());
            while window.len() > ANALYSIS_WINDOW {
                window.pop_front();
            }
        }
        if let Ok(mut capture) = self.capture.lock() {
            if let Some(ref mut buffer) = *capture {
                buffer.extend_from_slice(&mono);
            }
        }
    }

    fn latest(&self, n: usize) -> Vec<f32> {
        self.window
            .lock()
            .map(|window| {
                let start = window.len().saturating_sub(n);
                window.iter().skip(start).copied().collect()
            })
            .unwrap_or_default()
    }
}

enum WorkerCommand {
    Shutdown,
}

struct CaptureWorker {
    commands: mpsc::Sender<WorkerCommand>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Default-device microphone source backed by cpal
pub struct MicrophoneSource {
    config: VoiceConfig,
    tap: Arc<SampleTap>,
    worker: Mutex<Option<CaptureWorker>>,
}

impl MicrophoneSource {
    pub fn new(config: VoiceConfig) -> Self {
        let channels = config.channels as u16;
        Self {
            config,
            tap: Arc::new(SampleTap::new(channels)),
            worker: Mutex::new(None),
        }
    }

    /// Build the cpal stream on the capture thread
    fn build_stream(
        config: &VoiceConfig,
        tap: Arc<SampleTap>,
    ) -> VoiceResult<cpal::Stream> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            VoiceError::DeviceUnavailable("no input device (microphone not found)".to_string())
        })?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using input device: {}", device_name);

        let stream_config = cpal::StreamConfig {
            channels: config.channels as u16,
            sample_rate: cpal::SampleRate(config.sample_rate_hz),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_fn = |err| error!("Audio input error: {}", err);
        let sample_format = device.default_input_config()?.sample_format();

        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                let tap = tap.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        tap.push(data);
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let tap = tap.clone();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let samples: Vec<f32> = data
                            .iter()
                            .map(|&s| (s as f32 / i16::MAX as f32).clamp(-1.0, 1.0))
                            .collect();
                        tap.push(&samples);
                    },
                    err_fn,
                    None,
                )?
            }
            format => {
                return Err(VoiceError::Device(format!(
                    "unsupported sample format: {:?}",
                    format
                )))
            }
        };

        stream.play()?;
        Ok(stream)
    }
}

impl AudioSource for MicrophoneSource {
    fn open(&self) -> VoiceResult<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            debug!("Microphone already open");
            return Ok(());
        }

        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();
        let config = self.config.clone();
        let tap = self.tap.clone();

        let handle = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let stream = match Self::build_stream(&config, tap) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Hold the stream alive until shutdown
                while let Ok(command) = command_rx.recv() {
                    match command {
                        WorkerCommand::Shutdown => break,
                    }
                }
                drop(stream);
                debug!("Capture thread exiting");
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.tap.enabled.store(true, Ordering::SeqCst);
                *worker = Some(CaptureWorker {
                    commands,
                    handle: Some(handle),
                });
                info!("Audio input started at {}Hz", self.config.sample_rate_hz);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VoiceError::Device("capture thread died during startup".to_string()))
            }
        }
    }

    fn pause(&self) {
        self.tap.enabled.store(false, Ordering::SeqCst);
        debug!("Audio input paused");
    }

    fn resume(&self) {
        self.tap.enabled.store(true, Ordering::SeqCst);
        debug!("Audio input resumed");
    }

    fn close(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(mut active) = worker.take() {
            let _ = active.commands.send(WorkerCommand::Shutdown);
            if let Some(handle) = active.handle.take() {
                let _ = handle.join();
            }
            info!("Audio input stopped");
        }
        if let Ok(mut window) = self.tap.window.lock() {
            window.clear();
        }
    }

    fn latest(&self, n: usize) -> Vec<f32> {
        self.tap.latest(n)
    }

    fn begin_capture(&self) {
        if let Ok(mut capture) = self.tap.capture.lock() {
            *capture = Some(Vec::new());
        }
        debug!("Utterance capture started");
    }

    fn take_capture(&self) -> Vec<f32> {
        let samples = self
            .tap
            .capture
            .lock()
            .map(|mut capture| capture.take().unwrap_or_default())
            .unwrap_or_default();
        debug!("Utterance capture finished: {} samples", samples.len());
        samples
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate_hz
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}
