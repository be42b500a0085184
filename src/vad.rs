//! Voice Activity Detection
//!
//! Classifies a live audio source as speech vs. silence in real time.
//! Each sampling tick measures energy in the low speech band, votes it
//! against the configured threshold, and smooths the votes over a short
//! history ring so single noisy windows cannot flip the classification.
//!
//! ```text
//! AudioSource → band energy → threshold vote → majority ring → edge events
//! ```
//!
//! A rising edge fires `on_speech_start` immediately. A falling edge arms
//! a silence deadline; only if the quiet holds for the full debounce does
//! `on_speech_end` fire.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::capture::AudioSource;
use crate::config::VoiceConfig;
use crate::error::VoiceResult;

/// Sampling cadence
const TICK_MS: u64 = 25;

/// Votes retained for the majority classification
const HISTORY_SIZE: usize = 3;

/// Samples per analysis window
const WINDOW_SIZE: usize = 512;

/// Low speech band analyzed for energy (Hz)
const SPEECH_BAND_HZ: (f32, f32) = (85.0, 255.0);

/// Peak normalized component amplitude across the low speech band.
///
/// Runs a Goertzel magnitude estimate per DFT bin inside
/// [`SPEECH_BAND_HZ`] and returns the strongest one, normalized so a
/// full-scale sinusoid at a bin frequency measures ~1.0. Monotonic in
/// input amplitude: scaling the window up never lowers the result.
pub fn band_energy(samples: &[f32], sample_rate: u32) -> f32 {
    if samples.is_empty() || sample_rate == 0 {
        return 0.0;
    }

    let n = samples.len().min(WINDOW_SIZE);
    let window = &samples[samples.len() - n..];
    let bin_hz = sample_rate as f32 / n as f32;

    let first_bin = (SPEECH_BAND_HZ.0 / bin_hz).ceil().max(1.0) as usize;
    let last_bin = (SPEECH_BAND_HZ.1 / bin_hz).floor() as usize;
    if last_bin < first_bin {
        return 0.0;
    }

    let mut peak = 0.0f32;
    for bin in first_bin..=last_bin {
        let magnitude = goertzel_magnitude(window, bin);
        // Scale |X_k| so a unit sinusoid at this bin reads ~1.0
        let amplitude = 2.0 * magnitude / n as f32;
        peak = peak.max(amplitude);
    }

    peak.clamp(0.0, 1.0)
}

/// Goertzel magnitude of DFT bin `k` over `samples`
fn goertzel_magnitude(samples: &[f32], k: usize) -> f32 {
    let n = samples.len() as f32;
    let omega = 2.0 * PI * k as f32 / n;
    let coeff = 2.0 * omega.cos();

    let mut s_prev = 0.0f32;
    let mut s_prev2 = 0.0f32;
    for &sample in samples {
        let s = sample + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }

    let power = s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2;
    power.max(0.0).sqrt()
}

/// Energy-based voice activity monitor over a live audio source
pub struct AudioEnergyMonitor {
    config: VoiceConfig,
    source: Arc<dyn AudioSource>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AudioEnergyMonitor {
    pub fn new(config: VoiceConfig, source: Arc<dyn AudioSource>) -> Self {
        Self {
            config,
            source,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Open the underlying capture device
    pub fn init(&self) -> VoiceResult<()> {
        self.source.open()
    }

    /// Begin periodic sampling, invoking the callbacks on speech edges.
    ///
    /// Idempotent: calling `start` while sampling is already running
    /// leaves the existing task in place.
    pub fn start<F, G>(&self, on_speech_start: F, on_speech_end: G)
    where
        F: Fn() + Send + 'static,
        G: Fn() + Send + 'static,
    {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            debug!("VAD already running, ignoring start");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);

        let running = self.running.clone();
        let paused = self.paused.clone();
        let source = self.source.clone();
        let threshold = self.config.silence_threshold;
        let sample_rate = self.config.sample_rate_hz;
        let silence_timeout = Duration::from_millis(self.config.silence_timeout_ms as u64);

        let handle = tokio::spawn(async move {
            let mut history: VecDeque<bool> = VecDeque::with_capacity(HISTORY_SIZE);
            let mut speaking = false;
            let mut silence_deadline: Option<Instant> = None;

            let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!("VAD sampling started (threshold={:.2})", threshold);

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                if paused.load(Ordering::SeqCst) {
                    history.clear();
                    speaking = false;
                    silence_deadline = None;
                    continue;
                }

                let window = source.latest(WINDOW_SIZE);
                if window.is_empty() {
                    continue;
                }

                let energy = band_energy(&window, sample_rate);
                history.push_back(energy > threshold);
                while history.len() > HISTORY_SIZE {
                    history.pop_front();
                }

                let votes = history.iter().filter(|&&vote| vote).count();
                let speaking_now = votes * 2 > HISTORY_SIZE;

                trace!(
                    "VAD tick: energy={:.3}, votes={}/{}, speaking={}",
                    energy,
                    votes,
                    history.len(),
                    speaking
                );

                if speaking_now {
                    if silence_deadline.take().is_some() {
                        debug!("Speech resumed, silence deadline cancelled");
                    }
                    if !speaking {
                        speaking = true;
                        debug!("Speech started");
                        if running.load(Ordering::SeqCst) {
                            on_speech_start();
                        }
                    }
                } else if speaking && silence_deadline.is_none() {
                    silence_deadline = Some(Instant::now() + silence_timeout);
                    debug!("Silence detected, deadline armed");
                }

                if let Some(deadline) = silence_deadline {
                    if Instant::now() >= deadline {
                        speaking = false;
                        silence_deadline = None;
                        history.clear();
                        debug!("Speech ended");
                        if running.load(Ordering::SeqCst) {
                            on_speech_end();
                        }
                    }
                }
            }

            debug!("VAD sampling loop exited");
        });

        *task = Some(handle);
    }

    /// Mute sampling without releasing the device
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.source.pause();
        debug!("VAD paused");
    }

    /// Resume sampling after a pause
    pub fn resume(&self) {
        self.source.resume();
        self.paused.store(false, Ordering::SeqCst);
        debug!("VAD resumed");
    }

    /// Stop sampling and release the device. Idempotent.
    ///
    /// The running flag is cleared before the task is aborted so no
    /// callback can fire once `stop` has returned.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
        self.source.close();
        info!("VAD stopped");
    }

    /// Whether the sampling task is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Generates a pure tone inside the speech band at a settable amplitude
    struct ToneSource {
        amplitude: StdMutex<f32>,
        paused: AtomicBool,
        open_calls: std::sync::atomic::AtomicU32,
    }

    impl ToneSource {
        fn new() -> Self {
            Self {
                amplitude: StdMutex::new(0.0),
                paused: AtomicBool::new(false),
                open_calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn set_amplitude(&self, amplitude: f32) {
            *self.amplitude.lock().unwrap() = amplitude;
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
            tone(n, amplitude, 16_000)
        }
        fn begin_capture(&self) {}
        fn take_capture(&self) -> Vec<f32> {
            Vec::new()
        }
        fn sample_rate(&self) -> u32 {
            16_000
        }
    }

    /// 125 Hz sine (inside the 85-255 Hz speech band at 16kHz/512 bins)
    fn tone(n: usize, amplitude: f32, sample_rate: u32) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                amplitude * (2.0 * PI * 125.0 * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_band_energy_of_silence() {
        let silence = vec![0.0f32; WINDOW_SIZE];
        assert_eq!(band_energy(&silence, 16_000), 0.0);
    }

    #[test]
    fn test_band_energy_tracks_amplitude() {
        let quiet = band_energy(&tone(WINDOW_SIZE, 0.1, 16_000), 16_000);
        let loud = band_energy(&tone(WINDOW_SIZE, 0.5, 16_000), 16_000);
        assert!(quiet > 0.05 && quiet < 0.2, "quiet={}", quiet);
        assert!(loud > 0.4 && loud < 0.6, "loud={}", loud);
    }

    #[test]
    fn test_band_energy_is_monotonic_in_amplitude() {
        let mut previous = 0.0f32;
        for step in 1..=10 {
            let amplitude = step as f32 / 10.0;
            let energy = band_energy(&tone(WINDOW_SIZE, amplitude, 16_000), 16_000);
            assert!(
                energy >= previous,
                "energy dropped from {} to {} at amplitude {}",
                previous,
                energy,
                amplitude
            );
            previous = energy;
        }
    }

    #[test]
    fn test_band_energy_ignores_out_of_band_tone() {
        // 4kHz is far above the speech band
        let high: Vec<f32> = (0..WINDOW_SIZE)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                0.8 * (2.0 * PI * 4000.0 * t).sin()
            })
            .collect();
        assert!(band_energy(&high, 16_000) < 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_raises_start_and_debounced_end() {
        let source = Arc::new(ToneSource::new());
        let config = VoiceConfig {
            silence_threshold: 0.15,
            silence_timeout_ms: 1200,
            ..Default::default()
        };
        let monitor = AudioEnergyMonitor::new(config, source.clone());
        monitor.init().unwrap();

        let events: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let starts = events.clone();
        let ends = events.clone();
        monitor.start(
            move || starts.lock().unwrap().push("start"),
            move || ends.lock().unwrap().push("end"),
        );

        // Speech for 500ms
        source.set_amplitude(0.5);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(events.lock().unwrap().as_slice(), &["start"]);

        // Brief dip shorter than the debounce must not end the turn
        source.set_amplitude(0.0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        source.set_amplitude(0.5);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(events.lock().unwrap().as_slice(), &["start"]);

        // Sustained silence past the debounce fires exactly one end
        source.set_amplitude(0.0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(events.lock().unwrap().as_slice(), &["start", "end"]);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_pause_suppresses_detection() {
        let source = Arc::new(ToneSource::new());
        let monitor = AudioEnergyMonitor::new(VoiceConfig::default(), source.clone());
        monitor.init().unwrap();

        let starts = Arc::new(StdMutex::new(0u32));
        let counter = starts.clone();
        monitor.start(move || *counter.lock().unwrap() += 1, || {});

        monitor.pause();
        source.set_amplitude(0.9);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*starts.lock().unwrap(), 0);

        monitor.resume();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*starts.lock().unwrap(), 1);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_no_callbacks_after_stop() {
        let source = Arc::new(ToneSource::new());
        let monitor = AudioEnergyMonitor::new(VoiceConfig::default(), source.clone());
        monitor.init().unwrap();

        let starts = Arc::new(StdMutex::new(0u32));
        let counter = starts.clone();
        monitor.start(move || *counter.lock().unwrap() += 1, || {});

        monitor.stop();
        assert!(!monitor.is_running());

        source.set_amplitude(0.9);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*starts.lock().unwrap(), 0);
    }
}
