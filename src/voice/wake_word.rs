//! Wake word gate
//!
//! Owns a listening loop on a dedicated thread that reads fixed-duration
//! frames from the input device, resamples them to the scorer's rate, and
//! scores them for keyword presence. A detection closes the device before
//! the [`DetectionEvent`] (which carries the [`DeviceLease`]) is delivered,
//! so nothing after the detecting frame is scored until the gate is resumed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc as async_mpsc;

use super::device::{AudioBackend, DeviceLease, LeasedInput, ReadFailures, join_with_timeout};
use super::frame::{GATE_FRAME_MS, SCORER_SAMPLE_RATE, rms, samples_per_frame};
use super::resample::StreamResampler;
use crate::{Error, Result};

/// How long `pause()` waits for the loop to hand the device back
const PAUSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded join on shutdown
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Scores are logged at debug level every this many frames
const DEBUG_SCORE_INTERVAL: u64 = 50;

/// Score for one configured keyword
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordScore {
    /// Keyword identifier (e.g. "`hey_jarvis`")
    pub keyword: String,
    /// Confidence in [0, 1]
    pub score: f32,
}

/// Keyword scoring model consumed by the gate
pub trait KeywordScorer: Send {
    /// Sample rate the scorer expects
    fn sample_rate(&self) -> u32 {
        SCORER_SAMPLE_RATE
    }

    /// Score a run of samples at [`KeywordScorer::sample_rate`]
    fn score(&mut self, samples: &[i16]) -> Vec<KeywordScore>;

    /// Forget any buffered context (called on resume)
    fn reset(&mut self) {}
}

/// Stand-in scorer that treats sustained loud speech as the keyword
///
/// Useful for bench testing without a keyword model: the score is the
/// quietest RMS across a short window, relative to `reference_rms`.
pub struct EnergyScorer {
    keyword: String,
    reference_rms: f32,
    window: VecDeque<f32>,
    window_len: usize,
}

impl EnergyScorer {
    /// Create a scorer reporting `keyword`
    #[must_use]
    pub fn new(keyword: impl Into<String>, reference_rms: f32, window_len: usize) -> Self {
        Self {
            keyword: keyword.into(),
            reference_rms: reference_rms.max(f32::EPSILON),
            window: VecDeque::with_capacity(window_len),
            window_len: window_len.max(1),
        }
    }
}

impl KeywordScorer for EnergyScorer {
    fn score(&mut self, samples: &[i16]) -> Vec<KeywordScore> {
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(rms(samples));

        let score = if self.window.len() < self.window_len {
            0.0
        } else {
            let quietest = self.window.iter().copied().fold(f32::MAX, f32::min);
            (quietest / self.reference_rms).clamp(0.0, 1.0)
        };

        vec![KeywordScore {
            keyword: self.keyword.clone(),
            score,
        }]
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// Gate tuning
#[derive(Debug, Clone)]
pub struct GateSettings {
    /// A keyword fires when its score exceeds this
    pub threshold: f32,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
    /// Audio discarded after a resume, in milliseconds
    pub cooldown_ms: u32,
    /// Native rates tried in order when opening the device
    pub candidate_rates: Vec<u32>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            frame_ms: GATE_FRAME_MS,
            cooldown_ms: 1000,
            candidate_rates: vec![16_000, 48_000, 44_100],
        }
    }
}

impl GateSettings {
    /// Frames discarded during a post-resume cooldown
    #[must_use]
    pub fn cooldown_frames(&self) -> u32 {
        if self.frame_ms == 0 {
            return 0;
        }
        self.cooldown_ms.div_ceil(self.frame_ms)
    }
}

/// A keyword crossed the detection threshold
///
/// Carries the device lease released by the gate; consuming the event is the
/// only way to get the lease back.
#[derive(Debug)]
pub struct DetectionEvent {
    /// Highest-scoring keyword
    pub keyword: String,
    /// Its score
    pub score: f32,
    /// When the detecting frame was scored
    pub timestamp: DateTime<Utc>,
    lease: DeviceLease,
}

impl DetectionEvent {
    /// Take the released device lease
    #[must_use]
    pub fn into_lease(self) -> DeviceLease {
        self.lease
    }
}

/// Events emitted by the gate loop
#[derive(Debug)]
pub enum GateEvent {
    /// Keyword detected; the gate is paused and the device closed
    Detected(DetectionEvent),
    /// The device could not be opened at any candidate rate
    Failed {
        /// Why opening failed
        error: Error,
        /// The lease the gate was given
        lease: DeviceLease,
    },
}

enum GateCommand {
    Pause {
        reply: mpsc::Sender<Option<DeviceLease>>,
    },
    Resume(DeviceLease),
    Stop,
}

/// Handle to the wake word listening loop
pub struct WakeWordGate {
    cmd_tx: mpsc::Sender<GateCommand>,
    paused: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Option<DeviceLease>>>,
}

impl WakeWordGate {
    /// Spawn the listening loop, opening the device under `lease`
    ///
    /// Detections and fatal device failures are sent on `events`.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start(
        settings: GateSettings,
        backend: Arc<dyn AudioBackend>,
        scorer: Box<dyn KeywordScorer>,
        lease: DeviceLease,
        events: async_mpsc::Sender<GateEvent>,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let paused = Arc::new(AtomicBool::new(true));

        let worker = GateWorker {
            settings,
            backend,
            scorer,
            events,
            cmd_rx,
            paused: Arc::clone(&paused),
            resampler: None,
            discard_remaining: 0,
            frames_scored: 0,
            read_failures: ReadFailures::default(),
        };

        let thread = thread::Builder::new()
            .name("visor-wake-word".into())
            .spawn(move || worker.run(lease))
            .map_err(|e| Error::Audio(format!("failed to spawn wake word thread: {e}")))?;

        tracing::info!("wake word gate started");

        Ok(Self {
            cmd_tx,
            paused,
            thread: Some(thread),
        })
    }

    /// Close the device and suspend scoring, returning the lease if held
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handoff`] if the loop does not release the device in time
    pub fn pause(&self) -> Result<Option<DeviceLease>> {
        let (reply, reply_rx) = mpsc::channel();
        self.cmd_tx
            .send(GateCommand::Pause { reply })
            .map_err(|_| Error::Handoff("wake word loop is not running".to_string()))?;
        reply_rx
            .recv_timeout(PAUSE_TIMEOUT)
            .map_err(|_| Error::Handoff("wake word loop did not release the device".to_string()))
    }

    /// Reopen the device under `lease`, discard a cooldown's worth of audio,
    /// then resume scoring
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handoff`] if the loop has exited; the lease is dropped
    /// back to its authority
    pub fn resume(&self, lease: DeviceLease) -> Result<()> {
        self.cmd_tx
            .send(GateCommand::Resume(lease))
            .map_err(|_| Error::Handoff("wake word loop is not running".to_string()))
    }

    /// Whether the loop is currently not scoring
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Terminate the loop, returning the lease if it was listening
    pub fn stop(mut self) -> Option<DeviceLease> {
        let _ = self.cmd_tx.send(GateCommand::Stop);
        let handle = self.thread.take()?;
        let lease = join_with_timeout(handle, STOP_TIMEOUT).flatten();
        tracing::info!("wake word gate stopped");
        lease
    }
}

impl Drop for WakeWordGate {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.cmd_tx.send(GateCommand::Stop);
        }
    }
}

struct GateWorker {
    settings: GateSettings,
    backend: Arc<dyn AudioBackend>,
    scorer: Box<dyn KeywordScorer>,
    events: async_mpsc::Sender<GateEvent>,
    cmd_rx: mpsc::Receiver<GateCommand>,
    paused: Arc<AtomicBool>,
    resampler: Option<StreamResampler>,
    discard_remaining: u32,
    frames_scored: u64,
    read_failures: ReadFailures,
}

impl GateWorker {
    fn run(mut self, lease: DeviceLease) -> Option<DeviceLease> {
        let mut input = self.open(lease, false);

        loop {
            let Some(mut live) = input.take() else {
                match self.cmd_rx.recv() {
                    Ok(GateCommand::Resume(lease)) => input = self.open(lease, true),
                    Ok(GateCommand::Pause { reply }) => {
                        let _ = reply.send(None);
                    }
                    Ok(GateCommand::Stop) | Err(_) => return None,
                }
                continue;
            };

            match self.cmd_rx.try_recv() {
                Ok(GateCommand::Pause { reply }) => {
                    self.paused.store(true, Ordering::Release);
                    let lease = live.close();
                    tracing::info!("wake word gate paused (device released)");
                    if let Err(mpsc::SendError(Some(lease))) = reply.send(Some(lease)) {
                        // Caller gave up waiting; keep listening
                        input = self.open(lease, true);
                    }
                    continue;
                }
                Ok(GateCommand::Resume(extra)) => {
                    tracing::warn!("resume requested while already listening, dropping extra lease");
                    drop(extra);
                }
                Ok(GateCommand::Stop) | Err(mpsc::TryRecvError::Disconnected) => {
                    self.paused.store(true, Ordering::Release);
                    return Some(live.close());
                }
                Err(mpsc::TryRecvError::Empty) => {}
            }

            match self.step(&mut live) {
                Ok(Some(best)) => {
                    self.read_failures.clear();
                    self.paused.store(true, Ordering::Release);
                    let lease = live.close();
                    tracing::info!(keyword = %best.keyword, score = best.score, "wake word detected");
                    let event = DetectionEvent {
                        keyword: best.keyword,
                        score: best.score,
                        timestamp: Utc::now(),
                        lease,
                    };
                    if self.events.blocking_send(GateEvent::Detected(event)).is_err() {
                        tracing::warn!("detection receiver dropped, stopping wake word loop");
                        return None;
                    }
                }
                Ok(None) => {
                    self.read_failures.clear();
                    input = Some(live);
                }
                Err(e) => {
                    self.read_failures.record(&e);
                    input = Some(live);
                }
            }
        }
    }

    fn open(&mut self, lease: DeviceLease, cooldown: bool) -> Option<LeasedInput> {
        let opened = LeasedInput::open(
            self.backend.as_ref(),
            lease,
            &self.settings.candidate_rates,
            self.settings.frame_ms,
        );

        let live = match opened {
            Ok(live) => live,
            Err((lease, error)) => {
                tracing::error!(error = %error, "wake word gate cannot open input device");
                self.paused.store(true, Ordering::Release);
                let _ = self.events.blocking_send(GateEvent::Failed { error, lease });
                return None;
            }
        };

        let native = live.sample_rate();
        let target = self.scorer.sample_rate();
        let chunk = samples_per_frame(native, self.settings.frame_ms);
        self.resampler = if native == target {
            None
        } else {
            match StreamResampler::new(native, target, chunk) {
                Ok(r) => Some(r),
                Err(error) => {
                    let lease = live.close();
                    self.paused.store(true, Ordering::Release);
                    let _ = self.events.blocking_send(GateEvent::Failed { error, lease });
                    return None;
                }
            }
        };

        self.scorer.reset();
        self.discard_remaining = if cooldown {
            self.settings.cooldown_frames()
        } else {
            0
        };
        self.paused.store(false, Ordering::Release);

        tracing::info!(
            native_rate = native,
            resample = self.resampler.is_some(),
            cooldown_frames = self.discard_remaining,
            threshold = self.settings.threshold,
            "wake word gate listening"
        );

        Some(live)
    }

    fn step(&mut self, live: &mut LeasedInput) -> Result<Option<KeywordScore>> {
        let frame = live.read_frame()?;

        if self.discard_remaining > 0 {
            self.discard_remaining -= 1;
            return Ok(None);
        }

        let samples = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(frame.samples())?,
            None => frame.samples().to_vec(),
        };
        if samples.is_empty() {
            return Ok(None);
        }

        let scores = self.scorer.score(&samples);
        self.frames_scored += 1;

        if self.frames_scored % DEBUG_SCORE_INTERVAL == 0 {
            tracing::debug!(frame = self.frames_scored, scores = ?scores, "wake word scores");
        }

        Ok(best_detection(scores, self.settings.threshold))
    }
}

/// Highest score strictly above `threshold`, if any
#[must_use]
pub fn best_detection(scores: Vec<KeywordScore>, threshold: f32) -> Option<KeywordScore> {
    scores
        .into_iter()
        .filter(|s| s.score > threshold)
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(keyword: &str, score: f32) -> KeywordScore {
        KeywordScore {
            keyword: keyword.to_string(),
            score,
        }
    }

    #[test]
    fn test_best_detection_picks_highest_above_threshold() {
        let best = best_detection(
            vec![score("alexa", 0.6), score("hey_jarvis", 0.92), score("ok_naomi", 0.1)],
            0.5,
        )
        .unwrap();
        assert_eq!(best.keyword, "hey_jarvis");
    }

    #[test]
    fn test_best_detection_threshold_is_exclusive() {
        assert!(best_detection(vec![score("hey_jarvis", 0.5)], 0.5).is_none());
        assert!(best_detection(vec![], 0.5).is_none());
    }

    #[test]
    fn test_energy_scorer_needs_sustained_energy() {
        let mut scorer = EnergyScorer::new("hey_jarvis", 0.06, 3);
        let loud = vec![8000i16; 1280];
        let quiet = vec![0i16; 1280];

        assert!(scorer.score(&loud)[0].score < f32::EPSILON);
        assert!(scorer.score(&loud)[0].score < f32::EPSILON);
        assert!(scorer.score(&loud)[0].score > 0.9);

        assert!(scorer.score(&quiet)[0].score < f32::EPSILON);
        scorer.reset();
        assert!(scorer.score(&loud)[0].score < f32::EPSILON);
    }

    #[test]
    fn test_cooldown_frames_rounds_up() {
        let settings = GateSettings {
            frame_ms: 80,
            cooldown_ms: 1000,
            ..GateSettings::default()
        };
        assert_eq!(settings.cooldown_frames(), 13);
    }
}
