//! Session capture and playback threads
//!
//! Each thread opens its own device (streams never cross threads) and
//! reports the outcome of opening through a one-shot init channel before
//! entering its loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc as async_mpsc;

use crate::voice::{
    AudioBackend, AudioFrame, DeviceLease, LeasedInput, PROTOCOL_SAMPLE_RATE, ReadFailures,
    StreamResampler, apply_volume, join_with_timeout, negotiate_rate, samples_per_frame,
};
use crate::{Error, Result};

const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default wait for the capture thread in [`CaptureWorker::stop`]
pub const CAPTURE_STOP_TIMEOUT: Duration = JOIN_TIMEOUT;

/// Capture could not start
#[derive(Debug)]
pub struct CaptureFailure {
    /// The lease, unless it was lost with a crashed thread
    pub lease: Option<DeviceLease>,
    /// What went wrong
    pub error: Error,
}

/// How capture ended
#[derive(Debug)]
pub enum CaptureStop {
    /// The thread closed the device and handed the lease back
    Released(DeviceLease),
    /// The thread ended without the lease (it panicked); the lease went
    /// back to its authority
    Lost,
    /// The thread is still inside a device call and holds the lease until
    /// it returns
    Stalled(thread::JoinHandle<Option<DeviceLease>>),
}

impl CaptureStop {
    /// Block until a stalled thread exits; other outcomes return at once
    #[must_use]
    pub fn wait(self) -> Option<DeviceLease> {
        match self {
            Self::Released(lease) => Some(lease),
            Self::Lost => None,
            Self::Stalled(handle) => handle.join().ok().flatten(),
        }
    }
}

/// Microphone capture thread owning the leased input device
///
/// Frames are resampled to the protocol rate and offered to the session
/// without blocking; when the session falls behind they are dropped.
pub struct CaptureWorker {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Option<DeviceLease>>>,
    native_rate: u32,
}

impl CaptureWorker {
    /// Open the input under `lease` and start capturing
    ///
    /// # Errors
    ///
    /// Returns the lease alongside the error if the device does not open at
    /// any candidate rate
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        lease: DeviceLease,
        candidates: Vec<u32>,
        frame_ms: u32,
        frames: async_mpsc::Sender<AudioFrame>,
    ) -> std::result::Result<Self, CaptureFailure> {
        let running = Arc::new(AtomicBool::new(true));
        let (lease_tx, lease_rx) = mpsc::sync_channel::<DeviceLease>(1);
        let (init_tx, init_rx) = mpsc::sync_channel(1);

        let thread_running = Arc::clone(&running);
        let spawned = thread::Builder::new()
            .name("visor-capture".into())
            .spawn(move || {
                let lease = lease_rx.recv().ok()?;
                match LeasedInput::open(backend.as_ref(), lease, &candidates, frame_ms) {
                    Ok(input) => {
                        let _ = init_tx.send(Ok(input.sample_rate()));
                        capture_loop(input, frame_ms, &thread_running, &frames)
                    }
                    Err((lease, error)) => {
                        let _ = init_tx.send(Err((lease, error)));
                        None
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return Err(CaptureFailure {
                    lease: Some(lease),
                    error: Error::Audio(format!("failed to spawn capture thread: {e}")),
                });
            }
        };

        if let Err(mpsc::SendError(lease)) = lease_tx.send(lease) {
            return Err(CaptureFailure {
                lease: Some(lease),
                error: Error::Audio("capture thread exited early".to_string()),
            });
        }

        match init_rx.recv() {
            Ok(Ok(native_rate)) => {
                tracing::info!(native_rate, "session capture started");
                Ok(Self {
                    running,
                    thread: Some(handle),
                    native_rate,
                })
            }
            Ok(Err((lease, error))) => {
                let _ = join_with_timeout(handle, JOIN_TIMEOUT);
                Err(CaptureFailure {
                    lease: Some(lease),
                    error,
                })
            }
            Err(_) => Err(CaptureFailure {
                lease: None,
                error: Error::Handoff("capture thread died while opening the device".to_string()),
            }),
        }
    }

    /// Negotiated native input rate
    #[must_use]
    pub const fn native_rate(&self) -> u32 {
        self.native_rate
    }

    /// Stop capturing, waiting up to `timeout` for the lease
    pub fn stop(mut self, timeout: Duration) -> CaptureStop {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.thread.take() else {
            return CaptureStop::Lost;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    timeout_ms = timeout.as_millis(),
                    "capture thread still reading, it keeps the lease until it exits"
                );
                return CaptureStop::Stalled(handle);
            }
            thread::sleep(Duration::from_millis(10));
        }

        match handle.join() {
            Ok(Some(lease)) => {
                tracing::info!("session capture stopped");
                CaptureStop::Released(lease)
            }
            Ok(None) => CaptureStop::Lost,
            Err(_) => {
                tracing::error!("capture thread panicked");
                CaptureStop::Lost
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn capture_loop(
    mut input: LeasedInput,
    frame_ms: u32,
    running: &AtomicBool,
    frames: &async_mpsc::Sender<AudioFrame>,
) -> Option<DeviceLease> {
    let native = input.sample_rate();
    let chunk = samples_per_frame(native, frame_ms);
    let mut resampler = match StreamResampler::new(native, PROTOCOL_SAMPLE_RATE, chunk) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "capture resampler unavailable");
            return Some(input.close());
        }
    };
    let mut dropped: u64 = 0;
    let mut failures = ReadFailures::default();

    while running.load(Ordering::Acquire) {
        let frame = match input.read_frame() {
            Ok(frame) => {
                failures.clear();
                frame
            }
            Err(e) => {
                failures.record(&e);
                continue;
            }
        };

        let samples = match resampler.process(frame.samples()) {
            Ok(samples) if samples.is_empty() => continue,
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(error = %e, "capture resample failed");
                continue;
            }
        };

        match frames.try_send(AudioFrame::new(samples, PROTOCOL_SAMPLE_RATE)) {
            Ok(()) => {}
            Err(async_mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 50 == 1 {
                    tracing::debug!(dropped, "session not draining microphone frames");
                }
            }
            Err(async_mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    Some(input.close())
}

/// Speaker playback thread fed through a bounded queue
///
/// Queued audio is at the protocol rate; the thread resamples it to the
/// negotiated output rate, scales it by the volume, and writes it out.
pub struct PlaybackWorker {
    tx: Option<mpsc::SyncSender<Vec<i16>>>,
    thread: Option<thread::JoinHandle<()>>,
    native_rate: u32,
}

impl PlaybackWorker {
    /// Open the output at the first candidate rate that works
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if no candidate rate opens
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        candidates: Vec<u32>,
        volume: f32,
        queue_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Vec<i16>>(queue_depth.max(1));
        let (init_tx, init_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("visor-playback".into())
            .spawn(move || {
                let opened = negotiate_rate(&candidates, |rate| backend.open_output(rate));
                let mut output = match opened {
                    Ok(negotiated) => {
                        let _ = init_tx.send(Ok(negotiated.rate));
                        negotiated.handle
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                let native = output.sample_rate();
                let mut resampler = match StreamResampler::new(PROTOCOL_SAMPLE_RATE, native, 480) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(error = %e, "playback resampler unavailable");
                        return;
                    }
                };

                while let Ok(chunk) = rx.recv() {
                    match resampler.process(&chunk) {
                        Ok(samples) if !samples.is_empty() => {
                            if let Err(e) = output.write(&apply_volume(&samples, volume)) {
                                tracing::error!(error = %e, "speaker write failed");
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "playback resample failed"),
                    }
                }

                if let Ok(tail) = resampler.flush() {
                    let _ = output.write(&apply_volume(&tail, volume));
                }
            })
            .map_err(|e| Error::Audio(format!("failed to spawn playback thread: {e}")))?;

        match init_rx.recv() {
            Ok(Ok(native_rate)) => {
                tracing::info!(native_rate, volume, "session playback started");
                Ok(Self {
                    tx: Some(tx),
                    thread: Some(handle),
                    native_rate,
                })
            }
            Ok(Err(e)) => {
                let _ = join_with_timeout(handle, JOIN_TIMEOUT);
                Err(e)
            }
            Err(_) => Err(Error::Audio("playback thread died while opening the device".to_string())),
        }
    }

    /// Negotiated native output rate
    #[must_use]
    pub const fn native_rate(&self) -> u32 {
        self.native_rate
    }

    /// Queue protocol-rate samples without blocking
    ///
    /// Returns `false` if the chunk was dropped because the queue is full
    /// or the thread has exited.
    pub fn enqueue(&self, samples: Vec<i16>) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(samples) {
            Ok(()) => true,
            Err(mpsc::TrySendError::Full(_)) => {
                tracing::warn!("playback queue full, dropping audio");
                false
            }
            Err(mpsc::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Let queued audio drain, then close the output
    pub fn stop(mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = join_with_timeout(handle, JOIN_TIMEOUT);
        }
        tracing::info!("session playback stopped");
    }
}

impl Drop for PlaybackWorker {
    fn drop(&mut self) {
        self.tx.take();
    }
}
