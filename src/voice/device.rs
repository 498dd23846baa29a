//! Audio device abstraction, sample rate negotiation, and the device lease
//!
//! The physical input device is shared between the wake word gate and the
//! assistant session. Ownership is expressed as a [`DeviceLease`]: a single,
//! non-cloneable token minted by a [`LeaseAuthority`]. Opening the input
//! device requires handing over the lease, and closing it hands it back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::frame::AudioFrame;
use crate::{Error, Result};

/// Blocking mono PCM16 input stream
pub trait InputDevice {
    /// Negotiated native sample rate
    fn sample_rate(&self) -> u32;

    /// Block until the next frame is available
    ///
    /// # Errors
    ///
    /// Returns error on a (possibly transient) read failure
    fn read_frame(&mut self) -> Result<AudioFrame>;
}

/// Blocking mono PCM16 output stream
pub trait OutputDevice {
    /// Negotiated native sample rate
    fn sample_rate(&self) -> u32;

    /// Queue samples for playback, blocking while the device buffer is full
    ///
    /// # Errors
    ///
    /// Returns error if the stream failed
    fn write(&mut self, samples: &[i16]) -> Result<()>;
}

/// Opens audio streams at a requested sample rate
///
/// Streams may be `!Send`: they are opened and used on the thread that owns
/// them and never cross thread boundaries.
pub trait AudioBackend: Send + Sync {
    /// Open the input device at exactly `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened at that rate
    fn open_input(&self, sample_rate: u32, frame_samples: usize) -> Result<Box<dyn InputDevice>>;

    /// Open the output device at exactly `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened at that rate
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>>;
}

/// Outcome of a successful rate negotiation
#[derive(Debug)]
pub struct Negotiated<T> {
    /// First candidate rate that opened
    pub rate: u32,
    /// Whatever the opener returned for that rate
    pub handle: T,
}

/// Try `candidates` in order and return the first rate `open` accepts
///
/// # Errors
///
/// Returns [`Error::DeviceUnavailable`] listing every rate tried when none open
pub fn negotiate_rate<T, F>(candidates: &[u32], mut open: F) -> Result<Negotiated<T>>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut tried = Vec::with_capacity(candidates.len());
    for &rate in candidates {
        tried.push(rate);
        match open(rate) {
            Ok(handle) => {
                tracing::debug!(rate, attempts = tried.len(), "sample rate negotiated");
                return Ok(Negotiated { rate, handle });
            }
            Err(e) => {
                tracing::debug!(rate, error = %e, "sample rate rejected");
            }
        }
    }
    Err(Error::DeviceUnavailable { tried })
}

/// Mints the single [`DeviceLease`] for one physical input device
#[derive(Debug, Clone, Default)]
pub struct LeaseAuthority {
    outstanding: Arc<AtomicBool>,
}

impl LeaseAuthority {
    /// Create an authority with no lease outstanding
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the lease, or `None` while one is still alive
    #[must_use]
    pub fn acquire(&self) -> Option<DeviceLease> {
        self.outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DeviceLease {
                outstanding: Arc::clone(&self.outstanding),
            })
    }

    /// Whether a lease is currently alive
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Exclusive ownership of the physical input device
///
/// Not `Clone`. Dropping the lease returns it to its authority, which is how
/// a component that died while holding it gets reset.
#[derive(Debug)]
pub struct DeviceLease {
    outstanding: Arc<AtomicBool>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.outstanding.store(false, Ordering::Release);
    }
}

/// An input device opened under a lease
pub struct LeasedInput {
    lease: DeviceLease,
    device: Box<dyn InputDevice>,
}

impl LeasedInput {
    /// Negotiate a rate from `candidates` and open the input device
    ///
    /// On failure the lease is handed back alongside the error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if no candidate rate opens
    pub fn open(
        backend: &dyn AudioBackend,
        lease: DeviceLease,
        candidates: &[u32],
        frame_ms: u32,
    ) -> std::result::Result<Self, (DeviceLease, Error)> {
        let negotiated = negotiate_rate(candidates, |rate| {
            backend.open_input(rate, super::frame::samples_per_frame(rate, frame_ms))
        });
        match negotiated {
            Ok(Negotiated { handle, .. }) => Ok(Self {
                lease,
                device: handle,
            }),
            Err(e) => Err((lease, e)),
        }
    }

    /// Negotiated native rate
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate()
    }

    /// Read the next frame
    ///
    /// # Errors
    ///
    /// Returns error on read failure
    pub fn read_frame(&mut self) -> Result<AudioFrame> {
        self.device.read_frame()
    }

    /// Close the stream and hand the lease back
    #[must_use]
    pub fn close(self) -> DeviceLease {
        let Self { lease, device } = self;
        drop(device);
        tracing::debug!("input device closed");
        lease
    }
}

/// Pause after a failed read before trying the device again
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Consecutive failed reads between repeated warnings
const READ_FAILURE_LOG_INTERVAL: u64 = 50;

/// Consecutive read failures of a blocking reader thread
///
/// A device that fails every read would otherwise spin its thread and flood
/// the log.
#[derive(Debug, Default)]
pub struct ReadFailures {
    consecutive: u64,
}

impl ReadFailures {
    /// Log the failure (the first and every 50th in a row) and pause
    pub fn record(&mut self, error: &Error) {
        self.consecutive += 1;
        if self.consecutive % READ_FAILURE_LOG_INTERVAL == 1 {
            tracing::warn!(error = %error, consecutive = self.consecutive, "input read failed");
        }
        std::thread::sleep(READ_RETRY_DELAY);
    }

    /// A read succeeded
    pub fn clear(&mut self) {
        if self.consecutive > 0 {
            tracing::debug!(failed = self.consecutive, "input reads recovered");
            self.consecutive = 0;
        }
    }

    /// Failures since the last successful read
    #[must_use]
    pub const fn consecutive(&self) -> u64 {
        self.consecutive
    }
}

/// Join an audio thread, giving up after `timeout`
///
/// Returns `None` if the thread is still running at the deadline (it is
/// detached) or if it panicked.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(
                thread = handle.thread().name().unwrap_or("unnamed"),
                "audio thread did not stop in time, detaching"
            );
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().map_or_else(
        |_| {
            tracing::error!("audio thread panicked");
            None
        },
        Some,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_failures_pause_and_reset() {
        let mut failures = ReadFailures::default();
        let error = Error::Audio("device gone".to_string());

        let started = Instant::now();
        for _ in 0..3 {
            failures.record(&error);
        }
        assert!(started.elapsed() >= READ_RETRY_DELAY * 3);
        assert_eq!(failures.consecutive(), 3);

        failures.clear();
        assert_eq!(failures.consecutive(), 0);
    }

    #[test]
    fn test_negotiate_first_success_wins() {
        let result = negotiate_rate(&[16_000, 48_000, 44_100], |rate| {
            if rate == 16_000 {
                Err(Error::Audio("unsupported".to_string()))
            } else {
                Ok(rate * 2)
            }
        })
        .unwrap();
        assert_eq!(result.rate, 48_000);
        assert_eq!(result.handle, 96_000);
    }

    #[test]
    fn test_negotiate_exhausted_reports_all_rates() {
        let result: Result<Negotiated<()>> =
            negotiate_rate(&[24_000, 48_000], |_| Err(Error::Audio("busy".to_string())));
        match result {
            Err(Error::DeviceUnavailable { tried }) => assert_eq!(tried, vec![24_000, 48_000]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_empty_candidates() {
        let result: Result<Negotiated<()>> = negotiate_rate(&[], |_| Ok(()));
        assert!(matches!(result, Err(Error::DeviceUnavailable { tried }) if tried.is_empty()));
    }

    #[test]
    fn test_join_with_timeout() {
        let done = std::thread::spawn(|| 7);
        assert_eq!(join_with_timeout(done, Duration::from_secs(1)), Some(7));

        let stuck = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(500)));
        assert!(join_with_timeout(stuck, Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_only_one_lease_alive() {
        let authority = LeaseAuthority::new();
        let lease = authority.acquire().unwrap();
        assert!(authority.is_leased());
        assert!(authority.acquire().is_none());

        drop(lease);
        assert!(!authority.is_leased());
        assert!(authority.acquire().is_some());
    }
}
