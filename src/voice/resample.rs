//! Sample rate conversion between device-native and protocol rates

use rubato::{FftFixedIn, Resampler as _};

use super::frame::{f32_to_i16, i16_to_f32};
use crate::{Error, Result};

/// Default number of input samples handed to the FFT resampler per pass
const DEFAULT_CHUNK: usize = 1024;

/// Stateful mono resampler for a continuous PCM16 stream
///
/// Input is buffered until a full resampler chunk is available, so output
/// lags input by at most one chunk. When both rates match the stream is
/// passed through untouched.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    from_rate: u32,
    to_rate: u32,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler converting `from_rate` to `to_rate`
    ///
    /// `chunk` is the preferred number of input samples per pass, usually
    /// one frame at `from_rate`.
    ///
    /// # Errors
    ///
    /// Returns error if either rate is zero or rubato rejects the ratio
    pub fn new(from_rate: u32, to_rate: u32, chunk: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(Error::Resample(
                "sample rates must be greater than 0".to_string(),
            ));
        }

        let inner = if from_rate == to_rate {
            None
        } else {
            let chunk = if chunk == 0 { DEFAULT_CHUNK } else { chunk };
            let resampler = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                chunk,
                2,
                1,
            )
            .map_err(|e| Error::Resample(e.to_string()))?;
            Some(resampler)
        };

        tracing::debug!(from_rate, to_rate, passthrough = inner.is_none(), "resampler created");

        Ok(Self {
            inner,
            from_rate,
            to_rate,
            pending: Vec::new(),
        })
    }

    /// Whether this resampler converts at all
    #[must_use]
    pub const fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Input sample rate
    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Output sample rate
    #[must_use]
    pub const fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Output samples of latency before the first converted input sample
    #[must_use]
    pub fn output_delay(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.output_delay())
    }

    /// Feed samples, returning whatever converted output is ready
    ///
    /// # Errors
    ///
    /// Returns error if the underlying resampler fails
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend(i16_to_f32(samples));

        let mut output = Vec::new();
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let converted = inner
                .process(&[&self.pending[..needed]], None)
                .map_err(|e| Error::Resample(e.to_string()))?;
            if let Some(channel) = converted.first() {
                output.extend(f32_to_i16(channel));
            }
            self.pending.drain(..needed);
        }

        Ok(output)
    }

    /// Push buffered input through by padding with silence
    ///
    /// # Errors
    ///
    /// Returns error if the underlying resampler fails
    pub fn flush(&mut self) -> Result<Vec<i16>> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let needed = inner.input_frames_next();
        let padding = needed.saturating_sub(self.pending.len());
        self.process(&vec![0; padding])
    }

    /// Drop buffered input
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

/// Resample a complete buffer in one pass
///
/// The resampler's leading latency is trimmed and the output holds exactly
/// `ceil(len * to_rate / from_rate)` samples.
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>> {
    let mut resampler = StreamResampler::new(from_rate, to_rate, DEFAULT_CHUNK)?;
    if resampler.is_passthrough() || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = resampled_len(samples.len(), from_rate, to_rate)?;
    let delay = resampler.output_delay();

    let mut output = resampler.process(samples)?;
    let silence = vec![0; DEFAULT_CHUNK];
    while output.len() < delay + expected {
        output.extend(resampler.process(&silence)?);
    }
    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}

fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> Result<usize> {
    let overflow = || Error::Resample(format!("{len} samples is too long to resample"));
    let scaled = u64::try_from(len)
        .ok()
        .and_then(|len| len.checked_mul(u64::from(to_rate)))
        .ok_or_else(overflow)?;
    usize::try_from(scaled.div_ceil(u64::from(from_rate))).map_err(|_| overflow())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut resampler = StreamResampler::new(24_000, 24_000, 480).unwrap();
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_one_shot_length_is_exact() {
        // 480 samples is 10 ms at 48 kHz
        let frame: Vec<i16> = (0..480).map(|i| i16::try_from(i % 200).unwrap()).collect();
        assert_eq!(resample(&frame, 48_000, 16_000).unwrap().len(), 160);
        assert_eq!(resample(&frame, 16_000, 48_000).unwrap().len(), 1440);
        assert_eq!(resample(&frame, 44_100, 24_000).unwrap().len(), 262);
        assert!(resample(&[], 48_000, 16_000).unwrap().is_empty());
    }

    #[test]
    fn test_one_shot_trims_latency() {
        // A lone impulse stays near the start instead of shifting by the delay
        let mut impulse = vec![0i16; 4800];
        impulse[0] = i16::MAX;
        let output = resample(&impulse, 48_000, 16_000).unwrap();
        let peak = output
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.unsigned_abs())
            .map(|(i, _)| i)
            .unwrap();
        assert!(peak < 16, "peak at {peak}");
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(StreamResampler::new(0, 16_000, 1024).is_err());
    }

    #[test]
    fn test_streaming_output_length_tracks_ratio() {
        let mut resampler = StreamResampler::new(48_000, 16_000, 960).unwrap();
        let frame = vec![0i16; 960];
        let mut total = 0;
        for _ in 0..50 {
            total += resampler.process(&frame).unwrap().len();
        }
        // 50 frames of 960 at 48k is 16000 samples at 16k, minus at most one chunk of latency
        assert!(total <= 16_000);
        assert!(total >= 16_000 - 960);
    }
}
