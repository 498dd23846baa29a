//! PCM frames exchanged between audio threads, the gate, and the session

use std::sync::Arc;

/// Sample rate mandated by the realtime protocol (pcm16 in and out)
pub const PROTOCOL_SAMPLE_RATE: u32 = 24_000;

/// Sample rate expected by keyword scorers
pub const SCORER_SAMPLE_RATE: u32 = 16_000;

/// Frame duration used by the wake word gate
pub const GATE_FRAME_MS: u32 = 80;

/// Frame duration used by the session capture thread
pub const SESSION_FRAME_MS: u32 = 20;

/// Number of samples in a frame of `frame_ms` at `sample_rate`
#[must_use]
pub const fn samples_per_frame(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as usize * frame_ms as usize) / 1000
}

/// Fixed-size buffer of signed 16-bit mono samples tagged with its source rate
///
/// Immutable once produced. Cloning shares the sample buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Wrap samples captured at `sample_rate`
    #[must_use]
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// A frame of silence
    #[must_use]
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0; len], sample_rate)
    }

    /// Samples in this frame
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Source sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame duration in milliseconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn duration_ms(&self) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        ((self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)) as u32
    }

    /// Little-endian PCM16 bytes, as sent on the wire
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        samples_to_le_bytes(&self.samples)
    }
}

/// Encode samples as little-endian PCM16 bytes
#[must_use]
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian PCM16 bytes; a trailing odd byte is dropped
#[must_use]
pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert PCM16 to f32 in [-1.0, 1.0)
#[must_use]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// Convert f32 samples to PCM16 with clamping
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Scale samples by `volume` (clamped to 0.0..=1.0)
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn apply_volume(samples: &[i16], volume: f32) -> Vec<i16> {
    let volume = volume.clamp(0.0, 1.0);
    if (volume - 1.0).abs() < f32::EPSILON {
        return samples.to_vec();
    }
    samples
        .iter()
        .map(|&s| (f32::from(s) * volume) as i16)
        .collect()
}

/// RMS energy of PCM16 samples, normalised to [0, 1]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    rms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_per_frame() {
        assert_eq!(samples_per_frame(16_000, 80), 1280);
        assert_eq!(samples_per_frame(48_000, 20), 960);
        assert_eq!(samples_per_frame(44_100, 20), 882);
    }

    #[test]
    fn test_le_bytes_layout() {
        let bytes = samples_to_le_bytes(&[1, -2]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(le_bytes_to_samples(&[0x01, 0x00, 0xFE, 0xFF, 0x7F]), vec![1, -2]);
    }

    #[test]
    fn test_volume_scaling() {
        assert_eq!(apply_volume(&[1000, -1000], 0.5), vec![500, -500]);
        assert_eq!(apply_volume(&[1000], 3.0), vec![1000]);
        assert_eq!(apply_volume(&[1000], -1.0), vec![0]);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::silence(480, 24_000);
        assert_eq!(frame.duration_ms(), 20);
        assert_eq!(frame.len(), 480);
    }

    #[test]
    fn test_rms() {
        assert!(rms(&[0; 100]) < 0.001);
        assert!(rms(&[16384; 100]) > 0.49);
    }
}
