//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::device::OutputDevice;
use crate::{Error, Result};

/// Seconds of audio buffered ahead of the output callback
const BUFFER_SECS: usize = 2;

/// Speaker stream opened at a fixed sample rate
pub struct CpalOutput {
    _stream: Stream,
    buffer: Arc<Mutex<VecDeque<i16>>>,
    failed: Arc<AtomicBool>,
    capacity: usize,
    sample_rate: u32,
}

impl CpalOutput {
    /// Open `device` at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no config supports the rate or the stream cannot start
    pub fn open(device: &Device, sample_rate: u32) -> Result<Self> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
                    && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
            })
            .min_by_key(|c| c.channels())
            .ok_or_else(|| Error::Audio(format!("output does not support {sample_rate} Hz")))?;

        let sample_format = supported.sample_format();
        let config = supported.with_sample_rate(SampleRate(sample_rate)).config();

        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match sample_format {
            SampleFormat::I16 => build_stream::<i16>(device, &config, &buffer, &failed),
            SampleFormat::F32 => build_stream::<f32>(device, &config, &buffer, &failed),
            other => Err(Error::Audio(format!("unsupported sample format: {other:?}"))),
        }?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio playback started"
        );

        Ok(Self {
            _stream: stream,
            buffer,
            failed,
            capacity: sample_rate as usize * BUFFER_SECS,
            sample_rate,
        })
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or_default()
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        for chunk in samples.chunks((self.capacity / 4).max(1)) {
            while self.buffered() + chunk.len() > self.capacity {
                if self.failed.load(Ordering::Acquire) {
                    return Err(Error::Audio("output stream failed".to_string()));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            if let Ok(mut buf) = self.buffer.lock() {
                buf.extend(chunk.iter().copied());
            }
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        tracing::debug!(remaining = self.buffered(), "audio playback stopped");
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: &Arc<Mutex<VecDeque<i16>>>,
    failed: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = usize::from(config.channels.max(1));
    let buffer = Arc::clone(buffer);
    let failed = Arc::clone(failed);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let Ok(mut buf) = buffer.lock() else {
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = <T as FromSample<i16>>::from_sample_(buf.pop_front().unwrap_or(0));
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Find an output device by name substring, or the default output
///
/// # Errors
///
/// Returns error if no matching device exists
pub fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.contains(wanted)))
            .ok_or_else(|| Error::Audio(format!("no output device matching '{wanted}'"))),
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string())),
    }
}
