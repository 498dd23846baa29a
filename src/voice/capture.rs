//! Audio capture from microphone

use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::device::InputDevice;
use super::frame::AudioFrame;
use crate::{Error, Result};

/// Raw callback buffers queued between the cpal callback and the reader
const CALLBACK_QUEUE_DEPTH: usize = 64;

/// How long `read_frame` waits for audio before reporting a transient error
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Microphone stream opened at a fixed sample rate
pub struct CpalInput {
    _stream: Stream,
    rx: mpsc::Receiver<Vec<i16>>,
    pending: Vec<i16>,
    frame_samples: usize,
    sample_rate: u32,
}

impl CpalInput {
    /// Open `device` at `sample_rate`, delivering frames of `frame_samples`
    ///
    /// # Errors
    ///
    /// Returns error if no mono-capable config supports the rate or the
    /// stream cannot be started
    pub fn open(device: &Device, sample_rate: u32, frame_samples: usize) -> Result<Self> {
        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
                    && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
            })
            .min_by_key(|c| c.channels())
            .ok_or_else(|| Error::Audio(format!("input does not support {sample_rate} Hz")))?;

        let sample_format = supported.sample_format();
        let config = supported.with_sample_rate(SampleRate(sample_rate)).config();
        let (tx, rx) = mpsc::sync_channel(CALLBACK_QUEUE_DEPTH);

        let stream = match sample_format {
            SampleFormat::I16 => build_stream::<i16>(device, &config, tx, |s| s),
            SampleFormat::F32 => build_stream::<f32>(device, &config, tx, |s| {
                #[allow(clippy::cast_possible_truncation)]
                let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                v
            }),
            other => Err(Error::Audio(format!("unsupported sample format: {other:?}"))),
        }?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            frame_samples,
            "audio capture started"
        );

        Ok(Self {
            _stream: stream,
            rx,
            pending: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            sample_rate,
        })
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frame(&mut self) -> Result<AudioFrame> {
        while self.pending.len() < self.frame_samples {
            let chunk = self.rx.recv_timeout(READ_TIMEOUT).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => Error::Audio("input read timed out".to_string()),
                mpsc::RecvTimeoutError::Disconnected => Error::Audio("input stream closed".to_string()),
            })?;
            self.pending.extend(chunk);
        }
        let rest = self.pending.split_off(self.frame_samples);
        let frame = std::mem::replace(&mut self.pending, rest);
        Ok(AudioFrame::new(frame, self.sample_rate))
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        tracing::debug!("audio capture stopped");
    }
}

fn build_stream<T: SizedSample + Send + 'static>(
    device: &Device,
    config: &StreamConfig,
    tx: mpsc::SyncSender<Vec<i16>>,
    convert: fn(T) -> i16,
) -> Result<Stream> {
    let channels = usize::from(config.channels.max(1));
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: i32 = frame.iter().map(|&s| i32::from(convert(s))).sum();
                        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                        let avg = (sum / channels as i32) as i16;
                        avg
                    })
                    .collect();
                // Reader fell behind: drop rather than block the audio callback
                let _ = tx.try_send(mono);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Find an input device by name substring, or the default input
///
/// # Errors
///
/// Returns error if no matching device exists
pub fn find_input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.contains(wanted)))
            .ok_or_else(|| Error::Audio(format!("no input device matching '{wanted}'"))),
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string())),
    }
}
