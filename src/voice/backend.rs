//! cpal-backed implementation of [`AudioBackend`]

use cpal::traits::{DeviceTrait, HostTrait};

use super::capture::{CpalInput, find_input_device};
use super::device::{AudioBackend, InputDevice, OutputDevice};
use super::playback::{CpalOutput, find_output_device};
use crate::{Error, Result};

/// Opens the system's audio devices through cpal
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_name: Option<String>,
    output_name: Option<String>,
}

impl CpalBackend {
    /// Use devices whose names contain the given substrings, or the defaults
    #[must_use]
    pub const fn new(input_name: Option<String>, output_name: Option<String>) -> Self {
        Self {
            input_name,
            output_name,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, sample_rate: u32, frame_samples: usize) -> Result<Box<dyn InputDevice>> {
        let device = find_input_device(self.input_name.as_deref())?;
        Ok(Box::new(CpalInput::open(&device, sample_rate, frame_samples)?))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>> {
        let device = find_output_device(self.output_name.as_deref())?;
        Ok(Box::new(CpalOutput::open(&device, sample_rate)?))
    }
}

/// Name and supported rate range of an audio device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name as reported by the host
    pub name: String,
    /// Lowest supported sample rate
    pub min_rate: u32,
    /// Highest supported sample rate
    pub max_rate: u32,
}

/// List input and output devices on the default host
///
/// # Errors
///
/// Returns error if the host cannot enumerate devices
pub fn list_devices() -> Result<(Vec<DeviceInfo>, Vec<DeviceInfo>)> {
    let host = cpal::default_host();

    let inputs = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?
        .map(|d| {
            let (min_rate, max_rate) = d
                .supported_input_configs()
                .map(|configs| rate_bounds(configs.map(|c| (c.min_sample_rate().0, c.max_sample_rate().0))))
                .unwrap_or_default();
            DeviceInfo {
                name: d.name().unwrap_or_default(),
                min_rate,
                max_rate,
            }
        })
        .collect();

    let outputs = host
        .output_devices()
        .map_err(|e| Error::Audio(e.to_string()))?
        .map(|d| {
            let (min_rate, max_rate) = d
                .supported_output_configs()
                .map(|configs| rate_bounds(configs.map(|c| (c.min_sample_rate().0, c.max_sample_rate().0))))
                .unwrap_or_default();
            DeviceInfo {
                name: d.name().unwrap_or_default(),
                min_rate,
                max_rate,
            }
        })
        .collect();

    Ok((inputs, outputs))
}

fn rate_bounds(ranges: impl Iterator<Item = (u32, u32)>) -> (u32, u32) {
    ranges.fold((0, 0), |(lo, hi), (min, max)| {
        let lo = if lo == 0 { min } else { lo.min(min) };
        (lo, hi.max(max))
    })
}
