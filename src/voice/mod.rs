//! Voice processing module
//!
//! Handles device negotiation, audio capture and playback, resampling, and
//! wake word detection. The physical microphone is shared through a single
//! [`DeviceLease`].

mod backend;
mod capture;
mod device;
mod frame;
mod playback;
mod resample;
mod wake_word;
mod wav;

pub use backend::{CpalBackend, DeviceInfo, list_devices};
pub use capture::{CpalInput, find_input_device};
pub use device::{
    AudioBackend, DeviceLease, InputDevice, LeaseAuthority, LeasedInput, Negotiated, OutputDevice,
    READ_RETRY_DELAY, ReadFailures, join_with_timeout, negotiate_rate,
};
pub use frame::{
    AudioFrame, GATE_FRAME_MS, PROTOCOL_SAMPLE_RATE, SCORER_SAMPLE_RATE, SESSION_FRAME_MS,
    apply_volume, f32_to_i16, i16_to_f32, le_bytes_to_samples, rms, samples_per_frame,
    samples_to_le_bytes,
};
pub use playback::{CpalOutput, find_output_device};
pub use resample::{StreamResampler, resample};
pub use wake_word::{
    DetectionEvent, EnergyScorer, GateEvent, GateSettings, KeywordScore, KeywordScorer,
    WakeWordGate, best_detection,
};
pub use wav::samples_to_wav;
