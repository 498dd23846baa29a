//! TOML configuration file loading
//!
//! Supports `~/.config/visor/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VisorConfigFile {
    /// Realtime model connection and conversation settings
    #[serde(default)]
    pub realtime: RealtimeFileConfig,

    /// Wake word gate
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Session audio devices
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Dismissal handling
    #[serde(default)]
    pub dismissal: DismissalFileConfig,

    /// Reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Tool collaborators
    #[serde(default)]
    pub tools: ToolsFileConfig,
}

/// Realtime model configuration
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeFileConfig {
    /// WebSocket endpoint, without the model query
    pub url: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// API key (prefer `OPENAI_API_KEY`)
    pub api_key: Option<String>,

    /// Voice identifier (e.g. "alloy")
    pub voice: Option<String>,

    /// System instructions
    pub instructions: Option<String>,

    /// Instructions for the greeting turn
    pub greeting: Option<String>,

    /// Server VAD threshold
    pub vad_threshold: Option<f32>,

    /// Server VAD prefix padding
    pub prefix_padding_ms: Option<u32>,

    /// Server VAD silence duration
    pub silence_duration_ms: Option<u32>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Maximum tokens per response
    pub max_output_tokens: Option<u32>,

    /// Input transcription model (e.g. "whisper-1")
    pub transcription_model: Option<String>,

    /// Remote error codes that are only logged at debug level
    pub benign_error_codes: Option<Vec<String>>,

    /// Keepalive ping interval
    pub ping_interval_secs: Option<u64>,

    /// How long to wait for `session.updated`
    pub configure_timeout_secs: Option<u64>,

    /// How long to wait for the closing utterance
    pub flush_timeout_secs: Option<u64>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Keywords to listen for (e.g. `["hey_jarvis"]`)
    pub keywords: Option<Vec<String>>,

    /// Detection threshold (0.0-1.0)
    pub threshold: Option<f32>,

    /// Frame duration in milliseconds
    pub frame_ms: Option<u32>,

    /// Cooldown after a detection in milliseconds
    pub cooldown_ms: Option<u32>,

    /// Sample rates to try, in order
    pub sample_rates: Option<Vec<u32>>,

    /// Input device name substring
    pub device: Option<String>,
}

/// Session audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Input sample rates to try, in order
    pub input_rates: Option<Vec<u32>>,

    /// Output sample rates to try, in order
    pub output_rates: Option<Vec<u32>>,

    /// Output volume (0.0-1.0)
    pub volume: Option<f32>,

    /// Playback chunks buffered ahead of the device
    pub playback_queue: Option<usize>,

    /// Input device name substring
    pub input_device: Option<String>,

    /// Output device name substring
    pub output_device: Option<String>,

    /// Capture frame duration in milliseconds
    pub frame_ms: Option<u32>,
}

/// Dismissal configuration
#[derive(Debug, Default, Deserialize)]
pub struct DismissalFileConfig {
    /// Phrases that end a conversation
    pub phrases: Option<Vec<String>>,

    /// Closing words spoken before disconnecting
    pub acknowledgement: Option<String>,
}

/// Reconnect configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    /// Attempts before giving up
    pub max_retries: Option<u32>,

    /// First delay in seconds
    pub base_delay_secs: Option<u64>,

    /// Delay cap in seconds
    pub max_delay_secs: Option<u64>,
}

/// Tool configuration
#[derive(Debug, Default, Deserialize)]
pub struct ToolsFileConfig {
    /// Search provider ("brave" or "serper")
    pub search_provider: Option<String>,

    /// Search provider API key
    pub search_api_key: Option<String>,

    /// Per-call timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Recorder command, `{output}` is replaced by the file path
    pub recorder_command: Option<Vec<String>>,

    /// Directory for recordings
    pub recording_dir: Option<String>,
}

/// Parse a config file's contents
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config(content: &str) -> Result<VisorConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file
///
/// Reads `path` if given, otherwise the default location. Returns
/// `VisorConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> VisorConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return VisorConfigFile::default();
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return VisorConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VisorConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VisorConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/visor/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("visor").join("config.toml"))
}
