//! Configuration management for the visor assistant
//!
//! Every value resolves as environment variable > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::session::{Backoff, DEFAULT_DISMISSAL_PHRASES, SessionSettings};
use crate::tools::SearchProvider;
use crate::voice::{GATE_FRAME_MS, GateSettings, SESSION_FRAME_MS};
use crate::{Error, Result};

use self::file::VisorConfigFile;

const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Visor assistant configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Realtime model connection and conversation settings
    pub realtime: RealtimeConfig,

    /// Wake word gate
    pub wake: WakeConfig,

    /// Session audio devices
    pub audio: AudioConfig,

    /// Dismissal handling
    pub dismissal: DismissalConfig,

    /// Reconnect policy
    pub reconnect: ReconnectConfig,

    /// Tool collaborators
    pub tools: ToolsConfig,
}

/// Realtime model configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, without the model query
    pub url: String,

    /// Model identifier
    pub model: String,

    /// API key (from `OPENAI_API_KEY` env)
    pub api_key: Option<SecretString>,

    /// Voice identifier
    pub voice: String,

    /// System instructions
    pub instructions: String,

    /// Instructions for the greeting turn
    pub greeting: String,

    /// Server VAD threshold
    pub vad_threshold: f32,

    /// Server VAD prefix padding
    pub prefix_padding_ms: u32,

    /// Server VAD silence duration
    pub silence_duration_ms: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum tokens per response
    pub max_output_tokens: u32,

    /// Input transcription model
    pub transcription_model: String,

    /// Remote error codes only logged at debug level
    pub benign_error_codes: Vec<String>,

    /// Keepalive ping interval
    pub ping_interval: Duration,

    /// How long to wait for `session.updated`
    pub configure_timeout: Duration,

    /// How long to wait for the closing utterance
    pub flush_timeout: Duration,
}

impl RealtimeConfig {
    /// Full endpoint including the model query
    #[must_use]
    pub fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}model={}", self.url, self.model)
    }
}

/// Wake word configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Keywords listened for
    pub keywords: Vec<String>,

    /// Detection threshold
    pub threshold: f32,

    /// Frame duration in milliseconds
    pub frame_ms: u32,

    /// Cooldown after a detection in milliseconds
    pub cooldown_ms: u32,

    /// Sample rates to try, in order
    pub sample_rates: Vec<u32>,

    /// Input device name substring
    pub device: Option<String>,
}

impl WakeConfig {
    /// Settings for the wake word gate
    #[must_use]
    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            threshold: self.threshold,
            frame_ms: self.frame_ms,
            cooldown_ms: self.cooldown_ms,
            candidate_rates: self.sample_rates.clone(),
        }
    }
}

/// Session audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Input sample rates to try, in order
    pub input_rates: Vec<u32>,

    /// Output sample rates to try, in order
    pub output_rates: Vec<u32>,

    /// Output volume, clamped to 0.0-1.0
    pub volume: f32,

    /// Playback chunks buffered ahead of the device
    pub playback_queue: usize,

    /// Input device name substring
    pub input_device: Option<String>,

    /// Output device name substring
    pub output_device: Option<String>,

    /// Capture frame duration in milliseconds
    pub frame_ms: u32,
}

/// Dismissal configuration
#[derive(Debug, Clone)]
pub struct DismissalConfig {
    /// Phrases that end a conversation
    pub phrases: Vec<String>,

    /// Closing words spoken before disconnecting
    pub acknowledgement: String,
}

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts before giving up
    pub max_retries: u32,

    /// First delay
    pub base_delay: Duration,

    /// Delay cap
    pub max_delay: Duration,
}

impl ReconnectConfig {
    /// Fresh backoff policy
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(self.max_retries, self.base_delay, self.max_delay)
    }
}

/// Tool configuration
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Web search provider, if a key is configured
    pub search: Option<SearchProvider>,

    /// Per-call timeout
    pub timeout: Duration,

    /// Recorder command, `{output}` is replaced by the file path
    pub recorder_command: Option<Vec<String>>,

    /// Directory for recordings
    pub recording_dir: PathBuf,
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides the default `~/.config/visor/config.toml`.
    #[must_use]
    pub fn load(path: Option<&Path>) -> Self {
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: VisorConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = SessionSettings::default();
        let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<f32>().ok());

        let rt = fc.realtime;
        let realtime = RealtimeConfig {
            url: env("VISOR_REALTIME_URL")
                .or(rt.url)
                .unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string()),
            model: env("VISOR_MODEL")
                .or(rt.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: env("OPENAI_API_KEY")
                .or(rt.api_key)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            voice: env("VISOR_VOICE").or(rt.voice).unwrap_or(defaults.voice),
            instructions: env("VISOR_INSTRUCTIONS")
                .or(rt.instructions)
                .unwrap_or(defaults.instructions),
            greeting: rt.greeting.unwrap_or(defaults.greeting),
            vad_threshold: rt.vad_threshold.unwrap_or(defaults.vad_threshold),
            prefix_padding_ms: rt.prefix_padding_ms.unwrap_or(defaults.prefix_padding_ms),
            silence_duration_ms: rt
                .silence_duration_ms
                .unwrap_or(defaults.silence_duration_ms),
            temperature: rt.temperature.unwrap_or(defaults.temperature),
            max_output_tokens: rt.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            transcription_model: rt
                .transcription_model
                .unwrap_or(defaults.transcription_model),
            benign_error_codes: rt
                .benign_error_codes
                .unwrap_or(defaults.benign_error_codes),
            ping_interval: rt
                .ping_interval_secs
                .map_or(defaults.ping_interval, Duration::from_secs),
            configure_timeout: rt
                .configure_timeout_secs
                .map_or(defaults.configure_timeout, Duration::from_secs),
            flush_timeout: rt
                .flush_timeout_secs
                .map_or(defaults.flush_timeout, Duration::from_secs),
        };

        let gate_defaults = GateSettings::default();
        let wk = fc.wake;
        let wake = WakeConfig {
            keywords: env("VISOR_WAKE_KEYWORDS")
                .map(|s| split_list(&s))
                .or(wk.keywords)
                .unwrap_or_else(|| vec!["hey_jarvis".to_string()]),
            threshold: parsed("VISOR_WAKE_THRESHOLD")
                .or(wk.threshold)
                .unwrap_or(gate_defaults.threshold),
            frame_ms: wk.frame_ms.unwrap_or(GATE_FRAME_MS),
            cooldown_ms: wk.cooldown_ms.unwrap_or(gate_defaults.cooldown_ms),
            sample_rates: wk.sample_rates.unwrap_or(gate_defaults.candidate_rates),
            device: env("VISOR_INPUT_DEVICE").or(wk.device),
        };

        let au = fc.audio;
        let audio = AudioConfig {
            input_rates: au.input_rates.unwrap_or(defaults.input_rates),
            output_rates: au.output_rates.unwrap_or(defaults.output_rates),
            volume: parsed("VISOR_VOLUME")
                .or(au.volume)
                .unwrap_or(defaults.output_volume)
                .clamp(0.0, 1.0),
            playback_queue: au.playback_queue.unwrap_or(defaults.playback_queue),
            input_device: env("VISOR_INPUT_DEVICE").or(au.input_device),
            output_device: env("VISOR_OUTPUT_DEVICE").or(au.output_device),
            frame_ms: au.frame_ms.unwrap_or(SESSION_FRAME_MS),
        };

        let dismissal = DismissalConfig {
            phrases: fc.dismissal.phrases.unwrap_or_else(|| {
                DEFAULT_DISMISSAL_PHRASES
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }),
            acknowledgement: fc
                .dismissal
                .acknowledgement
                .unwrap_or(defaults.acknowledgement),
        };

        let default_backoff = ReconnectConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        let rc = fc.reconnect;
        let reconnect = ReconnectConfig {
            max_retries: rc.max_retries.unwrap_or(default_backoff.max_retries),
            base_delay: rc
                .base_delay_secs
                .map_or(default_backoff.base_delay, Duration::from_secs),
            max_delay: rc
                .max_delay_secs
                .map_or(default_backoff.max_delay, Duration::from_secs),
        };

        let tc = fc.tools;
        let search = resolve_search_provider(
            env("VISOR_SEARCH_PROVIDER").or(tc.search_provider),
            env("BRAVE_API_KEY"),
            env("SERPER_API_KEY"),
            tc.search_api_key,
        );
        let tools = ToolsConfig {
            search,
            timeout: Duration::from_secs(tc.timeout_secs.unwrap_or(10)),
            recorder_command: env("VISOR_RECORDER_COMMAND")
                .map(|s| s.split_whitespace().map(ToString::to_string).collect())
                .or(tc.recorder_command)
                .filter(|c: &Vec<String>| !c.is_empty()),
            recording_dir: env("VISOR_RECORDING_DIR")
                .or(tc.recording_dir)
                .map_or_else(default_recording_dir, PathBuf::from),
        };

        Self {
            realtime,
            wake,
            audio,
            dismissal,
            reconnect,
            tools,
        }
    }

    /// Check the values needed to run the assistant
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.realtime.api_key.is_none() {
            return Err(Error::Config(
                "OPENAI_API_KEY is not set (env or [realtime] api_key)".to_string(),
            ));
        }
        if self.wake.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(Error::Config("no wake keywords configured".to_string()));
        }
        if !(0.0..=1.0).contains(&self.wake.threshold) {
            return Err(Error::Config(format!(
                "wake threshold {} is outside 0.0-1.0",
                self.wake.threshold
            )));
        }
        if self.wake.frame_ms == 0 || self.audio.frame_ms == 0 {
            return Err(Error::Config("frame duration must be non-zero".to_string()));
        }
        for (name, rates) in [
            ("wake sample_rates", &self.wake.sample_rates),
            ("audio input_rates", &self.audio.input_rates),
            ("audio output_rates", &self.audio.output_rates),
        ] {
            if rates.is_empty() || rates.contains(&0) {
                return Err(Error::Config(format!("{name} must list non-zero rates")));
            }
        }
        Ok(())
    }

    /// Settings for the assistant session
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        let rt = &self.realtime;
        SessionSettings {
            instructions: rt.instructions.clone(),
            voice: rt.voice.clone(),
            greeting: rt.greeting.clone(),
            acknowledgement: self.dismissal.acknowledgement.clone(),
            vad_threshold: rt.vad_threshold,
            prefix_padding_ms: rt.prefix_padding_ms,
            silence_duration_ms: rt.silence_duration_ms,
            temperature: rt.temperature,
            max_output_tokens: rt.max_output_tokens,
            transcription_model: rt.transcription_model.clone(),
            benign_error_codes: rt.benign_error_codes.clone(),
            dismissal_phrases: self.dismissal.phrases.clone(),
            ping_interval: rt.ping_interval,
            configure_timeout: rt.configure_timeout,
            flush_timeout: rt.flush_timeout,
            backoff: self.reconnect.backoff(),
            input_rates: self.audio.input_rates.clone(),
            output_rates: self.audio.output_rates.clone(),
            frame_ms: self.audio.frame_ms,
            output_volume: self.audio.volume,
            playback_queue: self.audio.playback_queue,
            ..SessionSettings::default()
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Pick the search provider: an explicit name wins, otherwise whichever
/// provider has a key in the environment
fn resolve_search_provider(
    name: Option<String>,
    brave_key: Option<String>,
    serper_key: Option<String>,
    file_key: Option<String>,
) -> Option<SearchProvider> {
    let name = name.map(|n| n.trim().to_lowercase());
    let (name, key) = match name.as_deref() {
        Some("brave") => ("brave", brave_key.or(file_key)),
        Some("serper") => ("serper", serper_key.or(file_key)),
        Some(other) => {
            tracing::warn!(provider = other, "unknown search provider, web search disabled");
            return None;
        }
        None => match (brave_key, serper_key) {
            (Some(key), _) => ("brave", Some(key)),
            (None, Some(key)) => ("serper", Some(key)),
            (None, None) => ("brave", file_key),
        },
    };

    let api_key = SecretString::from(key.filter(|k| !k.trim().is_empty())?);
    Some(match name {
        "serper" => SearchProvider::Serper { api_key },
        _ => SearchProvider::Brave { api_key },
    })
}

fn default_recording_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|d| d.video_dir().map(|v| v.join("visor")))
        .or_else(|| directories::BaseDirs::new().map(|d| d.data_dir().join("visor").join("recordings")))
        .unwrap_or_else(|| PathBuf::from("recordings"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::file::parse_config;
    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(VisorConfigFile::default(), env_from(&[]));

        assert_eq!(
            config.realtime.endpoint(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01"
        );
        assert!(config.realtime.api_key.is_none());
        assert_eq!(config.wake.keywords, vec!["hey_jarvis"]);
        assert!((config.wake.threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.wake.frame_ms, 80);
        assert_eq!(config.wake.sample_rates, vec![16_000, 48_000, 44_100]);
        assert_eq!(config.audio.input_rates, vec![24_000, 48_000, 44_100]);
        assert_eq!(config.audio.output_rates, vec![44_100, 48_000, 24_000]);
        assert_eq!(config.audio.frame_ms, 20);
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.tools.timeout, Duration::from_secs(10));
        assert!(config.tools.search.is_none());
        assert!(config.tools.recorder_command.is_none());
        assert_eq!(config.dismissal.phrases.len(), DEFAULT_DISMISSAL_PHRASES.len());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = parse_config(
            r#"
            [realtime]
            voice = "verse"
            api_key = "from-file"

            [wake]
            threshold = 0.7
            "#,
        )
        .unwrap();
        let config = Config::from_sources(
            fc,
            env_from(&[("OPENAI_API_KEY", "from-env"), ("VISOR_VOICE", "shimmer")]),
        );

        assert_eq!(config.realtime.voice, "shimmer");
        assert_eq!(
            config.realtime.api_key.as_ref().unwrap().expose_secret(),
            "from-env"
        );
        assert!((config.wake.threshold - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_volume_clamped() {
        let fc = parse_config("[audio]\nvolume = 3.5").unwrap();
        let config = Config::from_sources(fc, env_from(&[]));
        assert!((config.audio.volume - 1.0).abs() < f32::EPSILON);

        let config = Config::from_sources(
            VisorConfigFile::default(),
            env_from(&[("VISOR_VOLUME", "-2")]),
        );
        assert!(config.audio.volume.abs() < f32::EPSILON);
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = Config::from_sources(VisorConfigFile::default(), env_from(&[]));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config::from_sources(
            VisorConfigFile::default(),
            env_from(&[("OPENAI_API_KEY", "sk-test")]),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_rates() {
        let fc = parse_config("[audio]\ninput_rates = []").unwrap();
        let config = Config::from_sources(fc, env_from(&[("OPENAI_API_KEY", "sk-test")]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_search_provider_resolution() {
        let config = Config::from_sources(
            VisorConfigFile::default(),
            env_from(&[("SERPER_API_KEY", "abc")]),
        );
        assert!(matches!(
            config.tools.search,
            Some(SearchProvider::Serper { .. })
        ));

        let fc = parse_config("[tools]\nsearch_provider = \"brave\"\nsearch_api_key = \"k\"")
            .unwrap();
        let config = Config::from_sources(fc, env_from(&[]));
        assert!(matches!(config.tools.search, Some(SearchProvider::Brave { .. })));

        let fc = parse_config("[tools]\nsearch_provider = \"bing\"\nsearch_api_key = \"k\"")
            .unwrap();
        let config = Config::from_sources(fc, env_from(&[]));
        assert!(config.tools.search.is_none());
    }

    #[test]
    fn test_recorder_command_from_env() {
        let config = Config::from_sources(
            VisorConfigFile::default(),
            env_from(&[("VISOR_RECORDER_COMMAND", "ffmpeg -i /dev/video0 {output}")]),
        );
        assert_eq!(
            config.tools.recorder_command.unwrap(),
            vec!["ffmpeg", "-i", "/dev/video0", "{output}"]
        );
    }

    #[test]
    fn test_session_settings_follow_config() {
        let fc = parse_config(
            r#"
            [dismissal]
            phrases = ["dismissed"]
            acknowledgement = "Very good."

            [reconnect]
            max_retries = 1
            "#,
        )
        .unwrap();
        let settings = Config::from_sources(fc, env_from(&[])).session_settings();

        assert_eq!(settings.dismissal_phrases, vec!["dismissed"]);
        assert_eq!(settings.acknowledgement, "Very good.");
        let mut backoff = settings.backoff;
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }
}
