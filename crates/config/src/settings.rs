//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{audio, dialogue, endpoints, timeouts, turn, vad};
use crate::ConfigError;

/// Main application settings, one record per session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub stt: SttSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub tts: TtsSettings,

    #[serde(default)]
    pub vad: VadSettings,

    #[serde(default)]
    pub turn: TurnSettings,

    #[serde(default)]
    pub dialogue: DialogueSettings,

    #[serde(default)]
    pub session: SessionSettings,
}

/// Streaming recognizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    /// WebSocket URL of the recognizer
    #[serde(default = "default_stt_url")]
    pub url: String,

    /// Language hint sent in the handshake
    #[serde(default = "default_stt_language")]
    pub language: String,

    /// Model tier requested in the handshake
    #[serde(default = "default_stt_model")]
    pub model: String,

    #[serde(default = "default_stt_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Trailing window after speech end during which PCM keeps flowing
    #[serde(default = "default_stt_hangover_ms")]
    pub hangover_ms: u64,

    /// Idle connections are kept warm this long before teardown
    #[serde(default = "default_stt_idle_keepalive_s")]
    pub idle_keepalive_s: u64,
}

fn default_stt_url() -> String {
    endpoints::STT_DEFAULT.clone()
}
fn default_stt_language() -> String {
    "en".to_string()
}
fn default_stt_model() -> String {
    "small".to_string()
}
fn default_stt_handshake_timeout_ms() -> u64 {
    timeouts::STT_HANDSHAKE_MS
}
fn default_stt_hangover_ms() -> u64 {
    turn::STT_HANGOVER_MS
}
fn default_stt_idle_keepalive_s() -> u64 {
    timeouts::STT_IDLE_KEEPALIVE_S
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            language: default_stt_language(),
            model: default_stt_model(),
            handshake_timeout_ms: default_stt_handshake_timeout_ms(),
            hangover_ms: default_stt_hangover_ms(),
            idle_keepalive_s: default_stt_idle_keepalive_s(),
        }
    }
}

/// Chat LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_url")]
    pub url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_first_token_timeout_ms")]
    pub first_token_timeout_ms: u64,

    #[serde(default = "default_llm_total_timeout_ms")]
    pub total_timeout_ms: u64,
}

fn default_llm_url() -> String {
    endpoints::LLM_DEFAULT.clone()
}
fn default_llm_model() -> String {
    "qwen3:4b-instruct-2507-q4_K_M".to_string()
}
fn default_llm_temperature() -> f32 {
    0.7
}
fn default_llm_first_token_timeout_ms() -> u64 {
    timeouts::LLM_FIRST_TOKEN_MS
}
fn default_llm_total_timeout_ms() -> u64 {
    timeouts::LLM_TOTAL_MS
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_llm_temperature(),
            first_token_timeout_ms: default_llm_first_token_timeout_ms(),
            total_timeout_ms: default_llm_total_timeout_ms(),
        }
    }
}

/// Streaming synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_tts_url")]
    pub url: String,

    #[serde(default = "default_tts_voice")]
    pub voice: String,

    /// Sample rate requested from the synthesizer
    #[serde(default = "default_tts_sample_rate_hz")]
    pub sample_rate_hz: u32,

    /// Rate published on the outbound track
    #[serde(default = "default_publish_sample_rate_hz")]
    pub publish_sample_rate_hz: u32,

    #[serde(default = "default_tts_first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,
}

fn default_tts_url() -> String {
    endpoints::TTS_DEFAULT.clone()
}
fn default_tts_voice() -> String {
    "default".to_string()
}
fn default_tts_sample_rate_hz() -> u32 {
    22_050
}
fn default_publish_sample_rate_hz() -> u32 {
    audio::PUBLISH_RATE_HZ
}
fn default_tts_first_byte_timeout_ms() -> u64 {
    timeouts::TTS_FIRST_BYTE_MS
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            voice: default_tts_voice(),
            sample_rate_hz: default_tts_sample_rate_hz(),
            publish_sample_rate_hz: default_publish_sample_rate_hz(),
            first_byte_timeout_ms: default_tts_first_byte_timeout_ms(),
        }
    }
}

/// Voice activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    #[serde(default = "default_vad_activation_threshold")]
    pub activation_threshold: f32,

    #[serde(default = "default_vad_min_speech_ms")]
    pub min_speech_ms: u32,

    #[serde(default = "default_vad_min_silence_ms")]
    pub min_silence_ms: u32,

    #[serde(default = "default_vad_window_ms")]
    pub window_ms: u32,
}

fn default_vad_activation_threshold() -> f32 {
    vad::ACTIVATION_THRESHOLD
}
fn default_vad_min_speech_ms() -> u32 {
    vad::MIN_SPEECH_MS
}
fn default_vad_min_silence_ms() -> u32 {
    vad::MIN_SILENCE_MS
}
fn default_vad_window_ms() -> u32 {
    vad::WINDOW_MS
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            activation_threshold: default_vad_activation_threshold(),
            min_speech_ms: default_vad_min_speech_ms(),
            min_silence_ms: default_vad_min_silence_ms(),
            window_ms: default_vad_window_ms(),
        }
    }
}

/// Turn-taking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSettings {
    /// Upper bound on the wait between speech end and commit
    #[serde(default = "default_endpointing_delay_ms")]
    pub endpointing_delay_ms: u64,

    /// Deadline for outbound audio to stop after a barge-in
    #[serde(default = "default_barge_in_deadline_ms")]
    pub barge_in_deadline_ms: u64,

    /// Extra tokens (besides sentence-final punctuation) that satisfy the
    /// turn-complete predicate when a final transcript ends with one
    #[serde(default)]
    pub completion_tokens: Vec<String>,
}

fn default_endpointing_delay_ms() -> u64 {
    turn::ENDPOINTING_DELAY_MS
}
fn default_barge_in_deadline_ms() -> u64 {
    turn::BARGE_IN_DEADLINE_MS
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            endpointing_delay_ms: default_endpointing_delay_ms(),
            barge_in_deadline_ms: default_barge_in_deadline_ms(),
            completion_tokens: Vec::new(),
        }
    }
}

/// Dialogue context bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueSettings {
    #[serde(default = "default_dialogue_max_turns")]
    pub max_turns: usize,

    #[serde(default = "default_dialogue_max_chars")]
    pub max_chars: usize,

    #[serde(default = "default_system_preamble")]
    pub system_preamble: String,
}

fn default_dialogue_max_turns() -> usize {
    dialogue::MAX_TURNS
}
fn default_dialogue_max_chars() -> usize {
    dialogue::MAX_CHARS
}
fn default_system_preamble() -> String {
    "You are a helpful voice assistant. Respond concisely and naturally; \
     keep replies brief because they will be spoken aloud."
        .to_string()
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            max_turns: default_dialogue_max_turns(),
            max_chars: default_dialogue_max_chars(),
            system_preamble: default_system_preamble(),
        }
    }
}

/// Session-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Spoken when the first participant joins, if set
    #[serde(default)]
    pub greeting: Option<String>,

    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    timeouts::SESSION_DRAIN_MS
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            greeting: None,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Settings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings: defaults <- optional file <- `ROOM_AGENT_` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(Environment::with_prefix("ROOM_AGENT").separator("__"))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings. An error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stt.url.is_empty() {
            return Err(ConfigError::invalid("stt.url", "must not be empty"));
        }
        if !self.stt.url.starts_with("ws://") && !self.stt.url.starts_with("wss://") {
            return Err(ConfigError::invalid(
                "stt.url",
                "must be a ws:// or wss:// URL",
            ));
        }
        if self.llm.url.is_empty() {
            return Err(ConfigError::invalid("llm.url", "must not be empty"));
        }
        if self.tts.url.is_empty() {
            return Err(ConfigError::invalid("tts.url", "must not be empty"));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::invalid(
                "llm.temperature",
                "must be within [0.0, 2.0]",
            ));
        }

        if self.tts.sample_rate_hz == 0 || self.tts.publish_sample_rate_hz == 0 {
            return Err(ConfigError::invalid(
                "tts.sample_rate_hz",
                "sample rates must be non-zero",
            ));
        }

        if !(0.0..1.0).contains(&self.vad.activation_threshold) {
            return Err(ConfigError::invalid(
                "vad.activation_threshold",
                "must be within [0.0, 1.0)",
            ));
        }
        if self.vad.window_ms == 0 || self.vad.window_ms > 40 {
            return Err(ConfigError::invalid(
                "vad.window_ms",
                "must be within (0, 40] ms",
            ));
        }

        if self.turn.endpointing_delay_ms == 0 {
            return Err(ConfigError::invalid(
                "turn.endpointing_delay_ms",
                "must be non-zero",
            ));
        }
        if self.turn.barge_in_deadline_ms > self.turn.endpointing_delay_ms {
            return Err(ConfigError::invalid(
                "turn.barge_in_deadline_ms",
                "must not exceed the endpointing delay",
            ));
        }

        if self.dialogue.max_turns == 0 || self.dialogue.max_chars == 0 {
            return Err(ConfigError::invalid(
                "dialogue.max_turns",
                "dialogue bounds must be non-zero",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.vad.activation_threshold, 0.45);
        assert_eq!(settings.turn.endpointing_delay_ms, 2_000);
        assert_eq!(settings.stt.hangover_ms, 300);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let mut settings = Settings::default();
        settings.vad.activation_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_http_stt_url() {
        let mut settings = Settings::default();
        settings.stt.url = "http://localhost:9090".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_llm_url() {
        let mut settings = Settings::default();
        settings.llm.url.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = Settings::load(Some(Path::new("/nonexistent/agent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
