//! Configuration management for the room voice agent
//!
//! Supports loading configuration from:
//! - TOML/JSON files
//! - Environment variables (`ROOM_AGENT_` prefix, `__` separator)
//! - Built-in defaults
//!
//! The core takes a fully-built [`Settings`]; the launcher that constructs
//! it is external. An invalid configuration is fatal at startup: the session
//! refuses to start rather than limp along.

pub mod constants;
pub mod settings;

pub use settings::{
    DialogueSettings, LlmSettings, SessionSettings, Settings, SttSettings, TtsSettings,
    TurnSettings, VadSettings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
