//! Error types shared across the agent

use thiserror::Error;

use crate::participant::ParticipantId;

/// Result alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced across crate boundaries.
///
/// `Cancelled` is deliberately distinct from the I/O variants: a turn being
/// interrupted is control flow, not a failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown participant: {0}")]
    ParticipantUnknown(ParticipantId),

    #[error("speech recognition unavailable: {0}")]
    SttUnavailable(String),

    #[error("speech recognition error: {0}")]
    Stt(String),

    #[error("language model timed out: {0}")]
    LlmTimeout(String),

    #[error("language model error: {0}")]
    Llm(String),

    #[error("malformed language model response: {0}")]
    LlmMalformed(String),

    #[error("synthesis error: {0}")]
    Tts(String),

    #[error("audio egress stalled")]
    EgressStalled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the operation was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
