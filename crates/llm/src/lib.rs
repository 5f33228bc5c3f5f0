//! Streaming chat client
//!
//! Speaks the chat server's newline-delimited JSON protocol and implements
//! the [`room_agent_core::LanguageModel`] trait consumed by the response
//! generator. Deadlines: first token within 5 s, whole generation within
//! 20 s (both configurable). Cancellation is signalled by the caller
//! dropping its token receiver; the in-flight request is aborted and the
//! partial text returned with `FinishReason::Cancelled`.

mod client;

pub use client::ChatClient;

use thiserror::Error;

/// Chat client errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("no first token within {0} ms")]
    FirstTokenTimeout(u64),

    #[error("generation exceeded {0} ms")]
    TotalTimeout(u64),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Network(err.to_string())
    }
}

impl From<LlmError> for room_agent_core::Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::FirstTokenTimeout(_) | LlmError::TotalTimeout(_) => {
                room_agent_core::Error::LlmTimeout(err.to_string())
            }
            LlmError::Malformed(m) => room_agent_core::Error::LlmMalformed(m),
            other => room_agent_core::Error::Llm(other.to_string()),
        }
    }
}
