//! Voice pipeline for the room agent
//!
//! Per-session processing chain:
//! Ingress -> VAD (per participant) -> STT transport -> Turn Controller
//! -> Response Generator -> TTS transport & egress.
//!
//! The turn controller is the single arbiter of who is speaking; it alone
//! cancels the generator -> TTS -> egress chain on barge-in. Everything
//! communicates over bounded channels, and cancellation flows through
//! `watch` handles observed at every suspension point.

pub mod generator;
pub mod ingress;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use generator::{GeneratorConfig, GeneratorOutcome, ResponseGenerator, SpeakChunk};
pub use ingress::{IngressConfig, IngressDemux, IngressHandle};
pub use stt::{SttFeed, SttTransport, SttTransportConfig, WebSocketStt};
pub use tts::{EgressConfig, HttpTts, TtsOutcome, TtsPipeline};
pub use turn::{
    ControllerDeps, ControllerEvent, ControllerSummary, TurnController, TurnControllerConfig,
};
pub use vad::{VadConfig, VadEvent, VoiceActivityDetector};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use thiserror::Error;

use room_agent_core::{DialogueContext, ParticipantId};

/// Sleep until an optional deadline; pends forever when unarmed. Meant for
/// `tokio::select!` arms guarded with `if deadline.is_some()`.
pub(crate) async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Dialogue context shared between the turn controller (user turns) and the
/// response generator (assistant turns). Critical sections are snapshot
/// copies only.
pub type SharedDialogue = Arc<Mutex<DialogueContext>>;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown participant: {0}")]
    ParticipantUnknown(ParticipantId),

    #[error("stt transport: {0}")]
    Stt(String),

    #[error("stt unavailable: {0}")]
    SttUnavailable(String),

    #[error("generation: {0}")]
    Generation(String),

    #[error("synthesis: {0}")]
    Synthesis(String),

    #[error("audio egress stalled")]
    EgressStalled,

    #[error("cancelled")]
    Cancelled,
}

impl From<room_agent_core::Error> for PipelineError {
    fn from(err: room_agent_core::Error) -> Self {
        use room_agent_core::Error as E;
        match err {
            E::Cancelled => PipelineError::Cancelled,
            E::ParticipantUnknown(p) => PipelineError::ParticipantUnknown(p),
            E::SttUnavailable(m) => PipelineError::SttUnavailable(m),
            E::Stt(m) => PipelineError::Stt(m),
            E::LlmTimeout(m) | E::Llm(m) | E::LlmMalformed(m) => PipelineError::Generation(m),
            E::Tts(m) => PipelineError::Synthesis(m),
            E::EgressStalled => PipelineError::EgressStalled,
            other => PipelineError::Generation(other.to_string()),
        }
    }
}
