//! Core types and traits for the room voice agent
//!
//! This crate provides the foundational pieces shared by every other crate:
//! - Audio frame type and PCM16 helpers
//! - Participant, utterance, and dialogue types
//! - Telemetry payloads for the data-channel topics
//! - Client traits for pluggable engines (STT, LLM, TTS) and the media
//!   transport, injected at session construction so tests can substitute
//!   scripted doubles
//! - Error types

pub mod audio;
pub mod dialogue;
pub mod error;
pub mod participant;
pub mod telemetry;
pub mod traits;
pub mod utterance;

pub use audio::AudioFrame;
pub use dialogue::{DialogueContext, DialogueTurn, Role};
pub use error::{Error, Result};
pub use participant::{Participant, ParticipantId};
pub use telemetry::{
    AgentStatusMessage, Speaker, TelemetryEvent, TranscriptMessage, TurnLatencies, TurnState,
    TOPIC_AGENT_STATUS, TOPIC_TRANSCRIPTS,
};
pub use traits::{
    ChatMessage, ChatOutcome, ChatRequest, FinishReason, LanguageModel, MediaTransport,
    SpeechToText, SttSegment, SttSink, SttSource, TextToSpeech, TransportEvent, TtsEvent,
};
pub use utterance::{Utterance, UtteranceId};
