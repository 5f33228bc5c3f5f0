//! Client traits for pluggable engines and the media transport
//!
//! The session is constructed with `Arc<dyn SpeechToText>`,
//! `Arc<dyn LanguageModel>`, `Arc<dyn TextToSpeech>`, and
//! `Arc<dyn MediaTransport>`. Production implementations speak the wire
//! protocols of the external engines; tests inject scripted doubles.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::dialogue::{DialogueTurn, Role};
use crate::error::Result;
use crate::participant::ParticipantId;

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// One chat message in an LLM request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A complete chat request built from the dialogue snapshot.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
        }
    }

    /// Build a request from a dialogue snapshot plus the just-committed
    /// user utterance.
    pub fn from_dialogue(snapshot: &[DialogueTurn], user_text: &str, temperature: f32) -> Self {
        let mut messages: Vec<ChatMessage> = snapshot
            .iter()
            .map(|t| ChatMessage::new(t.role, t.text.clone()))
            .collect();
        messages.push(ChatMessage::new(Role::User, user_text));
        Self::new(messages, temperature)
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Model signalled done
    Stop,
    /// Token limit reached
    Length,
    /// Receiver closed the token channel mid-stream
    Cancelled,
    /// Stream ended without a done marker
    Error,
}

/// Summary of a completed (or cancelled) generation.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Everything generated before the stream ended
    pub text: String,
    pub finish_reason: FinishReason,
    pub time_to_first_token: Option<Duration>,
    pub total_time: Duration,
}

/// Streaming chat interface.
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Stream generated tokens into `tx` as they arrive.
    ///
    /// A closed receiver cancels the generation: the implementation aborts
    /// the request and returns with `FinishReason::Cancelled` rather than an
    /// error.
    async fn generate_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome>;

    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Speech to text
// ---------------------------------------------------------------------------

/// One recognized segment from the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SttSegment {
    pub text: String,
    pub start_s: f64,
    pub end_s: f64,
    /// `true` marks a stable final; interims may be superseded
    pub completed: bool,
}

/// Write half of a recognition stream.
#[async_trait]
pub trait SttSink: Send {
    /// Forward mono 16 kHz PCM16 audio.
    async fn send_pcm(&mut self, pcm: &[i16]) -> Result<()>;

    /// Signal end of the current utterance so the recognizer flushes
    /// pending finals.
    async fn flush(&mut self) -> Result<()>;
}

/// Read half of a recognition stream.
#[async_trait]
pub trait SttSource: Send {
    /// Next batch of segments, or `None` when the stream closed.
    async fn next_segments(&mut self) -> Option<Result<Vec<SttSegment>>>;
}

/// Streaming recognizer client. One stream per active participant.
#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    /// Open a recognition stream, performing the configuration handshake.
    ///
    /// The halves are independent so the send and receive loops can run as
    /// separate tasks.
    async fn open_stream(
        &self,
        participant: &ParticipantId,
    ) -> Result<(Box<dyn SttSink>, Box<dyn SttSource>)>;

    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Text to speech
// ---------------------------------------------------------------------------

/// Events produced by a streaming synthesis request.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// Response headers arrived; PCM format for all following audio
    Started { sample_rate_hz: u32, channels: u16 },
    /// Raw synthesized PCM, mono after downmix by the implementation
    Audio { pcm: Vec<i16> },
    /// Request body fully consumed
    Complete,
}

/// Streaming synthesis interface.
#[async_trait]
pub trait TextToSpeech: Send + Sync + 'static {
    /// Synthesize `text`, streaming events into `tx` as audio arrives.
    ///
    /// A closed receiver aborts the in-flight request and the call returns
    /// `Error::Cancelled`.
    async fn synthesize_stream(&self, text: &str, tx: mpsc::Sender<TtsEvent>) -> Result<()>;

    fn voice(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Media transport
// ---------------------------------------------------------------------------

/// Events delivered by the media transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ParticipantJoined {
        identity: ParticipantId,
        name: String,
        sid: String,
    },
    ParticipantLeft {
        identity: ParticipantId,
    },
    /// Decoded audio from a participant's track
    AudioFrame {
        identity: ParticipantId,
        pcm: Vec<i16>,
        sample_rate_hz: u32,
        channels: u16,
        captured_at: Instant,
    },
}

/// Room media transport: audio in/out plus the data channel.
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    /// Subscribe to room events. Each subscriber sees every event.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Enqueue a mono PCM16 frame on the outbound audio track.
    async fn publish_audio(&self, pcm: Vec<i16>, sample_rate_hz: u32) -> Result<()>;

    /// Publish a payload on a named data-channel topic.
    async fn publish_data(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::DialogueContext;

    #[test]
    fn test_request_from_dialogue() {
        let mut ctx = DialogueContext::new("Be brief.", 16, 4096);
        ctx.push_user("hello");
        ctx.push_assistant("hi!");

        let request = ChatRequest::from_dialogue(&ctx.snapshot(), "how are you?", 0.7);
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[3].role, Role::User);
        assert_eq!(request.messages[3].content, "how are you?");
    }
}
