//! Telemetry wire payloads
//!
//! Two data-channel topics are published per session: `transcripts` carries
//! user and assistant transcript messages, `agent_status` carries the turn
//! state machine and per-turn latency breakdown. Delivery is fire-and-forget;
//! there is no persistence contract.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Data-channel topic for transcript messages.
pub const TOPIC_TRANSCRIPTS: &str = "transcripts";
/// Data-channel topic for agent status messages.
pub const TOPIC_AGENT_STATUS: &str = "agent_status";

/// Who produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// Transcript message published on [`TOPIC_TRANSCRIPTS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub speaker: Speaker,
    #[serde(rename = "participantIdentity")]
    pub participant_identity: String,
    #[serde(rename = "participantSid")]
    pub participant_sid: String,
    pub text: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interim: Option<bool>,
}

impl TranscriptMessage {
    pub fn user(
        identity: impl Into<String>,
        sid: impl Into<String>,
        text: impl Into<String>,
        interim: bool,
    ) -> Self {
        Self {
            kind: "transcript".to_string(),
            speaker: Speaker::User,
            participant_identity: identity.into(),
            participant_sid: sid.into(),
            text: text.into(),
            timestamp: Utc::now().timestamp_millis(),
            interim: interim.then_some(true),
        }
    }

    pub fn assistant(
        identity: impl Into<String>,
        sid: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: "transcript".to_string(),
            speaker: Speaker::Assistant,
            participant_identity: identity.into(),
            participant_sid: sid.into(),
            text: text.into(),
            timestamp: Utc::now().timestamp_millis(),
            interim: None,
        }
    }
}

/// Turn controller state, exactly one at a time per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Listening,
    Endpointing,
    Thinking,
    Speaking,
    Interrupted,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Endpointing => "endpointing",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
            TurnState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Per-turn latency breakdown in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TurnLatencies {
    /// Speech end to last final transcript
    pub stt_ms: u64,
    /// Commit to first LLM token
    pub llm_ttft_ms: u64,
    /// Commit to LLM done
    pub llm_total_ms: u64,
    /// First speak chunk to first synthesized audio
    pub tts_ttfb_ms: u64,
    /// Speech end to first published audio frame
    pub e2e_ms: u64,
}

/// Agent status message published on [`TOPIC_AGENT_STATUS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusMessage {
    pub state: TurnState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latencies: Option<TurnLatencies>,
}

impl AgentStatusMessage {
    pub fn state(state: TurnState) -> Self {
        Self {
            state,
            turn_id: None,
            latencies: None,
        }
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn with_latencies(mut self, latencies: TurnLatencies) -> Self {
        self.latencies = Some(latencies);
        self
    }
}

/// Internal telemetry fan-out item. The session publisher serializes these
/// onto their data-channel topics; other subscribers (tests, diagnostics)
/// may observe them in-process.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Transcript(TranscriptMessage),
    Status(AgentStatusMessage),
}

impl TelemetryEvent {
    /// Topic this event publishes on.
    pub fn topic(&self) -> &'static str {
        match self {
            TelemetryEvent::Transcript(_) => TOPIC_TRANSCRIPTS,
            TelemetryEvent::Status(_) => TOPIC_AGENT_STATUS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_wire_shape() {
        let msg = TranscriptMessage::user("alice", "PA_1", "hello", true);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "transcript");
        assert_eq!(json["speaker"], "user");
        assert_eq!(json["participantIdentity"], "alice");
        assert_eq!(json["participantSid"], "PA_1");
        assert_eq!(json["interim"], true);
    }

    #[test]
    fn test_final_transcript_omits_interim() {
        let msg = TranscriptMessage::user("alice", "PA_1", "hello", false);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("interim").is_none());
    }

    #[test]
    fn test_status_wire_shape() {
        let msg = AgentStatusMessage::state(TurnState::Speaking)
            .with_turn("t-1")
            .with_latencies(TurnLatencies {
                stt_ms: 120,
                llm_ttft_ms: 350,
                llm_total_ms: 900,
                tts_ttfb_ms: 180,
                e2e_ms: 1400,
            });
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["state"], "speaking");
        assert_eq!(json["turn_id"], "t-1");
        assert_eq!(json["latencies"]["llm_ttft_ms"], 350);
    }

    #[test]
    fn test_idle_status_is_minimal() {
        let msg = AgentStatusMessage::state(TurnState::Idle);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"state\":\"idle\"}");
    }
}
