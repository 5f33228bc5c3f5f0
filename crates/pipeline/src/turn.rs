//! Turn controller
//!
//! The single arbiter of turn-taking. Runs as a single-writer actor over an
//! inbound event queue, so every state transition is totally ordered. Fuses
//! VAD transitions, STT finals, endpointing timers, and barge-in rules;
//! owns the generator -> TTS -> egress chain for the turn it began and is
//! the only component allowed to cancel it.
//!
//! State machine: Idle -> Listening -> Endpointing -> Thinking -> Speaking
//! -> Idle, with Speaking -> Interrupted -> Listening on barge-in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use room_agent_config::Settings;
use room_agent_core::telemetry::TelemetryEvent;
use room_agent_core::{
    AgentStatusMessage, ChatRequest, LanguageModel, MediaTransport, Participant, ParticipantId,
    TextToSpeech, TranscriptMessage, TurnLatencies, TurnState, Utterance, UtteranceId,
};

use crate::generator::{GeneratorConfig, GeneratorOutcome, ResponseGenerator, SENTENCE_TERMINATORS};
use crate::tts::{EgressConfig, TtsOutcome, TtsPipeline};
use crate::{sleep_until_opt, SharedDialogue, SpeakChunk};

/// Identity used for the agent's own transcript messages.
const AGENT_IDENTITY: &str = "agent";

/// Inbound events, from the supervisor, the per-participant tasks, the STT
/// transports, and the speak pipelines the controller spawned.
#[derive(Debug)]
pub enum ControllerEvent {
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        participant: ParticipantId,
        remaining: usize,
    },
    SpeechStart {
        participant: ParticipantId,
        utterance: UtteranceId,
        at: Instant,
    },
    SpeechEnd {
        participant: ParticipantId,
        utterance: UtteranceId,
        at: Instant,
    },
    Interim {
        participant: ParticipantId,
        utterance: UtteranceId,
        text: String,
    },
    Final {
        participant: ParticipantId,
        utterance: UtteranceId,
        text: String,
        at: Instant,
    },
    SttFailed {
        participant: ParticipantId,
        utterance: UtteranceId,
        reason: String,
    },
    FirstChunk {
        turn_id: String,
        at: Instant,
    },
    FirstAudio {
        turn_id: String,
        at: Instant,
    },
    GeneratorDone {
        turn_id: String,
        result: Result<GeneratorOutcome, String>,
    },
    TtsDone {
        turn_id: String,
        outcome: TtsOutcome,
    },
}

/// Injected collaborators.
pub struct ControllerDeps {
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub transport: Arc<dyn MediaTransport>,
    pub dialogue: SharedDialogue,
    pub telemetry: mpsc::Sender<TelemetryEvent>,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct TurnControllerConfig {
    /// Upper bound on the wait between speech end and commit
    pub endpointing_delay: Duration,
    /// Silence required before the turn-complete predicate may commit early
    pub predicate_min_silence: Duration,
    /// Contractual stop deadline after a barge-in; exceeding it is logged
    pub barge_in_deadline: Duration,
    /// Extra tokens that mark an utterance complete
    pub completion_tokens: Vec<String>,
    pub llm_temperature: f32,
    /// Interim transcripts publish at most this often per participant
    pub interim_publish_interval: Duration,
    pub drain_timeout: Duration,
    /// Spoken when the first participant joins, if set
    pub greeting: Option<String>,
    /// Canned reply when generation fails
    pub apology_text: String,
    pub generator: GeneratorConfig,
    pub egress: EgressConfig,
}

impl Default for TurnControllerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl TurnControllerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        use room_agent_config::constants::turn::PREDICATE_MIN_SILENCE_MS;
        Self {
            endpointing_delay: Duration::from_millis(settings.turn.endpointing_delay_ms),
            predicate_min_silence: Duration::from_millis(PREDICATE_MIN_SILENCE_MS),
            barge_in_deadline: Duration::from_millis(settings.turn.barge_in_deadline_ms),
            completion_tokens: settings.turn.completion_tokens.clone(),
            llm_temperature: settings.llm.temperature,
            interim_publish_interval: Duration::from_millis(250),
            drain_timeout: Duration::from_millis(settings.session.drain_timeout_ms),
            greeting: settings.session.greeting.clone(),
            apology_text: "Sorry, I had trouble answering. Could you repeat that?".to_string(),
            generator: GeneratorConfig::default(),
            egress: EgressConfig::from_settings(&settings.tts),
        }
    }
}

/// Session counters reported when the controller stops.
#[derive(Debug, Clone, Default)]
pub struct ControllerSummary {
    pub turns_completed: u64,
    pub barge_ins: u64,
    pub stt_failures: u64,
    pub utterances_committed: u64,
}

/// One participant's recognition state as the controller sees it.
struct ParticipantSlot {
    info: Participant,
    current: Option<UtteranceRecord>,
    /// Stale-final high-water mark: finals at or below are dropped
    closed_up_to: u64,
    last_interim_published: Option<Instant>,
}

struct UtteranceRecord {
    utterance: Utterance,
    speech_ended_at: Option<Instant>,
    last_final_at: Option<Instant>,
}

/// Text captured for the turn being listened to. Spans multiple utterances
/// when the speaker pauses and resumes inside the endpointing window; the
/// text of closed utterances is folded in as speech resumes.
struct ActiveCapture {
    participant: ParticipantId,
    utterance_ids: Vec<UtteranceId>,
    folded_text: Vec<String>,
    last_final_at: Option<Instant>,
}

impl ActiveCapture {
    fn new(participant: ParticipantId, utterance: UtteranceId) -> Self {
        Self {
            participant,
            utterance_ids: vec![utterance],
            folded_text: Vec::new(),
            last_final_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Reply,
    Greeting,
    Apology,
}

/// The in-flight speak pipeline for one turn.
struct ActiveTurn {
    id: String,
    kind: TurnKind,
    cancel: watch::Sender<bool>,
    generator_done: bool,
    tts_done: bool,
    interrupted: bool,
    failed: bool,
    barge_in_at: Option<Instant>,
    timings: TurnTimings,
}

impl ActiveTurn {
    fn is_closed(&self) -> bool {
        self.generator_done && self.tts_done
    }
}

/// Latency breakpoints captured across one turn.
#[derive(Debug, Clone, Copy, Default)]
struct TurnTimings {
    speech_end_at: Option<Instant>,
    last_final_at: Option<Instant>,
    committed_at: Option<Instant>,
    first_token: Option<Duration>,
    llm_total: Option<Duration>,
    first_chunk_at: Option<Instant>,
    first_audio_at: Option<Instant>,
}

impl TurnTimings {
    fn latencies(&self) -> TurnLatencies {
        let between = |from: Option<Instant>, to: Option<Instant>| -> u64 {
            match (from, to) {
                (Some(from), Some(to)) if to > from => (to - from).as_millis() as u64,
                _ => 0,
            }
        };
        TurnLatencies {
            stt_ms: between(self.speech_end_at, self.last_final_at),
            llm_ttft_ms: self.first_token.map(|d| d.as_millis() as u64).unwrap_or(0),
            llm_total_ms: self.llm_total.map(|d| d.as_millis() as u64).unwrap_or(0),
            tts_ttfb_ms: between(self.first_chunk_at, self.first_audio_at),
            e2e_ms: between(self.speech_end_at, self.first_audio_at),
        }
    }
}

/// The per-session turn controller actor.
pub struct TurnController {
    config: TurnControllerConfig,
    deps: ControllerDeps,
    /// Handed to spawned speak pipelines so their events come back here
    event_tx: mpsc::Sender<ControllerEvent>,

    state: TurnState,
    participants: HashMap<ParticipantId, ParticipantSlot>,
    active: Option<ActiveCapture>,
    turn: Option<ActiveTurn>,
    /// Who barged in; becomes the active speaker once the turn unwinds
    interrupter: Option<(ParticipantId, UtteranceId)>,
    speech_end_at: Option<Instant>,
    /// Start the apology turn once the failed turn finishes unwinding
    pending_apology: bool,
    greeted: bool,
    draining: bool,
    drain_deadline: Option<Instant>,
    summary: ControllerSummary,
}

impl TurnController {
    pub fn new(
        config: TurnControllerConfig,
        deps: ControllerDeps,
        event_tx: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            config,
            deps,
            event_tx,
            state: TurnState::Idle,
            participants: HashMap::new(),
            active: None,
            turn: None,
            interrupter: None,
            speech_end_at: None,
            pending_apology: false,
            greeted: false,
            draining: false,
            drain_deadline: None,
            summary: ControllerSummary::default(),
        }
    }

    /// Run until the session drains or is cancelled.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ControllerEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> ControllerSummary {
        self.publish_status().await;

        loop {
            let deadline = self.next_deadline();

            let done = tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.cancel_turn("session cancelled");
                        true
                    } else {
                        false
                    }
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => true,
                },

                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.handle_deadline().await
                }
            };

            if done {
                break;
            }
        }

        self.state = TurnState::Idle;
        self.publish_status().await;
        tracing::info!(
            turns = self.summary.turns_completed,
            barge_ins = self.summary.barge_ins,
            "turn controller stopped"
        );
        self.summary
    }

    /// Earliest armed timer, if any.
    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = self.drain_deadline;

        if self.state == TurnState::Endpointing {
            if let Some(end) = self.speech_end_at {
                let hard = end + self.config.endpointing_delay;
                deadline = Some(deadline.map_or(hard, |d| d.min(hard)));

                // Early commit path: re-check the predicate once the
                // minimum silence has accrued
                if self.predicate_text_qualifies() {
                    let soft = end + self.config.predicate_min_silence;
                    deadline = Some(deadline.map_or(soft, |d| d.min(soft)));
                }
            }
        }

        deadline
    }

    async fn handle_deadline(&mut self) -> bool {
        let now = Instant::now();

        if let Some(drain_at) = self.drain_deadline {
            if now >= drain_at {
                tracing::info!("drain deadline reached, cancelling current turn");
                self.cancel_turn("drain deadline");
                self.drain_deadline = None;
                // Wait for the turn to unwind; fully closed means done
                return self.turn.is_none();
            }
        }

        if self.state == TurnState::Endpointing {
            if let Some(end) = self.speech_end_at {
                let elapsed = now.duration_since(end);
                if elapsed >= self.config.endpointing_delay {
                    return self.commit_utterance().await;
                }
                if elapsed >= self.config.predicate_min_silence && self.predicate_text_qualifies()
                {
                    return self.commit_utterance().await;
                }
            }
        }

        false
    }

    async fn handle_event(&mut self, event: ControllerEvent) -> bool {
        match event {
            ControllerEvent::ParticipantJoined { participant } => {
                self.on_participant_joined(participant).await
            }
            ControllerEvent::ParticipantLeft {
                participant,
                remaining,
            } => self.on_participant_left(participant, remaining).await,
            ControllerEvent::SpeechStart {
                participant,
                utterance,
                at,
            } => self.on_speech_start(participant, utterance, at).await,
            ControllerEvent::SpeechEnd {
                participant,
                utterance,
                at,
            } => self.on_speech_end(participant, utterance, at).await,
            ControllerEvent::Interim {
                participant,
                utterance,
                text,
            } => self.on_interim(participant, utterance, text).await,
            ControllerEvent::Final {
                participant,
                utterance,
                text,
                at,
            } => self.on_final(participant, utterance, text, at).await,
            ControllerEvent::SttFailed {
                participant,
                utterance,
                reason,
            } => self.on_stt_failed(participant, utterance, reason).await,
            ControllerEvent::FirstChunk { turn_id, at } => {
                self.on_first_chunk(turn_id, at).await;
                false
            }
            ControllerEvent::FirstAudio { turn_id, at } => {
                if let Some(turn) = self.turn.as_mut() {
                    if turn.id == turn_id && turn.timings.first_audio_at.is_none() {
                        turn.timings.first_audio_at = Some(at);
                    }
                }
                false
            }
            ControllerEvent::GeneratorDone { turn_id, result } => {
                self.on_generator_done(turn_id, result).await
            }
            ControllerEvent::TtsDone { turn_id, outcome } => {
                self.on_tts_done(turn_id, outcome).await
            }
        }
    }

    async fn on_participant_joined(&mut self, participant: Participant) -> bool {
        tracing::info!(participant = %participant.id, name = %participant.name, "participant joined");
        let first = self.participants.is_empty();
        self.participants.insert(
            participant.id.clone(),
            ParticipantSlot {
                info: participant,
                current: None,
                closed_up_to: 0,
                last_interim_published: None,
            },
        );

        if first && !self.greeted {
            if let Some(greeting) = self.config.greeting.clone() {
                self.greeted = true;
                if self.state == TurnState::Idle {
                    self.start_direct_turn(TurnKind::Greeting, greeting).await;
                }
            }
        }
        false
    }

    async fn on_participant_left(&mut self, participant: ParticipantId, remaining: usize) -> bool {
        tracing::info!(participant = %participant, remaining, "participant left");
        self.participants.remove(&participant);

        // A departure mid-utterance cancels that utterance
        if let Some(active) = &self.active {
            if active.participant == participant
                && matches!(self.state, TurnState::Listening | TurnState::Endpointing)
            {
                self.active = None;
                self.speech_end_at = None;
                self.state = TurnState::Idle;
                self.publish_status().await;
            }
        }
        if let Some((interrupter, _)) = &self.interrupter {
            if *interrupter == participant {
                self.interrupter = None;
            }
        }

        if remaining == 0 {
            return self.begin_drain().await;
        }
        false
    }

    /// Last human left: stop taking audio, let the current turn finish on a
    /// deadline, then stop.
    async fn begin_drain(&mut self) -> bool {
        self.draining = true;
        match self.state {
            TurnState::Idle => true,
            TurnState::Listening | TurnState::Endpointing => {
                self.active = None;
                self.speech_end_at = None;
                self.state = TurnState::Idle;
                true
            }
            TurnState::Thinking | TurnState::Speaking | TurnState::Interrupted => {
                self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                false
            }
        }
    }

    async fn on_speech_start(
        &mut self,
        participant: ParticipantId,
        utterance: UtteranceId,
        at: Instant,
    ) -> bool {
        if !self.participants.contains_key(&participant) {
            return false;
        }

        // Same speaker resuming inside the endpointing window: fold the
        // closed utterance's text into the capture before opening the next
        let is_resumption = self.state == TurnState::Endpointing
            && self
                .active
                .as_ref()
                .is_some_and(|a| a.participant == participant);
        if is_resumption {
            let folded = self
                .participants
                .get_mut(&participant)
                .and_then(|slot| slot.current.take());
            if let (Some(record), Some(active)) = (folded, self.active.as_mut()) {
                let text = record.utterance.best_text().trim().to_string();
                if !text.is_empty() {
                    active.folded_text.push(text);
                }
                if record.last_final_at.is_some() {
                    active.last_final_at = record.last_final_at;
                }
            }
        }

        let slot = self
            .participants
            .get_mut(&participant)
            .expect("participant checked above");
        slot.current = Some(UtteranceRecord {
            utterance: Utterance::open(utterance, participant.clone(), at),
            speech_ended_at: None,
            last_final_at: None,
        });

        match self.state {
            TurnState::Idle => {
                if self.draining {
                    return false;
                }
                self.active = Some(ActiveCapture::new(participant.clone(), utterance));
                self.speech_end_at = None;
                self.state = TurnState::Listening;
                tracing::debug!(participant = %participant, %utterance, "idle -> listening");
                self.publish_status().await;
            }

            TurnState::Endpointing => {
                if is_resumption {
                    if let Some(active) = self.active.as_mut() {
                        active.utterance_ids.push(utterance);
                    }
                    self.speech_end_at = None;
                    self.state = TurnState::Listening;
                    tracing::debug!(participant = %participant, "endpointing -> listening (speech resumed)");
                    self.publish_status().await;
                }
            }

            TurnState::Speaking => {
                // Barge-in honors any participant
                self.summary.barge_ins += 1;
                metrics::counter!("barge_ins").increment(1);
                self.interrupter = Some((participant.clone(), utterance));
                self.state = TurnState::Interrupted;
                if let Some(turn) = self.turn.as_mut() {
                    turn.interrupted = true;
                    turn.barge_in_at = Some(at);
                    let _ = turn.cancel.send(true);
                }
                tracing::info!(participant = %participant, "barge-in: speaking -> interrupted");
                self.publish_status().await;
            }

            // Listening keeps forwarding regardless of who else speaks;
            // Thinking and Interrupted leave the floor as it is
            _ => {}
        }
        false
    }

    async fn on_speech_end(
        &mut self,
        participant: ParticipantId,
        utterance: UtteranceId,
        at: Instant,
    ) -> bool {
        if let Some(slot) = self.participants.get_mut(&participant) {
            if let Some(record) = slot.current.as_mut() {
                if record.utterance.id == utterance {
                    record.speech_ended_at = Some(at);
                }
            }
        }

        let is_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.participant == participant);

        let is_interrupter = self
            .interrupter
            .as_ref()
            .is_some_and(|(p, _)| *p == participant);

        if is_active && self.state == TurnState::Listening {
            self.speech_end_at = Some(at);
            self.state = TurnState::Endpointing;
            tracing::debug!(participant = %participant, "listening -> endpointing");
            self.publish_status().await;
        } else if !is_active && !is_interrupter {
            // A bystander's finished utterance is published as transcript
            // but drives no transition
            self.flush_bystander(&participant).await;
        }
        false
    }

    async fn on_interim(
        &mut self,
        participant: ParticipantId,
        utterance: UtteranceId,
        text: String,
    ) -> bool {
        let Some(slot) = self.participants.get_mut(&participant) else {
            return false;
        };
        if utterance.0 <= slot.closed_up_to {
            return false;
        }
        let Some(record) = slot.current.as_mut() else {
            return false;
        };
        if record.utterance.id != utterance {
            return false;
        }
        record.utterance.set_interim(text.clone());

        // Throttled so the data channel is not flooded
        let now = Instant::now();
        let due = slot
            .last_interim_published
            .map_or(true, |last| now - last >= self.config.interim_publish_interval);
        if due {
            slot.last_interim_published = Some(now);
            let message =
                TranscriptMessage::user(slot.info.id.as_str(), slot.info.sid.clone(), text, true);
            self.publish_transcript(message).await;
        }
        false
    }

    async fn on_final(
        &mut self,
        participant: ParticipantId,
        utterance: UtteranceId,
        text: String,
        at: Instant,
    ) -> bool {
        let Some(slot) = self.participants.get_mut(&participant) else {
            return false;
        };
        if utterance.0 <= slot.closed_up_to {
            tracing::warn!(
                participant = %participant,
                %utterance,
                "stale final dropped (utterance already closed)"
            );
            return false;
        }
        let Some(record) = slot.current.as_mut() else {
            return false;
        };
        if record.utterance.id != utterance {
            tracing::warn!(participant = %participant, %utterance, "final for superseded utterance dropped");
            return false;
        }

        record.utterance.push_final(&text);
        record.last_final_at = Some(at);

        let is_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.participant == participant);

        if is_active {
            if let Some(active) = self.active.as_mut() {
                active.last_final_at = Some(at);
            }
            if self.state == TurnState::Endpointing {
                let silence = self
                    .speech_end_at
                    .map(|end| at.saturating_duration_since(end))
                    .unwrap_or_default();
                if silence >= self.config.predicate_min_silence && self.predicate_text_qualifies()
                {
                    return self.commit_utterance().await;
                }
            }
        } else {
            let is_interrupter = self
                .interrupter
                .as_ref()
                .is_some_and(|(p, _)| *p == participant);
            if !is_interrupter && slot_has_ended(self.participants.get(&participant)) {
                self.flush_bystander(&participant).await;
            }
        }
        false
    }

    async fn on_stt_failed(
        &mut self,
        participant: ParticipantId,
        utterance: UtteranceId,
        reason: String,
    ) -> bool {
        self.summary.stt_failures += 1;
        tracing::error!(participant = %participant, %utterance, %reason, "stt unavailable");

        if let Some(slot) = self.participants.get_mut(&participant) {
            slot.closed_up_to = slot.closed_up_to.max(utterance.0);
            slot.current = None;
        }

        let is_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.participant == participant);

        // No transcript means no turn: back to idle without a response
        if is_active && matches!(self.state, TurnState::Listening | TurnState::Endpointing) {
            self.active = None;
            self.speech_end_at = None;
            self.state = TurnState::Idle;
            self.publish_status().await;
            if self.draining {
                return true;
            }
        }
        false
    }

    async fn on_first_chunk(&mut self, turn_id: String, at: Instant) {
        let Some(turn) = self.turn.as_mut() else { return };
        if turn.id != turn_id {
            return;
        }
        if turn.timings.first_chunk_at.is_none() {
            turn.timings.first_chunk_at = Some(at);
        }
        if self.state == TurnState::Thinking {
            self.state = TurnState::Speaking;
            tracing::debug!(%turn_id, "thinking -> speaking");
            self.publish_status().await;
        }
    }

    async fn on_generator_done(
        &mut self,
        turn_id: String,
        result: Result<GeneratorOutcome, String>,
    ) -> bool {
        {
            let Some(turn) = self.turn.as_mut() else {
                return false;
            };
            if turn.id != turn_id {
                return false;
            }
            turn.generator_done = true;

            match result {
                Ok(outcome) => {
                    turn.timings.first_token = outcome.time_to_first_token;
                    turn.timings.llm_total = Some(outcome.total_time);

                    if !outcome.text.trim().is_empty() && turn.kind != TurnKind::Apology {
                        let message = TranscriptMessage::assistant(
                            AGENT_IDENTITY,
                            AGENT_IDENTITY,
                            outcome.text.clone(),
                        );
                        let _ = self
                            .deps
                            .telemetry
                            .send(TelemetryEvent::Transcript(message))
                            .await;
                    }

                    if turn.kind == TurnKind::Greeting && !outcome.cancelled {
                        self.deps.dialogue.lock().push_assistant(outcome.text);
                    }
                }
                Err(reason) => {
                    tracing::error!(%turn_id, %reason, "generator failed, scheduling apology");
                    turn.failed = true;
                    let _ = turn.cancel.send(true);
                    if turn.kind == TurnKind::Reply {
                        self.deps
                            .dialogue
                            .lock()
                            .push(room_agent_core::DialogueTurn::failure(reason));
                        self.pending_apology = true;
                    }
                }
            }
        }

        self.maybe_close_turn().await
    }

    async fn on_tts_done(&mut self, turn_id: String, outcome: TtsOutcome) -> bool {
        {
            let Some(turn) = self.turn.as_mut() else {
                return false;
            };
            if turn.id != turn_id {
                return false;
            }
            turn.tts_done = true;
            if turn.timings.first_audio_at.is_none() {
                turn.timings.first_audio_at = outcome.first_audio_at;
            }

            if let Some(barge_at) = turn.barge_in_at {
                let stop_lag = barge_at.elapsed();
                if stop_lag > self.config.barge_in_deadline {
                    tracing::warn!(
                        %turn_id,
                        stop_ms = stop_lag.as_millis() as u64,
                        deadline_ms = self.config.barge_in_deadline.as_millis() as u64,
                        "barge-in stop exceeded deadline"
                    );
                }
            }
            if outcome.stalled_chunks > 0 {
                tracing::warn!(%turn_id, stalled = outcome.stalled_chunks, "egress stalled during turn");
            }
        }

        self.maybe_close_turn().await
    }

    /// Close out the turn once both halves of the speak pipeline stopped.
    async fn maybe_close_turn(&mut self) -> bool {
        if !self.turn.as_ref().is_some_and(ActiveTurn::is_closed) {
            return false;
        }
        let turn = self.turn.take().expect("turn checked above");

        if turn.failed && self.pending_apology && !self.draining {
            self.pending_apology = false;
            let apology = self.config.apology_text.clone();
            self.start_direct_turn(TurnKind::Apology, apology).await;
            return false;
        }
        self.pending_apology = false;

        if turn.interrupted {
            // Barge-in unwound: the interrupter takes the floor
            if let Some((participant, utterance)) = self.interrupter.take() {
                if !self.draining && self.participants.contains_key(&participant) {
                    self.active = Some(ActiveCapture::new(participant.clone(), utterance));
                    // The interrupter may already have finished speaking
                    // while the cancelled turn unwound
                    let ended_at = self
                        .participants
                        .get(&participant)
                        .and_then(|s| s.current.as_ref())
                        .and_then(|r| r.speech_ended_at);
                    if let Some(at) = ended_at {
                        self.speech_end_at = Some(at);
                        self.state = TurnState::Endpointing;
                    } else {
                        self.speech_end_at = None;
                        self.state = TurnState::Listening;
                    }
                    tracing::debug!(participant = %participant, "interrupted -> listening");
                    self.publish_status().await;
                    return false;
                }
            }
        }

        if !turn.failed && !turn.interrupted && turn.kind != TurnKind::Apology {
            self.summary.turns_completed += 1;
        }

        self.state = TurnState::Idle;
        let status = AgentStatusMessage::state(TurnState::Idle)
            .with_turn(turn.id.clone())
            .with_latencies(turn.timings.latencies());
        let _ = self
            .deps
            .telemetry
            .send(TelemetryEvent::Status(status))
            .await;

        self.draining
    }

    /// Turn-complete predicate: the captured text ends with sentence-final
    /// punctuation or a configured completion token.
    fn predicate_text_qualifies(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        let text = self.capture_text(active);
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed
            .chars()
            .last()
            .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
        {
            return true;
        }
        let lowered = trimmed.to_lowercase();
        self.config
            .completion_tokens
            .iter()
            .any(|token| lowered.ends_with(&token.to_lowercase()))
    }

    /// Folded text of earlier utterances in this capture plus the current
    /// utterance's best text, in order.
    fn capture_text(&self, active: &ActiveCapture) -> String {
        let mut parts: Vec<&str> = active.folded_text.iter().map(String::as_str).collect();
        if let Some(record) = self
            .participants
            .get(&active.participant)
            .and_then(|slot| slot.current.as_ref())
        {
            if active.utterance_ids.contains(&record.utterance.id) {
                let text = record.utterance.best_text();
                if !text.is_empty() {
                    parts.push(text);
                }
            }
        }
        parts.join(" ")
    }

    /// Commit the active capture and begin the reply turn.
    async fn commit_utterance(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        let speech_end_at = self.speech_end_at.take();

        let text = self.capture_text(&active);
        let mut last_final_at = active.last_final_at;

        {
            let Some(slot) = self.participants.get_mut(&active.participant) else {
                self.state = TurnState::Idle;
                self.publish_status().await;
                return self.draining;
            };

            if let Some(record) = slot.current.as_mut() {
                if record.last_final_at.is_some() {
                    last_final_at = record.last_final_at;
                }
                record.utterance.commit(Instant::now());
            }
            let high = active
                .utterance_ids
                .iter()
                .map(|u| u.0)
                .max()
                .unwrap_or(0);
            slot.closed_up_to = slot.closed_up_to.max(high);
            slot.current = None;
        }

        self.summary.utterances_committed += 1;

        if text.trim().is_empty() {
            // Nothing recognized: a no-op commit, no response
            tracing::debug!(participant = %active.participant, "empty commit, returning to idle");
            self.state = TurnState::Idle;
            self.publish_status().await;
            return self.draining;
        }

        // Publish the user's final transcript exactly once, at commit
        if let Some(slot) = self.participants.get(&active.participant) {
            let message = TranscriptMessage::user(
                slot.info.id.as_str(),
                slot.info.sid.clone(),
                text.clone(),
                false,
            );
            self.publish_transcript(message).await;
        }

        // Build the request from the snapshot, then record the user turn
        let request = {
            let dialogue = self.deps.dialogue.lock();
            ChatRequest::from_dialogue(&dialogue.snapshot(), &text, self.config.llm_temperature)
        };
        self.deps.dialogue.lock().push_user(text);

        let mut timings = TurnTimings {
            speech_end_at,
            last_final_at,
            committed_at: Some(Instant::now()),
            ..Default::default()
        };
        if timings.speech_end_at.is_none() {
            timings.speech_end_at = timings.committed_at;
        }

        self.state = TurnState::Thinking;
        tracing::info!(participant = %active.participant, "endpointing -> thinking (committed)");
        self.start_reply_turn(request, timings).await;
        false
    }

    /// Spawn the generator and TTS pipeline for a committed utterance.
    async fn start_reply_turn(&mut self, request: ChatRequest, timings: TurnTimings) {
        let turn_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (chunk_tx, chunk_rx) = mpsc::channel::<SpeakChunk>(16);

        let generator = ResponseGenerator::new(
            self.deps.llm.clone(),
            self.config.generator.clone(),
            self.deps.dialogue.clone(),
        );
        let events = self.event_tx.clone();
        let id = turn_id.clone();
        let generator_cancel = cancel_rx.clone();
        tokio::spawn(async move {
            let result = generator
                .run(request, chunk_tx, generator_cancel)
                .await
                .map_err(|e| e.to_string());
            let _ = events
                .send(ControllerEvent::GeneratorDone {
                    turn_id: id,
                    result,
                })
                .await;
        });

        self.spawn_tts(turn_id.clone(), chunk_rx, cancel_rx).await;

        self.turn = Some(ActiveTurn {
            id: turn_id,
            kind: TurnKind::Reply,
            cancel: cancel_tx,
            generator_done: false,
            tts_done: false,
            interrupted: false,
            failed: false,
            barge_in_at: None,
            timings,
        });
        self.publish_status().await;
    }

    /// Speak fixed text (greeting, apology) through the normal pipeline so
    /// barge-in and status reporting behave identically.
    async fn start_direct_turn(&mut self, kind: TurnKind, text: String) {
        let turn_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (chunk_tx, chunk_rx) = mpsc::channel::<SpeakChunk>(4);

        let events = self.event_tx.clone();
        let id = turn_id.clone();
        let spoken = text.clone();
        tokio::spawn(async move {
            let cancelled = chunk_tx
                .send(SpeakChunk {
                    index: 0,
                    text: spoken.clone(),
                    is_final: true,
                })
                .await
                .is_err();
            let _ = events
                .send(ControllerEvent::GeneratorDone {
                    turn_id: id,
                    result: Ok(GeneratorOutcome {
                        text: spoken,
                        cancelled,
                        time_to_first_token: None,
                        total_time: Duration::ZERO,
                    }),
                })
                .await;
        });

        self.spawn_tts(turn_id.clone(), chunk_rx, cancel_rx).await;

        self.state = TurnState::Thinking;
        self.turn = Some(ActiveTurn {
            id: turn_id,
            kind,
            cancel: cancel_tx,
            generator_done: false,
            tts_done: false,
            interrupted: false,
            failed: false,
            barge_in_at: None,
            timings: TurnTimings::default(),
        });
        self.publish_status().await;
    }

    async fn spawn_tts(
        &self,
        turn_id: String,
        chunk_rx: mpsc::Receiver<SpeakChunk>,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let pipeline = TtsPipeline::new(
            self.deps.tts.clone(),
            self.deps.transport.clone(),
            self.config.egress.clone(),
            self.event_tx.clone(),
            turn_id.clone(),
        );
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = pipeline.run(chunk_rx, cancel_rx).await;
            let _ = events
                .send(ControllerEvent::TtsDone { turn_id, outcome })
                .await;
        });
    }

    /// Publish a bystander's finished utterance and close it.
    async fn flush_bystander(&mut self, participant: &ParticipantId) {
        let Some(slot) = self.participants.get_mut(participant) else {
            return;
        };
        let Some(record) = slot.current.as_ref() else {
            return;
        };
        if record.speech_ended_at.is_none() {
            return;
        }
        let text = record.utterance.best_text().to_string();
        if text.trim().is_empty() {
            return;
        }

        slot.closed_up_to = slot.closed_up_to.max(record.utterance.id.0);
        slot.current = None;
        let message =
            TranscriptMessage::user(slot.info.id.as_str(), slot.info.sid.clone(), text, false);
        self.publish_transcript(message).await;
    }

    fn cancel_turn(&mut self, reason: &str) {
        if let Some(turn) = self.turn.as_mut() {
            tracing::info!(turn_id = %turn.id, %reason, "cancelling turn");
            let _ = turn.cancel.send(true);
        }
    }

    async fn publish_status(&self) {
        let mut message = AgentStatusMessage::state(self.state);
        if let Some(turn) = &self.turn {
            message = message.with_turn(turn.id.clone());
        }
        let _ = self
            .deps
            .telemetry
            .send(TelemetryEvent::Status(message))
            .await;
    }

    async fn publish_transcript(&self, message: TranscriptMessage) {
        let _ = self
            .deps
            .telemetry
            .send(TelemetryEvent::Transcript(message))
            .await;
    }
}

fn slot_has_ended(slot: Option<&ParticipantSlot>) -> bool {
    slot.and_then(|s| s.current.as_ref())
        .is_some_and(|r| r.speech_ended_at.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TurnControllerConfig {
        TurnControllerConfig::default()
    }

    #[test]
    fn test_latency_derivation() {
        let t0 = Instant::now();
        let timings = TurnTimings {
            speech_end_at: Some(t0),
            last_final_at: Some(t0 + Duration::from_millis(120)),
            committed_at: Some(t0 + Duration::from_millis(300)),
            first_token: Some(Duration::from_millis(350)),
            llm_total: Some(Duration::from_millis(900)),
            first_chunk_at: Some(t0 + Duration::from_millis(700)),
            first_audio_at: Some(t0 + Duration::from_millis(880)),
        };
        let latencies = timings.latencies();
        assert_eq!(latencies.stt_ms, 120);
        assert_eq!(latencies.llm_ttft_ms, 350);
        assert_eq!(latencies.llm_total_ms, 900);
        assert_eq!(latencies.tts_ttfb_ms, 180);
        assert_eq!(latencies.e2e_ms, 880);
    }

    #[test]
    fn test_missing_breakpoints_zero_out() {
        let latencies = TurnTimings::default().latencies();
        assert_eq!(latencies.stt_ms, 0);
        assert_eq!(latencies.e2e_ms, 0);
    }

    #[test]
    fn test_default_config_matches_settings() {
        let c = config();
        assert_eq!(c.endpointing_delay, Duration::from_millis(2_000));
        assert_eq!(c.predicate_min_silence, Duration::from_millis(300));
        assert_eq!(c.barge_in_deadline, Duration::from_millis(150));
        assert!(c.greeting.is_none());
    }
}
