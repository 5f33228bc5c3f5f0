//! STT transport
//!
//! One transport per participant. The send loop forwards PCM while the
//! participant is in speech and for a short hangover window afterwards to
//! catch trailing phonemes, then flushes with `{"eof":true}`. The receive
//! loop runs as its own task so recognition output is never blocked behind
//! audio forwarding. Connections are opened on the first `SpeechStart`,
//! kept warm between utterances, and torn down after the idle window.
//!
//! Duplicate finals are dropped here, keyed on
//! `(participant, utterance_id, text_hash)`; the stale-final rule lives in
//! the turn controller, which knows what was committed or cancelled.

mod client;

pub use client::WebSocketStt;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use rand::Rng;

use room_agent_config::SttSettings;
use room_agent_core::{ParticipantId, SpeechToText, SttSegment, SttSink, UtteranceId};

use crate::sleep_until_opt;
use crate::turn::ControllerEvent;

/// Feed from the participant's ingress/VAD task.
#[derive(Debug)]
pub enum SttFeed {
    /// A new utterance opened; ensure a warm connection and tag output
    Open { utterance: UtteranceId },
    /// Normalized 16 kHz mono PCM, every frame regardless of speech state
    Pcm { pcm: Vec<i16> },
    /// Speech ended; keep forwarding for the hangover window, then flush
    SpeechEnded,
}

/// STT transport configuration
#[derive(Debug, Clone)]
pub struct SttTransportConfig {
    pub hangover: Duration,
    pub idle_keepalive: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    /// Reconnect attempts per utterance before giving up
    pub max_attempts: u32,
}

impl Default for SttTransportConfig {
    fn default() -> Self {
        use room_agent_config::constants::{retry, timeouts, turn};
        Self {
            hangover: Duration::from_millis(turn::STT_HANGOVER_MS),
            idle_keepalive: Duration::from_secs(timeouts::STT_IDLE_KEEPALIVE_S),
            backoff_initial: Duration::from_millis(retry::STT_BACKOFF_INITIAL_MS),
            backoff_cap: Duration::from_millis(retry::STT_BACKOFF_CAP_MS),
            max_attempts: retry::STT_MAX_ATTEMPTS,
        }
    }
}

impl SttTransportConfig {
    pub fn from_settings(settings: &SttSettings) -> Self {
        Self {
            hangover: Duration::from_millis(settings.hangover_ms),
            idle_keepalive: Duration::from_secs(settings.idle_keepalive_s),
            ..Default::default()
        }
    }
}

/// Message from the receive loop to the transport task.
enum ReaderMessage {
    Segments(Vec<SttSegment>),
    Failed(String),
    Closed,
}

enum ForwardState {
    /// Not forwarding; frames are discarded
    Idle,
    /// Utterance in progress; frames forwarded
    Active,
    /// Speech ended; forwarding until the deadline, then flush
    Hangover(Instant),
}

struct Connection {
    sink: Box<dyn SttSink>,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Per-participant STT transport task.
pub struct SttTransport {
    participant: ParticipantId,
    client: Arc<dyn SpeechToText>,
    config: SttTransportConfig,
    events: mpsc::Sender<ControllerEvent>,
}

impl SttTransport {
    pub fn new(
        participant: ParticipantId,
        client: Arc<dyn SpeechToText>,
        config: SttTransportConfig,
        events: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            participant,
            client,
            config,
            events,
        }
    }

    pub async fn run(
        self,
        mut feed: mpsc::Receiver<SttFeed>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let (reader_tx, mut reader_rx) = mpsc::channel::<ReaderMessage>(32);

        let mut connection: Option<Connection> = None;
        let mut forward = ForwardState::Idle;
        let mut current: Option<UtteranceId> = None;
        let mut attempts: u32 = 0;
        let mut seen_finals: HashSet<(u64, u64)> = HashSet::new();
        let mut idle_deadline: Option<Instant> = None;

        loop {
            let hangover_at = match forward {
                ForwardState::Hangover(at) => Some(at),
                _ => None,
            };

            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }

                item = feed.recv() => {
                    let Some(item) = item else { break };
                    match item {
                        SttFeed::Open { utterance } => {
                            current = Some(utterance);
                            forward = ForwardState::Active;
                            attempts = 0;
                            seen_finals.clear();
                            idle_deadline = None;

                            if connection.is_none() {
                                connection = self
                                    .connect(&mut attempts, &reader_tx, &mut cancel)
                                    .await;
                                if connection.is_none() {
                                    self.report_unavailable(utterance, "connect failed").await;
                                    forward = ForwardState::Idle;
                                }
                            }
                        }

                        SttFeed::Pcm { pcm } => {
                            let forwarding = match forward {
                                ForwardState::Active => true,
                                ForwardState::Hangover(at) => Instant::now() < at,
                                ForwardState::Idle => false,
                            };
                            if !forwarding {
                                continue;
                            }

                            if let Some(conn) = connection.as_mut() {
                                if let Err(e) = conn.sink.send_pcm(&pcm).await {
                                    tracing::warn!(
                                        participant = %self.participant,
                                        error = %e,
                                        "stt send failed, reconnecting"
                                    );
                                    connection = self
                                        .connect(&mut attempts, &reader_tx, &mut cancel)
                                        .await;
                                    if connection.is_none() {
                                        if let Some(utterance) = current {
                                            self.report_unavailable(utterance, &e.to_string())
                                                .await;
                                        }
                                        forward = ForwardState::Idle;
                                    }
                                }
                            }
                        }

                        SttFeed::SpeechEnded => {
                            if matches!(forward, ForwardState::Active) {
                                forward =
                                    ForwardState::Hangover(Instant::now() + self.config.hangover);
                            }
                        }
                    }
                }

                message = reader_rx.recv() => {
                    match message {
                        Some(ReaderMessage::Segments(segments)) => {
                            let Some(utterance) = current else { continue };
                            if self.forward_segments(utterance, segments, &mut seen_finals).await {
                                break;
                            }
                        }
                        Some(ReaderMessage::Failed(reason)) => {
                            connection = None;
                            if !matches!(forward, ForwardState::Idle) {
                                tracing::warn!(
                                    participant = %self.participant,
                                    %reason,
                                    "stt connection lost mid-utterance, reconnecting"
                                );
                                connection = self
                                    .connect(&mut attempts, &reader_tx, &mut cancel)
                                    .await;
                                if connection.is_none() {
                                    if let Some(utterance) = current {
                                        self.report_unavailable(utterance, &reason).await;
                                    }
                                    forward = ForwardState::Idle;
                                }
                            }
                        }
                        Some(ReaderMessage::Closed) => {
                            connection = None;
                        }
                        None => break,
                    }
                }

                _ = sleep_until_opt(hangover_at), if hangover_at.is_some() => {
                    if let Some(conn) = connection.as_mut() {
                        if let Err(e) = conn.sink.flush().await {
                            tracing::warn!(participant = %self.participant, error = %e, "stt eof failed");
                            connection = None;
                        }
                    }
                    forward = ForwardState::Idle;
                    idle_deadline = Some(Instant::now() + self.config.idle_keepalive);
                }

                _ = sleep_until_opt(idle_deadline), if idle_deadline.is_some() && connection.is_some() => {
                    tracing::debug!(participant = %self.participant, "stt connection idle, closing");
                    connection = None;
                    idle_deadline = None;
                }
            }
        }

        if let Some(conn) = connection.as_mut() {
            let _ = conn.sink.flush().await;
        }
        tracing::debug!(participant = %self.participant, "stt transport stopped");
    }

    /// Forward segments as controller events, deduplicating finals.
    /// Returns true when the controller is gone.
    async fn forward_segments(
        &self,
        utterance: UtteranceId,
        segments: Vec<SttSegment>,
        seen_finals: &mut HashSet<(u64, u64)>,
    ) -> bool {
        for segment in segments {
            if segment.text.trim().is_empty() {
                continue;
            }

            let event = if segment.completed {
                if !seen_finals.insert((utterance.0, text_hash(&segment.text))) {
                    tracing::debug!(
                        participant = %self.participant,
                        %utterance,
                        "duplicate final dropped"
                    );
                    continue;
                }
                ControllerEvent::Final {
                    participant: self.participant.clone(),
                    utterance,
                    text: segment.text,
                    at: Instant::now(),
                }
            } else {
                ControllerEvent::Interim {
                    participant: self.participant.clone(),
                    utterance,
                    text: segment.text,
                }
            };

            if self.events.send(event).await.is_err() {
                return true;
            }
        }
        false
    }

    /// Connect with exponential backoff and jitter. Attempts are counted
    /// per utterance; `None` means they are exhausted (or we were
    /// cancelled).
    async fn connect(
        &self,
        attempts: &mut u32,
        reader_tx: &mpsc::Sender<ReaderMessage>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Connection> {
        while *attempts < self.config.max_attempts {
            if *attempts > 0 {
                let backoff = self.backoff_for(*attempts);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return None;
                        }
                    }
                }
            }
            *attempts += 1;

            match self.client.open_stream(&self.participant).await {
                Ok((sink, mut source)) => {
                    let tx = reader_tx.clone();
                    let reader = tokio::spawn(async move {
                        loop {
                            match source.next_segments().await {
                                Some(Ok(segments)) => {
                                    if tx.send(ReaderMessage::Segments(segments)).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    let _ = tx.send(ReaderMessage::Failed(e.to_string())).await;
                                    return;
                                }
                                None => {
                                    let _ = tx.send(ReaderMessage::Closed).await;
                                    return;
                                }
                            }
                        }
                    });
                    return Some(Connection { sink, reader });
                }
                Err(e) => {
                    tracing::warn!(
                        participant = %self.participant,
                        attempt = *attempts,
                        error = %e,
                        "stt connect attempt failed"
                    );
                }
            }
        }
        None
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_initial
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.config.backoff_cap);
        // +-10% jitter so a flapping recognizer is not hammered in lockstep
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        base.mul_f64(jitter)
    }

    async fn report_unavailable(&self, utterance: UtteranceId, reason: &str) {
        metrics::counter!("stt_unavailable").increment(1);
        let _ = self
            .events
            .send(ControllerEvent::SttFailed {
                participant: self.participant.clone(),
                utterance,
                reason: reason.to_string(),
            })
            .await;
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let transport = SttTransport::new(
            ParticipantId::new("alice"),
            Arc::new(WebSocketStt::new(SttSettings::default())),
            SttTransportConfig::default(),
            mpsc::channel(1).0,
        );

        // 250ms doubling toward the 4s cap, with 10% jitter either way
        let b1 = transport.backoff_for(1);
        assert!(b1 >= Duration::from_millis(225) && b1 <= Duration::from_millis(275));

        let b5 = transport.backoff_for(5);
        assert!(b5 <= Duration::from_millis(4_400));

        let b20 = transport.backoff_for(20);
        assert!(b20 <= Duration::from_millis(4_400));
    }

    #[test]
    fn test_text_hash_distinguishes_finals() {
        assert_eq!(text_hash("hello"), text_hash("hello"));
        assert_ne!(text_hash("hello"), text_hash("hello there"));
    }
}
