//! Session supervisor
//!
//! Owns all per-session resources: the ingress demultiplexer, one
//! participant pipeline and one STT transport per human participant, the
//! turn controller, and the telemetry hub. A single `watch` cancellation
//! signal is the root of the hierarchy; every child observes it at its
//! suspension points.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use room_agent_config::Settings;
use room_agent_core::{
    DialogueContext, LanguageModel, MediaTransport, Participant, ParticipantId, SpeechToText,
    TextToSpeech, TransportEvent,
};
use room_agent_llm::ChatClient;
use room_agent_pipeline::{
    ControllerDeps, ControllerEvent, ControllerSummary, HttpTts, IngressConfig, IngressDemux,
    SharedDialogue, SttTransport, SttTransportConfig, TurnController, TurnControllerConfig,
    VadConfig, WebSocketStt,
};

use crate::participant::ParticipantPipeline;
use crate::telemetry::TelemetryHub;
use crate::SessionError;

/// Counters reported when the session ends.
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub controller: ControllerSummary,
    /// Ingress frames dropped on queue overflow
    pub dropped_frames: u64,
    /// Frames that arrived for unregistered identities
    pub unknown_dropped: u64,
}

/// Handle to a running session.
pub struct SessionHandle {
    id: String,
    cancel: watch::Sender<bool>,
    task: tokio::task::JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request shutdown; children observe the signal at their suspension
    /// points.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end and collect its counters.
    pub async fn join(self) -> SessionSummary {
        self.task.await.unwrap_or_default()
    }
}

/// One voice agent session in one room.
pub struct Session;

impl Session {
    /// Spawn a session against injected engine clients. Tests use this with
    /// scripted doubles.
    pub fn spawn(
        settings: Settings,
        transport: Arc<dyn MediaTransport>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Result<SessionHandle, SessionError> {
        // An invalid configuration refuses to start, full stop
        settings.validate()?;

        let id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let runner = SessionRunner {
            id: id.clone(),
            settings,
            transport,
            stt,
            llm,
            tts,
        };
        let task = tokio::spawn(runner.run(cancel_rx));

        tracing::info!(session_id = %id, "session started");
        Ok(SessionHandle {
            id,
            cancel: cancel_tx,
            task,
        })
    }

    /// Spawn a session with production clients built from the settings.
    pub fn connect(
        settings: Settings,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<SessionHandle, SessionError> {
        settings.validate()?;

        let stt: Arc<dyn SpeechToText> = Arc::new(WebSocketStt::new(settings.stt.clone()));
        let llm: Arc<dyn LanguageModel> = Arc::new(
            ChatClient::new(settings.llm.clone()).map_err(|e| SessionError::Client(e.to_string()))?,
        );
        let tts: Arc<dyn TextToSpeech> = Arc::new(
            HttpTts::new(settings.tts.clone()).map_err(|e| SessionError::Client(e.to_string()))?,
        );

        Self::spawn(settings, transport, stt, llm, tts)
    }
}

struct SessionRunner {
    id: String,
    settings: Settings,
    transport: Arc<dyn MediaTransport>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
}

impl SessionRunner {
    async fn run(self, mut external_cancel: watch::Receiver<bool>) -> SessionSummary {
        // Internal cancellation root: fed by the external handle, the
        // transport closing, or the controller finishing its drain
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let dialogue: SharedDialogue = Arc::new(Mutex::new(DialogueContext::new(
            &self.settings.dialogue.system_preamble,
            self.settings.dialogue.max_turns,
            self.settings.dialogue.max_chars,
        )));
        let ingress = IngressDemux::new(IngressConfig::default());
        let hub = TelemetryHub::spawn(self.transport.clone());

        let (event_tx, event_rx) = mpsc::channel::<ControllerEvent>(256);
        let controller = TurnController::new(
            TurnControllerConfig::from_settings(&self.settings),
            ControllerDeps {
                llm: self.llm.clone(),
                tts: self.tts.clone(),
                transport: self.transport.clone(),
                dialogue: dialogue.clone(),
                telemetry: hub.sender(),
            },
            event_tx.clone(),
        );
        let mut controller_task = tokio::spawn(controller.run(event_rx, cancel_rx.clone()));

        let mut transport_rx = self.transport.subscribe();
        let mut members: HashSet<ParticipantId> = HashSet::new();
        let mut controller_summary = ControllerSummary::default();

        let vad_config = VadConfig {
            activation_threshold: self.settings.vad.activation_threshold,
            window_ms: self.settings.vad.window_ms,
            min_speech_ms: self.settings.vad.min_speech_ms,
            min_silence_ms: self.settings.vad.min_silence_ms,
            ..VadConfig::default()
        };

        loop {
            tokio::select! {
                _ = external_cancel.changed() => {
                    if *external_cancel.borrow() {
                        tracing::info!(session_id = %self.id, "external shutdown requested");
                        let _ = cancel_tx.send(true);
                    }
                }

                result = &mut controller_task => {
                    controller_summary = result.unwrap_or_default();
                    break;
                }

                event = transport_rx.recv() => match event {
                    Ok(TransportEvent::ParticipantJoined { identity, name, sid }) => {
                        if !members.insert(identity.clone()) {
                            continue;
                        }
                        self.attach_participant(
                            identity.clone(),
                            &ingress,
                            vad_config.clone(),
                            event_tx.clone(),
                            cancel_rx.clone(),
                        );
                        let _ = event_tx
                            .send(ControllerEvent::ParticipantJoined {
                                participant: Participant::new(identity, name, sid),
                            })
                            .await;
                    }

                    Ok(TransportEvent::ParticipantLeft { identity }) => {
                        if !members.remove(&identity) {
                            continue;
                        }
                        ingress.unregister(&identity);
                        let _ = event_tx
                            .send(ControllerEvent::ParticipantLeft {
                                participant: identity,
                                remaining: members.len(),
                            })
                            .await;
                    }

                    Ok(TransportEvent::AudioFrame { identity, pcm, sample_rate_hz, channels, captured_at }) => {
                        if let Err(e) =
                            ingress.push(&identity, &pcm, sample_rate_hz, channels, captured_at)
                        {
                            tracing::debug!(error = %e, "ingress frame dropped");
                        }
                    }

                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "transport event stream lagged");
                    }

                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!(session_id = %self.id, "transport closed");
                        let _ = cancel_tx.send(true);
                    }
                },
            }
        }

        // Unwind: stop every child, then collect what they left behind
        let _ = cancel_tx.send(true);
        if !controller_task.is_finished() {
            if let Ok(summary) = controller_task.await {
                controller_summary = summary;
            }
        }
        drop(event_tx);
        hub.close().await;

        let summary = SessionSummary {
            controller: controller_summary,
            dropped_frames: ingress.dropped_frames(),
            unknown_dropped: ingress.unknown_dropped(),
        };
        tracing::info!(
            session_id = %self.id,
            turns = summary.controller.turns_completed,
            dropped_frames = summary.dropped_frames,
            "session ended"
        );
        summary
    }

    /// Wire up the ingress queue, VAD task, and STT transport for one
    /// participant.
    fn attach_participant(
        &self,
        identity: ParticipantId,
        ingress: &IngressDemux,
        vad_config: VadConfig,
        event_tx: mpsc::Sender<ControllerEvent>,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let handle = ingress.register(identity.clone());

        let (feed_tx, feed_rx) = mpsc::channel(64);
        let stt_transport = SttTransport::new(
            identity.clone(),
            self.stt.clone(),
            SttTransportConfig::from_settings(&self.settings.stt),
            event_tx.clone(),
        );
        tokio::spawn(stt_transport.run(feed_rx, cancel_rx.clone()));

        let pipeline = ParticipantPipeline::new(
            identity,
            room_agent_pipeline::VoiceActivityDetector::new(vad_config),
            event_tx,
            feed_tx,
        );
        tokio::spawn(pipeline.run(handle, cancel_rx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_settings_refuse_to_start() {
        let mut settings = Settings::default();
        settings.vad.activation_threshold = 2.0;

        // No clients needed; validation fails before anything spawns.
        // Session::connect validates first as well.
        assert!(settings.validate().is_err());
    }
}
