//! Per-participant ingress + VAD task
//!
//! One task per participant: drains the ingress queue in capture order,
//! runs the voice activity detector, numbers utterances, and feeds both the
//! turn controller (VAD transitions) and the STT transport (PCM plus
//! utterance markers). VAD is cheap enough to colocate with ingress.

use tokio::sync::{mpsc, watch};

use room_agent_core::{ParticipantId, UtteranceId};
use room_agent_pipeline::{ControllerEvent, IngressHandle, SttFeed, VadEvent, VoiceActivityDetector};

pub(crate) struct ParticipantPipeline {
    participant: ParticipantId,
    vad: VoiceActivityDetector,
    events: mpsc::Sender<ControllerEvent>,
    stt_feed: mpsc::Sender<SttFeed>,
    /// Utterance ids increase strictly per participant
    next_utterance: u64,
}

impl ParticipantPipeline {
    pub(crate) fn new(
        participant: ParticipantId,
        vad: VoiceActivityDetector,
        events: mpsc::Sender<ControllerEvent>,
        stt_feed: mpsc::Sender<SttFeed>,
    ) -> Self {
        Self {
            participant,
            vad,
            events,
            stt_feed,
            next_utterance: 0,
        }
    }

    pub(crate) async fn run(mut self, handle: IngressHandle, mut cancel: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                frame = handle.recv() => {
                    let Some(frame) = frame else { break };
                    if self.process_frame(&frame).await {
                        break;
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(
            participant = %self.participant,
            dropped = handle.dropped_frames(),
            "participant pipeline stopped"
        );
    }

    /// Returns true when a downstream channel closed and the task should
    /// stop.
    async fn process_frame(&mut self, frame: &room_agent_core::AudioFrame) -> bool {
        for event in self.vad.push_frame(frame) {
            match event {
                VadEvent::SpeechStart { at } => {
                    self.next_utterance += 1;
                    let utterance = UtteranceId(self.next_utterance);

                    if self
                        .stt_feed
                        .send(SttFeed::Open { utterance })
                        .await
                        .is_err()
                    {
                        return true;
                    }
                    if self
                        .events
                        .send(ControllerEvent::SpeechStart {
                            participant: self.participant.clone(),
                            utterance,
                            at,
                        })
                        .await
                        .is_err()
                    {
                        return true;
                    }
                }

                VadEvent::SpeechEnd { at } => {
                    let utterance = UtteranceId(self.next_utterance);

                    if self.stt_feed.send(SttFeed::SpeechEnded).await.is_err() {
                        return true;
                    }
                    if self
                        .events
                        .send(ControllerEvent::SpeechEnd {
                            participant: self.participant.clone(),
                            utterance,
                            at,
                        })
                        .await
                        .is_err()
                    {
                        return true;
                    }
                }
            }
        }

        // Every frame goes to the STT transport; it decides what to forward
        // based on utterance state and the hangover window
        self.stt_feed
            .send(SttFeed::Pcm {
                pcm: frame.samples.to_vec(),
            })
            .await
            .is_err()
    }
}
