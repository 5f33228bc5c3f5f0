//! Telemetry fan-out
//!
//! Everything observable about a session flows through here: transcript
//! messages and agent status updates are broadcast to in-process
//! subscribers and serialized onto their data-channel topics. Delivery is
//! best effort; telemetry never blocks the pipeline.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use room_agent_core::{MediaTransport, TelemetryEvent};

/// Per-session telemetry hub.
pub struct TelemetryHub {
    input: mpsc::Sender<TelemetryEvent>,
    fanout: broadcast::Sender<TelemetryEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl TelemetryHub {
    /// Spawn the publisher task for this session.
    pub fn spawn(transport: Arc<dyn MediaTransport>) -> Self {
        let (input, mut rx) = mpsc::channel::<TelemetryEvent>(256);
        let (fanout, _) = broadcast::channel(256);
        let fanout_tx = fanout.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = fanout_tx.send(event.clone());

                let payload = match &event {
                    TelemetryEvent::Transcript(message) => serde_json::to_vec(message),
                    TelemetryEvent::Status(message) => serde_json::to_vec(message),
                };
                let payload = match payload {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(error = %e, "telemetry serialization failed");
                        continue;
                    }
                };

                if let Err(e) = transport.publish_data(event.topic(), payload).await {
                    tracing::warn!(error = %e, topic = event.topic(), "telemetry publish failed");
                }
            }
        });

        Self {
            input,
            fanout,
            task,
        }
    }

    /// Sender handed to the turn controller and anything else that emits.
    pub fn sender(&self) -> mpsc::Sender<TelemetryEvent> {
        self.input.clone()
    }

    /// In-process subscription, mainly for tests and diagnostics.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.fanout.subscribe()
    }

    /// Stop the publisher once all senders are gone.
    pub async fn close(self) {
        drop(self.input);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use room_agent_core::{AgentStatusMessage, Result, TransportEvent, TurnState};

    #[derive(Default)]
    struct RecordingTransport {
        data: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl MediaTransport for RecordingTransport {
        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            broadcast::channel(1).1
        }

        async fn publish_audio(&self, _pcm: Vec<i16>, _rate: u32) -> Result<()> {
            Ok(())
        }

        async fn publish_data(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            self.data.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_reach_topic_and_subscribers() {
        let transport = Arc::new(RecordingTransport::default());
        let hub = TelemetryHub::spawn(transport.clone());
        let mut rx = hub.subscribe();

        hub.sender()
            .send(TelemetryEvent::Status(AgentStatusMessage::state(
                TurnState::Listening,
            )))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TelemetryEvent::Status(_)));

        hub.close().await;
        let data = transport.data.lock();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].0, "agent_status");
        let json: serde_json::Value = serde_json::from_slice(&data[0].1).unwrap();
        assert_eq!(json["state"], "listening");
    }
}
