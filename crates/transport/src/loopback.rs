//! In-process loopback transport
//!
//! Stands in for the media server during tests: room events are injected by
//! the test, and everything the agent publishes (audio frames, data-channel
//! payloads) is captured with timestamps for assertions.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use room_agent_core::{MediaTransport, ParticipantId, Result, TransportEvent};

/// One audio frame published by the agent.
#[derive(Debug, Clone)]
pub struct PublishedAudio {
    pub pcm: Vec<i16>,
    pub sample_rate_hz: u32,
    pub published_at: Instant,
}

/// One data-channel payload published by the agent.
#[derive(Debug, Clone)]
pub struct PublishedData {
    pub topic: String,
    pub payload: Vec<u8>,
    pub published_at: Instant,
}

/// In-process media transport for tests.
pub struct LoopbackTransport {
    events: broadcast::Sender<TransportEvent>,
    audio: Mutex<Vec<PublishedAudio>>,
    data: Mutex<Vec<PublishedData>>,
    published: Notify,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        // Capacity sized for bursts of 20ms frames; test subscribers drain
        // promptly so lagging is a test bug, not a runtime concern.
        let (events, _) = broadcast::channel(1024);
        Self {
            events,
            audio: Mutex::new(Vec::new()),
            data: Mutex::new(Vec::new()),
            published: Notify::new(),
        }
    }

    /// Inject a participant join.
    pub fn join(&self, identity: &str, name: &str, sid: &str) {
        let _ = self.events.send(TransportEvent::ParticipantJoined {
            identity: ParticipantId::new(identity),
            name: name.to_string(),
            sid: sid.to_string(),
        });
    }

    /// Inject a participant departure.
    pub fn leave(&self, identity: &str) {
        let _ = self.events.send(TransportEvent::ParticipantLeft {
            identity: ParticipantId::new(identity),
        });
    }

    /// Inject decoded audio from a participant's track.
    pub fn push_audio(&self, identity: &str, pcm: Vec<i16>, sample_rate_hz: u32, channels: u16) {
        let _ = self.events.send(TransportEvent::AudioFrame {
            identity: ParticipantId::new(identity),
            pcm,
            sample_rate_hz,
            channels,
            captured_at: Instant::now(),
        });
    }

    /// Snapshot of all audio published so far.
    pub fn published_audio(&self) -> Vec<PublishedAudio> {
        self.audio.lock().clone()
    }

    /// Snapshot of all data payloads published so far.
    pub fn published_data(&self) -> Vec<PublishedData> {
        self.data.lock().clone()
    }

    /// Data payloads on one topic, decoded as UTF-8 JSON strings.
    pub fn published_on_topic(&self, topic: &str) -> Vec<String> {
        self.data
            .lock()
            .iter()
            .filter(|d| d.topic == topic)
            .map(|d| String::from_utf8_lossy(&d.payload).into_owned())
            .collect()
    }

    /// Timestamp of the most recently published audio frame.
    pub fn last_audio_at(&self) -> Option<Instant> {
        self.audio.lock().last().map(|a| a.published_at)
    }

    /// Wait until at least one more publish (audio or data) lands.
    pub async fn wait_for_publish(&self) {
        self.published.notified().await;
    }

    /// Drop captured audio, keeping data payloads.
    pub fn clear_audio(&self) {
        self.audio.lock().clear();
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn publish_audio(&self, pcm: Vec<i16>, sample_rate_hz: u32) -> Result<()> {
        self.audio.lock().push(PublishedAudio {
            pcm,
            sample_rate_hz,
            published_at: Instant::now(),
        });
        self.published.notify_waiters();
        Ok(())
    }

    async fn publish_data(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.data.lock().push(PublishedData {
            topic: topic.to_string(),
            payload,
            published_at: Instant::now(),
        });
        self.published.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let transport = LoopbackTransport::new();
        let mut rx = transport.subscribe();

        transport.join("alice", "Alice", "PA_1");
        transport.push_audio("alice", vec![0i16; 160], 16_000, 1);
        transport.leave("alice");

        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::ParticipantJoined { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::AudioFrame { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::ParticipantLeft { .. }
        ));
    }

    #[tokio::test]
    async fn test_publishes_are_captured() {
        let transport = LoopbackTransport::new();

        transport
            .publish_audio(vec![1i16; 960], 48_000)
            .await
            .unwrap();
        transport
            .publish_data("transcripts", b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(transport.published_audio().len(), 1);
        assert_eq!(transport.published_on_topic("transcripts"), vec!["{}"]);
        assert!(transport.published_on_topic("agent_status").is_empty());
    }
}
