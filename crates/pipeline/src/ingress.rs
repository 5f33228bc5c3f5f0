//! Audio ingress demultiplexer
//!
//! Receives decoded frames from the media transport callback, normalizes
//! them to mono 16 kHz PCM16, and routes each to a bounded per-participant
//! queue. On overflow the oldest frames are dropped: conversational latency
//! budgets prefer freshness over completeness.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

use room_agent_core::audio::{downmix_to_mono, resample_linear, samples_for_ms};
use room_agent_core::{AudioFrame, ParticipantId};

use crate::PipelineError;

/// Ingress configuration
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Rate frames are normalized to (the VAD/STT rate)
    pub target_rate_hz: u32,
    /// Emitted frame length; kept short so VAD stays responsive
    pub frame_ms: u32,
    /// Per-participant queue capacity
    pub queue_capacity_ms: u32,
}

impl Default for IngressConfig {
    fn default() -> Self {
        use room_agent_config::constants::audio::{CAPTURE_RATE_HZ, FRAME_MS, INGRESS_QUEUE_MS};
        Self {
            target_rate_hz: CAPTURE_RATE_HZ,
            frame_ms: FRAME_MS,
            queue_capacity_ms: INGRESS_QUEUE_MS,
        }
    }
}

struct ParticipantQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity_frames: usize,
}

impl ParticipantQueue {
    fn push(&self, frame: AudioFrame) {
        {
            let mut frames = self.frames.lock();
            while frames.len() >= self.capacity_frames {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ingress_dropped_frames").increment(1);
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Consumer handle for one participant's normalized frame stream.
#[derive(Clone)]
pub struct IngressHandle {
    queue: Arc<ParticipantQueue>,
}

impl IngressHandle {
    /// Next frame in capture order, or `None` once the participant is
    /// unregistered and the queue is drained.
    pub async fn recv(&self) -> Option<AudioFrame> {
        loop {
            if let Some(frame) = self.queue.frames.lock().pop_front() {
                return Some(frame);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Frames dropped on overflow so far.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Routes decoded transport audio to per-participant queues.
pub struct IngressDemux {
    config: IngressConfig,
    participants: DashMap<ParticipantId, Arc<ParticipantQueue>>,
    /// Frames that arrived for unregistered identities
    unknown_dropped: AtomicU64,
    /// Leftover samples smaller than one frame, per participant
    remainders: DashMap<ParticipantId, Vec<i16>>,
}

impl IngressDemux {
    pub fn new(config: IngressConfig) -> Self {
        Self {
            config,
            participants: DashMap::new(),
            unknown_dropped: AtomicU64::new(0),
            remainders: DashMap::new(),
        }
    }

    /// Register a participant and return the consumer handle for its queue.
    pub fn register(&self, participant: ParticipantId) -> IngressHandle {
        let capacity_frames =
            (self.config.queue_capacity_ms / self.config.frame_ms).max(1) as usize;
        let queue = Arc::new(ParticipantQueue {
            frames: Mutex::new(VecDeque::with_capacity(capacity_frames)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity_frames,
        });
        self.participants.insert(participant, queue.clone());
        IngressHandle { queue }
    }

    /// Unregister a participant; its consumer sees end-of-stream after the
    /// queue drains.
    pub fn unregister(&self, participant: &ParticipantId) {
        if let Some((_, queue)) = self.participants.remove(participant) {
            queue.close();
        }
        self.remainders.remove(participant);
    }

    /// Route one decoded frame from the transport.
    ///
    /// Normalizes to mono at the target rate and splits into `frame_ms`
    /// frames; a sub-frame tail is carried into the next push so capture
    /// order and total duration are preserved.
    pub fn push(
        &self,
        participant: &ParticipantId,
        pcm: &[i16],
        sample_rate_hz: u32,
        channels: u16,
        captured_at: Instant,
    ) -> Result<(), PipelineError> {
        let queue = match self.participants.get(participant) {
            Some(queue) => queue.clone(),
            None => {
                self.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::ParticipantUnknown(participant.clone()));
            }
        };

        let mono = downmix_to_mono(pcm, channels);
        let normalized = resample_linear(&mono, sample_rate_hz, self.config.target_rate_hz);

        let frame_samples = samples_for_ms(self.config.target_rate_hz, self.config.frame_ms);
        let mut buffer = self
            .remainders
            .entry(participant.clone())
            .or_default();
        buffer.extend_from_slice(&normalized);

        let mut offset = 0;
        while buffer.len() - offset >= frame_samples {
            let chunk = buffer[offset..offset + frame_samples].to_vec();
            offset += frame_samples;
            queue.push(AudioFrame::new(
                participant.clone(),
                chunk,
                self.config.target_rate_hz,
                captured_at,
            ));
        }
        buffer.drain(..offset);

        Ok(())
    }

    /// Frames received for unregistered identities.
    pub fn unknown_dropped(&self) -> u64 {
        self.unknown_dropped.load(Ordering::Relaxed)
    }

    /// Total frames dropped on overflow across participants.
    pub fn dropped_frames(&self) -> u64 {
        self.participants
            .iter()
            .map(|entry| entry.value().dropped.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demux() -> IngressDemux {
        IngressDemux::new(IngressConfig::default())
    }

    #[tokio::test]
    async fn test_normalizes_and_splits_frames() {
        let demux = demux();
        let alice = ParticipantId::new("alice");
        let handle = demux.register(alice.clone());

        // 40ms of stereo 48kHz audio
        let pcm = vec![100i16; 48 * 40 * 2];
        demux.push(&alice, &pcm, 48_000, 2, Instant::now()).unwrap();

        let frame = handle.recv().await.unwrap();
        assert_eq!(frame.sample_rate_hz, 16_000);
        assert_eq!(frame.samples.len(), 320); // 20ms at 16kHz
        let frame = handle.recv().await.unwrap();
        assert_eq!(frame.samples.len(), 320);
    }

    #[tokio::test]
    async fn test_subframe_tail_carries_over() {
        let demux = demux();
        let alice = ParticipantId::new("alice");
        let handle = demux.register(alice.clone());

        // Two 10ms pushes at 16kHz produce one 20ms frame
        let pcm = vec![1i16; 160];
        demux.push(&alice, &pcm, 16_000, 1, Instant::now()).unwrap();
        demux.push(&alice, &pcm, 16_000, 1, Instant::now()).unwrap();

        let frame = handle.recv().await.unwrap();
        assert_eq!(frame.samples.len(), 320);
    }

    #[test]
    fn test_unknown_participant_is_error() {
        let demux = demux();
        let err = demux
            .push(
                &ParticipantId::new("ghost"),
                &[0i16; 320],
                16_000,
                1,
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::ParticipantUnknown(_)));
        assert_eq!(demux.unknown_dropped(), 1);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let demux = demux();
        let alice = ParticipantId::new("alice");
        let handle = demux.register(alice.clone());

        // Capacity is 1s = 50 frames of 20ms; push 60 distinguishable frames
        for i in 0..60i16 {
            let pcm = vec![i; 320];
            demux.push(&alice, &pcm, 16_000, 1, Instant::now()).unwrap();
        }

        assert_eq!(handle.dropped_frames(), 10);
        // The oldest surviving frame is #10, not #0
        let first = handle.recv().await.unwrap();
        assert_eq!(first.samples[0], 10);
    }

    #[tokio::test]
    async fn test_unregister_closes_stream() {
        let demux = demux();
        let alice = ParticipantId::new("alice");
        let handle = demux.register(alice.clone());

        demux
            .push(&alice, &vec![7i16; 320], 16_000, 1, Instant::now())
            .unwrap();
        demux.unregister(&alice);

        // Queued frame still delivered, then end of stream
        assert!(handle.recv().await.is_some());
        assert!(handle.recv().await.is_none());
    }
}
