//! TTS transport and audio egress
//!
//! Consumes speak chunks strictly in order: one streaming synthesis request
//! per chunk, resampled to the publish rate with a windowed-sinc resampler,
//! packetized into 20 ms frames, and handed to the media transport. Frames
//! of chunk N fully drain before chunk N+1 starts, preserving prosody
//! order.
//!
//! Backpressure: the synthesis channel is bounded, so a slow transport
//! pauses the HTTP body read via flow control. A publish that makes no
//! progress for the stall window abandons the chunk (non-fatal) and moves
//! on. On cancel, the in-flight request is aborted, queued audio is
//! discarded, and a short fade is published to avoid a click.

mod http;

pub use http::HttpTts;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

use room_agent_config::TtsSettings;
use room_agent_core::audio::samples_for_ms;
use room_agent_core::{MediaTransport, TextToSpeech, TtsEvent};

use crate::generator::SpeakChunk;
use crate::turn::ControllerEvent;

/// Egress configuration
#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Rate published on the outbound track
    pub publish_rate_hz: u32,
    /// Outbound packet length
    pub frame_ms: u32,
    /// Bound on buffered synthesized audio awaiting publish
    pub queue_capacity_ms: u32,
    /// A publish blocked this long abandons the chunk
    pub stall_timeout: Duration,
    /// Fade applied on cancel to avoid clicks
    pub fade_ms: u32,
}

impl Default for EgressConfig {
    fn default() -> Self {
        use room_agent_config::constants::{audio, timeouts};
        Self {
            publish_rate_hz: audio::PUBLISH_RATE_HZ,
            frame_ms: audio::FRAME_MS,
            queue_capacity_ms: audio::EGRESS_QUEUE_MS,
            stall_timeout: Duration::from_millis(timeouts::EGRESS_STALL_MS),
            fade_ms: audio::CANCEL_FADE_MS,
        }
    }
}

impl EgressConfig {
    pub fn from_settings(settings: &TtsSettings) -> Self {
        Self {
            publish_rate_hz: settings.publish_sample_rate_hz,
            ..Default::default()
        }
    }

    /// Synthesis channel capacity in messages, approximating the audio
    /// bound with one frame per message.
    fn queue_messages(&self) -> usize {
        (self.queue_capacity_ms / self.frame_ms).max(4) as usize
    }
}

/// How one egress run ended.
#[derive(Debug, Clone, Default)]
pub struct TtsOutcome {
    pub cancelled: bool,
    pub chunks_synthesized: u32,
    /// Chunks abandoned because the transport stopped accepting frames
    pub stalled_chunks: u32,
    pub frames_published: u64,
    pub first_audio_at: Option<Instant>,
}

enum ChunkResult {
    Done,
    Stalled,
    Failed(String),
    Cancelled,
}

enum PublishResult {
    Ok,
    Stalled,
}

/// One turn's synthesis-and-egress pipeline.
pub struct TtsPipeline {
    tts: Arc<dyn TextToSpeech>,
    transport: Arc<dyn MediaTransport>,
    config: EgressConfig,
    events: mpsc::Sender<ControllerEvent>,
    turn_id: String,
}

impl TtsPipeline {
    pub fn new(
        tts: Arc<dyn TextToSpeech>,
        transport: Arc<dyn MediaTransport>,
        config: EgressConfig,
        events: mpsc::Sender<ControllerEvent>,
        turn_id: String,
    ) -> Self {
        Self {
            tts,
            transport,
            config,
            events,
            turn_id,
        }
    }

    /// Drain the chunk channel until the final chunk, cancellation, or the
    /// generator closing the channel.
    pub async fn run(
        self,
        mut chunk_rx: mpsc::Receiver<SpeakChunk>,
        mut cancel: watch::Receiver<bool>,
    ) -> TtsOutcome {
        let frame_samples = samples_for_ms(self.config.publish_rate_hz, self.config.frame_ms);
        let mut framer = Framer::new(frame_samples);
        let mut outcome = TtsOutcome::default();
        let mut sent_first_chunk = false;

        if *cancel.borrow() {
            outcome.cancelled = true;
            return outcome;
        }

        loop {
            let chunk = tokio::select! {
                chunk = chunk_rx.recv() => chunk,
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.fade_out(&mut framer, &mut outcome).await;
                        break;
                    }
                    continue;
                }
            };

            let Some(chunk) = chunk else { break };

            if !sent_first_chunk {
                sent_first_chunk = true;
                let _ = self
                    .events
                    .send(ControllerEvent::FirstChunk {
                        turn_id: self.turn_id.clone(),
                        at: Instant::now(),
                    })
                    .await;
            }

            let is_final = chunk.is_final;
            if !chunk.text.is_empty() {
                match self
                    .speak_chunk(&chunk, &mut framer, &mut outcome, &mut cancel)
                    .await
                {
                    ChunkResult::Done => outcome.chunks_synthesized += 1,
                    ChunkResult::Stalled => {
                        outcome.stalled_chunks += 1;
                        metrics::counter!("egress_stalled").increment(1);
                        tracing::warn!(
                            turn_id = %self.turn_id,
                            chunk = chunk.index,
                            "egress stalled, abandoning chunk"
                        );
                    }
                    ChunkResult::Failed(reason) => {
                        tracing::warn!(
                            turn_id = %self.turn_id,
                            chunk = chunk.index,
                            %reason,
                            "chunk synthesis failed, continuing"
                        );
                    }
                    ChunkResult::Cancelled => {
                        self.fade_out(&mut framer, &mut outcome).await;
                        break;
                    }
                }
            }

            if is_final {
                break;
            }
        }

        outcome
    }

    async fn speak_chunk(
        &self,
        chunk: &SpeakChunk,
        framer: &mut Framer,
        outcome: &mut TtsOutcome,
        cancel: &mut watch::Receiver<bool>,
    ) -> ChunkResult {
        let (tts_tx, mut tts_rx) = mpsc::channel::<TtsEvent>(self.config.queue_messages());
        let tts = self.tts.clone();
        let text = chunk.text.clone();
        let synth = tokio::spawn(async move { tts.synthesize_stream(&text, tts_tx).await });

        let mut resampler: Option<SincStream> = None;

        loop {
            tokio::select! {
                event = tts_rx.recv() => match event {
                    Some(TtsEvent::Started { sample_rate_hz, .. }) => {
                        if sample_rate_hz != self.config.publish_rate_hz {
                            match SincStream::new(sample_rate_hz, self.config.publish_rate_hz) {
                                Ok(r) => resampler = Some(r),
                                Err(e) => {
                                    synth.abort();
                                    framer.clear();
                                    return ChunkResult::Failed(e);
                                }
                            }
                        }
                    }

                    Some(TtsEvent::Audio { pcm }) => {
                        let resampled = match resampler.as_mut() {
                            Some(r) => r.process(&pcm),
                            None => pcm,
                        };
                        for frame in framer.push(&resampled) {
                            match self.publish(frame, outcome).await {
                                PublishResult::Ok => {}
                                PublishResult::Stalled => {
                                    synth.abort();
                                    framer.clear();
                                    return ChunkResult::Stalled;
                                }
                            }
                        }
                    }

                    Some(TtsEvent::Complete) | None => {
                        // Chunk fully drains, partial tail frame included,
                        // before the next chunk may start
                        let tail = resampler.as_mut().map(|r| r.finish()).unwrap_or_default();
                        for frame in framer.push(&tail) {
                            if let PublishResult::Stalled = self.publish(frame, outcome).await {
                                framer.clear();
                                return ChunkResult::Stalled;
                            }
                        }
                        if let Some(rest) = framer.take_rest() {
                            if let PublishResult::Stalled = self.publish(rest, outcome).await {
                                return ChunkResult::Stalled;
                            }
                        }
                        break;
                    }
                },

                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        synth.abort();
                        return ChunkResult::Cancelled;
                    }
                }
            }
        }

        match synth.await {
            Ok(Ok(())) => ChunkResult::Done,
            Ok(Err(e)) if e.is_cancelled() => ChunkResult::Done,
            Ok(Err(e)) => ChunkResult::Failed(e.to_string()),
            Err(join) if join.is_cancelled() => ChunkResult::Done,
            Err(join) => ChunkResult::Failed(join.to_string()),
        }
    }

    async fn publish(&self, frame: Vec<i16>, outcome: &mut TtsOutcome) -> PublishResult {
        match timeout(
            self.config.stall_timeout,
            self.transport
                .publish_audio(frame, self.config.publish_rate_hz),
        )
        .await
        {
            Ok(Ok(())) => {
                if outcome.first_audio_at.is_none() {
                    let at = Instant::now();
                    outcome.first_audio_at = Some(at);
                    let _ = self
                        .events
                        .send(ControllerEvent::FirstAudio {
                            turn_id: self.turn_id.clone(),
                            at,
                        })
                        .await;
                }
                outcome.frames_published += 1;
                PublishResult::Ok
            }
            Ok(Err(e)) => {
                tracing::warn!(turn_id = %self.turn_id, error = %e, "publish failed");
                PublishResult::Ok
            }
            Err(_) => PublishResult::Stalled,
        }
    }

    /// Discard queued audio, publishing only a short fade to avoid a click.
    async fn fade_out(&self, framer: &mut Framer, outcome: &mut TtsOutcome) {
        outcome.cancelled = true;

        let fade_samples = samples_for_ms(self.config.publish_rate_hz, self.config.fade_ms);
        if let Some(mut rest) = framer.take_rest() {
            rest.truncate(fade_samples);
            apply_fade_out(&mut rest);
            let _ = timeout(
                self.config.stall_timeout,
                self.transport
                    .publish_audio(rest, self.config.publish_rate_hz),
            )
            .await;
        }
    }
}

/// Linear fade to zero over the whole buffer.
fn apply_fade_out(samples: &mut [i16]) {
    let len = samples.len();
    if len == 0 {
        return;
    }
    for (i, sample) in samples.iter_mut().enumerate() {
        let gain = (len - i) as f32 / len as f32;
        *sample = (*sample as f32 * gain) as i16;
    }
}

/// Accumulates samples and cuts them into fixed-size publish frames.
struct Framer {
    pending: Vec<i16>,
    frame_samples: usize,
}

impl Framer {
    fn new(frame_samples: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_samples * 2),
            frame_samples,
        }
    }

    fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            frames.push(self.pending.drain(..self.frame_samples).collect());
        }
        frames
    }

    /// Remaining sub-frame tail, if any.
    fn take_rest(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Streaming windowed-sinc resampler over fixed input blocks.
struct SincStream {
    resampler: SincFixedIn<f32>,
    pending: Vec<f32>,
    chunk_size: usize,
}

const SINC_CHUNK: usize = 512;

impl SincStream {
    fn new(from_hz: u32, to_hz: u32) -> Result<Self, String> {
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::new(
            to_hz as f64 / from_hz as f64,
            1.1,
            params,
            SINC_CHUNK,
            1,
        )
        .map_err(|e| format!("resampler init failed: {e}"))?;

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(SINC_CHUNK * 2),
            chunk_size: SINC_CHUNK,
        })
    }

    fn process(&mut self, pcm: &[i16]) -> Vec<i16> {
        self.pending
            .extend(pcm.iter().map(|&s| s as f32 / 32768.0));

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let block: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            match self.resampler.process(&[block], None) {
                Ok(mut frames) => {
                    out.extend(frames.remove(0).into_iter().map(f32_to_i16));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resampler block failed, dropping");
                }
            }
        }
        out
    }

    /// Flush the partial block and the filter tail.
    fn finish(&mut self) -> Vec<i16> {
        let mut out = Vec::new();

        if !self.pending.is_empty() {
            let block: Vec<f32> = self.pending.drain(..).collect();
            if let Ok(mut frames) = self.resampler.process_partial(Some(&[block]), None) {
                out.extend(frames.remove(0).into_iter().map(f32_to_i16));
            }
        }
        if let Ok(mut frames) = self
            .resampler
            .process_partial(None::<&[Vec<f32>]>, None)
        {
            out.extend(frames.remove(0).into_iter().map(f32_to_i16));
        }
        out
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_cuts_fixed_frames() {
        let mut framer = Framer::new(320);
        assert!(framer.push(&vec![1i16; 300]).is_empty());

        let frames = framer.push(&vec![1i16; 500]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 320));

        let rest = framer.take_rest().unwrap();
        assert_eq!(rest.len(), 160);
        assert!(framer.take_rest().is_none());
    }

    #[test]
    fn test_fade_ends_at_silence() {
        let mut samples = vec![20_000i16; 960];
        apply_fade_out(&mut samples);
        assert!(samples[0] > 15_000);
        assert!(samples[959].abs() < 100);
        // Monotone enough that no click survives
        assert!(samples[480] < samples[0]);
    }

    #[test]
    fn test_sinc_stream_ratio() {
        let mut stream = SincStream::new(16_000, 48_000).unwrap();
        let input = vec![1000i16; 1600]; // 100ms at 16kHz

        let mut output = stream.process(&input);
        output.extend(stream.finish());

        // ~300ms worth at 48kHz, allow for filter delay
        let expected = 4800;
        assert!(
            (output.len() as i64 - expected).unsigned_abs() < 1000,
            "got {} samples",
            output.len()
        );
    }

    #[test]
    fn test_queue_messages_bound() {
        let config = EgressConfig::default();
        assert_eq!(config.queue_messages(), 25); // 500ms / 20ms
    }
}
