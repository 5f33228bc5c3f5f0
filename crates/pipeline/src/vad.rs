//! Voice activity detection
//!
//! Lightweight energy-scored classifier over fixed windows, debounced by
//! minimum speech/silence run lengths. Decoupled from STT so barge-in
//! decisions can be made before any transcript exists; scoring a window is
//! a few microseconds of arithmetic, far cheaper than real time.

use std::time::Duration;
use tokio::time::Instant;

use room_agent_core::audio::{rms_dbfs, samples_for_ms};
use room_agent_core::AudioFrame;

/// VAD configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Speech score threshold (0.0 - 1.0)
    pub activation_threshold: f32,
    /// Analysis window length
    pub window_ms: u32,
    /// Speech run required for the silence -> speech transition
    pub min_speech_ms: u32,
    /// Silence run required for the speech -> silence transition
    pub min_silence_ms: u32,
    /// Sample rate of incoming frames
    pub sample_rate_hz: u32,
    /// Score is zero at or below this level
    pub noise_floor_dbfs: f32,
    /// Score reaches one this many dB above the floor
    pub dynamic_range_db: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        use room_agent_config::constants::{audio::CAPTURE_RATE_HZ, vad};
        Self {
            activation_threshold: vad::ACTIVATION_THRESHOLD,
            window_ms: vad::WINDOW_MS,
            min_speech_ms: vad::MIN_SPEECH_MS,
            min_silence_ms: vad::MIN_SILENCE_MS,
            sample_rate_hz: CAPTURE_RATE_HZ,
            noise_floor_dbfs: vad::NOISE_FLOOR_DBFS,
            dynamic_range_db: 30.0,
        }
    }
}

/// Events emitted on state transitions. Continuation emits nothing; frames
/// keep flowing to STT regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart { at: Instant },
    SpeechEnd { at: Instant },
}

/// Per-participant voice activity detector.
///
/// Owned by the participant's ingress task; no locking. State is the
/// classic run-length pair: `speech_run_ms`, `silence_run_ms`, `in_speech`.
pub struct VoiceActivityDetector {
    config: VadConfig,
    window_samples: usize,
    buffer: Vec<i16>,
    window_time: Option<Instant>,
    speech_run_ms: u32,
    silence_run_ms: u32,
    in_speech: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let window_samples = samples_for_ms(config.sample_rate_hz, config.window_ms);
        Self {
            config,
            window_samples,
            buffer: Vec::with_capacity(window_samples * 2),
            window_time: None,
            speech_run_ms: 0,
            silence_run_ms: 0,
            in_speech: false,
        }
    }

    /// Feed one frame; returns any transition events it produced.
    pub fn push_frame(&mut self, frame: &AudioFrame) -> Vec<VadEvent> {
        debug_assert_eq!(frame.sample_rate_hz, self.config.sample_rate_hz);

        self.buffer.extend_from_slice(&frame.samples);
        if self.window_time.is_none() {
            self.window_time = Some(frame.captured_at);
        }

        let mut events = Vec::new();
        while self.buffer.len() >= self.window_samples {
            let window: Vec<i16> = self.buffer.drain(..self.window_samples).collect();
            let at = self.window_time.unwrap_or(frame.captured_at);
            self.window_time =
                Some(at + Duration::from_millis(self.config.window_ms as u64));

            if let Some(event) = self.process_window(&window, at) {
                events.push(event);
            }
        }
        events
    }

    fn process_window(&mut self, window: &[i16], at: Instant) -> Option<VadEvent> {
        let score = self.score(window);
        let is_speech = score >= self.config.activation_threshold;

        if is_speech {
            self.speech_run_ms += self.config.window_ms;
            self.silence_run_ms = 0;
            if !self.in_speech && self.speech_run_ms >= self.config.min_speech_ms {
                self.in_speech = true;
                return Some(VadEvent::SpeechStart { at });
            }
        } else {
            self.silence_run_ms += self.config.window_ms;
            self.speech_run_ms = 0;
            if self.in_speech && self.silence_run_ms >= self.config.min_silence_ms {
                self.in_speech = false;
                return Some(VadEvent::SpeechEnd { at });
            }
        }
        None
    }

    /// Energy-based speech score in [0, 1].
    fn score(&self, window: &[i16]) -> f32 {
        let level = rms_dbfs(window);
        if level <= self.config.noise_floor_dbfs {
            return 0.0;
        }
        ((level - self.config.noise_floor_dbfs) / self.config.dynamic_range_db).clamp(0.0, 1.0)
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.window_time = None;
        self.speech_run_ms = 0;
        self.silence_run_ms = 0;
        self.in_speech = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_agent_core::ParticipantId;

    fn frame(samples: Vec<i16>) -> AudioFrame {
        AudioFrame::new(ParticipantId::new("alice"), samples, 16_000, Instant::now())
    }

    fn loud_frame(ms: u32) -> AudioFrame {
        frame(vec![12_000i16; samples_for_ms(16_000, ms)])
    }

    fn quiet_frame(ms: u32) -> AudioFrame {
        frame(vec![0i16; samples_for_ms(16_000, ms)])
    }

    #[test]
    fn test_speech_start_requires_min_run() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());

        // 90ms of speech: below the 100ms debounce
        let events = vad.push_frame(&loud_frame(90));
        assert!(events.is_empty());
        assert!(!vad.in_speech());

        // Another 30ms window crosses the threshold
        let events = vad.push_frame(&loud_frame(30));
        assert!(matches!(events.as_slice(), [VadEvent::SpeechStart { .. }]));
        assert!(vad.in_speech());
    }

    #[test]
    fn test_speech_end_requires_min_silence() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.push_frame(&loud_frame(120));
        assert!(vad.in_speech());

        // 270ms of silence: below the 300ms debounce
        assert!(vad.push_frame(&quiet_frame(270)).is_empty());
        assert!(vad.in_speech());

        let events = vad.push_frame(&quiet_frame(30));
        assert!(matches!(events.as_slice(), [VadEvent::SpeechEnd { .. }]));
        assert!(!vad.in_speech());
    }

    #[test]
    fn test_short_blip_emits_nothing() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());

        // 60ms burst surrounded by silence never confirms speech
        assert!(vad.push_frame(&quiet_frame(60)).is_empty());
        assert!(vad.push_frame(&loud_frame(60)).is_empty());
        assert!(vad.push_frame(&quiet_frame(300)).is_empty());
        assert!(!vad.in_speech());
    }

    #[test]
    fn test_no_event_on_continuation() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.push_frame(&loud_frame(120));

        // Continued speech stays silent on the event side
        assert!(vad.push_frame(&loud_frame(300)).is_empty());
    }

    #[test]
    fn test_reset() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.push_frame(&loud_frame(150));
        assert!(vad.in_speech());

        vad.reset();
        assert!(!vad.in_speech());
    }
}
