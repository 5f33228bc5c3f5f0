//! Audio frame type and PCM16 utilities
//!
//! All audio inside the pipeline is mono 16-bit PCM. Frames arrive from the
//! media transport already decoded; ingress normalizes them to the
//! recognition rate with the linear resampler below, while the egress path
//! uses the windowed-sinc resampler in the pipeline crate.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::participant::ParticipantId;

/// Minimum representable level in dBFS, used for all-zero frames.
const SILENCE_DBFS: f32 = -96.0;

/// A mono PCM16 audio frame tagged with its source participant.
#[derive(Clone)]
pub struct AudioFrame {
    /// Participant the audio was captured from
    pub participant: ParticipantId,
    /// Mono samples, 16-bit signed
    pub samples: Arc<[i16]>,
    /// Sample rate of `samples`
    pub sample_rate_hz: u32,
    /// Monotonic capture timestamp
    pub captured_at: Instant,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("participant", &self.participant)
            .field("samples_len", &self.samples.len())
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("duration_ms", &self.duration().as_millis())
            .finish()
    }
}

impl AudioFrame {
    pub fn new(
        participant: ParticipantId,
        samples: Vec<i16>,
        sample_rate_hz: u32,
        captured_at: Instant,
    ) -> Self {
        Self {
            participant,
            samples: samples.into(),
            sample_rate_hz,
            captured_at,
        }
    }

    /// Duration covered by this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate_hz as f64)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration().as_millis() as u64
    }

    /// RMS level in dBFS relative to full scale.
    pub fn rms_dbfs(&self) -> f32 {
        rms_dbfs(&self.samples)
    }
}

/// RMS level of a PCM16 buffer in dBFS.
pub fn rms_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DBFS;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let norm = s as f64 / 32768.0;
            norm * norm
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();

    if rms > 0.0 {
        (20.0 * rms.log10()) as f32
    } else {
        SILENCE_DBFS
    }
}

/// Decode little-endian PCM16 bytes into samples. A trailing odd byte is
/// ignored.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Encode samples as little-endian PCM16 bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Downmix interleaved multi-channel PCM to mono by averaging channels.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Fixed linear resampler used on the ingress path.
///
/// Quality is sufficient for speech recognition input; the egress path uses
/// a windowed-sinc resampler instead.
pub fn resample_linear(samples: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_hz as f64 / from_hz as f64;
    let out_len = ((samples.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let next = (idx + 1).min(samples.len() - 1);
        let frac = (src - idx as f64) as f32;

        let a = samples[idx.min(samples.len() - 1)] as f32;
        let b = samples[next] as f32;
        out.push((a * (1.0 - frac) + b * frac) as i16);
    }

    out
}

/// Number of samples covering `ms` milliseconds at `rate_hz`.
pub fn samples_for_ms(rate_hz: u32, ms: u32) -> usize {
    (rate_hz as usize * ms as usize) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<i16>, rate: u32) -> AudioFrame {
        AudioFrame::new(ParticipantId::new("alice"), samples, rate, Instant::now())
    }

    #[test]
    fn test_pcm16_roundtrip() {
        let samples = vec![0i16, 1000, -1000, i16::MAX, i16::MIN];
        let bytes = pcm16_to_bytes(&samples);
        assert_eq!(pcm16_from_bytes(&bytes), samples);
    }

    #[test]
    fn test_duration() {
        let f = frame(vec![0; 320], 16_000);
        assert_eq!(f.duration(), Duration::from_millis(20));
        assert_eq!(f.duration_ms(), 20);
    }

    #[test]
    fn test_rms_levels() {
        assert!(rms_dbfs(&[0i16; 160]) <= SILENCE_DBFS);
        // Half scale is about -6 dBFS
        let loud = rms_dbfs(&[16_384i16; 160]);
        assert!(loud > -7.0 && loud < -5.0);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = vec![100i16, 300, -100, -300];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![200, -200]);
        assert_eq!(downmix_to_mono(&stereo, 1), stereo);
    }

    #[test]
    fn test_resample_linear_lengths() {
        let samples = vec![0i16; 480]; // 10ms at 48kHz
        assert_eq!(resample_linear(&samples, 48_000, 16_000).len(), 160);
        let samples = vec![0i16; 160]; // 10ms at 16kHz
        assert_eq!(resample_linear(&samples, 16_000, 48_000).len(), 480);
    }

    #[test]
    fn test_samples_for_ms() {
        assert_eq!(samples_for_ms(16_000, 20), 320);
        assert_eq!(samples_for_ms(48_000, 20), 960);
    }
}
