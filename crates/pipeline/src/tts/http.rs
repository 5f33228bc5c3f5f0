//! Streaming synthesis HTTP client
//!
//! POSTs `{text, voice, sample_rate}` and reads raw little-endian PCM16
//! from the response body. The actual PCM format comes back in the
//! `X-Sample-Rate` / `X-Channels` / `X-Sample-Width` headers; multi-channel
//! audio is downmixed to mono here so consumers only ever see mono.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use room_agent_config::TtsSettings;
use room_agent_core::audio::{downmix_to_mono, pcm16_from_bytes};
use room_agent_core::{Error, Result, TextToSpeech, TtsEvent};

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    sample_rate: u32,
}

/// Streaming synthesis client.
pub struct HttpTts {
    client: Client,
    settings: TtsSettings,
}

impl HttpTts {
    pub fn new(settings: TtsSettings) -> Result<Self> {
        let client = Client::builder()
            // Backstop only; the per-chunk first-byte deadline is enforced below
            .connect_timeout(Duration::from_millis(settings.first_byte_timeout_ms))
            .build()
            .map_err(|e| Error::Tts(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    fn synthesize_url(&self) -> String {
        format!(
            "{}/api/synthesize/stream",
            self.settings.url.trim_end_matches('/')
        )
    }

    fn header_u32(response: &reqwest::Response, name: &str) -> Option<u32> {
        response
            .headers()
            .get(name)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

#[async_trait]
impl TextToSpeech for HttpTts {
    async fn synthesize_stream(&self, text: &str, tx: mpsc::Sender<TtsEvent>) -> Result<()> {
        let first_byte = Duration::from_millis(self.settings.first_byte_timeout_ms);

        let request = SynthesizeRequest {
            text,
            voice: &self.settings.voice,
            sample_rate: self.settings.sample_rate_hz,
        };

        let response = timeout(
            first_byte,
            self.client.post(self.synthesize_url()).json(&request).send(),
        )
        .await
        .map_err(|_| {
            Error::Tts(format!(
                "no response within {} ms",
                self.settings.first_byte_timeout_ms
            ))
        })?
        .map_err(|e| Error::Tts(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("{status}: {body}")));
        }

        let sample_rate_hz = Self::header_u32(&response, "X-Sample-Rate")
            .unwrap_or(self.settings.sample_rate_hz);
        let channels = Self::header_u32(&response, "X-Channels").unwrap_or(1) as u16;
        let sample_width = Self::header_u32(&response, "X-Sample-Width").unwrap_or(2);
        if sample_width != 2 {
            return Err(Error::Tts(format!(
                "unsupported sample width {sample_width}, expected 2 (s16le)"
            )));
        }

        if tx
            .send(TtsEvent::Started {
                sample_rate_hz,
                channels: 1,
            })
            .await
            .is_err()
        {
            return Err(Error::Cancelled);
        }

        let mut stream = response.bytes_stream();
        // Carry bytes so samples (and channel frames) stay aligned across
        // network chunk boundaries
        let frame_bytes = 2 * channels as usize;
        let mut carry: Vec<u8> = Vec::new();
        let mut first_audio = true;

        loop {
            let chunk = if first_audio {
                match timeout(first_byte, stream.next()).await {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        return Err(Error::Tts(format!(
                            "no audio within {} ms",
                            self.settings.first_byte_timeout_ms
                        )));
                    }
                }
            } else {
                stream.next().await
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| Error::Tts(format!("stream read failed: {e}")))?;
            first_audio = false;

            carry.extend_from_slice(&chunk);
            let usable = carry.len() - carry.len() % frame_bytes;
            if usable == 0 {
                continue;
            }

            let samples = pcm16_from_bytes(&carry[..usable]);
            carry.drain(..usable);

            let mono = downmix_to_mono(&samples, channels);
            if tx.send(TtsEvent::Audio { pcm: mono }).await.is_err() {
                // Receiver gone: the turn was cancelled, abort the request
                return Err(Error::Cancelled);
            }
        }

        if tx.send(TtsEvent::Complete).await.is_err() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn voice(&self) -> &str {
        &self.settings.voice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_url() {
        let mut settings = TtsSettings::default();
        settings.url = "http://localhost:8880/".to_string();
        let tts = HttpTts::new(settings).unwrap();
        assert_eq!(
            tts.synthesize_url(),
            "http://localhost:8880/api/synthesize/stream"
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let request = SynthesizeRequest {
            text: "hello",
            voice: "aria",
            sample_rate: 22_050,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["text"], "hello");
        assert_eq!(json["voice"], "aria");
        assert_eq!(json["sample_rate"], 22_050);
    }
}
