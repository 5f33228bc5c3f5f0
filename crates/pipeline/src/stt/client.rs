//! WebSocket recognizer client
//!
//! Protocol: JSON configuration handshake, then binary little-endian PCM16
//! at 16 kHz mono. The server pushes `{segments:[{text, start, end,
//! completed}]}` messages; `{"eof":true}` asks it to flush pending finals.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use room_agent_config::SttSettings;
use room_agent_core::audio::pcm16_to_bytes;
use room_agent_core::{
    Error, ParticipantId, Result, SpeechToText, SttSegment, SttSink, SttSource,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration handshake sent after connecting.
#[derive(Debug, Serialize)]
struct Handshake<'a> {
    uid: &'a str,
    language: &'a str,
    model: &'a str,
    /// Server-side VAD stays off; the pipeline VAD owns endpointing
    use_vad: bool,
    task: &'a str,
}

#[derive(Debug, Serialize)]
struct EofMessage {
    eof: bool,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    segments: Vec<WireSegment>,
}

#[derive(Debug, Deserialize)]
struct WireSegment {
    text: String,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    completed: bool,
}

/// Streaming recognizer client over WebSocket.
pub struct WebSocketStt {
    settings: SttSettings,
}

impl WebSocketStt {
    pub fn new(settings: SttSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SpeechToText for WebSocketStt {
    async fn open_stream(
        &self,
        participant: &ParticipantId,
    ) -> Result<(Box<dyn SttSink>, Box<dyn SttSource>)> {
        let handshake_timeout = Duration::from_millis(self.settings.handshake_timeout_ms);

        let (stream, _) = timeout(handshake_timeout, connect_async(&self.settings.url))
            .await
            .map_err(|_| {
                Error::Stt(format!(
                    "handshake timed out after {} ms",
                    self.settings.handshake_timeout_ms
                ))
            })?
            .map_err(|e| Error::Stt(format!("connect failed: {e}")))?;

        let (mut write, read) = stream.split();

        let handshake = Handshake {
            uid: participant.as_str(),
            language: &self.settings.language,
            model: &self.settings.model,
            use_vad: false,
            task: "transcribe",
        };
        let payload =
            serde_json::to_string(&handshake).map_err(|e| Error::Stt(e.to_string()))?;
        timeout(handshake_timeout, write.send(Message::Text(payload.into())))
            .await
            .map_err(|_| Error::Stt("handshake send timed out".to_string()))?
            .map_err(|e| Error::Stt(format!("handshake send failed: {e}")))?;

        tracing::debug!(participant = %participant, url = %self.settings.url, "stt stream opened");

        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SttSink for WsSink {
    async fn send_pcm(&mut self, pcm: &[i16]) -> Result<()> {
        self.write
            .send(Message::Binary(pcm16_to_bytes(pcm).into()))
            .await
            .map_err(|e| Error::Stt(format!("pcm send failed: {e}")))
    }

    async fn flush(&mut self) -> Result<()> {
        let payload = serde_json::to_string(&EofMessage { eof: true })
            .map_err(|e| Error::Stt(e.to_string()))?;
        self.write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| Error::Stt(format!("eof send failed: {e}")))
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SttSource for WsSource {
    async fn next_segments(&mut self) -> Option<Result<Vec<SttSegment>>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => {
                    return match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(message) => Some(Ok(message
                            .segments
                            .into_iter()
                            .map(|s| SttSegment {
                                text: s.text,
                                start_s: s.start,
                                end_s: s.end,
                                completed: s.completed,
                            })
                            .collect())),
                        Err(e) => Some(Err(Error::Stt(format!("bad server message: {e}")))),
                    };
                }
                Ok(Message::Close(_)) => return None,
                // Pings/pongs and stray binary frames carry nothing for us
                Ok(_) => continue,
                Err(e) => return Some(Err(Error::Stt(format!("read failed: {e}")))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_wire_shape() {
        let handshake = Handshake {
            uid: "alice",
            language: "en",
            model: "small",
            use_vad: false,
            task: "transcribe",
        };
        let json = serde_json::to_value(&handshake).unwrap();
        assert_eq!(json["uid"], "alice");
        assert_eq!(json["use_vad"], false);
        assert_eq!(json["task"], "transcribe");
    }

    #[test]
    fn test_eof_wire_shape() {
        let json = serde_json::to_string(&EofMessage { eof: true }).unwrap();
        assert_eq!(json, "{\"eof\":true}");
    }

    #[test]
    fn test_server_message_parsing() {
        let message: ServerMessage = serde_json::from_str(
            r#"{"segments":[{"text":"hello","start":0.0,"end":0.8,"completed":false},
                            {"text":"hello there","start":0.0,"end":1.2,"completed":true}]}"#,
        )
        .unwrap();
        assert_eq!(message.segments.len(), 2);
        assert!(!message.segments[0].completed);
        assert!(message.segments[1].completed);
        assert_eq!(message.segments[1].text, "hello there");
    }
}
