//! Chat API client with NDJSON streaming

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use room_agent_config::LlmSettings;
use room_agent_core::{ChatOutcome, ChatRequest, FinishReason, LanguageModel, Result};

use crate::LlmError;

/// Streaming chat client for the `/api/chat` NDJSON protocol.
pub struct ChatClient {
    client: Client,
    settings: LlmSettings,
    /// Retries for the initial connect only; mid-stream failures surface
    max_connect_retries: u32,
    connect_backoff: Duration,
}

impl ChatClient {
    pub fn new(settings: LlmSettings) -> std::result::Result<Self, LlmError> {
        // Client-level timeout is a backstop covering the whole body read;
        // the first-token and total deadlines below are the real limits.
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.total_timeout_ms * 2))
            .build()
            .map_err(|e| LlmError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            settings,
            max_connect_retries: 2,
            connect_backoff: Duration::from_millis(100),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.settings.url.trim_end_matches('/'))
    }

    async fn send_request(
        &self,
        request: &ChatApiRequest<'_>,
    ) -> std::result::Result<reqwest::Response, LlmError> {
        let mut backoff = self.connect_backoff;
        let mut last_err = None;

        for attempt in 0..=self.max_connect_retries {
            if attempt > 0 {
                tracing::warn!(attempt, "chat request failed, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.client.post(self.chat_url()).json(request).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    // 5xx is worth a retry, 4xx is not
                    if status.is_server_error() && attempt < self.max_connect_retries {
                        last_err = Some(LlmError::Http(format!("{status}: {body}")));
                        continue;
                    }
                    return Err(LlmError::Http(format!("{status}: {body}")));
                }
                Err(e) if e.is_connect() && attempt < self.max_connect_retries => {
                    last_err = Some(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::Network("connect retries exhausted".into())))
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    async fn generate_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome> {
        let start = Instant::now();
        let first_token_deadline =
            start + Duration::from_millis(self.settings.first_token_timeout_ms);
        let total_deadline = start + Duration::from_millis(self.settings.total_timeout_ms);

        let wire_request = ChatApiRequest {
            model: &self.settings.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
            options: ChatOptions {
                temperature: request.temperature,
            },
        };

        let response = self
            .send_request(&wire_request)
            .await
            .map_err(room_agent_core::Error::from)?;

        let mut stream = response.bytes_stream();
        let mut line_buffer = String::new();
        let mut full_text = String::new();
        let mut first_token_at: Option<Instant> = None;
        let mut done = false;

        'read: while !done {
            let deadline = if first_token_at.is_none() {
                first_token_deadline.min(total_deadline)
            } else {
                total_deadline
            };

            let chunk = match timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    return Err(LlmError::Network(e.to_string()).into());
                }
                Ok(None) => break 'read,
                Err(_) if first_token_at.is_none() => {
                    return Err(
                        LlmError::FirstTokenTimeout(self.settings.first_token_timeout_ms).into(),
                    );
                }
                Err(_) => {
                    return Err(LlmError::TotalTimeout(self.settings.total_timeout_ms).into());
                }
            };

            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Complete NDJSON lines only; a partial line stays buffered
            while let Some(newline) = line_buffer.find('\n') {
                let line = line_buffer[..newline].trim().to_string();
                line_buffer.drain(..=newline);

                if line.is_empty() {
                    continue;
                }

                let parsed: StreamChunk = serde_json::from_str(&line)
                    .map_err(|e| LlmError::Malformed(format!("{e}: {line}")))?;

                if let Some(message) = parsed.message {
                    if !message.content.is_empty() {
                        if first_token_at.is_none() {
                            first_token_at = Some(Instant::now());
                        }
                        full_text.push_str(&message.content);

                        if tx.send(message.content).await.is_err() {
                            // Receiver dropped: the turn was cancelled.
                            // Dropping `stream` aborts the request.
                            tracing::debug!("token channel closed, aborting generation");
                            return Ok(ChatOutcome {
                                text: full_text,
                                finish_reason: FinishReason::Cancelled,
                                time_to_first_token: first_token_at.map(|t| t - start),
                                total_time: start.elapsed(),
                            });
                        }
                    }
                }

                if parsed.done {
                    done = true;
                    break;
                }
            }
        }

        if !done {
            return Err(LlmError::Malformed("stream ended without done marker".into()).into());
        }

        Ok(ChatOutcome {
            text: full_text,
            finish_reason: FinishReason::Stop,
            time_to_first_token: first_token_at.map(|t| t - start),
            total_time: start.elapsed(),
        })
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

// Chat API wire types

#[derive(Debug, Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    message: Option<WireChunkMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct WireChunkMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_agent_core::{ChatMessage, Role};

    #[test]
    fn test_chat_url() {
        let mut settings = LlmSettings::default();
        settings.url = "http://localhost:11434/".to_string();
        let client = ChatClient::new(settings).unwrap();
        assert_eq!(client.chat_url(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatApiRequest {
            model: "test-model",
            messages: vec![
                WireMessage {
                    role: "system",
                    content: "be brief",
                },
                WireMessage {
                    role: "user",
                    content: "hello",
                },
            ],
            stream: true,
            options: ChatOptions { temperature: 0.7 },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["options"]["temperature"], 0.7);
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"message":{"content":"Hello"},"done":false}"#).unwrap();
        assert_eq!(chunk.message.unwrap().content, "Hello");
        assert!(!chunk.done);

        let done: StreamChunk = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(done.done);
    }

    #[test]
    fn test_wire_roles_cover_dialogue() {
        for (role, expected) in [
            (Role::System, "system"),
            (Role::User, "user"),
            (Role::Assistant, "assistant"),
        ] {
            let msg = ChatMessage::new(role, "x");
            assert_eq!(msg.role.as_str(), expected);
        }
    }
}
