//! Response generator
//!
//! Streams tokens from the language model and segments them into
//! synthesis-sized chunks. The chunk policy is the main latency lever:
//! the first chunk flushes on a sentence boundary, a size cap, or a short
//! timeout from the first token, whichever comes first; later chunks wait
//! for sentence boundaries or the larger size cap.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use room_agent_core::{ChatOutcome, ChatRequest, FinishReason, LanguageModel};

use crate::{sleep_until_opt, PipelineError, SharedDialogue};
use room_agent_core::DialogueTurn;

/// Sentence-final characters recognized by the chunker and the turn
/// controller's completion predicate.
pub const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '।', '…'];

/// Generator configuration
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// First chunk flushes at this many chars without a sentence boundary
    pub first_chunk_max_chars: usize,
    /// Later chunks flush at this many chars
    pub next_chunk_max_chars: usize,
    /// First chunk flushes this long after the first token regardless
    pub first_chunk_timeout: std::time::Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        use room_agent_config::constants::chunking;
        Self {
            first_chunk_max_chars: chunking::FIRST_CHUNK_MAX_CHARS,
            next_chunk_max_chars: chunking::NEXT_CHUNK_MAX_CHARS,
            first_chunk_timeout: std::time::Duration::from_millis(
                chunking::FIRST_CHUNK_TIMEOUT_MS,
            ),
        }
    }
}

/// One ordered unit of text handed to synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakChunk {
    /// Strictly increasing within a turn
    pub index: u32,
    pub text: String,
    pub is_final: bool,
}

/// How a generation run ended.
#[derive(Debug, Clone)]
pub struct GeneratorOutcome {
    /// Full text produced before the stream ended
    pub text: String,
    /// The turn was cancelled mid-generation
    pub cancelled: bool,
    pub time_to_first_token: Option<std::time::Duration>,
    pub total_time: std::time::Duration,
}

/// Streams one reply from the language model into ordered speak chunks.
pub struct ResponseGenerator {
    llm: Arc<dyn LanguageModel>,
    config: GeneratorConfig,
    dialogue: SharedDialogue,
}

impl ResponseGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, config: GeneratorConfig, dialogue: SharedDialogue) -> Self {
        Self {
            llm,
            config,
            dialogue,
        }
    }

    /// Run one generation, emitting chunks into `chunk_tx`.
    ///
    /// On cancellation the in-flight request is aborted (by dropping the
    /// token receiver), no further chunks are emitted, and the partial text
    /// is appended to the dialogue tagged as truncated. On success the full
    /// text becomes the assistant turn.
    pub async fn run(
        &self,
        request: ChatRequest,
        chunk_tx: mpsc::Sender<SpeakChunk>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<GeneratorOutcome, PipelineError> {
        let start = Instant::now();
        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);

        let llm = self.llm.clone();
        let mut llm_task =
            tokio::spawn(async move { llm.generate_stream(request, token_tx).await });

        let mut chunker = Chunker::new(self.config.clone());
        let mut received_text = String::new();
        let mut first_token_at: Option<Instant> = None;
        let mut timeout_flushed = false;
        let mut cancelled = *cancel.borrow();
        let mut llm_result: Option<room_agent_core::Result<ChatOutcome>> = None;

        while !cancelled && llm_result.is_none() {
            // Armed once: from the first token until the first chunk leaves
            let flush_at = match first_token_at {
                Some(at) if !chunker.emitted_any() && !timeout_flushed => {
                    Some(at + self.config.first_chunk_timeout)
                }
                _ => None,
            };

            tokio::select! {
                token = token_rx.recv() => {
                    match token {
                        Some(token) => {
                            if first_token_at.is_none() {
                                first_token_at = Some(Instant::now());
                            }
                            received_text.push_str(&token);
                            for chunk in chunker.push(&token) {
                                if chunk_tx.send(chunk).await.is_err() {
                                    cancelled = true;
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }

                _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    timeout_flushed = true;
                    if let Some(chunk) = chunker.flush_pending() {
                        if chunk_tx.send(chunk).await.is_err() {
                            cancelled = true;
                        }
                    }
                }

                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        cancelled = true;
                    }
                }

                result = &mut llm_task => {
                    llm_result = Some(result.map_err(|e| {
                        room_agent_core::Error::Llm(format!("generator task panicked: {e}"))
                    })?);
                }
            }
        }

        if cancelled {
            // Stop immediately: no further chunks, abort the request
            llm_task.abort();
            drop(token_rx);
            drop(chunk_tx);

            self.record_assistant_turn(&received_text, true);
            return Ok(GeneratorOutcome {
                text: received_text,
                cancelled: true,
                time_to_first_token: first_token_at.map(|t| t - start),
                total_time: start.elapsed(),
            });
        }

        // Drain any tokens raced between the last recv and task exit
        while let Ok(token) = token_rx.try_recv() {
            received_text.push_str(&token);
            for chunk in chunker.push(&token) {
                let _ = chunk_tx.send(chunk).await;
            }
        }

        let result = match llm_result {
            Some(result) => result,
            None => llm_task
                .await
                .map_err(|e| room_agent_core::Error::Llm(format!("generator task panicked: {e}")))?,
        };

        match result {
            Ok(outcome) => {
                let cancelled = outcome.finish_reason == FinishReason::Cancelled;

                if !cancelled {
                    if let Some(chunk) = chunker.finalize() {
                        let _ = chunk_tx.send(chunk).await;
                    }
                }
                drop(chunk_tx);

                self.record_assistant_turn(&outcome.text, cancelled);

                Ok(GeneratorOutcome {
                    text: outcome.text,
                    cancelled,
                    time_to_first_token: outcome.time_to_first_token,
                    total_time: outcome.total_time,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "generation failed");
                Err(e.into())
            }
        }
    }

    /// Append the assistant turn. A barged-in partial is kept, tagged as
    /// truncated, so the model knows what was actually said.
    fn record_assistant_turn(&self, text: &str, cancelled: bool) {
        if text.trim().is_empty() {
            return;
        }
        let turn = if cancelled {
            DialogueTurn::assistant(text).truncated()
        } else {
            DialogueTurn::assistant(text)
        };
        self.dialogue.lock().push(turn);
    }
}

/// Accumulates streamed tokens and cuts them into speak chunks.
struct Chunker {
    config: GeneratorConfig,
    buffer: String,
    next_index: u32,
}

impl Chunker {
    fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            next_index: 0,
        }
    }

    fn emitted_any(&self) -> bool {
        self.next_index > 0
    }

    fn max_chars(&self) -> usize {
        if self.emitted_any() {
            self.config.next_chunk_max_chars
        } else {
            self.config.first_chunk_max_chars
        }
    }

    /// Push a token, returning any chunks that became ready.
    fn push(&mut self, token: &str) -> Vec<SpeakChunk> {
        self.buffer.push_str(token);
        let mut out = Vec::new();

        loop {
            if let Some(boundary) = self.sentence_boundary() {
                let text: String = self.buffer.drain(..boundary).collect();
                if let Some(chunk) = self.make_chunk(&text, false) {
                    out.push(chunk);
                }
                continue;
            }

            if self.buffer.chars().count() >= self.max_chars() {
                if let Some(chunk) = self.cut_at_word_boundary() {
                    out.push(chunk);
                    continue;
                }
            }
            break;
        }

        out
    }

    /// Byte offset just past the first sentence terminator, if any.
    fn sentence_boundary(&self) -> Option<usize> {
        for (idx, c) in self.buffer.char_indices() {
            if SENTENCE_TERMINATORS.contains(&c) {
                return Some(idx + c.len_utf8());
            }
        }
        None
    }

    /// Cut the buffer at the last word boundary under the size cap.
    fn cut_at_word_boundary(&mut self) -> Option<SpeakChunk> {
        let cut = self
            .buffer
            .char_indices()
            .take(self.max_chars())
            .filter(|(_, c)| c.is_whitespace())
            .map(|(idx, _)| idx)
            .last()?;
        if cut == 0 {
            return None;
        }
        let text: String = self.buffer.drain(..cut).collect();
        self.make_chunk(&text, false)
    }

    /// Timeout flush: emit whatever accumulated, at a word boundary if one
    /// exists.
    fn flush_pending(&mut self) -> Option<SpeakChunk> {
        if self.buffer.trim().is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        self.make_chunk(&text, false)
    }

    /// End of stream: flush the remainder as the final chunk.
    fn finalize(&mut self) -> Option<SpeakChunk> {
        let text = std::mem::take(&mut self.buffer);
        if text.trim().is_empty() {
            // The final flag must still reach the synthesizer
            return Some(SpeakChunk {
                index: self.bump_index(),
                text: String::new(),
                is_final: true,
            });
        }
        self.make_chunk(&text, true)
    }

    fn make_chunk(&mut self, text: &str, is_final: bool) -> Option<SpeakChunk> {
        let trimmed = text.trim();
        if trimmed.is_empty() && !is_final {
            return None;
        }
        Some(SpeakChunk {
            index: self.bump_index(),
            text: trimmed.to_string(),
            is_final,
        })
    }

    fn bump_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(GeneratorConfig::default())
    }

    #[test]
    fn test_sentence_boundary_cuts_chunk() {
        let mut c = chunker();
        assert!(c.push("Hello the").is_empty());
        let chunks = c.push("re. How");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello there.");
        assert_eq!(chunks[0].index, 0);
        assert!(!chunks[0].is_final);
    }

    #[test]
    fn test_first_chunk_size_cap() {
        let mut c = chunker();
        // 90 chars of boundary-free text crosses the 80-char first cap
        let text = "word ".repeat(18);
        let chunks = c.push(&text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.chars().count() <= 80);
    }

    #[test]
    fn test_later_chunks_use_larger_cap() {
        let mut c = chunker();
        c.push("First sentence. ");
        assert!(c.emitted_any());

        // 100 boundary-free chars stay buffered under the 120-char cap
        let chunks = c.push(&"word ".repeat(20));
        assert!(chunks.is_empty());

        let chunks = c.push(&"word ".repeat(6));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_indices_strictly_increase() {
        let mut c = chunker();
        let mut indices = Vec::new();
        for chunk in c.push("One. Two. Three.") {
            indices.push(chunk.index);
        }
        if let Some(last) = c.finalize() {
            indices.push(last.index);
        }
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn test_finalize_marks_final() {
        let mut c = chunker();
        c.push("Complete sentence. And a tail");
        let last = c.finalize().unwrap();
        assert!(last.is_final);
        assert_eq!(last.text, "And a tail");
    }

    #[test]
    fn test_finalize_empty_still_flags_final() {
        let mut c = chunker();
        c.push("Just one sentence.");
        let last = c.finalize().unwrap();
        assert!(last.is_final);
        assert!(last.text.is_empty());
    }

    #[test]
    fn test_devanagari_terminator() {
        let mut c = chunker();
        let chunks = c.push("नमस्ते। और");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "नमस्ते।");
    }
}
