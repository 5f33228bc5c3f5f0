//! End-to-end session scenarios on the loopback transport
//!
//! The engine clients are scripted doubles: the recognizer replies with
//! queued finals on each utterance flush, the language model streams a
//! configured reply, and the synthesizer produces paced PCM. Time is
//! paused, so endpointing timers, hangover windows, and backoffs all run on
//! the virtual clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use room_agent_config::Settings;
use room_agent_core::{
    ChatOutcome, ChatRequest, Error, FinishReason, LanguageModel, ParticipantId, Result,
    SpeechToText, SttSegment, SttSink, SttSource, TextToSpeech, TtsEvent,
};
use room_agent_session::{Session, SessionHandle};
use room_agent_transport::LoopbackTransport;

// ---------------------------------------------------------------------------
// Scripted speech recognizer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedStt {
    /// Finals popped per participant, one entry per utterance flush
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    /// Fail this many open_stream calls before succeeding
    fail_connects: AtomicU32,
    /// First successful connection's sink errors after this many sends
    fail_first_sink_after: Option<usize>,
    /// Deliver every final twice to exercise dedup
    duplicate_finals: bool,
    opened: AtomicU32,
}

impl ScriptedStt {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, participant: &str, finals: &[&str]) -> Self {
        self.scripts.lock().insert(
            participant.to_string(),
            finals.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    fn failing_connects(mut self, count: u32) -> Self {
        self.fail_connects = AtomicU32::new(count);
        self
    }

    fn flaky_first_connection(mut self, fail_after_sends: usize) -> Self {
        self.fail_first_sink_after = Some(fail_after_sends);
        self
    }

    fn duplicating_finals(mut self) -> Self {
        self.duplicate_finals = true;
        self
    }
}

struct ScriptedSink {
    participant: String,
    scripts: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    segments_tx: mpsc::Sender<Vec<SttSegment>>,
    sends: usize,
    fail_after: Option<usize>,
    duplicate_finals: bool,
}

#[async_trait]
impl SttSink for ScriptedSink {
    async fn send_pcm(&mut self, _pcm: &[i16]) -> Result<()> {
        self.sends += 1;
        if let Some(limit) = self.fail_after {
            if self.sends > limit {
                return Err(Error::Stt("connection reset".to_string()));
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let text = self
            .scripts
            .lock()
            .get_mut(&self.participant)
            .and_then(|queue| queue.pop_front());

        if let Some(text) = text {
            let segments = vec![SttSegment {
                text,
                start_s: 0.0,
                end_s: 1.0,
                completed: true,
            }];
            let _ = self.segments_tx.send(segments.clone()).await;
            if self.duplicate_finals {
                let _ = self.segments_tx.send(segments).await;
            }
        }
        Ok(())
    }
}

struct ScriptedSource {
    segments_rx: mpsc::Receiver<Vec<SttSegment>>,
}

#[async_trait]
impl SttSource for ScriptedSource {
    async fn next_segments(&mut self) -> Option<Result<Vec<SttSegment>>> {
        self.segments_rx.recv().await.map(Ok)
    }
}

struct SharedScriptedStt {
    inner: Arc<ScriptedStt>,
    scripts: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl SharedScriptedStt {
    fn new(stt: ScriptedStt) -> Self {
        let scripts = Arc::new(Mutex::new(std::mem::take(&mut *stt.scripts.lock())));
        Self {
            inner: Arc::new(stt),
            scripts,
        }
    }
}

#[async_trait]
impl SpeechToText for SharedScriptedStt {
    async fn open_stream(
        &self,
        participant: &ParticipantId,
    ) -> Result<(Box<dyn SttSink>, Box<dyn SttSource>)> {
        let remaining = self.inner.fail_connects.load(Ordering::Relaxed);
        if remaining > 0 {
            self.inner.fail_connects.store(remaining - 1, Ordering::Relaxed);
            return Err(Error::Stt("connection refused".to_string()));
        }

        let connection_index = self.inner.opened.fetch_add(1, Ordering::Relaxed);
        let fail_after = if connection_index == 0 {
            self.inner.fail_first_sink_after
        } else {
            None
        };

        let (segments_tx, segments_rx) = mpsc::channel(16);
        Ok((
            Box::new(ScriptedSink {
                participant: participant.as_str().to_string(),
                scripts: self.scripts.clone(),
                segments_tx,
                sends: 0,
                fail_after,
                duplicate_finals: self.inner.duplicate_finals,
            }),
            Box::new(ScriptedSource { segments_rx }),
        ))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Scripted language model
// ---------------------------------------------------------------------------

enum LlmMode {
    /// Stream the reply word by word with a fixed inter-token delay
    Reply { text: String, token_delay: Duration },
    /// Produce nothing and fail like a first-token timeout
    Stall,
}

struct ScriptedLlm {
    mode: LlmMode,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn reply(text: &str) -> Self {
        Self {
            mode: LlmMode::Reply {
                text: text.to_string(),
                token_delay: Duration::from_millis(20),
            },
            calls: AtomicUsize::new(0),
        }
    }

    fn stalling() -> Self {
        Self {
            mode: LlmMode::Stall,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate_stream(
        &self,
        _request: ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let start = std::time::Instant::now();

        match &self.mode {
            LlmMode::Reply { text, token_delay } => {
                let mut sent = String::new();
                for token in text.split_inclusive(' ') {
                    sleep(*token_delay).await;
                    if tx.send(token.to_string()).await.is_err() {
                        return Ok(ChatOutcome {
                            text: sent,
                            finish_reason: FinishReason::Cancelled,
                            time_to_first_token: Some(*token_delay),
                            total_time: start.elapsed(),
                        });
                    }
                    sent.push_str(token);
                }
                Ok(ChatOutcome {
                    text: sent,
                    finish_reason: FinishReason::Stop,
                    time_to_first_token: Some(*token_delay),
                    total_time: start.elapsed(),
                })
            }
            LlmMode::Stall => {
                sleep(Duration::from_secs(5)).await;
                Err(Error::LlmTimeout("no first token within 5000 ms".to_string()))
            }
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Scripted synthesizer
// ---------------------------------------------------------------------------

struct ScriptedTts {
    synthesized: Mutex<Vec<String>>,
    chunk_delay: Duration,
}

impl ScriptedTts {
    fn new() -> Self {
        Self {
            synthesized: Mutex::new(Vec::new()),
            chunk_delay: Duration::from_millis(10),
        }
    }

    /// Slow synthesis so a turn stays in Speaking long enough to barge in.
    fn slow(chunk_delay_ms: u64) -> Self {
        Self {
            synthesized: Mutex::new(Vec::new()),
            chunk_delay: Duration::from_millis(chunk_delay_ms),
        }
    }

    fn synthesized(&self) -> Vec<String> {
        self.synthesized.lock().clone()
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    async fn synthesize_stream(&self, text: &str, tx: mpsc::Sender<TtsEvent>) -> Result<()> {
        self.synthesized.lock().push(text.to_string());

        if tx
            .send(TtsEvent::Started {
                sample_rate_hz: 16_000,
                channels: 1,
            })
            .await
            .is_err()
        {
            return Err(Error::Cancelled);
        }

        // One 20ms burst per ~10 characters keeps output proportional
        let bursts = (text.len() / 10).max(1);
        for _ in 0..bursts {
            sleep(self.chunk_delay).await;
            if tx
                .send(TtsEvent::Audio {
                    pcm: vec![1_000i16; 320],
                })
                .await
                .is_err()
            {
                return Err(Error::Cancelled);
            }
        }

        if tx.send(TtsEvent::Complete).await.is_err() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn voice(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

const SPEECH: i16 = 12_000;
const SILENCE: i16 = 0;

fn spawn_feed(transport: Arc<LoopbackTransport>, who: &'static str, timeline: Vec<(u64, i16)>) {
    tokio::spawn(async move {
        for (ms, amplitude) in timeline {
            for _ in 0..(ms / 20) {
                transport.push_audio(who, vec![amplitude; 320], 16_000, 1);
                sleep(Duration::from_millis(20)).await;
            }
        }
    });
}

/// Feed a single talk burst followed by a long silent tail.
fn speak_then_silence(transport: &Arc<LoopbackTransport>, who: &'static str, speech_ms: u64) {
    spawn_feed(
        transport.clone(),
        who,
        vec![(speech_ms, SPEECH), (30_000, SILENCE)],
    );
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..600 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn statuses(transport: &LoopbackTransport) -> Vec<String> {
    transport
        .published_on_topic("agent_status")
        .iter()
        .filter_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .filter_map(|v| v["state"].as_str().map(str::to_string))
        .collect()
}

fn transcripts(transport: &LoopbackTransport) -> Vec<serde_json::Value> {
    transport
        .published_on_topic("transcripts")
        .iter()
        .filter_map(|raw| serde_json::from_str(raw).ok())
        .collect()
}

fn user_finals(transport: &LoopbackTransport) -> Vec<serde_json::Value> {
    transcripts(transport)
        .into_iter()
        .filter(|t| t["speaker"] == "user" && t.get("interim").is_none())
        .collect()
}

fn assistant_transcripts(transport: &LoopbackTransport) -> Vec<serde_json::Value> {
    transcripts(transport)
        .into_iter()
        .filter(|t| t["speaker"] == "assistant")
        .collect()
}

fn count(haystack: &[String], needle: &str) -> usize {
    haystack.iter().filter(|s| s.as_str() == needle).count()
}

fn assert_subsequence(haystack: &[String], needle: &[&str]) {
    let mut it = haystack.iter();
    for expected in needle {
        assert!(
            it.any(|s| s == expected),
            "missing '{expected}' in status sequence {haystack:?}"
        );
    }
}

struct Scenario {
    transport: Arc<LoopbackTransport>,
    handle: SessionHandle,
}

fn start_session(
    settings: Settings,
    stt: ScriptedStt,
    llm: Arc<ScriptedLlm>,
    tts: Arc<ScriptedTts>,
) -> Scenario {
    let transport = Arc::new(LoopbackTransport::new());
    let handle = Session::spawn(
        settings,
        transport.clone(),
        Arc::new(SharedScriptedStt::new(stt)),
        llm,
        tts,
    )
    .expect("session should start");
    Scenario { transport, handle }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_greeting_round_trip() {
    let llm = Arc::new(ScriptedLlm::reply("I am doing well. Thanks for asking."));
    let tts = Arc::new(ScriptedTts::new());
    let scenario = start_session(
        Settings::default(),
        ScriptedStt::new().script("alice", &["Hello, how are you?"]),
        llm.clone(),
        tts.clone(),
    );
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    speak_then_silence(transport, "alice", 1_200);

    wait_for("assistant reply", || {
        !assistant_transcripts(transport).is_empty()
    })
    .await;
    wait_for("turn closed", || {
        statuses(transport).last().map(String::as_str) == Some("idle")
            && !transport.published_audio().is_empty()
    })
    .await;

    // Exactly one committed user transcript, final, with Alice's identity
    let finals = user_finals(transport);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0]["text"], "Hello, how are you?");
    assert_eq!(finals[0]["participantIdentity"], "alice");
    assert_eq!(finals[0]["participantSid"], "PA_alice");

    // Full state traversal, in order
    let states = statuses(transport);
    assert_subsequence(
        &states,
        &[
            "idle",
            "listening",
            "endpointing",
            "thinking",
            "speaking",
            "idle",
        ],
    );

    // Closing status carries the latency breakdown
    let with_latencies = transport
        .published_on_topic("agent_status")
        .iter()
        .filter_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .any(|v| v["state"] == "idle" && v.get("latencies").is_some());
    assert!(with_latencies, "closing idle status should report latencies");

    assert_eq!(llm.calls(), 1);
    assert!(!tts.synthesized().is_empty());

    scenario.handle.shutdown();
    let summary = scenario.handle.join().await;
    assert_eq!(summary.controller.turns_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_thinking_pause_commits_once() {
    let llm = Arc::new(ScriptedLlm::reply("Of course, when works for you?"));
    let tts = Arc::new(ScriptedTts::new());
    let scenario = start_session(
        Settings::default(),
        ScriptedStt::new().script("alice", &["Hello, I want to", "book an appointment"]),
        llm.clone(),
        tts.clone(),
    );
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;

    // 0.8s speech, 1.8s pause (inside the endpointing window), 1.1s speech
    spawn_feed(
        transport.clone(),
        "alice",
        vec![
            (800, SPEECH),
            (1_800, SILENCE),
            (1_100, SPEECH),
            (30_000, SILENCE),
        ],
    );

    wait_for("assistant reply", || {
        !assistant_transcripts(transport).is_empty()
    })
    .await;
    wait_for("turn closed", || {
        statuses(transport).last().map(String::as_str) == Some("idle")
    })
    .await;

    // One committed utterance spanning the pause, one response
    let finals = user_finals(transport);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0]["text"], "Hello, I want to book an appointment");
    assert_eq!(assistant_transcripts(transport).len(), 1);
    assert_eq!(count(&statuses(transport), "thinking"), 1);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_stops_audio_and_yields_floor() {
    let long_reply = "Once upon a time there was a kingdom. \
        The kingdom had a great library. \
        The library had ten thousand scrolls. \
        Each scroll told a different story. \
        The stories went on and on for ages.";
    let llm = Arc::new(ScriptedLlm::reply(long_reply));
    let tts = Arc::new(ScriptedTts::slow(60));
    let scenario = start_session(
        Settings::default(),
        ScriptedStt::new().script("alice", &["Tell me a long story.", "Stop."]),
        llm.clone(),
        tts.clone(),
    );
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    // Short silent tail so this feeder is done before the interrupt feed
    spawn_feed(
        transport.clone(),
        "alice",
        vec![(1_000, SPEECH), (1_000, SILENCE)],
    );

    wait_for("assistant speaking", || {
        statuses(transport).last().map(String::as_str) == Some("speaking")
            && !transport.published_audio().is_empty()
    })
    .await;

    // 600ms into assistant speech the user interrupts
    sleep(Duration::from_millis(600)).await;
    spawn_feed(
        transport.clone(),
        "alice",
        vec![(400, SPEECH), (30_000, SILENCE)],
    );

    wait_for("barge-in observed", || {
        statuses(transport).contains(&"interrupted".to_string())
    })
    .await;
    wait_for("floor handed to interrupter", || {
        let states = statuses(transport);
        let interrupted = states.iter().position(|s| s == "interrupted");
        let listening_after = interrupted
            .map(|i| states[i..].contains(&"listening".to_string()))
            .unwrap_or(false);
        listening_after
    })
    .await;

    // No orphan audio: once the cancelled turn settled, nothing more plays
    // until the next turn begins speaking
    let settled = transport.published_audio().len();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        transport.published_audio().len(),
        settled,
        "cancelled turn published audio after settling"
    );

    // The interrupting utterance drives a fresh turn
    wait_for("second reply", || {
        user_finals(transport)
            .iter()
            .any(|t| t["text"] == "Stop.")
            && llm.calls() >= 2
    })
    .await;

    // The story started from its first sentence, in order
    let synthesized = tts.synthesized();
    assert!(synthesized[0].starts_with("Once upon a time"));
}

#[tokio::test(start_paused = true)]
async fn test_stt_dropout_recovers_within_utterance() {
    let llm = Arc::new(ScriptedLlm::reply("Table for two, done."));
    let tts = Arc::new(ScriptedTts::new());
    let stt = ScriptedStt::new()
        .script("alice", &["please book me a table."])
        .flaky_first_connection(10);
    let scenario = start_session(Settings::default(), stt, llm.clone(), tts.clone());
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    speak_then_silence(transport, "alice", 3_000);

    wait_for("reply despite dropout", || {
        !assistant_transcripts(transport).is_empty()
    })
    .await;

    let finals = user_finals(transport);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0]["text"], "please book me a table.");

    scenario.handle.shutdown();
    scenario.handle.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_stt_unavailable_returns_to_idle_without_reply() {
    let llm = Arc::new(ScriptedLlm::reply("should never be called"));
    let tts = Arc::new(ScriptedTts::new());
    let stt = ScriptedStt::new()
        .script("alice", &["unreachable"])
        .failing_connects(u32::MAX);
    let scenario = start_session(Settings::default(), stt, llm.clone(), tts.clone());
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    speak_then_silence(transport, "alice", 2_000);

    wait_for("back to idle after failure", || {
        let states = statuses(transport);
        states.contains(&"listening".to_string())
            && states.last().map(String::as_str) == Some("idle")
    })
    .await;

    assert!(assistant_transcripts(transport).is_empty());
    assert_eq!(llm.calls(), 0);

    transport.leave("alice");
    let summary = scenario.handle.join().await;
    assert!(summary.controller.stt_failures >= 1);
    assert_eq!(summary.controller.turns_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_llm_stall_speaks_canned_apology() {
    let llm = Arc::new(ScriptedLlm::stalling());
    let tts = Arc::new(ScriptedTts::new());
    let scenario = start_session(
        Settings::default(),
        ScriptedStt::new().script("alice", &["What is the capital of France?"]),
        llm.clone(),
        tts.clone(),
    );
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    speak_then_silence(transport, "alice", 1_500);

    wait_for("apology synthesized", || {
        tts.synthesized()
            .iter()
            .any(|t| t.contains("Sorry, I had trouble answering"))
    })
    .await;
    wait_for("turn closed", || {
        statuses(transport).last().map(String::as_str) == Some("idle")
    })
    .await;

    // The canned apology is spoken, not delivered as an assistant
    // transcript, and the turn does not count as completed
    assert!(assistant_transcripts(transport).is_empty());

    scenario.handle.shutdown();
    let summary = scenario.handle.join().await;
    assert_eq!(summary.controller.turns_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_speakers_one_floor() {
    let llm = Arc::new(ScriptedLlm::reply("It is sunny today."));
    let tts = Arc::new(ScriptedTts::new());
    let scenario = start_session(
        Settings::default(),
        ScriptedStt::new()
            .script("alice", &["What's the weather?"])
            .script("bob", &["Hello."]),
        llm.clone(),
        tts.clone(),
    );
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    transport.join("bob", "Bob", "PA_bob");
    sleep(Duration::from_millis(50)).await;

    // Alice's speech leads by 120ms; Bob overlaps
    spawn_feed(
        transport.clone(),
        "alice",
        vec![(1_200, SPEECH), (30_000, SILENCE)],
    );
    spawn_feed(
        transport.clone(),
        "bob",
        vec![(120, SILENCE), (900, SPEECH), (30_000, SILENCE)],
    );

    wait_for("alice's reply", || {
        !assistant_transcripts(transport).is_empty()
    })
    .await;
    wait_for("bob transcribed", || {
        user_finals(transport)
            .iter()
            .any(|t| t["participantIdentity"] == "bob")
    })
    .await;

    // Bob is transcribed but does not get a concurrent second response
    let finals = user_finals(transport);
    assert!(finals
        .iter()
        .any(|t| t["participantIdentity"] == "alice" && t["text"] == "What's the weather?"));
    assert!(finals
        .iter()
        .any(|t| t["participantIdentity"] == "bob" && t["text"] == "Hello."));
    assert_eq!(assistant_transcripts(transport).len(), 1);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_finals_are_idempotent() {
    let llm = Arc::new(ScriptedLlm::reply("Hello there!"));
    let tts = Arc::new(ScriptedTts::new());
    let stt = ScriptedStt::new()
        .script("alice", &["Good morning."])
        .duplicating_finals();
    let scenario = start_session(Settings::default(), stt, llm.clone(), tts.clone());
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    speak_then_silence(transport, "alice", 1_000);

    wait_for("reply", || !assistant_transcripts(transport).is_empty()).await;
    wait_for("turn closed", || {
        statuses(transport).last().map(String::as_str) == Some("idle")
    })
    .await;

    // The duplicated final must not double the committed text
    let finals = user_finals(transport);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0]["text"], "Good morning.");
    assert_eq!(llm.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_greeting_spoken_on_first_join() {
    let mut settings = Settings::default();
    settings.session.greeting = Some("Hi! How can I help today?".to_string());

    let llm = Arc::new(ScriptedLlm::reply("unused"));
    let tts = Arc::new(ScriptedTts::new());
    let scenario = start_session(settings, ScriptedStt::new(), llm.clone(), tts.clone());
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");

    wait_for("greeting synthesized", || {
        tts.synthesized()
            .iter()
            .any(|t| t.contains("How can I help"))
    })
    .await;
    wait_for("greeting finished", || {
        statuses(transport).last().map(String::as_str) == Some("idle")
    })
    .await;

    // The greeting plays through the normal speak path and is transcribed
    assert!(assistant_transcripts(transport)
        .iter()
        .any(|t| t["text"] == "Hi! How can I help today?"));
    assert_eq!(llm.calls(), 0);
    assert!(!transport.published_audio().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_last_leave_drains_session() {
    let llm = Arc::new(ScriptedLlm::reply("Goodbye!"));
    let tts = Arc::new(ScriptedTts::new());
    let scenario = start_session(
        Settings::default(),
        ScriptedStt::new().script("alice", &["Bye now."]),
        llm.clone(),
        tts.clone(),
    );
    let transport = &scenario.transport;

    transport.join("alice", "Alice", "PA_alice");
    sleep(Duration::from_millis(50)).await;
    speak_then_silence(transport, "alice", 800);

    wait_for("turn completed", || {
        !assistant_transcripts(transport).is_empty()
            && statuses(transport).last().map(String::as_str) == Some("idle")
    })
    .await;

    transport.leave("alice");
    let summary = scenario.handle.join().await;
    assert_eq!(summary.controller.turns_completed, 1);
}
