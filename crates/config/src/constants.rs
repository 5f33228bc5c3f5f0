//! Centralized constants for the room voice agent
//!
//! Single source of truth for operational defaults shared across crates.
//! Everything here is tunable through [`crate::Settings`]; these are the
//! fallback values.

/// Service endpoints (loaded from env vars with fallback defaults)
pub mod endpoints {
    use once_cell::sync::Lazy;

    /// Streaming recognizer WebSocket endpoint (env: STT_URL)
    pub static STT_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("STT_URL").unwrap_or_else(|_| "ws://localhost:9090".to_string())
    });

    /// Chat LLM endpoint (env: LLM_URL)
    pub static LLM_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("LLM_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
    });

    /// Streaming synthesis endpoint (env: TTS_URL)
    pub static TTS_DEFAULT: Lazy<String> = Lazy::new(|| {
        std::env::var("TTS_URL").unwrap_or_else(|_| "http://localhost:8880".to_string())
    });
}

/// Audio processing constants
pub mod audio {
    /// Recognition-side sample rate; ingress normalizes to this
    pub const CAPTURE_RATE_HZ: u32 = 16_000;

    /// Default publish rate on the outbound WebRTC track
    pub const PUBLISH_RATE_HZ: u32 = 48_000;

    /// Frame length used across ingress and egress
    pub const FRAME_MS: u32 = 20;

    /// Per-participant ingress queue capacity
    pub const INGRESS_QUEUE_MS: u32 = 1_000;

    /// Outbound egress queue capacity
    pub const EGRESS_QUEUE_MS: u32 = 500;

    /// Fade applied when a turn is cancelled mid-frame
    pub const CANCEL_FADE_MS: u32 = 20;
}

/// Voice activity detection constants
pub mod vad {
    /// Speech score threshold for a window to count as speech
    pub const ACTIVATION_THRESHOLD: f32 = 0.45;

    /// Analysis window length
    pub const WINDOW_MS: u32 = 30;

    /// Speech run required for silence -> speech
    pub const MIN_SPEECH_MS: u32 = 100;

    /// Silence run required for speech -> silence
    pub const MIN_SILENCE_MS: u32 = 300;

    /// Levels at or below this score zero regardless of threshold
    pub const NOISE_FLOOR_DBFS: f32 = -55.0;
}

/// Turn-taking constants
pub mod turn {
    /// Upper bound on the endpointing wait after speech ends
    pub const ENDPOINTING_DELAY_MS: u64 = 2_000;

    /// Silence that must accrue before the turn-complete predicate commits
    pub const PREDICATE_MIN_SILENCE_MS: u64 = 300;

    /// Hard deadline for stopping outbound audio after a barge-in
    pub const BARGE_IN_DEADLINE_MS: u64 = 150;

    /// PCM keeps flowing to the recognizer this long after speech ends
    pub const STT_HANGOVER_MS: u64 = 300;
}

/// Timeouts (in milliseconds unless noted)
pub mod timeouts {
    /// STT configuration handshake
    pub const STT_HANDSHAKE_MS: u64 = 3_000;

    /// Idle STT connections are kept warm this long (seconds)
    pub const STT_IDLE_KEEPALIVE_S: u64 = 30;

    /// LLM time to first token
    pub const LLM_FIRST_TOKEN_MS: u64 = 5_000;

    /// LLM total generation
    pub const LLM_TOTAL_MS: u64 = 20_000;

    /// TTS time to first byte, per chunk
    pub const TTS_FIRST_BYTE_MS: u64 = 2_000;

    /// Egress abandoned as stalled after this long without progress
    pub const EGRESS_STALL_MS: u64 = 2_000;

    /// Graceful session drain
    pub const SESSION_DRAIN_MS: u64 = 3_000;
}

/// Retry/backoff constants
pub mod retry {
    /// Initial STT reconnect backoff
    pub const STT_BACKOFF_INITIAL_MS: u64 = 250;

    /// STT reconnect backoff cap
    pub const STT_BACKOFF_CAP_MS: u64 = 4_000;

    /// STT reconnect attempts per utterance
    pub const STT_MAX_ATTEMPTS: u32 = 5;
}

/// Dialogue context bounds
pub mod dialogue {
    pub const MAX_TURNS: usize = 16;
    pub const MAX_CHARS: usize = 4_096;
}

/// Response generator chunking constants
pub mod chunking {
    /// First chunk flushes at this size even without a sentence boundary
    pub const FIRST_CHUNK_MAX_CHARS: usize = 80;

    /// Later chunks flush at this size
    pub const NEXT_CHUNK_MAX_CHARS: usize = 120;

    /// First chunk flushes this long after the first token regardless
    pub const FIRST_CHUNK_TIMEOUT_MS: u64 = 400;
}
