//! Session supervisor for the room voice agent
//!
//! One [`Session`] per room. The supervisor owns every task of the session
//! (ingress+VAD per participant, STT send/receive loops, the turn
//! controller, and whatever speak pipeline the controller spawned),
//! propagates a single cancellation signal to all of them, and emits
//! telemetry over the transport's data channel. When the last human
//! participant leaves, the session drains gracefully: the current turn may
//! finish on a deadline, then everything shuts down.

mod participant;
mod supervisor;
mod telemetry;

pub use supervisor::{Session, SessionHandle, SessionSummary};
pub use telemetry::TelemetryHub;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] room_agent_config::ConfigError),

    #[error("client construction failed: {0}")]
    Client(String),
}
