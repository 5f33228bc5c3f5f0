//! Media transport surface for the room voice agent
//!
//! The production transport (WebRTC room membership, SIP bridging, track
//! subscription) lives in the media server and is injected through the
//! [`room_agent_core::MediaTransport`] trait. This crate provides the
//! in-process [`LoopbackTransport`] used by the session integration tests to
//! script room events and capture everything the agent publishes.

mod loopback;

pub use loopback::{LoopbackTransport, PublishedAudio, PublishedData};
pub use room_agent_core::{MediaTransport, TransportEvent};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<TransportError> for room_agent_core::Error {
    fn from(err: TransportError) -> Self {
        room_agent_core::Error::Transport(err.to_string())
    }
}
