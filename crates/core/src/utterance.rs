//! Utterance lifecycle types
//!
//! An utterance opens when speech starts for a participant and closes when
//! the turn controller commits or cancels it. Ids increase strictly per
//! participant; committed text is set exactly once.

use std::fmt;
use tokio::time::Instant;

use crate::participant::ParticipantId;

/// Per-participant monotonic utterance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(pub u64);

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// One user utterance being recognized.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: UtteranceId,
    pub participant: ParticipantId,
    pub opened_at: Instant,
    pub closed_at: Option<Instant>,
    /// Latest interim hypothesis; superseded freely
    pub interim_text: String,
    /// Concatenation of stable final segments
    pub final_text: String,
    /// Set exactly once, on commit
    pub complete: bool,
}

impl Utterance {
    pub fn open(id: UtteranceId, participant: ParticipantId, at: Instant) -> Self {
        Self {
            id,
            participant,
            opened_at: at,
            closed_at: None,
            interim_text: String::new(),
            final_text: String::new(),
            complete: false,
        }
    }

    /// Replace the interim hypothesis.
    pub fn set_interim(&mut self, text: impl Into<String>) {
        self.interim_text = text.into();
    }

    /// Append a stable final segment. Segments are joined with single spaces.
    pub fn push_final(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.final_text.is_empty() {
            self.final_text.push(' ');
        }
        self.final_text.push_str(text);
    }

    /// Best available text: finals if any arrived, otherwise the interim.
    pub fn best_text(&self) -> &str {
        if self.final_text.is_empty() {
            &self.interim_text
        } else {
            &self.final_text
        }
    }

    /// Close the utterance as committed.
    pub fn commit(&mut self, at: Instant) {
        debug_assert!(!self.complete, "utterance committed twice");
        self.complete = true;
        self.closed_at = Some(at);
    }

    /// Close the utterance without committing.
    pub fn cancel(&mut self, at: Instant) {
        self.closed_at = Some(at);
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance() -> Utterance {
        Utterance::open(UtteranceId(1), ParticipantId::new("alice"), Instant::now())
    }

    #[test]
    fn test_best_text_prefers_finals() {
        let mut u = utterance();
        u.set_interim("hello wor");
        assert_eq!(u.best_text(), "hello wor");

        u.push_final("hello world");
        assert_eq!(u.best_text(), "hello world");
    }

    #[test]
    fn test_finals_concatenate() {
        let mut u = utterance();
        u.push_final("hello, I want to");
        u.push_final("book an appointment");
        assert_eq!(u.best_text(), "hello, I want to book an appointment");
    }

    #[test]
    fn test_commit_closes() {
        let mut u = utterance();
        assert!(!u.is_closed());
        u.commit(Instant::now());
        assert!(u.complete);
        assert!(u.is_closed());
    }

    #[test]
    fn test_cancel_is_not_complete() {
        let mut u = utterance();
        u.cancel(Instant::now());
        assert!(!u.complete);
        assert!(u.is_closed());
    }
}
