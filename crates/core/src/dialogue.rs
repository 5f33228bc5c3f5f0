//! Dialogue context types
//!
//! A bounded rolling window of prior turns with the system preamble pinned
//! first. The turn controller writes user turns at commit, the response
//! generator writes assistant turns; nothing else mutates the context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single turn in the dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Assistant turn was cut short by a barge-in
    #[serde(default)]
    pub truncated: bool,
    /// Marker for a turn where generation failed; text is not real content
    #[serde(default)]
    pub failed: bool,
}

impl DialogueTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            truncated: false,
            failed: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant turn cut short by an interrupt.
    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Failure marker recorded when the generator could not produce a reply.
    pub fn failure(reason: impl Into<String>) -> Self {
        let mut turn = Self::new(Role::Assistant, reason);
        turn.failed = true;
        turn
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Bounded rolling dialogue window.
///
/// The system preamble is always the first turn and is never trimmed; the
/// oldest user/assistant turns are dropped once either bound is exceeded.
#[derive(Debug, Clone)]
pub struct DialogueContext {
    turns: Vec<DialogueTurn>,
    max_turns: usize,
    max_chars: usize,
}

impl DialogueContext {
    pub fn new(system_preamble: impl Into<String>, max_turns: usize, max_chars: usize) -> Self {
        Self {
            turns: vec![DialogueTurn::system(system_preamble)],
            max_turns,
            max_chars,
        }
    }

    pub fn push(&mut self, turn: DialogueTurn) {
        debug_assert!(turn.role != Role::System, "preamble is set at construction");
        self.turns.push(turn);
        self.trim();
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(DialogueTurn::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(DialogueTurn::assistant(text));
    }

    fn trim(&mut self) {
        // Index 0 is the preamble; always keep it and the most recent turn.
        while self.turns.len() > 2
            && (self.turns.len() - 1 > self.max_turns || self.dialogue_chars() > self.max_chars)
        {
            self.turns.remove(1);
        }
    }

    /// Character count of the trimmable window (preamble excluded).
    fn dialogue_chars(&self) -> usize {
        self.turns.iter().skip(1).map(|t| t.char_count()).sum()
    }

    pub fn char_count(&self) -> usize {
        self.dialogue_chars()
    }

    /// Number of user/assistant turns currently held.
    pub fn turn_count(&self) -> usize {
        self.turns.len() - 1
    }

    pub fn system_preamble(&self) -> &str {
        &self.turns[0].text
    }

    pub fn last(&self) -> Option<&DialogueTurn> {
        self.turns.last().filter(|t| t.role != Role::System)
    }

    /// Snapshot for building the next LLM request. Failure markers are
    /// excluded; they exist for the record, not for the model.
    pub fn snapshot(&self) -> Vec<DialogueTurn> {
        self.turns.iter().filter(|t| !t.failed).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_is_first_and_preserved() {
        let mut ctx = DialogueContext::new("You are a voice assistant.", 2, 10_000);
        for i in 0..10 {
            ctx.push_user(format!("user {i}"));
            ctx.push_assistant(format!("assistant {i}"));
        }

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot[0].role, Role::System);
        assert_eq!(ctx.system_preamble(), "You are a voice assistant.");
        assert!(ctx.turn_count() <= 2);
    }

    #[test]
    fn test_char_bound() {
        let mut ctx = DialogueContext::new("preamble", 100, 40);
        for _ in 0..10 {
            ctx.push_user("0123456789");
        }
        assert!(ctx.char_count() <= 40);
        assert_eq!(ctx.system_preamble(), "preamble");
    }

    #[test]
    fn test_most_recent_turn_survives_tight_bound() {
        let mut ctx = DialogueContext::new("preamble", 4, 5);
        ctx.push_user("this turn alone is over the character budget");
        assert_eq!(ctx.turn_count(), 1);
        assert_eq!(
            ctx.last().unwrap().text,
            "this turn alone is over the character budget"
        );
    }

    #[test]
    fn test_snapshot_excludes_failure_markers() {
        let mut ctx = DialogueContext::new("preamble", 16, 4096);
        ctx.push_user("hello");
        ctx.push(DialogueTurn::failure("llm timeout"));
        ctx.push_assistant("hi there");

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|t| !t.failed));
    }

    #[test]
    fn test_truncated_turn_retained() {
        let mut ctx = DialogueContext::new("preamble", 16, 4096);
        ctx.push(DialogueTurn::assistant("I was saying").truncated());
        assert!(ctx.last().unwrap().truncated);
    }
}
