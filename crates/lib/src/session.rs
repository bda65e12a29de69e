//! Conversation history for one chat session.
//!
//! A conversation is an ordered list of turns (user / model). Only completed exchanges
//! are recorded: the user turn and the model reply are appended together once the reply
//! stream has been fully consumed.

use crate::llm::ImagePayload;

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// Who produced a turn. Gemini names the assistant side "model".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// A single turn: role, text, and (user turns only) an optional attached image.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub image: Option<ImagePayload>,
}

impl Turn {
    pub fn user(text: impl Into<String>, image: Option<ImagePayload>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            image,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            image: None,
        }
    }
}

/// A conversation: id and ordered turn history.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: SessionId,
    pub turns: Vec<Turn>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// New empty conversation with a generated id.
    pub fn new() -> Self {
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            turns: Vec::new(),
        }
    }

    /// Record a completed exchange.
    pub fn push_exchange(&mut self, user: Turn, reply: impl Into<String>) {
        self.turns.push(user);
        self.turns.push(Turn::model(reply));
    }

    /// Number of completed user/model exchanges.
    pub fn exchanges(&self) -> usize {
        self.turns.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
