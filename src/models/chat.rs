// src/models/chat.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder title a chat carries until background title generation lands.
pub const PLACEHOLDER_TITLE: &str = "New Chat";

/// Author of a message. The wire values match what the generation backend
/// expects, so roles pass through without mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

/// A single chat message. Markdown source, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub role: Role,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role: Role::User,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role: Role::Model,
        }
    }
}

/// A conversation with its trunk history. Trunk messages are append-only:
/// they grow via merges, never get edited or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Chat {
    /// A freshly created chat: placeholder title, empty trunk. The first
    /// user message lives in the branch it was posted to, not the trunk.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            title: PLACEHOLDER_TITLE.to_string(),
            messages: Vec::new(),
        }
    }
}

/// A fork of a chat's trunk. Holds only its own continuation; the effective
/// history for generation is trunk-at-fork followed by these messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Uuid,
    pub messages: Vec<Message>,
}

impl Branch {
    /// Branches are lazily materialized: an unknown ID is just an empty
    /// branch waiting for its first message.
    pub fn empty(id: Uuid) -> Self {
        Self {
            id,
            messages: Vec::new(),
        }
    }
}

/// A chat referenced from a prompt, as posted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMention {
    pub id: Uuid,
    pub title: String,
}
