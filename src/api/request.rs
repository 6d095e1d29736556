//! Provider-facing request structures

use crate::router::OperationKind;
use serde::{Deserialize, Serialize};

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

/// Input payload of a request: free text or a chat transcript
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Chat(Vec<Message>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.trim().is_empty(),
            Payload::Chat(messages) => messages.iter().all(|m| m.content.trim().is_empty()),
        }
    }

    /// Flatten the payload into chat messages, treating free text as a user turn
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            Payload::Text(text) => vec![Message::user(text.clone())],
            Payload::Chat(messages) => messages.clone(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<Message>> for Payload {
    fn from(messages: Vec<Message>) -> Self {
        Payload::Chat(messages)
    }
}

/// What the router hands to a backend for a single call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub payload: Payload,
    pub operation: OperationKind,
    /// Upper bound on generated tokens
    pub max_output_tokens: u32,
}
