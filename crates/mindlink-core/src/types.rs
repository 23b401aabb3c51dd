//! Core types for Mindlink conversations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reserved key for the local assistant conversation.
pub const LOCAL_AI_KEY: &str = "local_ai";

/// Conversation identifier - cheaply cloneable.
///
/// Three key families exist: the reserved local-assistant key, generated
/// AI-session keys, and peer node ids (a peer chat is keyed by the peer).
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ConversationId(Arc<str>);

impl ConversationId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// The reserved local-assistant conversation.
    pub fn local_ai() -> Self {
        Self::new(LOCAL_AI_KEY)
    }

    /// A freshly generated AI-session conversation.
    pub fn ai_session() -> Self {
        Self::new(format!("ai-session-{}", uuid::Uuid::new_v4()))
    }

    /// A peer conversation, keyed by the peer's node id.
    pub fn peer(node_id: impl Into<String>) -> Self {
        Self::new(node_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Who authored a message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
    /// A remote peer, identified by node id.
    Peer(String),
}

/// A message in a conversation log.
///
/// A message is "pending" while `pending_command` carries the correlation id
/// of the command that will resolve it; resolution replaces the content and
/// clears the id, making the message terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Sender::Assistant, text)
    }

    /// A placeholder assistant message awaiting the response to `command_id`.
    pub fn assistant_pending(text: impl Into<String>, command_id: impl Into<String>) -> Self {
        let mut msg = Self::new(Sender::Assistant, text);
        msg.pending_command = Some(command_id.into());
        msg
    }

    pub fn peer(node_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Sender::Peer(node_id.into()), text)
    }

    fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
            pending_command: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.pending_command.is_some()
    }

    /// Terminal resolution: replace content and clear the correlation id.
    pub fn resolve(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.pending_command = None;
    }
}

/// Immutable attachment metadata carried on a message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Attachment {
    /// Human-readable size, e.g. "2.40 MB".
    pub fn size_label(&self) -> String {
        format!("{:.2} MB", self.size_bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Token usage for a conversation, updated from response payloads.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub used: u64,
    pub limit: u64,
}

impl TokenUsage {
    pub fn new(used: u64, limit: u64) -> Self {
        Self { used, limit }
    }

    /// The context window is full; further sends are gated until reset.
    pub fn is_full(&self) -> bool {
        self.limit > 0 && self.used >= self.limit
    }

    pub fn usage_percent(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            (self.used as f64 / self.limit as f64) * 100.0
        }
    }
}
