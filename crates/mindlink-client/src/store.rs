//! Conversation state store
//!
//! Per-conversation message logs with replace-on-write snapshots: every
//! mutation builds a fresh `Arc<Vec<Message>>`, so a reader holding a log
//! never observes a partially applied change. Conversations are created on
//! first reference and only removed explicitly.

use dashmap::DashMap;
use mindlink_core::{ConversationId, Message, TokenUsage};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Conversation {
    log: Arc<Vec<Message>>,
    unread: usize,
    usage: Option<TokenUsage>,
    busy: bool,
}

impl Conversation {
    fn new() -> Self {
        Self {
            log: Arc::new(Vec::new()),
            unread: 0,
            usage: None,
            busy: false,
        }
    }
}

/// Read-only snapshot of one conversation's derived state.
#[derive(Clone, Debug)]
pub struct ConversationView {
    pub log: Arc<Vec<Message>>,
    pub unread: usize,
    pub usage: Option<TokenUsage>,
    pub busy: bool,
}

/// The store owns all conversation records; mutation happens only through
/// these operations.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: DashMap<ConversationId, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, creating the conversation on first reference.
    pub fn append(&self, id: &ConversationId, message: Message) {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(Conversation::new);
        let mut log = entry.log.as_ref().clone();
        log.push(message);
        entry.log = Arc::new(log);
    }

    /// Patch the first message matching `predicate`. Returns whether a
    /// message was patched.
    pub fn update_message<P, F>(&self, id: &ConversationId, predicate: P, patch: F) -> bool
    where
        P: Fn(&Message) -> bool,
        F: FnOnce(&mut Message),
    {
        let Some(mut entry) = self.conversations.get_mut(id) else {
            return false;
        };
        let mut log = entry.log.as_ref().clone();
        let Some(target) = log.iter_mut().find(|m| predicate(m)) else {
            return false;
        };
        patch(target);
        entry.log = Arc::new(log);
        true
    }

    /// Replace the entire log (history restoration after reconnect).
    pub fn replace_log(&self, id: &ConversationId, messages: Vec<Message>) {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(Conversation::new);
        entry.log = Arc::new(messages);
    }

    /// The ordered log; empty for an unknown conversation.
    pub fn log(&self, id: &ConversationId) -> Arc<Vec<Message>> {
        self.conversations
            .get(id)
            .map(|c| c.log.clone())
            .unwrap_or_default()
    }

    pub fn view(&self, id: &ConversationId) -> Option<ConversationView> {
        self.conversations.get(id).map(|c| ConversationView {
            log: c.log.clone(),
            unread: c.unread,
            usage: c.usage,
            busy: c.busy,
        })
    }

    /// Clear messages, token usage, and unread count in one step. The caller
    /// clears the matching staleness records in the same turn, which keeps
    /// the three mutations atomic under the single-consumer loop.
    pub fn clear(&self, id: &ConversationId) {
        if let Some(mut entry) = self.conversations.get_mut(id) {
            entry.log = Arc::new(Vec::new());
            entry.usage = None;
            entry.unread = 0;
            debug!("cleared conversation {}", id);
        }
    }

    /// Remove the conversation record entirely (explicit AI-chat deletion;
    /// peer chats persist as long as the peer is known).
    pub fn remove(&self, id: &ConversationId) {
        self.conversations.remove(id);
    }

    pub fn set_busy(&self, id: &ConversationId, busy: bool) {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(Conversation::new);
        entry.busy = busy;
    }

    pub fn is_busy(&self, id: &ConversationId) -> bool {
        self.conversations.get(id).map(|c| c.busy).unwrap_or(false)
    }

    pub fn set_usage(&self, id: &ConversationId, usage: TokenUsage) {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(Conversation::new);
        entry.usage = Some(usage);
    }

    pub fn usage(&self, id: &ConversationId) -> Option<TokenUsage> {
        self.conversations.get(id).and_then(|c| c.usage)
    }

    /// The token window for this conversation is exhausted; sends are gated
    /// until the conversation is ended or reset.
    pub fn is_window_full(&self, id: &ConversationId) -> bool {
        self.usage(id).map(|u| u.is_full()).unwrap_or(false)
    }

    pub fn increment_unread(&self, id: &ConversationId) {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(Conversation::new);
        entry.unread += 1;
    }

    pub fn mark_read(&self, id: &ConversationId) {
        if let Some(mut entry) = self.conversations.get_mut(id) {
            entry.unread = 0;
        }
    }

    pub fn unread(&self, id: &ConversationId) -> usize {
        self.conversations.get(id).map(|c| c.unread).unwrap_or(0)
    }

    pub fn list(&self) -> Vec<ConversationId> {
        self.conversations.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }
}
