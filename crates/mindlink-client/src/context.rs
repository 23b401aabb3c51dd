//! Context-staleness tracking
//!
//! Each conversation pulls context from several sources (the local knowledge
//! store, each peer's shared context). A source is stale relative to a
//! conversation when its current content hash differs from the hash last
//! bundled into a query for that conversation, or when it was never bundled.
//! Staleness only annotates UI affordances; delivery correctness never
//! depends on it.

use mindlink_core::ConversationId;
use std::collections::HashMap;

/// A context source whose content hash is tracked.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum ContextSource {
    Local,
    Peer(String),
}

impl std::fmt::Display for ContextSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextSource::Local => f.write_str("local"),
            ContextSource::Peer(id) => write!(f, "peer:{}", id),
        }
    }
}

/// Per-(conversation, source) last-sent hash against per-source current hash.
#[derive(Debug, Default)]
pub struct ContextTracker {
    current: HashMap<ContextSource, String>,
    sent: HashMap<(ConversationId, ContextSource), String>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The source's content changed; record its new hash.
    pub fn mark_current(&mut self, source: ContextSource, hash: impl Into<String>) {
        self.current.insert(source, hash.into());
    }

    /// The source was just bundled into a query for this conversation; copy
    /// the current hash into the last-sent record.
    pub fn mark_sent(&mut self, conversation: &ConversationId, source: &ContextSource) {
        if let Some(hash) = self.current.get(source) {
            self.sent
                .insert((conversation.clone(), source.clone()), hash.clone());
        }
    }

    /// True iff the source was never sent for this conversation or its hash
    /// has moved since.
    pub fn is_stale(&self, conversation: &ConversationId, source: &ContextSource) -> bool {
        match self.sent.get(&(conversation.clone(), source.clone())) {
            None => true,
            Some(sent_hash) => self.current.get(source) != Some(sent_hash),
        }
    }

    /// All known sources currently stale for this conversation.
    pub fn stale_sources(&self, conversation: &ConversationId) -> Vec<ContextSource> {
        self.current
            .keys()
            .filter(|source| self.is_stale(conversation, source))
            .cloned()
            .collect()
    }

    /// Drop every last-sent record for a conversation (session reset).
    pub fn clear_conversation(&mut self, conversation: &ConversationId) {
        self.sent.retain(|(conv, _), _| conv != conversation);
    }

    pub fn current_hash(&self, source: &ContextSource) -> Option<&str> {
        self.current.get(source).map(String::as_str)
    }
}
