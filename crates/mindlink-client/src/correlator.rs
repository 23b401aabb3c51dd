//! Command correlation — matching outbound commands to their one response
//!
//! Every outbound command gets a unique `cmd-{n}` id and an entry in the
//! pending map. A response resolves its entry exactly once; resolutions for
//! ids that are no longer tracked (timed out, cancelled, duplicate delivery)
//! are silently discarded by returning `None`; the caller logs and moves on.

use mindlink_core::{CommandName, ConversationId};
use std::collections::HashMap;

/// Metadata held for one outstanding command until it resolves.
#[derive(Debug)]
pub struct PendingCommand {
    pub id: String,
    pub name: CommandName,
    /// Conversation whose state the resolution will touch, if any.
    pub conversation: Option<ConversationId>,
    /// Placeholder message the resolution will patch, if any.
    pub message_id: Option<String>,
}

/// Owns the pending-command map. Ids are never reused while an entry is
/// live; the sequence counter only moves forward.
#[derive(Debug, Default)]
pub struct CommandCorrelator {
    next_seq: u64,
    pending: HashMap<String, PendingCommand>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation id. Only called after the connection
    /// check has passed, so a rejected send never consumes an id.
    pub fn next_id(&mut self) -> String {
        self.next_seq += 1;
        format!("cmd-{}", self.next_seq)
    }

    pub fn track(&mut self, pending: PendingCommand) {
        self.pending.insert(pending.id.clone(), pending);
    }

    /// Take the entry for `id`, if still tracked. A second call for the same
    /// id returns `None`, which is what guards continuations against double
    /// invocation.
    pub fn resolve(&mut self, id: &str) -> Option<PendingCommand> {
        self.pending.remove(id)
    }

    /// Drop the association for a locally cancelled command. A late response
    /// will then fall through `resolve` as untracked.
    pub fn cancel(&mut self, id: &str) -> Option<PendingCommand> {
        self.pending.remove(id)
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Whether any query-class command is still outstanding for a
    /// conversation (drives the busy flag teardown).
    pub fn has_query_for(&self, conversation: &ConversationId) -> bool {
        self.pending.values().any(|p| {
            p.name.is_query_class() && p.conversation.as_ref() == Some(conversation)
        })
    }
}
