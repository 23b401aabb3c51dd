//! Core-service wire protocol — command envelopes, responses, and pushed events
//!
//! Wire format:
//!
//! Client → Core (command):
//!   { "id": "cmd-7", "command": "execute_ai_query", "params": { "prompt": "Hello" } }
//!
//! Core → Client (response, correlated by id):
//!   { "id": "cmd-7", "status": "OK", "payload": { "content": "Hi!" } }
//!   { "id": "cmd-7", "status": "ERROR", "payload": { "message": "model offline" } }
//!
//! Core → Client (event push, no id):
//!   { "event": "new_p2p_message", "payload": { "sender_node_id": "...", "text": "..." } }
//!
//! The response status vocabulary is not uniform across core versions
//! ("OK"/"success"/"ERROR"/"error"); `ResponseStatus` normalizes it to a
//! two-valued signal.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Approval fraction required for a knowledge commit to pass.
pub const CONSENSUS_THRESHOLD: f64 = 0.75;

// ---------------------------------------------------------------------------
// Client → Core: commands
// ---------------------------------------------------------------------------

/// The closed set of commands this layer sends. Adding a command here is a
/// compile-time concern, not a stringly-typed runtime one.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    ExecuteAiQuery,
    SendP2pMessage,
    GetConversationHistory,
    EndConversationSession,
    SendFile,
    AcceptFileOffer,
    CancelFileTransfer,
    ProposeNewSession,
    VoteNewSession,
    VoteKnowledgeCommit,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::ExecuteAiQuery => "execute_ai_query",
            CommandName::SendP2pMessage => "send_p2p_message",
            CommandName::GetConversationHistory => "get_conversation_history",
            CommandName::EndConversationSession => "end_conversation_session",
            CommandName::SendFile => "send_file",
            CommandName::AcceptFileOffer => "accept_file_offer",
            CommandName::CancelFileTransfer => "cancel_file_transfer",
            CommandName::ProposeNewSession => "propose_new_session",
            CommandName::VoteNewSession => "vote_new_session",
            CommandName::VoteKnowledgeCommit => "vote_knowledge_commit",
        }
    }

    /// Query-class commands mark the owning conversation busy while pending.
    pub fn is_query_class(&self) -> bool {
        matches!(
            self,
            CommandName::ExecuteAiQuery | CommandName::GetConversationHistory
        )
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound command envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub command: CommandName,
    #[serde(default)]
    pub params: Value,
}

impl Command {
    pub fn new(id: impl Into<String>, command: CommandName, params: Value) -> Self {
        Self {
            id: id.into(),
            command,
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Core → Client: responses
// ---------------------------------------------------------------------------

/// Normalized two-valued response status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Failure,
}

impl ResponseStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }
}

impl Serialize for ResponseStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ResponseStatus::Success => serializer.serialize_str("OK"),
            ResponseStatus::Failure => serializer.serialize_str("ERROR"),
        }
    }
}

impl<'de> Deserialize<'de> for ResponseStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "ok" | "success" => Ok(ResponseStatus::Success),
            "error" | "failure" => Ok(ResponseStatus::Failure),
            other => Err(serde::de::Error::custom(format!(
                "unknown response status: {}",
                other
            ))),
        }
    }
}

/// Inbound response envelope, correlated 1:1 with a command by `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub status: ResponseStatus,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    /// Successful response with a payload.
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            command: None,
            status: ResponseStatus::Success,
            payload,
        }
    }

    /// Error response with a message.
    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: None,
            status: ResponseStatus::Failure,
            payload: serde_json::json!({ "message": message.into() }),
        }
    }

    /// The failure message carried in the payload, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Core → Client: pushed events
// ---------------------------------------------------------------------------

/// Raw event envelope; `payload` shape is implied by `event`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Local preparation and transfer phases reported in progress events.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    HashingFile,
    ComputingChunks,
    Transferring,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A message as carried in `history_restored` payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    pub sender: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub attachments: Vec<crate::types::Attachment>,
}

/// The closed set of unsolicited events this layer consumes. Unknown kinds
/// parse to [`CoreEvent::Unknown`] and are dropped by the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum CoreEvent {
    NewP2pMessage {
        sender_node_id: String,
        #[serde(default)]
        sender_name: Option<String>,
        text: String,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        attachments: Vec<crate::types::Attachment>,
    },

    KnowledgeCommitProposal {
        proposal_id: String,
        initiator_node_id: String,
        topic: String,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        vote_deadline: Option<String>,
    },

    KnowledgeCommitResult {
        #[serde(default)]
        proposal_id: Option<String>,
        status: CommitOutcome,
        topic: String,
        vote_tally: VoteTally,
    },

    NewSessionProposal {
        proposal_id: String,
        initiator_node_id: String,
        conversation_id: String,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        participants: Vec<String>,
    },

    NewSessionResult {
        proposal_id: String,
        result: SessionOutcome,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        sender_node_id: Option<String>,
        #[serde(default)]
        vote_tally: Option<VoteTally>,
    },

    FileTransferOffer {
        transfer_id: String,
        filename: String,
        size_bytes: u64,
        sender_node_id: String,
        #[serde(default)]
        hash: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },

    FileTransferProgress {
        transfer_id: String,
        percent: f32,
        phase: TransferPhase,
    },

    FileTransferComplete {
        #[serde(default)]
        transfer_id: Option<String>,
        filename: String,
        direction: TransferDirection,
    },

    FileTransferCancelled {
        #[serde(default)]
        transfer_id: Option<String>,
        #[serde(default)]
        filename: Option<String>,
        reason: String,
    },

    TokenWarning {
        conversation_id: String,
        tokens_used: u64,
        token_limit: u64,
        usage_percent: f64,
    },

    ExtractionFailure {
        conversation_id: String,
        reason: String,
    },

    ContextUpdated {
        context_hash: String,
    },

    PeerContextUpdated {
        node_id: String,
        context_hash: String,
    },

    HistoryRestored {
        conversation_id: String,
        messages: Vec<WireMessage>,
        message_count: usize,
    },

    /// Forward-compatibility catch-all; never constructed by the core service
    /// directly, only by [`CoreEvent::parse`].
    #[serde(skip)]
    Unknown { kind: String },
}

const KNOWN_EVENT_KINDS: &[&str] = &[
    "new_p2p_message",
    "knowledge_commit_proposal",
    "knowledge_commit_result",
    "new_session_proposal",
    "new_session_result",
    "file_transfer_offer",
    "file_transfer_progress",
    "file_transfer_complete",
    "file_transfer_cancelled",
    "token_warning",
    "extraction_failure",
    "context_updated",
    "peer_context_updated",
    "history_restored",
];

impl CoreEvent {
    /// Parse an event envelope into a typed event.
    ///
    /// An unrecognized kind becomes [`CoreEvent::Unknown`]; a recognized kind
    /// whose payload is missing required fields is a
    /// [`crate::Error::ProtocolViolation`].
    pub fn parse(envelope: EventEnvelope) -> crate::Result<Self> {
        if !KNOWN_EVENT_KINDS.contains(&envelope.event.as_str()) {
            return Ok(CoreEvent::Unknown {
                kind: envelope.event,
            });
        }
        let value = serde_json::json!({
            "event": envelope.event,
            "payload": envelope.payload,
        });
        serde_json::from_value(value).map_err(|e| {
            crate::Error::ProtocolViolation(format!("malformed {} event: {}", envelope.event, e))
        })
    }
}

// ---------------------------------------------------------------------------
// Vote tallies and outcomes
// ---------------------------------------------------------------------------

/// Accumulated vote counts behind a protocol outcome. The core service owns
/// the tally; this layer only validates and renders it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteTally {
    #[serde(default)]
    pub approve: u32,
    #[serde(default)]
    pub reject: u32,
    #[serde(default)]
    pub request_changes: u32,
    pub total: u32,
}

impl VoteTally {
    /// Counts come straight off the wire, so the sum is widened to `u64`
    /// before comparing; arbitrary values must not overflow.
    pub fn is_consistent(&self) -> bool {
        u64::from(self.approve) + u64::from(self.reject) + u64::from(self.request_changes)
            <= u64::from(self.total)
    }

    pub fn approval_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.approve as f64 / self.total as f64
        }
    }
}

/// Terminal status of a knowledge-commit proposal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Approved,
    Rejected,
    RevisionNeeded,
    Timeout,
}

impl CommitOutcome {
    /// Deterministic outcome of a finished tally: approval rate at or above
    /// [`CONSENSUS_THRESHOLD`] approves; otherwise more rejections than
    /// change requests rejects; otherwise a revision is needed.
    pub fn from_tally(tally: &VoteTally) -> Self {
        if tally.approval_rate() >= CONSENSUS_THRESHOLD {
            CommitOutcome::Approved
        } else if tally.reject > tally.request_changes {
            CommitOutcome::Rejected
        } else {
            CommitOutcome::RevisionNeeded
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CommitOutcome::Approved => "approved",
            CommitOutcome::Rejected => "rejected",
            CommitOutcome::RevisionNeeded => "revision_needed",
            CommitOutcome::Timeout => "timeout",
        }
    }
}

/// Local vote choice on a knowledge-commit proposal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitVoteChoice {
    Approve,
    Reject,
    RequestChanges,
}

/// Terminal status of a new-session proposal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Approved,
    Rejected,
    Timeout,
}

// ---------------------------------------------------------------------------
// Unified inbound message — response or event push
// ---------------------------------------------------------------------------

/// Unified inbound frame. Serde tries the correlated response shape first,
/// then the event envelope.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    /// Correlated response: { "id": "...", "status": "...", "payload": ... }
    Response(Response),
    /// Unsolicited event: { "event": "...", "payload": ... }
    Event(EventEnvelope),
}
