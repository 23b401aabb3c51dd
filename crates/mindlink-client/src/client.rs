//! Client orchestration core — the single consumer of all inputs
//!
//! Every input enters one queue: raw frames from the socket pump, user
//! actions from the presentation surface, connection transitions, and timer
//! ticks. A single consumer loop applies them in arrival order against one
//! owned state container, so no protocol mutation ever races another.
//! Derived state flows back out through a broadcast of [`UiEvent`]s.

use crate::commit_protocol::KnowledgeCommitEngine;
use crate::connection::{ConnectionManager, ConnectionPhase};
use crate::context::{ContextSource, ContextTracker};
use crate::correlator::{CommandCorrelator, PendingCommand};
use crate::dispatch::{delivery_key, RecentKeys};
use crate::session_protocol::NewSessionEngine;
use crate::store::ConversationStore;
use crate::transfer::TransferEngine;
use chrono::{DateTime, Utc};
use mindlink_core::{
    Command, CommandName, CommitVoteChoice, ConversationId, CoreEvent, Error, InboundMessage,
    Message, Response, Result, Sender, TokenUsage, WireMessage,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// UI Events — emitted to the presentation surface via broadcast
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Events emitted to the presentation surface.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Connection phase changed
    ConnectionChanged { phase: ConnectionPhase },
    /// A conversation's log or derived state changed
    ConversationChanged { conversation: ConversationId },
    /// A transfer record changed state or progress
    TransferChanged { transfer_id: String },
    /// Transient notification line
    Notification { level: NoticeLevel, text: String },
    /// A peer proposed a new session; the surface should prompt for a vote
    PromptNewSession {
        proposal_id: String,
        initiator_node_id: String,
        conversation_id: String,
    },
    /// A knowledge-commit proposal arrived; prompt for a vote
    PromptKnowledgeCommit {
        proposal_id: String,
        initiator_node_id: String,
        topic: String,
        summary: Option<String>,
    },
    /// A peer offered a file; prompt to accept or decline
    PromptFileOffer {
        transfer_id: String,
        filename: String,
        size_bytes: u64,
        sender_node_id: String,
    },
}

// ---------------------------------------------------------------------------
// Inputs — everything that can enter the client queue
// ---------------------------------------------------------------------------

/// An action taken on the presentation surface.
#[derive(Debug, Clone)]
pub enum UserAction {
    SendAiQuery {
        conversation: ConversationId,
        prompt: String,
    },
    SendPeerMessage {
        peer_node_id: String,
        text: String,
    },
    RequestHistory {
        conversation: ConversationId,
    },
    EndSession {
        conversation: ConversationId,
    },
    SendFile {
        peer_node_id: String,
        path: String,
        filename: String,
        size_bytes: u64,
    },
    AcceptFileOffer {
        transfer_id: String,
    },
    RejectFileOffer {
        transfer_id: String,
    },
    CancelTransfer {
        transfer_id: String,
    },
    ProposeNewSession {
        conversation: ConversationId,
        participants: Vec<String>,
    },
    VoteNewSession {
        proposal_id: String,
        approve: bool,
    },
    VoteKnowledgeCommit {
        proposal_id: String,
        choice: CommitVoteChoice,
        comment: Option<String>,
    },
    MarkRead {
        conversation: ConversationId,
    },
    AcknowledgeTransfer {
        transfer_id: String,
    },
}

/// Every input that can enter the client queue.
#[derive(Debug)]
pub enum ClientInput {
    /// Raw text frame from the socket pump
    Line(String),
    /// User action from the presentation surface
    Action(UserAction),
    /// Timer tick — drives proposal expiry
    Tick,
    /// Socket pump started dialing
    Connecting,
    /// Socket pump established a connection
    ConnectionUp,
    /// Socket pump lost the connection
    ConnectionDown(String),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Client Core — the single owned state container
// ---------------------------------------------------------------------------

/// Owns all client-side protocol state. Mutated only by the single consumer
/// loop; concurrency with the core service happens at the protocol level
/// (many commands outstanding at once), never at the state level.
pub struct ClientCore {
    self_node_id: String,
    connection: ConnectionManager,
    correlator: CommandCorrelator,
    store: ConversationStore,
    recent: RecentKeys,
    transfers: TransferEngine,
    sessions: NewSessionEngine,
    commits: KnowledgeCommitEngine,
    context: ContextTracker,
    /// Participants per outstanding propose command, keyed by command id.
    session_params: HashMap<String, Vec<String>>,
    /// Transfer record per outstanding send_file command, keyed by command id.
    transfer_params: HashMap<String, String>,
    /// Serialized frames destined for the socket pump.
    outbound: mpsc::UnboundedSender<String>,
    ui_tx: broadcast::Sender<UiEvent>,
}

impl ClientCore {
    /// Create the core. Returns `(core, outbound_rx)`; the socket pump
    /// drains `outbound_rx` and surfaces subscribe via
    /// [`ClientCore::subscribe`].
    pub fn new(self_node_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (ui_tx, _) = broadcast::channel(1024);
        let core = Self {
            self_node_id: self_node_id.into(),
            connection: ConnectionManager::new(),
            correlator: CommandCorrelator::new(),
            store: ConversationStore::new(),
            recent: RecentKeys::default(),
            transfers: TransferEngine::new(),
            sessions: NewSessionEngine::new(),
            commits: KnowledgeCommitEngine::new(),
            context: ContextTracker::new(),
            session_params: HashMap::new(),
            transfer_params: HashMap::new(),
            outbound,
            ui_tx,
        };
        (core, outbound_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn connection_phase(&self) -> &ConnectionPhase {
        self.connection.phase()
    }

    pub fn outstanding_commands(&self) -> usize {
        self.correlator.outstanding()
    }

    // -- outbound ----------------------------------------------------------

    /// Serialize and queue one command. The connection check runs before the
    /// id allocation, so a rejected send never consumes a correlation id and
    /// never touches the pending map.
    fn send_command(
        &mut self,
        name: CommandName,
        params: Value,
        conversation: Option<ConversationId>,
        message_id: Option<String>,
    ) -> Result<String> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = self.correlator.next_id();
        let frame = serde_json::to_string(&Command::new(id.clone(), name, params))?;
        self.outbound.send(frame).map_err(|_| Error::ChannelClosed)?;
        if name.is_query_class() {
            if let Some(conv) = conversation.as_ref() {
                self.store.set_busy(conv, true);
            }
        }
        debug!("sent {} as {}", name, id);
        self.correlator.track(PendingCommand {
            id: id.clone(),
            name,
            conversation,
            message_id,
        });
        Ok(id)
    }

    // -- user actions ------------------------------------------------------

    /// Route one user action; failures surface as error notifications.
    pub fn apply_action(&mut self, action: UserAction) {
        let result = match action {
            UserAction::SendAiQuery {
                conversation,
                prompt,
            } => self.send_ai_query(conversation, prompt),
            UserAction::SendPeerMessage { peer_node_id, text } => {
                self.send_peer_message(peer_node_id, text)
            }
            UserAction::RequestHistory { conversation } => {
                self.request_history(conversation).map(|_| ())
            }
            UserAction::EndSession { conversation } => self.end_session(conversation).map(|_| ()),
            UserAction::SendFile {
                peer_node_id,
                path,
                filename,
                size_bytes,
            } => self
                .confirm_send_file(peer_node_id, path, filename, size_bytes)
                .map(|_| ()),
            UserAction::AcceptFileOffer { transfer_id } => self.accept_file_offer(&transfer_id),
            UserAction::RejectFileOffer { transfer_id } => self.reject_file_offer(&transfer_id),
            UserAction::CancelTransfer { transfer_id } => self.cancel_transfer(&transfer_id),
            UserAction::ProposeNewSession {
                conversation,
                participants,
            } => self.propose_new_session(conversation, participants).map(|_| ()),
            UserAction::VoteNewSession {
                proposal_id,
                approve,
            } => self.vote_new_session(&proposal_id, approve),
            UserAction::VoteKnowledgeCommit {
                proposal_id,
                choice,
                comment,
            } => self.vote_knowledge_commit(&proposal_id, choice, comment),
            UserAction::MarkRead { conversation } => {
                self.store.mark_read(&conversation);
                self.conversation_changed(&conversation);
                Ok(())
            }
            UserAction::AcknowledgeTransfer { transfer_id } => {
                self.transfers.acknowledge(&transfer_id);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.notify(NoticeLevel::Error, e.to_string());
        }
    }

    /// Send a prompt to the assistant. Appends the user message and a
    /// pending placeholder that the eventual response will resolve; sends
    /// while the token window is full are gated.
    pub fn send_ai_query(
        &mut self,
        conversation: ConversationId,
        prompt: impl Into<String>,
    ) -> Result<()> {
        let prompt = prompt.into();
        if self.store.is_window_full(&conversation) {
            return Err(Error::TokenLimitReached(conversation.to_string()));
        }
        if !self.connection.is_connected() {
            self.store.append(&conversation, Message::user(&prompt));
            self.store.append(
                &conversation,
                Message::assistant("Error: not connected to core service"),
            );
            self.conversation_changed(&conversation);
            return Err(Error::NotConnected);
        }
        self.store.append(&conversation, Message::user(&prompt));
        let stale = self.context.stale_sources(&conversation);
        let refresh: Vec<String> = stale.iter().map(|s| s.to_string()).collect();
        let params = json!({
            "conversation_id": conversation.as_str(),
            "prompt": prompt,
            "refresh_context": refresh,
        });
        let placeholder_id = uuid::Uuid::new_v4().to_string();
        let command_id = self.send_command(
            CommandName::ExecuteAiQuery,
            params,
            Some(conversation.clone()),
            Some(placeholder_id.clone()),
        )?;
        self.store.append(
            &conversation,
            Message::assistant_pending("Thinking...", command_id).with_id(placeholder_id),
        );
        for source in &stale {
            self.context.mark_sent(&conversation, source);
        }
        self.conversation_changed(&conversation);
        Ok(())
    }

    /// Send a chat message to a peer. The message appears immediately with a
    /// pending marker; the response clears it or annotates the failure.
    pub fn send_peer_message(
        &mut self,
        peer_node_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<()> {
        let peer = peer_node_id.into();
        let text = text.into();
        let conversation = ConversationId::peer(&peer);
        if !self.connection.is_connected() {
            self.store.append(&conversation, Message::user(&text));
            self.conversation_changed(&conversation);
            return Err(Error::NotConnected);
        }
        let params = json!({
            "recipient_node_id": peer,
            "text": text,
        });
        let message_id = uuid::Uuid::new_v4().to_string();
        let command_id = self.send_command(
            CommandName::SendP2pMessage,
            params,
            Some(conversation.clone()),
            Some(message_id.clone()),
        )?;
        self.store.append(
            &conversation,
            Message {
                id: message_id,
                pending_command: Some(command_id),
                ..Message::user(text)
            },
        );
        self.conversation_changed(&conversation);
        Ok(())
    }

    /// Ask the core service for a conversation's persisted log.
    pub fn request_history(&mut self, conversation: ConversationId) -> Result<String> {
        let params = json!({ "conversation_id": conversation.as_str() });
        self.send_command(
            CommandName::GetConversationHistory,
            params,
            Some(conversation),
            None,
        )
    }

    /// End an AI session; local state is torn down only after the core
    /// service confirms.
    pub fn end_session(&mut self, conversation: ConversationId) -> Result<String> {
        let params = json!({ "conversation_id": conversation.as_str() });
        self.send_command(
            CommandName::EndConversationSession,
            params,
            Some(conversation),
            None,
        )
    }

    /// Confirm an outbound file send. Returns `Ok(None)` when an identical
    /// send is already confirming and the click was suppressed.
    pub fn confirm_send_file(
        &mut self,
        peer_node_id: impl Into<String>,
        path: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
    ) -> Result<Option<String>> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        let peer = peer_node_id.into();
        let filename = filename.into();
        let Some(transfer_id) = self.transfers.begin_send(&peer, &filename, size_bytes) else {
            debug!("duplicate send confirmation for {}, suppressed", filename);
            return Ok(None);
        };
        let params = json!({
            "recipient_node_id": peer,
            "path": path.into(),
            "filename": filename,
            "size_bytes": size_bytes,
            "transfer_id": transfer_id,
        });
        match self.send_command(CommandName::SendFile, params, None, None) {
            Ok(command_id) => {
                self.transfer_params.insert(command_id, transfer_id.clone());
                self.transfer_changed(&transfer_id);
                Ok(Some(transfer_id))
            }
            Err(e) => {
                self.transfers.cancel(&transfer_id, "send_error")?;
                self.transfer_changed(&transfer_id);
                Err(e)
            }
        }
    }

    /// Accept an inbound file offer.
    pub fn accept_file_offer(&mut self, transfer_id: &str) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transfers.accept(transfer_id)?;
        let params = json!({ "transfer_id": transfer_id });
        self.send_command(CommandName::AcceptFileOffer, params, None, None)?;
        self.transfer_changed(transfer_id);
        Ok(())
    }

    /// Decline an inbound file offer.
    pub fn reject_file_offer(&mut self, transfer_id: &str) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transfers.reject(transfer_id)?;
        let params = json!({ "transfer_id": transfer_id, "reason": "declined" });
        self.send_command(CommandName::CancelFileTransfer, params, None, None)?;
        self.transfer_changed(transfer_id);
        Ok(())
    }

    /// Cancel a live transfer, ours or inbound.
    pub fn cancel_transfer(&mut self, transfer_id: &str) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transfers.cancel(transfer_id, "user_cancelled")?;
        let params = json!({ "transfer_id": transfer_id, "reason": "user_cancelled" });
        self.send_command(CommandName::CancelFileTransfer, params, None, None)?;
        self.transfer_changed(transfer_id);
        Ok(())
    }

    /// Propose starting a fresh session for a shared conversation. At most
    /// one proposal may be pending per conversation.
    pub fn propose_new_session(
        &mut self,
        conversation: ConversationId,
        participants: Vec<String>,
    ) -> Result<String> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        self.sessions.check_can_propose(&conversation)?;
        let params = json!({
            "conversation_id": conversation.as_str(),
            "participants": participants,
        });
        let command_id = self.send_command(
            CommandName::ProposeNewSession,
            params,
            Some(conversation),
            None,
        )?;
        self.session_params.insert(command_id.clone(), participants);
        Ok(command_id)
    }

    /// Cast our one vote on a peer's new-session proposal.
    pub fn vote_new_session(&mut self, proposal_id: &str, approve: bool) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        self.sessions.record_local_vote(proposal_id)?;
        let params = json!({
            "proposal_id": proposal_id,
            "vote": if approve { "approve" } else { "reject" },
        });
        self.send_command(CommandName::VoteNewSession, params, None, None)?;
        Ok(())
    }

    /// Cast our one vote on a knowledge-commit proposal, with an optional
    /// comment for the initiator.
    pub fn vote_knowledge_commit(
        &mut self,
        proposal_id: &str,
        choice: CommitVoteChoice,
        comment: Option<String>,
    ) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        self.commits.record_local_vote(proposal_id)?;
        let vote = match choice {
            CommitVoteChoice::Approve => "approve",
            CommitVoteChoice::Reject => "reject",
            CommitVoteChoice::RequestChanges => "request_changes",
        };
        let mut params = json!({ "proposal_id": proposal_id, "vote": vote });
        if let Some(comment) = comment {
            params["comment"] = Value::String(comment);
        }
        self.send_command(CommandName::VoteKnowledgeCommit, params, None, None)?;
        Ok(())
    }

    // -- inbound -----------------------------------------------------------

    /// Apply one raw frame from the socket pump.
    pub fn apply_text(&mut self, raw: &str) {
        match serde_json::from_str::<InboundMessage>(raw) {
            Ok(InboundMessage::Response(response)) => self.apply_response(response),
            Ok(InboundMessage::Event(envelope)) => match CoreEvent::parse(envelope) {
                Ok(event) => self.apply_event(event),
                Err(e) => warn!("{}", e),
            },
            Err(e) => warn!("unparseable frame from core service: {}", e),
        }
    }

    /// Resolve one correlated response. Responses for untracked ids (late
    /// duplicates, cancelled commands) are dropped; resolution runs at most
    /// once per command because the correlator removes the entry.
    pub fn apply_response(&mut self, response: Response) {
        let Some(pending) = self.correlator.resolve(&response.id) else {
            debug!("response for untracked command {}, dropped", response.id);
            return;
        };
        match pending.name {
            CommandName::ExecuteAiQuery => self.finish_ai_query(&pending, &response),
            CommandName::SendP2pMessage => self.finish_peer_send(&pending, &response),
            CommandName::GetConversationHistory => self.finish_history(&pending, &response),
            CommandName::EndConversationSession => self.finish_end_session(&pending, &response),
            CommandName::SendFile => self.finish_send_file(&pending, &response),
            CommandName::ProposeNewSession => self.finish_propose(&pending, &response),
            CommandName::AcceptFileOffer
            | CommandName::CancelFileTransfer
            | CommandName::VoteNewSession
            | CommandName::VoteKnowledgeCommit => {
                if !response.status.is_success() {
                    let message = response.error_message().unwrap_or("command failed");
                    self.notify(
                        NoticeLevel::Error,
                        format!("{}: {}", pending.name, message),
                    );
                }
            }
        }
        // Busy flag teardown: the conversation stays busy while any other
        // query-class command is still outstanding for it.
        if pending.name.is_query_class() {
            if let Some(conv) = pending.conversation.as_ref() {
                if !self.correlator.has_query_for(conv) {
                    self.store.set_busy(conv, false);
                }
            }
        }
    }

    fn finish_ai_query(&mut self, pending: &PendingCommand, response: &Response) {
        let Some(conversation) = pending.conversation.as_ref() else {
            return;
        };
        let command_id = pending.id.as_str();
        if response.status.is_success() {
            let content = response
                .payload
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            self.store.update_message(
                conversation,
                |m| m.pending_command.as_deref() == Some(command_id),
                |m| m.resolve(content),
            );
            if let Some(usage) = parse_usage(&response.payload) {
                self.store.set_usage(conversation, usage);
            }
        } else {
            let text = format!(
                "Error: {}",
                response.error_message().unwrap_or("query failed")
            );
            self.store.update_message(
                conversation,
                |m| m.pending_command.as_deref() == Some(command_id),
                |m| m.resolve(text),
            );
        }
        let conversation = conversation.clone();
        self.conversation_changed(&conversation);
    }

    fn finish_peer_send(&mut self, pending: &PendingCommand, response: &Response) {
        let Some(conversation) = pending.conversation.as_ref() else {
            return;
        };
        let command_id = pending.id.as_str();
        if response.status.is_success() {
            self.store.update_message(
                conversation,
                |m| m.pending_command.as_deref() == Some(command_id),
                |m| m.pending_command = None,
            );
        } else {
            let error = response
                .error_message()
                .unwrap_or("delivery failed")
                .to_string();
            self.store.update_message(
                conversation,
                |m| m.pending_command.as_deref() == Some(command_id),
                |m| {
                    let annotated = format!("{} (failed: {})", m.text, error);
                    m.resolve(annotated);
                },
            );
        }
        let conversation = conversation.clone();
        self.conversation_changed(&conversation);
    }

    fn finish_history(&mut self, pending: &PendingCommand, response: &Response) {
        let Some(conversation) = pending.conversation.as_ref() else {
            return;
        };
        if !response.status.is_success() {
            let message = response.error_message().unwrap_or("history unavailable");
            self.notify(NoticeLevel::Warning, format!("History: {}", message));
            return;
        }
        let wires: Vec<WireMessage> = response
            .payload
            .get("messages")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let messages = wires.into_iter().map(message_from_wire).collect();
        self.store.replace_log(conversation, messages);
        let conversation = conversation.clone();
        self.conversation_changed(&conversation);
    }

    fn finish_end_session(&mut self, pending: &PendingCommand, response: &Response) {
        let Some(conversation) = pending.conversation.as_ref() else {
            return;
        };
        if response.status.is_success() {
            let conversation = conversation.clone();
            self.store.remove(&conversation);
            self.context.clear_conversation(&conversation);
            info!("session ended: {}", conversation);
            self.conversation_changed(&conversation);
        } else {
            let message = response.error_message().unwrap_or("end session failed");
            self.notify(NoticeLevel::Error, format!("End session: {}", message));
        }
    }

    fn finish_send_file(&mut self, pending: &PendingCommand, response: &Response) {
        let Some(transfer_id) = self.transfer_params.remove(&pending.id) else {
            return;
        };
        if response.status.is_success() {
            if let Err(e) = self.transfers.offer_sent(&transfer_id) {
                debug!("offer_sent for {}: {}", transfer_id, e);
            }
        } else {
            let message = response.error_message().unwrap_or("send failed").to_string();
            if let Err(e) = self.transfers.cancel(&transfer_id, "send_error") {
                debug!("cancel for {}: {}", transfer_id, e);
            }
            self.notify(NoticeLevel::Error, format!("File send failed: {}", message));
        }
        self.transfer_changed(&transfer_id);
    }

    fn finish_propose(&mut self, pending: &PendingCommand, response: &Response) {
        let participants = self.session_params.remove(&pending.id).unwrap_or_default();
        if !response.status.is_success() {
            let message = response.error_message().unwrap_or("proposal failed");
            self.notify(NoticeLevel::Error, format!("New session: {}", message));
            return;
        }
        let proposal_id = response.payload.get("proposal_id").and_then(Value::as_str);
        match (proposal_id, pending.conversation.clone()) {
            (Some(proposal_id), Some(conversation)) => {
                self.sessions.register_initiated(
                    proposal_id,
                    conversation,
                    participants,
                    self.self_node_id.clone(),
                );
                self.notify(
                    NoticeLevel::Info,
                    "New session proposed; waiting for votes".to_string(),
                );
            }
            _ => warn!(
                "propose response {} carries no proposal id, cannot track",
                pending.id
            ),
        }
    }

    /// Apply one typed event push.
    pub fn apply_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::NewP2pMessage {
                sender_node_id,
                sender_name,
                text,
                message_id,
                attachments,
            } => {
                let key = delivery_key(message_id.as_deref(), &sender_node_id, &text);
                if !self.recent.insert(key) {
                    debug!("duplicate delivery from {}, dropped", sender_node_id);
                    return;
                }
                let conversation = ConversationId::peer(&sender_node_id);
                let mut message = Message::peer(sender_node_id, text);
                if let Some(id) = message_id {
                    message = message.with_id(id);
                }
                if !attachments.is_empty() {
                    message = message.with_attachments(attachments);
                }
                debug!(
                    "p2p message from {}",
                    sender_name.as_deref().unwrap_or(conversation.as_str())
                );
                self.store.append(&conversation, message);
                self.store.increment_unread(&conversation);
                self.conversation_changed(&conversation);
            }

            CoreEvent::KnowledgeCommitProposal {
                proposal_id,
                initiator_node_id,
                topic,
                summary,
                ..
            } => {
                if self.commits.on_proposal(
                    &proposal_id,
                    &initiator_node_id,
                    &topic,
                    summary.clone(),
                ) {
                    self.emit(UiEvent::PromptKnowledgeCommit {
                        proposal_id,
                        initiator_node_id,
                        topic,
                        summary,
                    });
                }
            }

            CoreEvent::KnowledgeCommitResult {
                proposal_id,
                status,
                topic,
                vote_tally,
            } => {
                let result =
                    self.commits
                        .on_result(proposal_id.as_deref(), status, topic, vote_tally);
                let level = match result.status {
                    mindlink_core::CommitOutcome::Approved => NoticeLevel::Info,
                    _ => NoticeLevel::Warning,
                };
                self.notify(level, result.notification());
            }

            CoreEvent::NewSessionProposal {
                proposal_id,
                initiator_node_id,
                conversation_id,
                participants,
                ..
            } => {
                if self.sessions.on_proposal(
                    &proposal_id,
                    &initiator_node_id,
                    &conversation_id,
                    participants,
                ) {
                    self.emit(UiEvent::PromptNewSession {
                        proposal_id,
                        initiator_node_id,
                        conversation_id,
                    });
                }
            }

            CoreEvent::NewSessionResult {
                proposal_id,
                result,
                conversation_id,
                sender_node_id,
                vote_tally,
            } => {
                let applied = self.sessions.on_result(
                    &proposal_id,
                    result,
                    conversation_id.as_deref(),
                    sender_node_id.as_deref(),
                    vote_tally,
                );
                if let Some(target) = applied.clear_target {
                    // Clear the log, usage, and staleness in the same turn so
                    // no input can observe a half-reset conversation.
                    self.store.clear(&target);
                    self.context.clear_conversation(&target);
                    self.conversation_changed(&target);
                }
                match applied.outcome {
                    mindlink_core::SessionOutcome::Approved => {
                        self.notify(NoticeLevel::Info, "New session started".to_string())
                    }
                    mindlink_core::SessionOutcome::Rejected => self.notify(
                        NoticeLevel::Warning,
                        "New session proposal rejected".to_string(),
                    ),
                    mindlink_core::SessionOutcome::Timeout => self.notify(
                        NoticeLevel::Warning,
                        "New session proposal timed out".to_string(),
                    ),
                }
            }

            CoreEvent::FileTransferOffer {
                transfer_id,
                filename,
                size_bytes,
                sender_node_id,
                ..
            } => {
                if self.transfers.inbound_offer(
                    &transfer_id,
                    &filename,
                    size_bytes,
                    &sender_node_id,
                ) {
                    self.transfer_changed(&transfer_id);
                    self.emit(UiEvent::PromptFileOffer {
                        transfer_id,
                        filename,
                        size_bytes,
                        sender_node_id,
                    });
                }
            }

            CoreEvent::FileTransferProgress {
                transfer_id,
                percent,
                phase,
            } => match self.transfers.progress(&transfer_id, percent, phase) {
                Ok(()) => self.transfer_changed(&transfer_id),
                Err(e) => debug!("progress event: {}", e),
            },

            CoreEvent::FileTransferComplete {
                transfer_id,
                filename,
                direction,
            } => {
                if let Some(id) =
                    self.transfers
                        .complete(transfer_id.as_deref(), &filename, direction)
                {
                    self.transfer_changed(&id);
                    self.notify(
                        NoticeLevel::Info,
                        format!("File transfer complete: {}", filename),
                    );
                } else {
                    debug!("completion for unknown transfer ({}), dropped", filename);
                }
            }

            CoreEvent::FileTransferCancelled {
                transfer_id,
                filename,
                reason,
            } => {
                if let Some(id) = self.transfers.cancel_by_event(
                    transfer_id.as_deref(),
                    filename.as_deref(),
                    &reason,
                ) {
                    self.transfer_changed(&id);
                    self.notify(
                        NoticeLevel::Warning,
                        format!("File transfer cancelled: {}", reason),
                    );
                } else {
                    debug!("cancellation for unknown transfer, dropped");
                }
            }

            CoreEvent::TokenWarning {
                conversation_id,
                tokens_used,
                token_limit,
                usage_percent,
            } => {
                let conversation = ConversationId::new(conversation_id);
                self.store
                    .set_usage(&conversation, TokenUsage::new(tokens_used, token_limit));
                self.notify(
                    NoticeLevel::Warning,
                    format!(
                        "Context window at {:.0}% for {}",
                        usage_percent, conversation
                    ),
                );
                self.conversation_changed(&conversation);
            }

            CoreEvent::ExtractionFailure {
                conversation_id,
                reason,
            } => {
                self.notify(
                    NoticeLevel::Warning,
                    format!(
                        "Knowledge extraction failed for {}: {}",
                        conversation_id, reason
                    ),
                );
            }

            CoreEvent::ContextUpdated { context_hash } => {
                self.context.mark_current(ContextSource::Local, context_hash);
            }

            CoreEvent::PeerContextUpdated {
                node_id,
                context_hash,
            } => {
                self.context
                    .mark_current(ContextSource::Peer(node_id), context_hash);
            }

            CoreEvent::HistoryRestored {
                conversation_id,
                messages,
                message_count,
            } => {
                if message_count != messages.len() {
                    warn!(
                        "history for {} declares {} messages, carries {}",
                        conversation_id,
                        message_count,
                        messages.len()
                    );
                }
                let conversation = ConversationId::new(conversation_id);
                let log = messages.into_iter().map(message_from_wire).collect();
                // Wholesale replacement, never a merge.
                self.store.replace_log(&conversation, log);
                self.conversation_changed(&conversation);
            }

            CoreEvent::Unknown { kind } => {
                warn!("unknown event kind {}, dropped", kind);
            }
        }
    }

    // -- timers and connection ---------------------------------------------

    /// Expire overdue new-session proposals. A timed-out proposal changes no
    /// conversation state.
    pub fn expire_timers(&mut self, now: Instant) {
        for proposal in self.sessions.expire(now) {
            self.notify(
                NoticeLevel::Warning,
                format!(
                    "New session proposal timed out for {}",
                    proposal.conversation_id
                ),
            );
        }
    }

    pub fn connection_connecting(&mut self) {
        self.set_connection(ConnectionPhase::Connecting);
    }

    pub fn connection_up(&mut self) {
        self.set_connection(ConnectionPhase::Connected);
    }

    pub fn connection_down(&mut self, reason: String) {
        self.set_connection(ConnectionPhase::Error(reason));
    }

    fn set_connection(&mut self, phase: ConnectionPhase) {
        self.connection.set_phase(phase.clone());
        self.emit(UiEvent::ConnectionChanged { phase });
    }

    // -- UI surface --------------------------------------------------------

    fn emit(&self, event: UiEvent) {
        // No subscribers is fine; surfaces attach and detach freely.
        let _ = self.ui_tx.send(event);
    }

    fn notify(&self, level: NoticeLevel, text: String) {
        self.emit(UiEvent::Notification { level, text });
    }

    fn conversation_changed(&self, conversation: &ConversationId) {
        self.emit(UiEvent::ConversationChanged {
            conversation: conversation.clone(),
        });
    }

    fn transfer_changed(&self, transfer_id: &str) {
        self.emit(UiEvent::TransferChanged {
            transfer_id: transfer_id.to_string(),
        });
    }
}

fn parse_usage(payload: &Value) -> Option<TokenUsage> {
    payload
        .get("token_usage")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn message_from_wire(wire: WireMessage) -> Message {
    let sender = match wire.sender.as_str() {
        "user" => Sender::User,
        "assistant" | "ai" => Sender::Assistant,
        other => Sender::Peer(other.to_string()),
    };
    let timestamp = wire
        .timestamp
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Message {
        id: wire
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        sender,
        text: wire.text,
        timestamp,
        pending_command: None,
        attachments: wire.attachments,
    }
}

// ---------------------------------------------------------------------------
// Client Loop — the single consumer of the input queue
// ---------------------------------------------------------------------------

/// The client loop: single consumer of the input queue.
///
/// All inputs enter through the returned sender. The loop applies them in
/// arrival order and drives proposal expiry off an internal one-second tick.
pub struct ClientLoop {
    core: ClientCore,
    input_rx: mpsc::UnboundedReceiver<ClientInput>,
}

impl ClientLoop {
    pub fn new(core: ClientCore) -> (Self, mpsc::UnboundedSender<ClientInput>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        (Self { core, input_rx }, input_tx)
    }

    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    /// Run until Shutdown or until every input sender is dropped.
    pub async fn run(mut self) {
        info!("client loop started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                input = self.input_rx.recv() => {
                    match input {
                        None => {
                            info!("input queue closed, shutting down");
                            break;
                        }
                        Some(ClientInput::Line(raw)) => self.core.apply_text(&raw),
                        Some(ClientInput::Action(action)) => self.core.apply_action(action),
                        Some(ClientInput::Tick) => self.core.expire_timers(Instant::now()),
                        Some(ClientInput::Connecting) => self.core.connection_connecting(),
                        Some(ClientInput::ConnectionUp) => self.core.connection_up(),
                        Some(ClientInput::ConnectionDown(reason)) => {
                            self.core.connection_down(reason)
                        }
                        Some(ClientInput::Shutdown) => {
                            info!("client loop: received Shutdown");
                            break;
                        }
                    }
                }
                _ = tick.tick() => self.core.expire_timers(Instant::now()),
            }
        }
        info!("client loop stopped");
    }
}
