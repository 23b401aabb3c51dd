//! New-session protocol — mutual approval before clearing shared history
//!
//! A conversation spanning two parties is never reset unilaterally: one side
//! proposes, everyone votes, and only an approved outcome clears state. The
//! voting itself happens in the core service; this engine tracks which
//! proposals are open locally, enforces one pending proposal per
//! conversation, and resolves which conversation to clear when the result
//! arrives.

use mindlink_core::{ConversationId, Error, Result, SessionOutcome, VoteTally};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Deadline for a proposal to collect votes before it times out locally.
pub const PROPOSAL_TIMEOUT: Duration = Duration::from_secs(60);

/// One open proposal, ours or a peer's.
#[derive(Clone, Debug)]
pub struct SessionProposal {
    pub proposal_id: String,
    pub initiator_node_id: String,
    pub conversation_id: ConversationId,
    pub participants: Vec<String>,
    /// We started this proposal (the initiator auto-votes approve).
    pub is_initiator: bool,
    /// Our vote went out; a second vote is rejected.
    pub voted: bool,
    pub deadline: Instant,
}

/// Outcome of a finished proposal as applied locally.
#[derive(Clone, Debug)]
pub struct SessionResult {
    pub proposal_id: String,
    pub outcome: SessionOutcome,
    /// Conversation whose state must be cleared; only set on approval.
    pub clear_target: Option<ConversationId>,
    pub tally: Option<VoteTally>,
}

/// Tracks open new-session proposals.
#[derive(Debug, Default)]
pub struct NewSessionEngine {
    active: HashMap<String, SessionProposal>,
}

impl NewSessionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard an outbound propose: at most one pending proposal per
    /// conversation.
    pub fn check_can_propose(&self, conversation: &ConversationId) -> Result<()> {
        if self
            .active
            .values()
            .any(|p| &p.conversation_id == conversation)
        {
            return Err(Error::ProposalPending(conversation.to_string()));
        }
        Ok(())
    }

    /// Register our own proposal once the core service has assigned its id
    /// (carried in the propose response).
    pub fn register_initiated(
        &mut self,
        proposal_id: impl Into<String>,
        conversation: ConversationId,
        participants: Vec<String>,
        self_node_id: impl Into<String>,
    ) {
        let proposal_id = proposal_id.into();
        info!(
            "new session proposed for {} ({})",
            conversation, proposal_id
        );
        self.active.insert(
            proposal_id.clone(),
            SessionProposal {
                proposal_id,
                initiator_node_id: self_node_id.into(),
                conversation_id: conversation,
                participants,
                is_initiator: true,
                // Initiator auto-votes approve.
                voted: true,
                deadline: Instant::now() + PROPOSAL_TIMEOUT,
            },
        );
    }

    /// A peer proposed a new session. Returns `true` when the proposal is
    /// new and a prompt should open; a re-delivered proposal is ignored.
    pub fn on_proposal(
        &mut self,
        proposal_id: impl Into<String>,
        initiator_node_id: impl Into<String>,
        conversation_id: impl Into<String>,
        participants: Vec<String>,
    ) -> bool {
        let proposal_id = proposal_id.into();
        if self.active.contains_key(&proposal_id) {
            debug!("duplicate session proposal {}, ignored", proposal_id);
            return false;
        }
        let initiator = initiator_node_id.into();
        info!("session proposal {} from {}", proposal_id, initiator);
        self.active.insert(
            proposal_id.clone(),
            SessionProposal {
                proposal_id,
                initiator_node_id: initiator,
                conversation_id: ConversationId::new(conversation_id.into()),
                participants,
                is_initiator: false,
                voted: false,
                deadline: Instant::now() + PROPOSAL_TIMEOUT,
            },
        );
        true
    }

    /// Record that our vote for `proposal_id` is going out. One vote only.
    pub fn record_local_vote(&mut self, proposal_id: &str) -> Result<()> {
        let proposal = self
            .active
            .get_mut(proposal_id)
            .ok_or_else(|| Error::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.voted {
            return Err(Error::AlreadyVoted(proposal_id.to_string()));
        }
        proposal.voted = true;
        Ok(())
    }

    /// Apply a result event. Conversation identity on clear: the sender's
    /// node id if we received the proposal, else the conversation the
    /// initiator started from. The core service populates exactly one of
    /// the two for each party.
    pub fn on_result(
        &mut self,
        proposal_id: &str,
        outcome: SessionOutcome,
        conversation_id: Option<&str>,
        sender_node_id: Option<&str>,
        tally: Option<VoteTally>,
    ) -> SessionResult {
        if self.active.remove(proposal_id).is_none() {
            // Result for a proposal we never tracked (or already expired);
            // still render it, the clear target comes from the event itself.
            debug!("result for untracked session proposal {}", proposal_id);
        }
        let clear_target = if outcome == SessionOutcome::Approved {
            sender_node_id
                .map(ConversationId::peer)
                .or_else(|| conversation_id.map(ConversationId::new))
        } else {
            None
        };
        if clear_target.is_none() && outcome == SessionOutcome::Approved {
            warn!(
                "approved session result {} carries no conversation identity",
                proposal_id
            );
        }
        info!("session proposal {} finished: {:?}", proposal_id, outcome);
        SessionResult {
            proposal_id: proposal_id.to_string(),
            outcome,
            clear_target,
            tally,
        }
    }

    /// Drop proposals whose deadline has passed. Timed-out proposals leave
    /// all conversation state untouched.
    pub fn expire(&mut self, now: Instant) -> Vec<SessionProposal> {
        let expired_ids: Vec<String> = self
            .active
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.proposal_id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| {
                info!("session proposal {} timed out", id);
                self.active.remove(&id)
            })
            .collect()
    }

    pub fn get(&self, proposal_id: &str) -> Option<&SessionProposal> {
        self.active.get(proposal_id)
    }

    pub fn pending_for(&self, conversation: &ConversationId) -> Option<&SessionProposal> {
        self.active
            .values()
            .find(|p| &p.conversation_id == conversation)
    }

    pub fn open_count(&self) -> usize {
        self.active.len()
    }
}
