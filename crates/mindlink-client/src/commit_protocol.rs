//! Knowledge-commit protocol — multi-party approval of a knowledge artifact
//!
//! The vote tally lives in the core service; locally this engine surfaces
//! each proposal exactly once, accepts one local vote, and renders the
//! terminal status with the numeric tally supplied by the final event.
//! Nothing is retained after a result is rendered, so a later
//! identical-shaped event reads as a fresh notification.

use mindlink_core::{CommitOutcome, Error, Result, VoteTally};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// One open commit proposal awaiting our vote or the tally.
#[derive(Clone, Debug)]
pub struct CommitProposal {
    pub proposal_id: String,
    pub initiator_node_id: String,
    pub topic: String,
    pub summary: Option<String>,
    pub voted: bool,
}

/// Rendered terminal state of a proposal.
#[derive(Clone, Debug)]
pub struct CommitResult {
    pub status: CommitOutcome,
    pub topic: String,
    pub tally: VoteTally,
}

impl CommitResult {
    /// Notification line, e.g. `approved: game_design (3/4)`.
    pub fn notification(&self) -> String {
        format!(
            "{}: {} ({}/{})",
            self.status.label(),
            self.topic,
            self.tally.approve,
            self.tally.total
        )
    }
}

/// Tracks open knowledge-commit proposals.
#[derive(Debug, Default)]
pub struct KnowledgeCommitEngine {
    open: HashMap<String, CommitProposal>,
}

impl KnowledgeCommitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A proposal arrived. Returns `true` when a prompt should open; an
    /// identical re-delivery before resolution must not re-open one.
    pub fn on_proposal(
        &mut self,
        proposal_id: impl Into<String>,
        initiator_node_id: impl Into<String>,
        topic: impl Into<String>,
        summary: Option<String>,
    ) -> bool {
        let proposal_id = proposal_id.into();
        if self.open.contains_key(&proposal_id) {
            debug!("duplicate commit proposal {}, ignored", proposal_id);
            return false;
        }
        let topic = topic.into();
        info!("commit proposal {} on topic {}", proposal_id, topic);
        self.open.insert(
            proposal_id.clone(),
            CommitProposal {
                proposal_id,
                initiator_node_id: initiator_node_id.into(),
                topic,
                summary,
                voted: false,
            },
        );
        true
    }

    /// Record that our single vote is going out.
    pub fn record_local_vote(&mut self, proposal_id: &str) -> Result<()> {
        let proposal = self
            .open
            .get_mut(proposal_id)
            .ok_or_else(|| Error::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.voted {
            return Err(Error::AlreadyVoted(proposal_id.to_string()));
        }
        proposal.voted = true;
        Ok(())
    }

    /// Apply the externally computed tally. Closes the matching open
    /// proposal (by id when present, else by topic) and returns the result
    /// to render; the engine keeps no record of it afterwards.
    ///
    /// The outcome is re-derived from the tally as a consistency check; the
    /// core service's status wins when they disagree.
    pub fn on_result(
        &mut self,
        proposal_id: Option<&str>,
        status: CommitOutcome,
        topic: impl Into<String>,
        tally: VoteTally,
    ) -> CommitResult {
        let topic = topic.into();
        match proposal_id {
            Some(id) => {
                self.open.remove(id);
            }
            None => {
                let by_topic: Option<String> = self
                    .open
                    .values()
                    .find(|p| p.topic == topic)
                    .map(|p| p.proposal_id.clone());
                if let Some(id) = by_topic {
                    self.open.remove(&id);
                }
            }
        }
        if !tally.is_consistent() {
            warn!("inconsistent vote tally for topic {}: {:?}", topic, tally);
        }
        let derived = CommitOutcome::from_tally(&tally);
        if status != CommitOutcome::Timeout && derived != status {
            warn!(
                "commit result status {:?} disagrees with tally-derived {:?} for {}",
                status, derived, topic
            );
        }
        info!("commit result for {}: {:?}", topic, status);
        CommitResult {
            status,
            topic,
            tally,
        }
    }

    pub fn get(&self, proposal_id: &str) -> Option<&CommitProposal> {
        self.open.get(proposal_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
