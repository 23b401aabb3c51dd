//! File-transfer engine — per-transfer state machine
//!
//! Outbound: `Preparing` (local hashing/chunking on the core side) →
//! `Offered` → `InProgress` → `Completed`. Inbound: an offer event creates
//! the record at `Offered`; user action moves it to `Accepted` →
//! `InProgress` → `Completed`, or `Rejected`. Cancellation is allowed from
//! any non-terminal state and always carries a reason. Terminal records are
//! retained until the UI acknowledges them.

use mindlink_core::{Error, Result, TransferDirection, TransferPhase};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// State of one transfer. See the module docs for the legal graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Preparing,
    Offered,
    Accepted,
    InProgress,
    Completed,
    Rejected,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Rejected | TransferState::Cancelled
        )
    }
}

/// One live transfer record; exactly one per transfer id.
#[derive(Clone, Debug)]
pub struct FileTransfer {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub peer_node_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub state: TransferState,
    pub progress_percent: f32,
    pub phase: Option<TransferPhase>,
    pub cancel_reason: Option<String>,
}

fn transition_allowed(transfer: &FileTransfer, to: TransferState) -> bool {
    use TransferState::*;
    match (transfer.state, to) {
        (Preparing, Offered) | (Preparing, Cancelled) => true,
        (Offered, Accepted) | (Offered, Rejected) => {
            transfer.direction == TransferDirection::Download
        }
        (Offered, InProgress) | (Offered, Completed) => {
            transfer.direction == TransferDirection::Upload
        }
        (Offered, Cancelled) => true,
        (Accepted, InProgress) | (Accepted, Cancelled) => true,
        (InProgress, Completed) | (InProgress, Cancelled) => true,
        _ => false,
    }
}

/// Owns all live transfer records and the idempotent-submit guard for
/// outbound sends.
#[derive(Debug, Default)]
pub struct TransferEngine {
    transfers: HashMap<String, FileTransfer>,
    /// (recipient, filename) pairs with a send currently in the confirming/
    /// preparing phase; repeated confirmation clicks are suppressed.
    confirming: HashSet<(String, String)>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an outbound send. Returns `None` (no duplicate record) while a
    /// send for the same (recipient, file) pair is already confirming.
    pub fn begin_send(
        &mut self,
        peer_node_id: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
    ) -> Option<String> {
        let peer = peer_node_id.into();
        let filename = filename.into();
        let pair = (peer.clone(), filename.clone());
        if self.confirming.contains(&pair) {
            debug!("send already confirming for {}:{}, suppressed", pair.0, pair.1);
            return None;
        }
        let transfer_id = uuid::Uuid::new_v4().to_string();
        self.confirming.insert(pair);
        self.transfers.insert(
            transfer_id.clone(),
            FileTransfer {
                transfer_id: transfer_id.clone(),
                direction: TransferDirection::Upload,
                peer_node_id: peer,
                filename,
                size_bytes,
                state: TransferState::Preparing,
                progress_percent: 0.0,
                phase: None,
                cancel_reason: None,
            },
        );
        Some(transfer_id)
    }

    pub fn is_confirming(&self, peer_node_id: &str, filename: &str) -> bool {
        self.confirming
            .contains(&(peer_node_id.to_string(), filename.to_string()))
    }

    /// The offer went out to the peer; local preparation is done.
    pub fn offer_sent(&mut self, transfer_id: &str) -> Result<()> {
        let transfer = self.get_mut(transfer_id)?;
        if !transition_allowed(transfer, TransferState::Offered) {
            warn!(
                "illegal transition {:?} -> Offered for {}, ignored",
                transfer.state, transfer_id
            );
            return Ok(());
        }
        transfer.state = TransferState::Offered;
        transfer.progress_percent = 100.0;
        let pair = (transfer.peer_node_id.clone(), transfer.filename.clone());
        self.confirming.remove(&pair);
        Ok(())
    }

    /// A peer offered us a file. Creates the record directly at `Offered`;
    /// a repeated offer for a known transfer id is ignored.
    pub fn inbound_offer(
        &mut self,
        transfer_id: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
        sender_node_id: impl Into<String>,
    ) -> bool {
        let transfer_id = transfer_id.into();
        if self.transfers.contains_key(&transfer_id) {
            debug!("duplicate offer for transfer {}, ignored", transfer_id);
            return false;
        }
        self.transfers.insert(
            transfer_id.clone(),
            FileTransfer {
                transfer_id,
                direction: TransferDirection::Download,
                peer_node_id: sender_node_id.into(),
                filename: filename.into(),
                size_bytes,
                state: TransferState::Offered,
                progress_percent: 0.0,
                phase: None,
                cancel_reason: None,
            },
        );
        true
    }

    pub fn accept(&mut self, transfer_id: &str) -> Result<()> {
        self.apply(transfer_id, TransferState::Accepted)
    }

    pub fn reject(&mut self, transfer_id: &str) -> Result<()> {
        self.apply(transfer_id, TransferState::Rejected)
    }

    /// Apply a progress event. Preparation phases only update the percent;
    /// the first `transferring` report moves the record into `InProgress`.
    pub fn progress(
        &mut self,
        transfer_id: &str,
        percent: f32,
        phase: TransferPhase,
    ) -> Result<()> {
        let transfer = self.get_mut(transfer_id)?;
        match phase {
            TransferPhase::HashingFile | TransferPhase::ComputingChunks => {
                if transfer.state != TransferState::Preparing {
                    warn!(
                        "preparation progress for {} in state {:?}, ignored",
                        transfer_id, transfer.state
                    );
                    return Ok(());
                }
            }
            TransferPhase::Transferring => {
                if transfer.state != TransferState::InProgress {
                    if !transition_allowed(transfer, TransferState::InProgress) {
                        warn!(
                            "illegal transition {:?} -> InProgress for {}, ignored",
                            transfer.state, transfer_id
                        );
                        return Ok(());
                    }
                    transfer.state = TransferState::InProgress;
                }
            }
        }
        transfer.phase = Some(phase);
        transfer.progress_percent = percent.clamp(0.0, 100.0);
        Ok(())
    }

    /// Resolve a completion event. The wire payload carries no transfer id,
    /// so the live record is matched by filename and direction, with an
    /// optional explicit id taking precedence.
    pub fn complete(
        &mut self,
        transfer_id: Option<&str>,
        filename: &str,
        direction: TransferDirection,
    ) -> Option<String> {
        let id = match transfer_id {
            Some(id) => id.to_string(),
            None => self.find_live(filename, Some(direction))?,
        };
        let transfer = self.transfers.get_mut(&id)?;
        if !transition_allowed(transfer, TransferState::Completed) {
            warn!(
                "illegal transition {:?} -> Completed for {}, ignored",
                transfer.state, id
            );
            return None;
        }
        transfer.state = TransferState::Completed;
        transfer.progress_percent = 100.0;
        info!("transfer completed: {} ({})", transfer.filename, id);
        Some(id)
    }

    /// Cancel from any non-terminal state; the reason is retained for the
    /// UI notification.
    pub fn cancel(&mut self, transfer_id: &str, reason: impl Into<String>) -> Result<()> {
        let transfer = self.get_mut(transfer_id)?;
        if transfer.state.is_terminal() {
            debug!("cancel for already-terminal transfer {}, ignored", transfer_id);
            return Ok(());
        }
        transfer.state = TransferState::Cancelled;
        let reason = reason.into();
        info!("transfer cancelled: {} (reason: {})", transfer_id, reason);
        transfer.cancel_reason = Some(reason);
        let pair = (transfer.peer_node_id.clone(), transfer.filename.clone());
        self.confirming.remove(&pair);
        Ok(())
    }

    /// Resolve a peer-side cancellation event by id or filename.
    pub fn cancel_by_event(
        &mut self,
        transfer_id: Option<&str>,
        filename: Option<&str>,
        reason: &str,
    ) -> Option<String> {
        let id = match transfer_id {
            Some(id) => id.to_string(),
            None => self.find_live(filename?, None)?,
        };
        self.cancel(&id, reason).ok()?;
        Some(id)
    }

    /// The UI has shown the terminal state; drop the record.
    pub fn acknowledge(&mut self, transfer_id: &str) {
        if let Some(t) = self.transfers.get(transfer_id) {
            if t.state.is_terminal() {
                self.transfers.remove(transfer_id);
            }
        }
    }

    pub fn get(&self, transfer_id: &str) -> Option<&FileTransfer> {
        self.transfers.get(transfer_id)
    }

    pub fn live_count(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    fn find_live(&self, filename: &str, direction: Option<TransferDirection>) -> Option<String> {
        self.transfers
            .values()
            .find(|t| {
                !t.state.is_terminal()
                    && t.filename == filename
                    && direction.map(|d| t.direction == d).unwrap_or(true)
            })
            .map(|t| t.transfer_id.clone())
    }

    fn apply(&mut self, transfer_id: &str, to: TransferState) -> Result<()> {
        let transfer = self.get_mut(transfer_id)?;
        if !transition_allowed(transfer, to) {
            warn!(
                "illegal transition {:?} -> {:?} for {}, ignored",
                transfer.state, to, transfer_id
            );
            return Ok(());
        }
        transfer.state = to;
        Ok(())
    }

    fn get_mut(&mut self, transfer_id: &str) -> Result<&mut FileTransfer> {
        self.transfers
            .get_mut(transfer_id)
            .ok_or_else(|| Error::TransferNotFound(transfer_id.to_string()))
    }
}
