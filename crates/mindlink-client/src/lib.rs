//! Mindlink Client - Protocol orchestration between the core service channel
//! and a presentation surface
//!
//! The core service (networking, inference, storage) lives in another
//! process; this crate owns the client half of its single logical channel:
//! correlating fire-and-forget commands with eventual responses, multiplexing
//! unsolicited events into per-conversation state, and running the
//! file-transfer and approval protocols concurrently.

pub mod client;
pub mod commit_protocol;
pub mod connection;
pub mod context;
pub mod correlator;
pub mod dispatch;
pub mod session_protocol;
pub mod store;
pub mod transfer;
pub mod ws;

pub use client::{ClientCore, ClientInput, ClientLoop, NoticeLevel, UiEvent, UserAction};
pub use commit_protocol::{CommitResult, KnowledgeCommitEngine};
pub use connection::{Backoff, ConnectionManager, ConnectionPhase};
pub use context::{ContextSource, ContextTracker};
pub use correlator::{CommandCorrelator, PendingCommand};
pub use dispatch::{delivery_key, RecentKeys, DEDUP_CAPACITY};
pub use session_protocol::{NewSessionEngine, SessionProposal, PROPOSAL_TIMEOUT};
pub use store::{ConversationStore, ConversationView};
pub use transfer::{FileTransfer, TransferEngine, TransferState};
pub use ws::SocketPump;
