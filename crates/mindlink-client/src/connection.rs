//! Connection phase tracking and reconnect backoff
//!
//! The layer owns exactly one logical channel to the core service. This
//! module tracks its phase; the actual socket pump lives in [`crate::ws`].

use std::time::Duration;
use tracing::info;

/// Phase of the single channel to the core service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionPhase {
    pub fn label(&self) -> &str {
        match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Error(_) => "error",
        }
    }
}

/// Tracks the channel phase. Connection loss is the only failure escalated
/// globally; everything else stays local to the operation that hit it.
#[derive(Debug)]
pub struct ConnectionManager {
    phase: ConnectionPhase,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
        }
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn set_phase(&mut self, phase: ConnectionPhase) {
        if phase != self.phase {
            info!("connection: {} -> {}", self.phase.label(), phase.label());
            self.phase = phase;
        }
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Doubling reconnect backoff, reset on a successful connect.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    /// The delay to wait before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}
