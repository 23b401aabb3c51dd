//! Delivery deduplication for peer-originated chat events
//!
//! Peer messages can arrive more than once (store-and-forward replay,
//! reconnect catch-up). Each delivery gets a tracking key: the explicit
//! message id when the sender provided one, else a fallback derived from
//! sender and content. A bounded most-recent set drops re-deliveries.

use std::collections::{HashSet, VecDeque};

/// How many distinct delivery keys are remembered before the oldest is
/// evicted. Older duplicates can therefore be re-admitted; the bound trades
/// exactly-once for bounded memory.
pub const DEDUP_CAPACITY: usize = 100;

/// Tracking key for one delivery. Without an explicit id, two legitimately
/// identical messages from the same sender collapse to one key and the
/// second is suppressed. A known limitation of the fallback, not something
/// this layer can distinguish.
pub fn delivery_key(message_id: Option<&str>, sender: &str, text: &str) -> String {
    match message_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("{}|{}", sender, text),
    }
}

/// Bounded FIFO set of recently seen keys. Eviction is strictly by insertion
/// order, never by access order.
#[derive(Debug)]
pub struct RecentKeys {
    cap: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for RecentKeys {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY)
    }
}

impl RecentKeys {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            order: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
        }
    }

    /// Record a key. Returns `true` if it was new, `false` for a duplicate.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
