//! Most-recent-value cell with a broadcast notification per value.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Broadcast capacity for inbound notifications.
const CHANNEL_CAPACITY: usize = 1024;

/// One inbound value as received from the wire.
///
/// `seq` is unique per inbox, so two identical payloads are still two
/// distinct notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Monotonic sequence number within the inbox.
    pub seq: u64,
    /// Raw or normalized payload text.
    pub data: String,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

/// Inbound message cell for one transport.
pub struct Inbox {
    last: RwLock<Option<InboundMessage>>,
    next_seq: AtomicU64,
    sender: broadcast::Sender<InboundMessage>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    /// Create an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            last: RwLock::new(None),
            next_seq: AtomicU64::new(1),
            sender,
        }
    }

    /// Store `data` as the most recent value and notify listeners.
    pub fn push(&self, data: impl Into<String>) -> InboundMessage {
        let msg = InboundMessage {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            data: data.into(),
            received_at: Utc::now(),
        };
        *self.last.write() = Some(msg.clone());
        let _ = self.sender.send(msg.clone()); // live listeners
        msg
    }

    /// Most recent value.
    #[must_use]
    pub fn last(&self) -> Option<InboundMessage> {
        self.last.read().clone()
    }

    /// Forget the most recent value.
    pub fn clear(&self) {
        *self.last.write() = None;
    }

    /// Get a receiver for live notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.sender.subscribe()
    }
}
