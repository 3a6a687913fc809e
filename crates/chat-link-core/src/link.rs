//! Single-owner slot for a transport's live wire connection.
//!
//! Every opened connection gets a fresh [`Epoch`]. Background tasks carry
//! the epoch they were spawned with and may only touch shared state while
//! that epoch is still current, so a superseded connection can never
//! resurrect connectivity or publish late messages.

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};

use crate::{ConnectionState, InboundMessage, Inbox, TransportError};

/// Generation counter for opened connections.
pub type Epoch = u64;

struct Active<C> {
    conn: C,
    task: Option<JoinHandle<()>>,
}

impl<C> Active<C> {
    fn shutdown(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

struct Slot<C> {
    epoch: Epoch,
    active: Option<Active<C>>,
}

/// Connection slot, connectivity state and inbox for one transport instance.
///
/// `C` is the per-connection data the transport needs (current URL, write
/// handle, ...).
pub struct Link<C> {
    slot: Mutex<Slot<C>>,
    state: watch::Sender<ConnectionState>,
    inbox: Inbox,
    last_error: Mutex<Option<TransportError>>,
}

impl<C> Default for Link<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Link<C> {
    /// Create an empty, disconnected link.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            slot: Mutex::new(Slot {
                epoch: 0,
                active: None,
            }),
            state,
            inbox: Inbox::new(),
            last_error: Mutex::new(None),
        }
    }

    /// Install a new connection, tearing down the previous one first.
    ///
    /// Moves the state to `Connecting` and returns the new epoch.
    pub fn open(&self, conn: C) -> Epoch {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.active.take() {
            tracing::debug!(epoch = slot.epoch, "Closing previous connection");
            previous.shutdown();
            self.state.send_replace(ConnectionState::Disconnected);
        }
        slot.epoch += 1;
        slot.active = Some(Active { conn, task: None });
        *self.last_error.lock() = None;
        self.state.send_replace(ConnectionState::Connecting);
        slot.epoch
    }

    /// Hand the background task driving `epoch` to the link.
    ///
    /// If the connection was superseded in the meantime the task is aborted.
    pub fn attach(&self, epoch: Epoch, task: JoinHandle<()>) {
        let mut guard = self.slot.lock();
        let slot = &mut *guard;
        match slot.active.as_mut() {
            Some(active) if slot.epoch == epoch => active.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Tear down the active connection and clear the last message.
    ///
    /// Returns false if there was nothing to tear down.
    pub fn close(&self) -> bool {
        let mut slot = self.slot.lock();
        let Some(active) = slot.active.take() else {
            return false;
        };
        active.shutdown();
        slot.epoch += 1;
        self.inbox.clear();
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }

    /// Whether `epoch` still owns the link.
    #[must_use]
    pub fn is_current(&self, epoch: Epoch) -> bool {
        let slot = self.slot.lock();
        slot.epoch == epoch && slot.active.is_some()
    }

    /// Mutate the connection data for `epoch`, if it is still current.
    pub fn update<R>(&self, epoch: Epoch, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut slot = self.slot.lock();
        if slot.epoch != epoch {
            return None;
        }
        slot.active.as_mut().map(|active| f(&mut active.conn))
    }

    /// Read the current connection data.
    pub fn with_conn<R>(&self, f: impl FnOnce(&C) -> R) -> Option<R> {
        self.slot.lock().active.as_ref().map(|active| f(&active.conn))
    }

    /// Set the connection state on behalf of `epoch`.
    ///
    /// Returns false (and changes nothing) if `epoch` was superseded.
    pub fn set_state(&self, epoch: Epoch, state: ConnectionState) -> bool {
        let slot = self.slot.lock();
        if slot.epoch != epoch || slot.active.is_none() {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Record a wire failure for `epoch` and mark the link disconnected.
    pub fn fail(&self, epoch: Epoch, error: TransportError) -> bool {
        let slot = self.slot.lock();
        if slot.epoch != epoch || slot.active.is_none() {
            return false;
        }
        *self.last_error.lock() = Some(error);
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }

    /// Publish an inbound value received by `epoch`.
    pub fn publish(&self, epoch: Epoch, data: impl Into<String>) -> Option<InboundMessage> {
        let slot = self.slot.lock();
        if slot.epoch != epoch || slot.active.is_none() {
            return None;
        }
        Some(self.inbox.push(data))
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for connection state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The inbox fed by this link.
    #[must_use]
    pub const fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Most recent wire failure.
    #[must_use]
    pub fn last_error(&self) -> Option<TransportError> {
        self.last_error.lock().clone()
    }
}
