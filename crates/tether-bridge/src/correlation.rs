//! Correlation tables matching asynchronous replies to waiting callers.
//!
//! Each pending identifier owns a single-slot channel. The reader delivers
//! without ever blocking; the caller's [`PendingReply`] removes its own entry
//! when dropped, whatever the outcome.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::BridgeError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Outcome of a reader-side delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The slot already holds a reply; this one is dropped.
    Duplicate,
    /// Nobody is waiting under that identifier.
    Unknown,
    /// The table was closed by connection teardown.
    Closed,
}

struct Table<T> {
    slots: DashMap<String, mpsc::Sender<T>>,
    closed: AtomicBool,
}

/// Concurrency-safe `identifier -> single-slot channel` table.
pub struct Correlator<T> {
    table: Arc<Table<T>>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Table {
                slots: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Opens a slot for `id`. Fails if the table is closed or `id` is already pending.
    pub fn register(&self, id: impl Into<String>) -> Result<PendingReply<T>, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        let id = id.into();
        let (tx, rx) = mpsc::channel(1);
        match self.table.slots.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BridgeError::Validation(format!("identifier {} already pending", id)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let pending = PendingReply {
            id,
            rx,
            table: Arc::clone(&self.table),
        };
        // close() may have cleared the table between the check and the insert.
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        Ok(pending)
    }

    /// Non-blocking delivery of a reply to whoever waits on `id`.
    pub fn deliver(&self, id: &str, value: T) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        let Some(tx) = self.table.slots.get(id) else {
            return Delivery::Unknown;
        };
        match tx.try_send(value) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Duplicate,
            Err(TrySendError::Closed(_)) => Delivery::Unknown,
        }
    }

    /// Releases every waiter with a closed indication; later registrations fail.
    pub fn close(&self) {
        self.table.closed.store(true, Ordering::SeqCst);
        self.table.slots.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.table.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.table.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.slots.contains_key(id)
    }
}

/// Caller-side handle on one pending identifier.
pub struct PendingReply<T> {
    id: String,
    rx: mpsc::Receiver<T>,
    table: Arc<Table<T>>,
}

impl<T> PendingReply<T> {
    /// Waits for the reply. `ConnectionClosed` if the table was closed first.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, BridgeError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(BridgeError::ConnectionClosed),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.table.slots.remove(&self.id);
    }
}
