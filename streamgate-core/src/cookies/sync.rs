//! Cluster replication protocol for the cookie table.
//!
//! In a multi-process deployment exactly one process (the primary) owns the
//! cookie file; every process keeps an in-memory mirror of the table. The
//! protocol is two tagged messages over a broadcast abstraction: a full
//! `Snapshot` on load and a `PointUpdate` per mutated slot. Convergence is
//! eventually-consistent, last-writer-wins per slot.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// A replication message exchanged between processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Full table, sent by the primary after load.
    Snapshot {
        cookies: BTreeMap<String, Vec<String>>,
    },
    /// One mutated slot, rebroadcast by the primary so workers converge.
    PointUpdate {
        service: String,
        index: usize,
        cookie: String,
    },
}

/// Transport seam for replication messages.
///
/// The store publishes through this trait and stays independent of the
/// process-management primitive actually carrying the messages.
pub trait ClusterBus: Send + Sync {
    /// Delivers a message to every other process.
    fn publish(&self, message: SyncMessage);
}

/// Bus backed by in-process channels.
///
/// Each subscriber gets its own unbounded receiver. This is the transport
/// used when worker processes are supervised in-process and in tests; a
/// real multi-process deployment wraps its IPC pipe in the same trait.
#[derive(Default)]
pub struct ChannelBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncMessage>>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl ClusterBus for ChannelBus {
    fn publish(&self, message: SyncMessage) {
        let mut subscribers = self.subscribers.lock();
        // Drop subscribers whose process went away.
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        debug!(subscribers = subscribers.len(), "published sync message");
    }
}
