//! Transfer events pushed to observers.
//!
//! Progress events are emitted only when a transfer's whole percent changes,
//! so a slow subscriber sees a bounded stream per transfer.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::transfer::TransferStatus;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress {
        transfer_id: i64,
        asset_id: i64,
        percent: u8,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    },
    StatusChanged {
        transfer_id: i64,
        status: TransferStatus,
    },
}

impl TransferEvent {
    #[must_use]
    pub fn transfer_id(&self) -> i64 {
        match self {
            Self::Progress { transfer_id, .. } | Self::StatusChanged { transfer_id, .. } => {
                *transfer_id
            }
        }
    }
}

/// Fan-out of [`TransferEvent`]s. Sending never blocks and never fails the
/// caller; events are dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status_changed(&self, transfer_id: i64, status: TransferStatus) {
        self.publish(TransferEvent::StatusChanged {
            transfer_id,
            status,
        });
    }
}
