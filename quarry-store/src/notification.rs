//! Change notifications.
//!
//! Every observable cache change is published on a tokio broadcast channel.
//! Publishing never blocks: with no subscribers the notification is dropped,
//! and a subscriber that falls behind by more than the channel capacity sees
//! `RecvError::Lagged` instead of stalling the store.

use quarry_core::{Identifier, RecordState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A change to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    /// The effective value of an attribute changed.
    AttributeChanged { identifier: Identifier, name: String },
    /// The effective membership of a relationship changed.
    RelationshipChanged { identifier: Identifier, name: String },
    /// The record moved to a new lifecycle state.
    StateChanged {
        identifier: Identifier,
        from: RecordState,
        to: RecordState,
    },
    /// A server id was assigned to a record created locally.
    IdentifierUpdated { identifier: Identifier, id: String },
    /// The record was detached from the cache.
    Unloaded { identifier: Identifier },
}

impl Notification {
    pub fn identifier(&self) -> &Identifier {
        match self {
            Notification::AttributeChanged { identifier, .. }
            | Notification::RelationshipChanged { identifier, .. }
            | Notification::StateChanged { identifier, .. }
            | Notification::IdentifierUpdated { identifier, .. }
            | Notification::Unloaded { identifier } => identifier,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AttributeChanged { .. } => "attributeChanged",
            Notification::RelationshipChanged { .. } => "relationshipChanged",
            Notification::StateChanged { .. } => "stateChanged",
            Notification::IdentifierUpdated { .. } => "identifierUpdated",
            Notification::Unloaded { .. } => "unloaded",
        }
    }
}

/// Sending half of the notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        match self.tx.send(notification) {
            Ok(receivers) => tracing::trace!(kind, receivers, "Published notification"),
            Err(_) => tracing::trace!(kind, "No subscribers for notification"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}
