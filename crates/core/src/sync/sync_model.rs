//! Sync domain models: pending actions, realtime events and status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::items::Item;

/// A not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingAction {
    Add {
        #[serde(rename = "todo")]
        item: Item,
    },
    /// Full replacement keyed by `item.id`.
    Update {
        #[serde(rename = "todo")]
        item: Item,
    },
    Delete { id: String },
}

impl PendingAction {
    pub fn item_id(&self) -> &str {
        match self {
            Self::Add { item } | Self::Update { item } => &item.id,
            Self::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> RemoteEventKind {
        match self {
            Self::Add { .. } => RemoteEventKind::Add,
            Self::Update { .. } => RemoteEventKind::Update,
            Self::Delete { .. } => RemoteEventKind::Delete,
        }
    }
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Queue entry as stored in the durable cache.
///
/// Metadata fields default when absent so queues written by older clients
/// (bare `{type, todo}` objects) still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    #[serde(default = "new_event_id")]
    pub event_id: String,
    #[serde(flatten)]
    pub action: PendingAction,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedAction {
    pub fn new(action: PendingAction) -> Self {
        Self {
            event_id: new_event_id(),
            action,
            enqueued_at: Some(Utc::now()),
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn item_id(&self) -> &str {
        self.action.item_id()
    }

    /// Record a failed attempt that keeps the entry queued.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
    }
}

/// Realtime event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteEventKind {
    Add,
    Update,
    Delete,
}

/// Event pushed over the realtime channel, by the remote authority or by
/// other clients' confirmed mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum RemoteEvent {
    #[serde(rename = "todo:add")]
    Add(Item),
    #[serde(rename = "todo:update")]
    Update(Item),
    #[serde(rename = "todo:delete")]
    Delete(String),
}

impl RemoteEvent {
    pub fn kind(&self) -> RemoteEventKind {
        match self {
            Self::Add(_) => RemoteEventKind::Add,
            Self::Update(_) => RemoteEventKind::Update,
            Self::Delete(_) => RemoteEventKind::Delete,
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            Self::Add(item) | Self::Update(item) => &item.id,
            Self::Delete(id) => id,
        }
    }
}

/// Per-item reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSyncState {
    /// Matches the remote authority as far as this client knows.
    Confirmed,
    /// Visible locally with at least one unconfirmed action.
    PendingLocal,
    /// Deleted locally, deletion not yet confirmed.
    Tombstoned,
}

/// Process-wide connectivity state. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub remote_reachable: bool,
}

impl SyncStatus {
    pub fn can_sync(&self) -> bool {
        self.online && self.remote_reachable
    }
}

/// Outcome summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub cycle: u64,
    pub attempted: usize,
    pub confirmed: usize,
    pub retained: usize,
    pub dropped: usize,
}

/// Determines whether an incoming remote value should overwrite a local one
/// that has no unconfirmed action.
///
/// Rule: apply unless both carry `updatedAt` and the remote one is strictly older.
pub fn should_apply_remote(local: &Item, remote: &Item) -> bool {
    match (local.updated_at, remote.updated_at) {
        (Some(local_ts), Some(remote_ts)) => remote_ts >= local_ts,
        _ => true,
    }
}
