//! Remote work items and their execution.
//!
//! The actor keeps these in a FIFO and runs at most one at a time; the call
//! itself happens in a spawned task whose outcome is posted back to the mailbox.

use std::sync::Arc;
use tokio::sync::oneshot;

use crate::errors::Result;
use crate::items::Item;
use crate::sync::remote::RemoteStore;
use crate::sync::sync_model::{PendingAction, QueuedAction};

/// Where a remote action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Origin {
    /// Issued straight from an intent while online.
    Direct,
    /// Part of the drain cycle with this id.
    Drain(u64),
}

pub(super) enum RemoteJob {
    Action { origin: Origin, entry: QueuedAction },
    DrainEnd { cycle: u64 },
    Fetch { reply: Option<oneshot::Sender<Result<usize>>> },
}

pub(super) enum RemoteOutcome {
    Action {
        origin: Origin,
        entry: QueuedAction,
        result: Result<Option<Item>>,
    },
    Fetched {
        result: Result<Vec<Item>>,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
}

/// Perform one pending action against the record service.
pub(super) async fn execute_action(
    remote: Arc<dyn RemoteStore>,
    action: &PendingAction,
) -> Result<Option<Item>> {
    match action {
        PendingAction::Add { item } => remote.create(item).await.map(Some),
        PendingAction::Update { item } => remote.update(item).await.map(Some),
        PendingAction::Delete { id } => remote.remove(id).await.map(|_| None),
    }
}
