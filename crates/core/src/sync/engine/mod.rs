//! Reconciliation engine.
//!
//! A single actor task owns the item collection, the pending queue and the
//! per-item pending counts. Intents, realtime events, connectivity edges and
//! remote completions all arrive on its mailbox and are applied one at a time.

mod actor;
mod dispatch;

use log::{debug, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use self::actor::{ActorParts, EditKind, EngineActor, EngineCommand};
use crate::constants::ENGINE_MAILBOX_CAPACITY;
use crate::errors::{Error, Result};
use crate::items::{Item, ItemDraft, ItemPatch};
use crate::storage::{DurableCache, KeyValueStore};
use crate::sync::pending_queue::PendingActionQueue;
use crate::sync::remote::{RealtimeChannel, RemoteStore};
use crate::sync::sync_model::{DrainReport, ItemSyncState, QueuedAction, RemoteEvent};

/// Collaborators the engine is wired to.
pub struct SyncEngineDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub realtime: Arc<dyn RealtimeChannel>,
    /// Edge-only `can_sync` signal, usually [`ConnectivityMonitor::subscribe`](crate::sync::ConnectivityMonitor::subscribe).
    pub can_sync: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Pull the full collection every time sync becomes available.
    pub refresh_on_connect: bool,
    pub mailbox_capacity: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            refresh_on_connect: true,
            mailbox_capacity: ENGINE_MAILBOX_CAPACITY,
        }
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    commands: mpsc::Sender<EngineCommand>,
    items: watch::Receiver<Arc<Vec<Item>>>,
    outstanding: watch::Receiver<usize>,
    can_sync: watch::Receiver<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncEngine {
    /// Load the cached collection and queue, then start the actor and its listeners.
    pub async fn start(deps: SyncEngineDeps, config: SyncEngineConfig) -> Result<Self> {
        let SyncEngineDeps {
            store,
            remote,
            realtime,
            mut can_sync,
        } = deps;

        let cache = DurableCache::new(store);
        let items = cache.load_items().await?;
        let mut queue = PendingActionQueue::load(cache.clone()).await?;
        let in_flight = cache.load_in_flight().await?;
        if !in_flight.is_empty() {
            queue.restore_in_flight(in_flight).await?;
            cache.store_in_flight(&[]).await?;
        }
        debug!(
            "[TodoSync] Loaded {} cached items and {} queued actions",
            items.len(),
            queue.len()
        );

        let (commands, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
        let (items_tx, items_rx) = watch::channel(Arc::new(items.clone()));
        let (outstanding_tx, outstanding_rx) = watch::channel(0usize);

        // Subscribe before anything can be published so no event is missed.
        let events = realtime.subscribe();
        let realtime_state = realtime.connection_state();

        let actor = EngineActor::new(ActorParts {
            items,
            queue,
            cache,
            remote,
            realtime,
            mailbox: commands.downgrade(),
            items_tx,
            outstanding_tx,
            refresh_on_connect: config.refresh_on_connect,
        });

        let initial = *can_sync.borrow_and_update();
        commands
            .send(EngineCommand::ConnectivityChanged(initial))
            .await
            .map_err(|_| Error::EngineStopped)?;

        let can_sync_rx = can_sync.clone();
        let actor_task = tokio::spawn(actor.run(mailbox));
        let connectivity_task = tokio::spawn(forward_connectivity(can_sync, commands.downgrade()));
        let realtime_task = tokio::spawn(forward_realtime(events, commands.downgrade()));
        let mut tasks = vec![actor_task, connectivity_task, realtime_task];
        if let Some(state) = realtime_state {
            tasks.push(tokio::spawn(forward_reconnects(state, commands.downgrade())));
        }

        Ok(Self {
            commands,
            items: items_rx,
            outstanding: outstanding_rx,
            can_sync: can_sync_rx,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    /// Create an item locally and sync it.
    pub async fn add(&self, draft: ItemDraft) -> Result<Item> {
        self.request(|reply| EngineCommand::Add { draft, reply })
            .await?
    }

    /// Flip `done`. `Ok(None)` when the id is unknown.
    pub async fn toggle_done(&self, id: &str) -> Result<Option<Item>> {
        let id = id.to_string();
        self.request(|reply| EngineCommand::Edit {
            id,
            kind: EditKind::Toggle,
            reply,
        })
        .await?
    }

    /// Apply a field patch. `Ok(None)` when the id is unknown.
    pub async fn edit(&self, id: &str, patch: ItemPatch) -> Result<Option<Item>> {
        let id = id.to_string();
        self.request(|reply| EngineCommand::Edit {
            id,
            kind: EditKind::Patch(patch),
            reply,
        })
        .await?
    }

    /// Remove an item. Returns false when the id is unknown.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| EngineCommand::Delete { id, reply })
            .await
    }

    /// Reorder locally. Order is never sent to the remote service.
    pub async fn move_item(&self, id: &str, to_index: usize) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| EngineCommand::Move { id, to_index, reply })
            .await
    }

    /// Fetch the full remote collection and merge it with local pending state.
    pub async fn refresh(&self) -> Result<usize> {
        self.request(|reply| EngineCommand::Refresh { reply })
            .await?
    }

    /// Drain the pending queue now and report the cycle.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.request(|reply| EngineCommand::SyncNow { reply })
            .await?
    }

    /// Inject a realtime event as if it arrived on the subscription.
    pub async fn handle_remote_event(&self, event: RemoteEvent) -> Result<()> {
        self.commands
            .send(EngineCommand::RemoteEvent(event))
            .await
            .map_err(|_| Error::EngineStopped)
    }

    pub fn items(&self) -> Vec<Item> {
        self.items.borrow().as_ref().clone()
    }

    pub fn subscribe_items(&self) -> watch::Receiver<Arc<Vec<Item>>> {
        self.items.clone()
    }

    pub fn can_sync(&self) -> bool {
        *self.can_sync.borrow()
    }

    pub fn subscribe_can_sync(&self) -> watch::Receiver<bool> {
        self.can_sync.clone()
    }

    pub async fn sync_state(&self, id: &str) -> Result<Option<ItemSyncState>> {
        let id = id.to_string();
        self.request(|reply| EngineCommand::SyncState { id, reply })
            .await
    }

    /// Snapshot of the durable pending queue.
    pub async fn pending_actions(&self) -> Result<Vec<QueuedAction>> {
        self.request(|reply| EngineCommand::PendingActions { reply })
            .await
    }

    /// Wait until every command sent so far has been applied and no remote
    /// work is queued or in flight.
    pub async fn settle(&self) -> Result<()> {
        let mut outstanding = self.outstanding.clone();
        loop {
            self.request(EngineCommand::Barrier).await?;
            outstanding
                .wait_for(|count| *count == 0)
                .await
                .map_err(|_| Error::EngineStopped)?;
            self.request(EngineCommand::Barrier).await?;
            if *outstanding.borrow() == 0 {
                return Ok(());
            }
        }
    }

    /// Stop the actor and its listeners. Queued actions stay persisted.
    pub async fn shutdown(&self) {
        if self.commands.send(EngineCommand::Shutdown).await.is_err() {
            debug!("[TodoSync] Engine already stopped");
        }
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let mut tasks = tasks.into_iter();
        if let Some(actor_task) = tasks.next() {
            let _ = actor_task.await;
        }
        for task in tasks {
            task.abort();
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::EngineStopped)?;
        response.await.map_err(|_| Error::EngineStopped)
    }
}

async fn forward(mailbox: &mpsc::WeakSender<EngineCommand>, command: EngineCommand) -> bool {
    match mailbox.upgrade() {
        Some(sender) => sender.send(command).await.is_ok(),
        None => false,
    }
}

async fn forward_connectivity(
    mut can_sync: watch::Receiver<bool>,
    mailbox: mpsc::WeakSender<EngineCommand>,
) {
    while can_sync.changed().await.is_ok() {
        let value = *can_sync.borrow_and_update();
        if !forward(&mailbox, EngineCommand::ConnectivityChanged(value)).await {
            break;
        }
    }
}

async fn forward_realtime(
    mut events: tokio::sync::broadcast::Receiver<RemoteEvent>,
    mailbox: mpsc::WeakSender<EngineCommand>,
) {
    loop {
        let command = match events.recv().await {
            Ok(event) => EngineCommand::RemoteEvent(event),
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    "[Realtime] Subscription lagged by {} events, requesting resync",
                    missed
                );
                EngineCommand::Resync
            }
            Err(RecvError::Closed) => break,
        };
        if !forward(&mailbox, command).await {
            break;
        }
    }
}

/// Events published while the realtime link was down are lost; resync on reconnect.
async fn forward_reconnects(
    mut connected: watch::Receiver<bool>,
    mailbox: mpsc::WeakSender<EngineCommand>,
) {
    let mut was_connected = *connected.borrow_and_update();
    while connected.changed().await.is_ok() {
        let is_connected = *connected.borrow_and_update();
        if is_connected && !was_connected {
            debug!("[Realtime] Reconnected, requesting resync");
            if !forward(&mailbox, EngineCommand::Resync).await {
                break;
            }
        }
        was_connected = is_connected;
    }
}
