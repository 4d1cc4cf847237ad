//! The engine actor: single owner of the item collection and pending queue.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::dispatch::{execute_action, Origin, RemoteJob, RemoteOutcome};
use crate::errors::{Error, Result, SyncRetryClass};
use crate::items::{new_item_id, Item, ItemDraft, ItemPatch};
use crate::storage::DurableCache;
use crate::sync::pending_queue::PendingActionQueue;
use crate::sync::remote::{RealtimeChannel, RemoteStore};
use crate::sync::sync_model::{
    should_apply_remote, DrainReport, ItemSyncState, PendingAction, QueuedAction, RemoteEvent,
};

pub(super) type Reply<T> = oneshot::Sender<T>;

pub(super) enum EditKind {
    Toggle,
    Patch(ItemPatch),
}

pub(super) enum EngineCommand {
    Add {
        draft: ItemDraft,
        reply: Reply<Result<Item>>,
    },
    Edit {
        id: String,
        kind: EditKind,
        reply: Reply<Result<Option<Item>>>,
    },
    Delete {
        id: String,
        reply: Reply<bool>,
    },
    Move {
        id: String,
        to_index: usize,
        reply: Reply<bool>,
    },
    Refresh {
        reply: Reply<Result<usize>>,
    },
    SyncNow {
        reply: Reply<Result<DrainReport>>,
    },
    SyncState {
        id: String,
        reply: Reply<Option<ItemSyncState>>,
    },
    PendingActions {
        reply: Reply<Vec<QueuedAction>>,
    },
    RemoteEvent(RemoteEvent),
    /// The realtime subscription missed events; pull the full collection.
    Resync,
    ConnectivityChanged(bool),
    RemoteCompleted(RemoteOutcome),
    Barrier(Reply<()>),
    Shutdown,
}

struct DrainCycle {
    report: DrainReport,
    snapshot_len: usize,
    retained: Vec<QueuedAction>,
    failed_ids: HashSet<String>,
    waiters: Vec<Reply<Result<DrainReport>>>,
}

pub(super) struct EngineActor {
    items: Vec<Item>,
    queue: PendingActionQueue,
    cache: DurableCache,
    remote: Arc<dyn RemoteStore>,
    realtime: Arc<dyn RealtimeChannel>,
    mailbox: mpsc::WeakSender<EngineCommand>,
    items_tx: watch::Sender<Arc<Vec<Item>>>,
    outstanding_tx: watch::Sender<usize>,
    /// Unconfirmed actions per item id, queued or in flight.
    unconfirmed: HashMap<String, usize>,
    /// Actions sent outside the queue and not yet answered; mirrored to the cache.
    in_transit: Vec<QueuedAction>,
    /// Items whose last attempt failed retryably; held until the next
    /// connectivity edge or manual sync.
    deferred: HashSet<String>,
    can_sync: bool,
    jobs: VecDeque<RemoteJob>,
    in_flight: bool,
    drain: Option<DrainCycle>,
    next_cycle: u64,
    follow_up: bool,
    follow_up_waiters: Vec<Reply<Result<DrainReport>>>,
    refresh_on_connect: bool,
    refresh_pending: bool,
}

pub(super) struct ActorParts {
    pub items: Vec<Item>,
    pub queue: PendingActionQueue,
    pub cache: DurableCache,
    pub remote: Arc<dyn RemoteStore>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub mailbox: mpsc::WeakSender<EngineCommand>,
    pub items_tx: watch::Sender<Arc<Vec<Item>>>,
    pub outstanding_tx: watch::Sender<usize>,
    pub refresh_on_connect: bool,
}

impl EngineActor {
    pub(super) fn new(parts: ActorParts) -> Self {
        let mut unconfirmed: HashMap<String, usize> = HashMap::new();
        for entry in parts.queue.peek_all() {
            *unconfirmed.entry(entry.item_id().to_string()).or_default() += 1;
        }
        Self {
            items: parts.items,
            queue: parts.queue,
            cache: parts.cache,
            remote: parts.remote,
            realtime: parts.realtime,
            mailbox: parts.mailbox,
            items_tx: parts.items_tx,
            outstanding_tx: parts.outstanding_tx,
            unconfirmed,
            in_transit: Vec::new(),
            deferred: HashSet::new(),
            can_sync: false,
            jobs: VecDeque::new(),
            in_flight: false,
            drain: None,
            next_cycle: 0,
            follow_up: false,
            follow_up_waiters: Vec::new(),
            refresh_on_connect: parts.refresh_on_connect,
            refresh_pending: false,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        while let Some(command) = commands.recv().await {
            if matches!(command, EngineCommand::Shutdown) {
                break;
            }
            self.handle(command).await;
            self.pump().await;
            self.publish_outstanding();
        }
        debug!("[TodoSync] Engine actor stopped");
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Add { draft, reply } => {
                let _ = reply.send(self.add(draft).await);
            }
            EngineCommand::Edit { id, kind, reply } => {
                let _ = reply.send(self.edit(&id, kind).await);
            }
            EngineCommand::Delete { id, reply } => {
                let _ = reply.send(self.delete(&id).await);
            }
            EngineCommand::Move { id, to_index, reply } => {
                let _ = reply.send(self.move_item(&id, to_index).await);
            }
            EngineCommand::Refresh { reply } => {
                if self.can_sync {
                    self.jobs.push_back(RemoteJob::Fetch { reply: Some(reply) });
                } else {
                    let _ = reply.send(Err(Error::NetworkUnavailable(
                        "cannot refresh while offline".to_string(),
                    )));
                }
            }
            EngineCommand::SyncNow { reply } => {
                if self.can_sync {
                    self.start_drain(vec![reply], true);
                } else {
                    let _ = reply.send(Err(Error::NetworkUnavailable(
                        "cannot sync while offline".to_string(),
                    )));
                }
            }
            EngineCommand::SyncState { id, reply } => {
                let _ = reply.send(self.sync_state(&id));
            }
            EngineCommand::PendingActions { reply } => {
                let _ = reply.send(self.queue.peek_all().to_vec());
            }
            EngineCommand::RemoteEvent(event) => self.apply_remote_event(event).await,
            EngineCommand::Resync => {
                if self.can_sync {
                    self.jobs.push_back(RemoteJob::Fetch { reply: None });
                } else {
                    self.refresh_pending = true;
                }
            }
            EngineCommand::ConnectivityChanged(can_sync) => self.connectivity_changed(can_sync),
            EngineCommand::RemoteCompleted(outcome) => {
                self.in_flight = false;
                self.complete(outcome).await;
            }
            EngineCommand::Barrier(reply) => {
                let _ = reply.send(());
            }
            EngineCommand::Shutdown => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local intents
    // ─────────────────────────────────────────────────────────────────────────

    async fn add(&mut self, draft: ItemDraft) -> Result<Item> {
        let item = draft.into_item(new_item_id(), Utc::now())?;
        debug!("[TodoSync] Add item {}", item.id);
        self.items.insert(0, item.clone());
        self.submit(PendingAction::Add { item: item.clone() }).await;
        self.items_changed().await;
        Ok(item)
    }

    async fn edit(&mut self, id: &str, kind: EditKind) -> Result<Option<Item>> {
        let Some(index) = self.position(id) else {
            debug!("[TodoSync] Ignoring edit for unknown item {}", id);
            return Ok(None);
        };
        let patch = match kind {
            EditKind::Toggle => ItemPatch::done(!self.items[index].done),
            EditKind::Patch(patch) => patch,
        };
        let updated = patch.apply_to(&self.items[index], Utc::now())?;
        self.items[index] = updated.clone();
        self.submit(PendingAction::Update {
            item: updated.clone(),
        })
        .await;
        self.items_changed().await;
        Ok(Some(updated))
    }

    async fn delete(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            debug!("[TodoSync] Ignoring delete for unknown item {}", id);
            return false;
        };
        self.items.remove(index);
        self.submit(PendingAction::Delete { id: id.to_string() })
            .await;
        self.items_changed().await;
        true
    }

    async fn move_item(&mut self, id: &str, to_index: usize) -> bool {
        let Some(from) = self.position(id) else {
            return false;
        };
        let item = self.items.remove(from);
        let to = to_index.min(self.items.len());
        self.items.insert(to, item);
        if from != to {
            self.items_changed().await;
        }
        true
    }

    /// Route a new action: straight to the remote when online and nothing
    /// for the same id is queued ahead of it, otherwise into the durable queue.
    /// Either way the action is persisted before this returns.
    async fn submit(&mut self, action: PendingAction) {
        let id = action.item_id().to_string();
        *self.unconfirmed.entry(id.clone()).or_default() += 1;
        let entry = QueuedAction::new(action);
        if self.can_sync && !self.queue.contains_item(&id) {
            self.in_transit.push(entry.clone());
            self.persist_in_transit().await;
            self.jobs.push_back(RemoteJob::Action {
                origin: Origin::Direct,
                entry,
            });
        } else {
            self.enqueue(entry).await;
        }
    }

    async fn enqueue(&mut self, entry: QueuedAction) {
        let id = entry.item_id().to_string();
        if let Err(err) = self.queue.enqueue(entry).await {
            warn!(
                "[TodoSync] Failed to persist pending action for item {}: {}",
                id, err
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote events
    // ─────────────────────────────────────────────────────────────────────────

    async fn apply_remote_event(&mut self, event: RemoteEvent) {
        let id = event.item_id().to_string();
        let has_pending = self.unconfirmed.contains_key(&id);
        let changed = match event {
            RemoteEvent::Add(item) => {
                if self.position(&id).is_some() || has_pending {
                    false
                } else {
                    self.items.insert(0, item);
                    true
                }
            }
            RemoteEvent::Update(item) => match self.position(&id) {
                None => false,
                Some(_) if has_pending => {
                    debug!(
                        "[TodoSync] Remote update for {} ignored: local action pending",
                        id
                    );
                    false
                }
                Some(index) => {
                    if self.items[index] != item && should_apply_remote(&self.items[index], &item)
                    {
                        self.items[index] = item;
                        true
                    } else {
                        false
                    }
                }
            },
            RemoteEvent::Delete(_) => {
                if has_pending {
                    debug!(
                        "[TodoSync] Remote delete for {} ignored: local action pending",
                        id
                    );
                    false
                } else if let Some(index) = self.position(&id) {
                    self.items.remove(index);
                    true
                } else {
                    false
                }
            }
        };
        if changed {
            self.publish_items();
        }
        self.persist_items().await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connectivity and draining
    // ─────────────────────────────────────────────────────────────────────────

    fn connectivity_changed(&mut self, can_sync: bool) {
        let was = self.can_sync;
        self.can_sync = can_sync;
        if !can_sync || was {
            return;
        }
        info!(
            "[TodoSync] Sync available; {} queued actions",
            self.queue.len()
        );
        self.start_drain(Vec::new(), true);
        // Realtime events published while we were away are not replayed.
        if self.refresh_on_connect || self.refresh_pending {
            self.refresh_pending = false;
            self.jobs.push_back(RemoteJob::Fetch { reply: None });
        }
    }

    /// Snapshot the queue and schedule every entry, in order, followed by a
    /// cycle marker. Entries for deferred items are carried over unattempted
    /// unless `retry_deferred` is set.
    fn start_drain(
        &mut self,
        mut waiters: Vec<Reply<Result<DrainReport>>>,
        retry_deferred: bool,
    ) {
        if self.drain.is_some() {
            self.follow_up = true;
            self.follow_up_waiters.append(&mut waiters);
            return;
        }
        if retry_deferred {
            self.deferred.clear();
        }
        waiters.append(&mut self.follow_up_waiters);
        if self.queue.is_empty() {
            let report = DrainReport {
                cycle: self.next_cycle,
                ..DrainReport::default()
            };
            for waiter in waiters {
                let _ = waiter.send(Ok(report.clone()));
            }
            return;
        }

        self.next_cycle += 1;
        let cycle = self.next_cycle;
        let snapshot = self.queue.peek_all().to_vec();
        info!(
            "[TodoSync] Drain cycle {} started with {} queued actions",
            cycle,
            snapshot.len()
        );
        let mut drain = DrainCycle {
            report: DrainReport {
                cycle,
                ..DrainReport::default()
            },
            snapshot_len: snapshot.len(),
            retained: Vec::new(),
            failed_ids: HashSet::new(),
            waiters,
        };
        for entry in snapshot {
            if self.deferred.contains(entry.item_id()) {
                drain.report.retained += 1;
                drain.retained.push(entry);
                continue;
            }
            self.jobs.push_back(RemoteJob::Action {
                origin: Origin::Drain(cycle),
                entry,
            });
        }
        self.drain = Some(drain);
        self.jobs.push_back(RemoteJob::DrainEnd { cycle });
    }

    async fn finish_drain(&mut self, cycle: u64) {
        let Some(drain) = self.drain.take() else {
            return;
        };
        if drain.report.cycle != cycle {
            warn!(
                "[TodoSync] Drain marker {} does not match running cycle {}",
                cycle, drain.report.cycle
            );
        }
        let retained_count = drain.retained.len();
        if let Err(err) = self
            .queue
            .complete_drain(drain.snapshot_len, drain.retained)
            .await
        {
            warn!("[TodoSync] Failed to persist queue after drain: {}", err);
        }
        self.persist_items().await;

        let report = drain.report;
        info!(
            "[TodoSync] Drain cycle {} complete attempted={} confirmed={} retained={} dropped={}",
            report.cycle, report.attempted, report.confirmed, report.retained, report.dropped
        );
        for waiter in drain.waiters {
            let _ = waiter.send(Ok(report.clone()));
        }

        let appended = self.queue.len() > retained_count;
        if self.can_sync && (self.follow_up || appended) {
            // Only a manual sync retries what this cycle just kept.
            let requested = std::mem::take(&mut self.follow_up);
            self.start_drain(Vec::new(), requested);
        } else if self.follow_up {
            self.follow_up = false;
            for waiter in self.follow_up_waiters.drain(..) {
                let _ = waiter.send(Err(Error::NetworkUnavailable(
                    "sync became unavailable".to_string(),
                )));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote job pump
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the next remote job unless one is already in flight.
    async fn pump(&mut self) {
        while !self.in_flight {
            let Some(job) = self.jobs.pop_front() else {
                break;
            };
            match job {
                RemoteJob::Action {
                    origin: Origin::Direct,
                    entry,
                } if !self.can_sync || self.queue.contains_item(entry.item_id()) => {
                    let event_id = entry.event_id.clone();
                    self.enqueue(entry).await;
                    self.untrack(&event_id).await;
                }
                RemoteJob::Action {
                    origin: Origin::Drain(cycle),
                    mut entry,
                } => {
                    let Some(drain) = self.drain.as_mut().filter(|d| d.report.cycle == cycle)
                    else {
                        warn!("[TodoSync] Dropping job for stale drain cycle {}", cycle);
                        continue;
                    };
                    if drain.failed_ids.contains(entry.item_id()) {
                        entry.record_failure("earlier action for this item is still pending");
                        drain.report.retained += 1;
                        drain.retained.push(entry);
                        continue;
                    }
                    drain.report.attempted += 1;
                    self.spawn_action(Origin::Drain(cycle), entry);
                }
                RemoteJob::Action { origin, entry } => self.spawn_action(origin, entry),
                RemoteJob::DrainEnd { cycle } => self.finish_drain(cycle).await,
                RemoteJob::Fetch { reply } => self.spawn_fetch(reply),
            }
        }
    }

    fn spawn_action(&mut self, origin: Origin, entry: QueuedAction) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let remote = Arc::clone(&self.remote);
        self.in_flight = true;
        tokio::spawn(async move {
            let result = execute_action(remote, &entry.action).await;
            let outcome = RemoteOutcome::Action {
                origin,
                entry,
                result,
            };
            let _ = mailbox.send(EngineCommand::RemoteCompleted(outcome)).await;
        });
    }

    fn spawn_fetch(&mut self, reply: Option<Reply<Result<usize>>>) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let remote = Arc::clone(&self.remote);
        self.in_flight = true;
        tokio::spawn(async move {
            let result = remote.list_all().await;
            let outcome = RemoteOutcome::Fetched { result, reply };
            let _ = mailbox.send(EngineCommand::RemoteCompleted(outcome)).await;
        });
    }

    async fn complete(&mut self, outcome: RemoteOutcome) {
        match outcome {
            RemoteOutcome::Action {
                origin,
                entry,
                result,
            } => {
                let event_id = entry.event_id.clone();
                match result {
                    Ok(confirmed) => self.confirm(origin, &entry, confirmed).await,
                    Err(err)
                        if err.is_not_found()
                            && matches!(entry.action, PendingAction::Delete { .. }) =>
                    {
                        self.confirm(origin, &entry, None).await
                    }
                    Err(err) => match err.retry_class() {
                        SyncRetryClass::Retryable => self.retain(origin, entry, &err).await,
                        SyncRetryClass::Permanent => self.discard(origin, &entry, &err).await,
                    },
                }
                if origin == Origin::Direct {
                    self.untrack(&event_id).await;
                }
            }
            RemoteOutcome::Fetched { result, reply } => {
                let result = match result {
                    Ok(remote_items) => Ok(self.merge_remote_collection(remote_items).await),
                    Err(err) => {
                        warn!("[TodoSync] Refresh failed, keeping cached items: {}", err);
                        Err(err)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn confirm(&mut self, origin: Origin, entry: &QueuedAction, confirmed: Option<Item>) {
        let id = entry.item_id().to_string();
        let settled = self.release(&id);
        debug!(
            "[TodoSync] Confirmed {:?} for item {} ({:?})",
            entry.action.kind(),
            id,
            origin
        );

        let mut changed = false;
        match (&entry.action, confirmed) {
            (PendingAction::Add { .. }, Some(server_item)) => {
                changed = self.reconcile_confirmed(&id, &server_item, settled);
                self.realtime.publish(RemoteEvent::Add(server_item));
            }
            (PendingAction::Update { .. }, Some(server_item)) => {
                changed = self.reconcile_confirmed(&id, &server_item, settled);
                self.realtime.publish(RemoteEvent::Update(server_item));
            }
            (PendingAction::Delete { id }, _) => {
                self.realtime.publish(RemoteEvent::Delete(id.clone()));
            }
            (_, None) => {}
        }

        match origin {
            Origin::Direct => {
                if changed {
                    self.items_changed().await;
                }
            }
            Origin::Drain(_) => {
                if changed {
                    self.publish_items();
                }
                if let Some(drain) = self.drain.as_mut() {
                    drain.report.confirmed += 1;
                }
            }
        }
    }

    /// Replace the local value with the server-confirmed one, unless a newer
    /// local action for the id is still outstanding or the item is gone locally.
    fn reconcile_confirmed(&mut self, id: &str, server_item: &Item, settled: bool) -> bool {
        if !settled {
            debug!(
                "[TodoSync] Keeping newer local value for {} over confirmed response",
                id
            );
            return false;
        }
        match self.position(id) {
            Some(index) if self.items[index] != *server_item => {
                self.items[index] = server_item.clone();
                true
            }
            _ => false,
        }
    }

    async fn retain(&mut self, origin: Origin, mut entry: QueuedAction, err: &Error) {
        warn!(
            "[TodoSync] {:?} for item {} not synced, keeping it queued: {}",
            entry.action.kind(),
            entry.item_id(),
            err
        );
        self.deferred.insert(entry.item_id().to_string());
        match origin {
            Origin::Direct => self.enqueue(entry).await,
            Origin::Drain(_) => {
                entry.record_failure(err.to_string());
                match self.drain.as_mut() {
                    Some(drain) => {
                        drain.failed_ids.insert(entry.item_id().to_string());
                        drain.report.retained += 1;
                        drain.retained.push(entry);
                    }
                    None => self.enqueue(entry).await,
                }
            }
        }
    }

    async fn discard(&mut self, origin: Origin, entry: &QueuedAction, err: &Error) {
        let id = entry.item_id().to_string();
        warn!(
            "[TodoSync] Dropping {:?} for item {}: {}",
            entry.action.kind(),
            id,
            err
        );
        let settled = self.release(&id);
        let mut changed = false;
        if settled && err.is_not_found() && matches!(entry.action, PendingAction::Update { .. }) {
            // Deleted remotely; deletion wins over the local edit.
            if let Some(index) = self.position(&id) {
                self.items.remove(index);
                changed = true;
            }
        }
        if let Origin::Drain(_) = origin {
            if let Some(drain) = self.drain.as_mut() {
                drain.report.dropped += 1;
            }
            if changed {
                self.publish_items();
            }
        } else if changed {
            self.items_changed().await;
        }
    }

    async fn merge_remote_collection(&mut self, remote_items: Vec<Item>) -> usize {
        let remote_ids: HashSet<String> = remote_items.iter().map(|i| i.id.clone()).collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged = Vec::with_capacity(remote_items.len() + self.unconfirmed.len());

        for item in &self.items {
            if self.unconfirmed.contains_key(&item.id) && !remote_ids.contains(&item.id) {
                seen.insert(item.id.clone());
                merged.push(item.clone());
            }
        }
        for remote_item in remote_items {
            if !seen.insert(remote_item.id.clone()) {
                continue;
            }
            if self.unconfirmed.contains_key(&remote_item.id) {
                if let Some(index) = self.position(&remote_item.id) {
                    merged.push(self.items[index].clone());
                }
            } else {
                merged.push(remote_item);
            }
        }

        debug!(
            "[TodoSync] Refreshed collection: {} items ({} pending locally)",
            merged.len(),
            self.unconfirmed.len()
        );
        self.items = merged;
        self.items_changed().await;
        self.items.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// Mark one action for `id` as resolved. True when none remain.
    fn release(&mut self, id: &str) -> bool {
        match self.unconfirmed.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.unconfirmed.remove(id);
                true
            }
            None => true,
        }
    }

    fn sync_state(&self, id: &str) -> Option<ItemSyncState> {
        let visible = self.position(id).is_some();
        match (self.unconfirmed.contains_key(id), visible) {
            (true, true) => Some(ItemSyncState::PendingLocal),
            (true, false) => Some(ItemSyncState::Tombstoned),
            (false, true) => Some(ItemSyncState::Confirmed),
            (false, false) => None,
        }
    }

    /// Forget a direct action once it is answered or handed to the queue.
    async fn untrack(&mut self, event_id: &str) {
        let before = self.in_transit.len();
        self.in_transit.retain(|entry| entry.event_id != event_id);
        if self.in_transit.len() != before {
            self.persist_in_transit().await;
        }
    }

    async fn persist_in_transit(&self) {
        if let Err(err) = self.cache.store_in_flight(&self.in_transit).await {
            warn!("[TodoSync] Failed to persist in-flight actions: {}", err);
        }
    }

    async fn items_changed(&mut self) {
        self.publish_items();
        self.persist_items().await;
    }

    fn publish_items(&self) {
        self.items_tx.send_replace(Arc::new(self.items.clone()));
    }

    async fn persist_items(&self) {
        if let Err(err) = self.cache.store_items(&self.items).await {
            warn!("[TodoSync] Failed to persist item collection: {}", err);
        }
    }

    fn publish_outstanding(&self) {
        let outstanding = self.jobs.len() + usize::from(self.in_flight);
        self.outstanding_tx.send_if_modified(|current| {
            if *current == outstanding {
                return false;
            }
            *current = outstanding;
            true
        });
    }
}
