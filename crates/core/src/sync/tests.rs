use super::*;
use crate::errors::{Error, Result};
use crate::items::{Item, ItemDraft, ItemPatch};
use crate::storage::MemoryKeyValueStore;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone, Copy)]
enum FailMode {
    Offline,
    Reject,
    NotFound,
    Malformed,
}

/// In-memory record service. Stamps `updatedAt` like a real server and can be
/// scripted to fail or to hold responses.
struct FakeRemote {
    items: Mutex<Vec<Item>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<FailMode>>,
    gated: AtomicBool,
    gate: Semaphore,
}

impl FakeRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    fn seed(&self, item: Item) {
        self.items.lock().unwrap().push(item);
    }

    fn fail_next(&self, mode: FailMode) {
        self.failures.lock().unwrap().push_back(mode);
    }

    fn hold_responses(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn server_item(&self, id: &str) -> Option<Item> {
        self.items.lock().unwrap().iter().find(|i| i.id == id).cloned()
    }

    async fn enter(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            None => Ok(()),
            Some(FailMode::Offline) => Err(Error::NetworkUnavailable("connection refused".into())),
            Some(FailMode::Reject) => Err(Error::rejected(400, "invalid todo")),
            Some(FailMode::NotFound) => Err(Error::NotFound("todo".into())),
            Some(FailMode::Malformed) => Err(Error::Serialization(
                serde_json::from_str::<Item>("<html>").unwrap_err(),
            )),
        }
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list_all(&self) -> Result<Vec<Item>> {
        self.enter("list".to_string()).await?;
        Ok(self.items.lock().unwrap().clone())
    }

    async fn create(&self, item: &Item) -> Result<Item> {
        self.enter(format!("create:{}", item.id)).await?;
        let mut confirmed = item.clone();
        confirmed.updated_at = Some(Utc::now());
        let mut items = self.items.lock().unwrap();
        items.retain(|i| i.id != item.id);
        items.push(confirmed.clone());
        Ok(confirmed)
    }

    async fn update(&self, item: &Item) -> Result<Item> {
        self.enter(format!("update:{}", item.id)).await?;
        let mut items = self.items.lock().unwrap();
        let Some(slot) = items.iter_mut().find(|i| i.id == item.id) else {
            return Err(Error::NotFound(item.id.clone()));
        };
        let mut confirmed = item.clone();
        confirmed.updated_at = Some(Utc::now());
        *slot = confirmed.clone();
        Ok(confirmed)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.enter(format!("remove:{}", id)).await?;
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| i.id != id);
        if items.len() == before {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }
}

struct Client {
    engine: SyncEngine,
    can_sync: watch::Sender<bool>,
}

impl Client {
    async fn start(
        store: &Arc<MemoryKeyValueStore>,
        remote: &Arc<FakeRemote>,
        hub: &Arc<LocalRealtimeHub>,
        online: bool,
    ) -> Self {
        Self::start_with(store, remote, hub, online, false).await
    }

    async fn start_with(
        store: &Arc<MemoryKeyValueStore>,
        remote: &Arc<FakeRemote>,
        hub: &Arc<LocalRealtimeHub>,
        online: bool,
        refresh_on_connect: bool,
    ) -> Self {
        let (can_sync, can_sync_rx) = watch::channel(online);
        let deps = SyncEngineDeps {
            store: store.clone(),
            remote: remote.clone(),
            realtime: hub.clone(),
            can_sync: can_sync_rx,
        };
        let config = SyncEngineConfig {
            refresh_on_connect,
            ..SyncEngineConfig::default()
        };
        let engine = SyncEngine::start(deps, config).await.unwrap();
        Self { engine, can_sync }
    }

    /// Flip connectivity and wait until the engine has acted on it.
    async fn set_can_sync(&self, value: bool) {
        self.can_sync.send_replace(value);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        self.engine.settle().await.unwrap();
    }

    async fn set_realtime_connected(&self, hub: &LocalRealtimeHub, value: bool) {
        hub.set_connected(value);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        self.engine.settle().await.unwrap();
    }

    async fn settle(&self) {
        self.engine.settle().await.unwrap();
    }

    fn ids(&self) -> Vec<String> {
        self.engine.items().into_iter().map(|i| i.id).collect()
    }

    fn item(&self, id: &str) -> Option<Item> {
        self.engine.items().into_iter().find(|i| i.id == id)
    }
}

fn fixture(id: &str, text: &str) -> Item {
    ItemDraft::new(text)
        .into_item(id.to_string(), Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap())
        .unwrap()
}

fn text_patch(text: &str) -> ItemPatch {
    ItemPatch {
        text: Some(text.to_string()),
        ..ItemPatch::default()
    }
}

async fn wait_for_calls(remote: &FakeRemote, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while remote.calls().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("remote calls did not arrive");
}

async fn wait_for_items(client: &Client, count: usize) {
    let mut rx = client.engine.subscribe_items();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|items| items.len() == count))
        .await
        .expect("items did not converge")
        .unwrap();
}

fn harness() -> (Arc<MemoryKeyValueStore>, Arc<FakeRemote>, Arc<LocalRealtimeHub>) {
    (
        Arc::new(MemoryKeyValueStore::new()),
        FakeRemote::new(),
        Arc::new(LocalRealtimeHub::default()),
    )
}

#[tokio::test]
async fn online_add_is_confirmed_and_broadcast() {
    let (store, remote, hub) = harness();
    let mut events = hub.subscribe();
    let client = Client::start(&store, &remote, &hub, true).await;

    let item = client
        .engine
        .add(ItemDraft::new("Buy milk").with_tag("groceries"))
        .await
        .unwrap();
    client.settle().await;

    assert_eq!(remote.calls(), vec![format!("create:{}", item.id)]);
    assert_eq!(client.ids(), vec![item.id.clone()]);
    assert_eq!(
        client.engine.sync_state(&item.id).await.unwrap(),
        Some(ItemSyncState::Confirmed)
    );
    assert!(client.engine.pending_actions().await.unwrap().is_empty());

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), RemoteEventKind::Add);
    assert_eq!(event.item_id(), item.id);
}

#[tokio::test]
async fn invalid_draft_is_rejected_before_queueing() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;

    let err = client.engine.add(ItemDraft::new("   ")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidItem(_)));
    client.settle().await;
    assert!(client.engine.items().is_empty());
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn offline_add_survives_restart_and_drains() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;

    let item = client.engine.add(ItemDraft::new("Write report")).await.unwrap();
    client.settle().await;
    assert_eq!(
        client.engine.sync_state(&item.id).await.unwrap(),
        Some(ItemSyncState::PendingLocal)
    );
    assert_eq!(client.engine.pending_actions().await.unwrap().len(), 1);
    assert!(remote.calls().is_empty());
    client.engine.shutdown().await;

    let restarted = Client::start(&store, &remote, &hub, false).await;
    assert_eq!(restarted.ids(), vec![item.id.clone()]);
    assert_eq!(restarted.engine.pending_actions().await.unwrap().len(), 1);

    restarted.set_can_sync(true).await;
    assert_eq!(remote.calls(), vec![format!("create:{}", item.id)]);
    assert!(restarted.engine.pending_actions().await.unwrap().is_empty());
    assert!(remote.server_item(&item.id).is_some());
    restarted.engine.shutdown().await;

    let cold = Client::start(&store, &remote, &hub, false).await;
    assert!(cold.engine.pending_actions().await.unwrap().is_empty());
    assert_eq!(cold.ids(), vec![item.id]);
}

#[tokio::test]
async fn remote_add_is_idempotent() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;

    let mine = client.engine.add(ItemDraft::new("Mine")).await.unwrap();
    client.settle().await;
    let confirmed = client.item(&mine.id).unwrap();
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(confirmed))
        .await
        .unwrap();

    let theirs = fixture("remote-1", "Theirs");
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(theirs.clone()))
        .await
        .unwrap();
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(theirs))
        .await
        .unwrap();
    client.settle().await;

    assert_eq!(client.ids(), vec!["remote-1".to_string(), mine.id]);
}

#[tokio::test]
async fn drain_replays_queue_in_order() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;
    let b = client.engine.add(ItemDraft::new("b")).await.unwrap();
    client.settle().await;

    client.set_can_sync(false).await;
    let a = client.engine.add(ItemDraft::new("a")).await.unwrap();
    client.engine.toggle_done(&a.id).await.unwrap();
    assert!(client.engine.delete(&b.id).await.unwrap());
    client.settle().await;
    assert_eq!(remote.calls().len(), 1);
    assert_eq!(
        client.engine.sync_state(&b.id).await.unwrap(),
        Some(ItemSyncState::Tombstoned)
    );

    client.set_can_sync(true).await;
    assert_eq!(
        remote.calls(),
        vec![
            format!("create:{}", b.id),
            format!("create:{}", a.id),
            format!("update:{}", a.id),
            format!("remove:{}", b.id),
        ]
    );
    assert!(remote.server_item(&a.id).unwrap().done);
    assert!(remote.server_item(&b.id).is_none());
    assert_eq!(client.ids(), vec![a.id]);
    assert_eq!(client.engine.sync_state(&b.id).await.unwrap(), None);
}

#[tokio::test]
async fn pending_local_update_beats_remote_update() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let x = fixture("x", "server text");
    remote.seed(x.clone());
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(x.clone()))
        .await
        .unwrap();
    client.engine.toggle_done("x").await.unwrap();

    let mut newer = x.clone();
    newer.text = "someone else".to_string();
    newer.updated_at = Some(Utc::now() + ChronoDuration::days(1));
    client
        .engine
        .handle_remote_event(RemoteEvent::Update(newer))
        .await
        .unwrap();
    client.settle().await;

    let local = client.item("x").unwrap();
    assert!(local.done);
    assert_eq!(local.text, "server text");

    client.set_can_sync(true).await;
    assert_eq!(remote.calls(), vec!["update:x".to_string()]);
    let local = client.item("x").unwrap();
    assert!(local.done);
    assert_eq!(local.text, "server text");
}

#[tokio::test]
async fn local_delete_suppresses_late_remote_events() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let x = fixture("x", "doomed");
    remote.seed(x.clone());
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(x.clone()))
        .await
        .unwrap();
    assert!(client.engine.delete("x").await.unwrap());

    client
        .engine
        .handle_remote_event(RemoteEvent::Update(x.clone()))
        .await
        .unwrap();
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(x))
        .await
        .unwrap();
    client.settle().await;
    assert!(client.engine.items().is_empty());

    client.set_can_sync(true).await;
    assert_eq!(remote.calls(), vec!["remove:x".to_string()]);
    assert!(client.engine.items().is_empty());
    assert!(remote.server_item("x").is_none());
}

#[tokio::test]
async fn concurrent_adds_from_two_clients_converge() {
    let remote = FakeRemote::new();
    let hub = Arc::new(LocalRealtimeHub::default());
    let store_a = Arc::new(MemoryKeyValueStore::new());
    let store_b = Arc::new(MemoryKeyValueStore::new());
    let client_a = Client::start(&store_a, &remote, &hub, true).await;
    let client_b = Client::start(&store_b, &remote, &hub, true).await;

    let (from_a, from_b) = tokio::join!(
        client_a.engine.add(ItemDraft::new("from a")),
        client_b.engine.add(ItemDraft::new("from b")),
    );
    let (from_a, from_b) = (from_a.unwrap(), from_b.unwrap());

    wait_for_items(&client_a, 2).await;
    wait_for_items(&client_b, 2).await;
    client_a.settle().await;
    client_b.settle().await;

    let mut ids_a = client_a.ids();
    let mut ids_b = client_b.ids();
    ids_a.sort();
    ids_b.sort();
    assert_eq!(ids_a, ids_b);
    assert!(ids_a.contains(&from_a.id));
    assert!(ids_a.contains(&from_b.id));
}

#[tokio::test]
async fn retryable_failure_stays_queued_and_rejection_is_dropped() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let a = client.engine.add(ItemDraft::new("a")).await.unwrap();
    let b = client.engine.add(ItemDraft::new("b")).await.unwrap();

    remote.fail_next(FailMode::Offline);
    remote.fail_next(FailMode::Reject);
    client.set_can_sync(true).await;

    let pending = client.engine.pending_actions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item_id(), a.id);
    assert_eq!(pending[0].retry_count, 1);
    assert!(pending[0].last_error.is_some());
    // rejected add stays visible as a local-only item
    assert!(client.item(&b.id).is_some());
    assert_eq!(client.engine.sync_state(&b.id).await.unwrap(), Some(ItemSyncState::Confirmed));

    let report = client.engine.sync_now().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.confirmed, 1);
    assert!(client.engine.pending_actions().await.unwrap().is_empty());
    assert!(remote.server_item(&a.id).is_some());
    assert!(remote.server_item(&b.id).is_none());
}

#[tokio::test]
async fn failed_add_holds_back_later_actions_for_same_item() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let a = client.engine.add(ItemDraft::new("a")).await.unwrap();
    client.engine.toggle_done(&a.id).await.unwrap();

    remote.fail_next(FailMode::Offline);
    client.set_can_sync(true).await;
    assert_eq!(remote.calls(), vec![format!("create:{}", a.id)]);

    let pending = client.engine.pending_actions().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].action.kind(), RemoteEventKind::Add);
    assert_eq!(pending[1].action.kind(), RemoteEventKind::Update);
    assert!(pending.iter().all(|entry| entry.retry_count == 1));

    let report = client.engine.sync_now().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.confirmed, 2);
    assert!(remote.server_item(&a.id).unwrap().done);
    assert_eq!(
        client.engine.sync_state(&a.id).await.unwrap(),
        Some(ItemSyncState::Confirmed)
    );
}

#[tokio::test]
async fn late_response_does_not_regress_newer_edit() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;
    let a = client.engine.add(ItemDraft::new("draft")).await.unwrap();
    client.settle().await;

    remote.hold_responses();
    client.engine.edit(&a.id, text_patch("first")).await.unwrap();
    client.engine.edit(&a.id, text_patch("second")).await.unwrap();
    wait_for_calls(&remote, 2).await;
    assert_eq!(client.item(&a.id).unwrap().text, "second");

    remote.release(1);
    wait_for_calls(&remote, 3).await;
    assert_eq!(client.item(&a.id).unwrap().text, "second");
    assert_eq!(
        client.engine.sync_state(&a.id).await.unwrap(),
        Some(ItemSyncState::PendingLocal)
    );

    remote.release(1);
    client.settle().await;
    assert_eq!(client.item(&a.id).unwrap().text, "second");
    assert_eq!(remote.server_item(&a.id).unwrap().text, "second");
    assert_eq!(
        client.engine.sync_state(&a.id).await.unwrap(),
        Some(ItemSyncState::Confirmed)
    );
}

#[tokio::test]
async fn actions_enqueued_mid_drain_get_a_follow_up_cycle() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let a = client.engine.add(ItemDraft::new("a")).await.unwrap();

    remote.hold_responses();
    client.can_sync.send_replace(true);
    wait_for_calls(&remote, 1).await;

    client.engine.toggle_done(&a.id).await.unwrap();
    assert_eq!(client.engine.pending_actions().await.unwrap().len(), 2);

    remote.release(2);
    client.settle().await;
    assert_eq!(
        remote.calls(),
        vec![format!("create:{}", a.id), format!("update:{}", a.id)]
    );
    assert!(client.engine.pending_actions().await.unwrap().is_empty());
    assert!(client.item(&a.id).unwrap().done);
}

#[tokio::test]
async fn refresh_merges_remote_collection_with_pending_local() {
    let (store, remote, hub) = harness();
    let s1 = fixture("s1", "server one");
    let s2 = fixture("s2", "server two");
    remote.seed(s1.clone());
    remote.seed(s2);

    let client = Client::start_with(&store, &remote, &hub, false, true).await;
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(s1))
        .await
        .unwrap();
    client.engine.toggle_done("s1").await.unwrap();
    let local = client.engine.add(ItemDraft::new("local")).await.unwrap();

    remote.fail_next(FailMode::Offline);
    remote.fail_next(FailMode::Offline);
    client.set_can_sync(true).await;

    assert_eq!(remote.calls().last().map(String::as_str), Some("list"));
    assert_eq!(
        client.ids(),
        vec![local.id.clone(), "s1".to_string(), "s2".to_string()]
    );
    assert!(client.item("s1").unwrap().done);
    assert!(!remote.server_item("s1").unwrap().done);

    assert_eq!(client.engine.refresh().await.unwrap(), 3);
}

#[tokio::test]
async fn failed_refresh_keeps_cached_items() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(fixture("c", "cached")))
        .await
        .unwrap();
    client.set_can_sync(true).await;

    remote.fail_next(FailMode::Offline);
    assert!(client.engine.refresh().await.is_err());
    assert_eq!(client.ids(), vec!["c".to_string()]);
}

#[tokio::test]
async fn unknown_ids_are_ignored() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;

    assert!(client.engine.toggle_done("nope").await.unwrap().is_none());
    assert!(!client.engine.delete("nope").await.unwrap());
    assert!(!client.engine.move_item("nope", 0).await.unwrap());
    client.settle().await;
    assert!(remote.calls().is_empty());
    assert!(client.engine.pending_actions().await.unwrap().is_empty());
}

#[tokio::test]
async fn update_of_remotely_deleted_item_removes_it_locally() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(fixture("gone", "deleted elsewhere")))
        .await
        .unwrap();

    client.engine.toggle_done("gone").await.unwrap();
    client.settle().await;

    assert_eq!(remote.calls(), vec!["update:gone".to_string()]);
    assert!(client.engine.items().is_empty());
    assert!(client.engine.pending_actions().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_of_missing_remote_item_counts_as_confirmed() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(fixture("x", "x")))
        .await
        .unwrap();
    client.engine.delete("x").await.unwrap();

    remote.fail_next(FailMode::NotFound);
    client.set_can_sync(true).await;
    assert_eq!(remote.calls(), vec!["remove:x".to_string()]);
    assert!(client.engine.pending_actions().await.unwrap().is_empty());
    assert_eq!(client.engine.sync_state("x").await.unwrap(), None);
}

#[tokio::test]
async fn move_item_reorders_locally_only() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;
    let a = client.engine.add(ItemDraft::new("a")).await.unwrap();
    let b = client.engine.add(ItemDraft::new("b")).await.unwrap();
    let c = client.engine.add(ItemDraft::new("c")).await.unwrap();
    client.settle().await;
    assert_eq!(client.ids(), vec![c.id.clone(), b.id.clone(), a.id.clone()]);
    let calls = remote.calls().len();

    assert!(client.engine.move_item(&a.id, 0).await.unwrap());
    assert!(client.engine.move_item(&c.id, 99).await.unwrap());
    client.settle().await;

    let expected = vec![a.id.clone(), b.id.clone(), c.id.clone()];
    assert_eq!(client.ids(), expected);
    assert_eq!(remote.calls().len(), calls);
    client.engine.shutdown().await;

    let restarted = Client::start(&store, &remote, &hub, false).await;
    assert_eq!(restarted.ids(), expected);
}

#[tokio::test]
async fn sync_and_refresh_require_connectivity() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;

    assert!(matches!(
        client.engine.sync_now().await,
        Err(Error::NetworkUnavailable(_))
    ));
    assert!(matches!(
        client.engine.refresh().await,
        Err(Error::NetworkUnavailable(_))
    ));
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn stale_remote_update_is_ignored() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let mut x = fixture("x", "current");
    let t = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    x.updated_at = Some(t);
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(x.clone()))
        .await
        .unwrap();

    let mut stale = x.clone();
    stale.text = "stale".to_string();
    stale.updated_at = Some(t - ChronoDuration::hours(1));
    client
        .engine
        .handle_remote_event(RemoteEvent::Update(stale))
        .await
        .unwrap();
    client.settle().await;
    assert_eq!(client.item("x").unwrap().text, "current");

    let mut fresh = x;
    fresh.text = "fresh".to_string();
    fresh.updated_at = Some(t + ChronoDuration::hours(1));
    client
        .engine
        .handle_remote_event(RemoteEvent::Update(fresh))
        .await
        .unwrap();
    client.settle().await;
    assert_eq!(client.item("x").unwrap().text, "fresh");
}

#[tokio::test]
async fn remote_delete_removes_confirmed_item() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    client
        .engine
        .handle_remote_event(RemoteEvent::Add(fixture("x", "x")))
        .await
        .unwrap();
    client
        .engine
        .handle_remote_event(RemoteEvent::Delete("x".to_string()))
        .await
        .unwrap();
    client
        .engine
        .handle_remote_event(RemoteEvent::Delete("missing".to_string()))
        .await
        .unwrap();
    client.settle().await;
    assert!(client.engine.items().is_empty());
    client.engine.shutdown().await;

    let restarted = Client::start(&store, &remote, &hub, false).await;
    assert!(restarted.engine.items().is_empty());
}

#[tokio::test]
async fn unanswered_online_actions_survive_shutdown() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;

    remote.hold_responses();
    let x = client.engine.add(ItemDraft::new("x")).await.unwrap();
    let y = client.engine.add(ItemDraft::new("y")).await.unwrap();
    wait_for_calls(&remote, 1).await;
    client.engine.shutdown().await;

    let restarted = Client::start(&store, &remote, &hub, false).await;
    let pending: Vec<String> = restarted
        .engine
        .pending_actions()
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.item_id().to_string())
        .collect();
    assert_eq!(pending, vec![x.id.clone(), y.id.clone()]);
    assert_eq!(
        restarted.engine.sync_state(&x.id).await.unwrap(),
        Some(ItemSyncState::PendingLocal)
    );

    // the stale request from the first session may land too
    remote.release(3);
    restarted.set_can_sync(true).await;
    assert!(restarted.engine.pending_actions().await.unwrap().is_empty());
    assert!(remote.server_item(&x.id).is_some());
    assert!(remote.server_item(&y.id).is_some());
    assert_eq!(
        restarted.engine.sync_state(&y.id).await.unwrap(),
        Some(ItemSyncState::Confirmed)
    );
}

#[tokio::test]
async fn unreadable_response_keeps_action_queued() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;

    remote.fail_next(FailMode::Malformed);
    let item = client.engine.add(ItemDraft::new("Pay rent")).await.unwrap();
    client.settle().await;

    let pending = client.engine.pending_actions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item_id(), item.id);
    assert_eq!(
        client.engine.sync_state(&item.id).await.unwrap(),
        Some(ItemSyncState::PendingLocal)
    );

    let report = client.engine.sync_now().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert!(remote.server_item(&item.id).is_some());
}

#[tokio::test]
async fn changes_made_while_offline_appear_after_reconnect() {
    let (store, remote, hub) = harness();
    let client = Client::start_with(&store, &remote, &hub, true, true).await;
    client.settle().await;
    assert_eq!(remote.calls(), vec!["list".to_string()]);

    client.set_can_sync(false).await;
    // written by another client while this one could not hear about it
    remote.seed(fixture("elsewhere", "added elsewhere"));
    client.set_can_sync(true).await;

    assert_eq!(remote.calls(), vec!["list".to_string(), "list".to_string()]);
    assert_eq!(client.ids(), vec!["elsewhere".to_string()]);
}

#[tokio::test]
async fn realtime_reconnect_triggers_resync() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, true).await;

    remote.seed(fixture("r1", "missed while the socket was down"));
    client.set_realtime_connected(&hub, false).await;
    client.set_realtime_connected(&hub, true).await;
    assert_eq!(client.ids(), vec!["r1".to_string()]);

    // a reconnect while sync is unavailable is remembered for the next edge
    client.set_can_sync(false).await;
    remote.seed(fixture("r2", "also missed"));
    client.set_realtime_connected(&hub, false).await;
    client.set_realtime_connected(&hub, true).await;
    assert_eq!(remote.calls(), vec!["list".to_string()]);

    client.set_can_sync(true).await;
    assert_eq!(remote.calls(), vec!["list".to_string(), "list".to_string()]);
    let mut ids = client.ids();
    ids.sort();
    assert_eq!(ids, vec!["r1".to_string(), "r2".to_string()]);
}

#[tokio::test]
async fn retryable_failure_waits_for_next_transition() {
    let (store, remote, hub) = harness();
    let client = Client::start(&store, &remote, &hub, false).await;
    let a = client.engine.add(ItemDraft::new("a")).await.unwrap();

    remote.hold_responses();
    remote.fail_next(FailMode::Offline);
    client.can_sync.send_replace(true);
    wait_for_calls(&remote, 1).await;

    // appended mid-drain, so the cycle ends with new work queued
    client.engine.toggle_done(&a.id).await.unwrap();
    remote.release(1);
    client.settle().await;

    assert_eq!(remote.calls(), vec![format!("create:{}", a.id)]);
    let pending = client.engine.pending_actions().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].retry_count, 1);

    remote.release(2);
    client.set_can_sync(false).await;
    client.set_can_sync(true).await;
    assert_eq!(
        remote.calls(),
        vec![
            format!("create:{}", a.id),
            format!("create:{}", a.id),
            format!("update:{}", a.id),
        ]
    );
    assert!(client.engine.pending_actions().await.unwrap().is_empty());
    assert!(remote.server_item(&a.id).unwrap().done);
}
