//! Cache adapter: the last-known-good collection and the pending queue.

use log::{debug, warn};
use std::sync::Arc;

use super::KeyValueStore;
use crate::constants::{CORRUPT_ENTRY_SUFFIX, IN_FLIGHT_KEY, ITEMS_CACHE_KEY, PENDING_QUEUE_KEY};
use crate::errors::Result;
use crate::items::Item;
use crate::sync::QueuedAction;

/// Passive mirror of engine state over a key-value store.
///
/// Written on every mutation, read once at startup. A corrupt entry is copied
/// to `<key>.corrupt`, logged, and treated as absent so a bad cache never
/// prevents startup.
#[derive(Clone)]
pub struct DurableCache {
    store: Arc<dyn KeyValueStore>,
}

impl DurableCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn load_json<T: serde::de::DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(T::default());
        };
        let parsed = serde_json::from_slice::<T>(&bytes);
        match parsed {
            Ok(value) => Ok(value),
            Err(err) => {
                let backup = format!("{}{}", key, CORRUPT_ENTRY_SUFFIX);
                warn!(
                    "[TodoSync] Ignoring unreadable cache entry '{}' (kept as '{}'): {}",
                    key, backup, err
                );
                self.store.set(&backup, bytes).await?;
                Ok(T::default())
            }
        }
    }

    pub async fn load_items(&self) -> Result<Vec<Item>> {
        let items: Vec<Item> = self.load_json(ITEMS_CACHE_KEY).await?;
        debug!("[TodoSync] Loaded {} cached items", items.len());
        Ok(items)
    }

    pub async fn store_items(&self, items: &[Item]) -> Result<()> {
        self.store
            .set(ITEMS_CACHE_KEY, serde_json::to_vec(items)?)
            .await
    }

    pub async fn load_queue(&self) -> Result<Vec<QueuedAction>> {
        let queue: Vec<QueuedAction> = self.load_json(PENDING_QUEUE_KEY).await?;
        debug!("[TodoSync] Loaded {} queued actions", queue.len());
        Ok(queue)
    }

    pub async fn store_queue(&self, queue: &[QueuedAction]) -> Result<()> {
        if queue.is_empty() {
            return self.clear_queue().await;
        }
        self.store
            .set(PENDING_QUEUE_KEY, serde_json::to_vec(queue)?)
            .await
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.store.remove(PENDING_QUEUE_KEY).await
    }

    /// Actions handed to the remote outside the queue and not yet answered.
    pub async fn load_in_flight(&self) -> Result<Vec<QueuedAction>> {
        self.load_json(IN_FLIGHT_KEY).await
    }

    pub async fn store_in_flight(&self, actions: &[QueuedAction]) -> Result<()> {
        if actions.is_empty() {
            return self.store.remove(IN_FLIGHT_KEY).await;
        }
        self.store
            .set(IN_FLIGHT_KEY, serde_json::to_vec(actions)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::ItemDraft;
    use crate::storage::MemoryKeyValueStore;
    use crate::sync::PendingAction;
    use chrono::Utc;

    #[tokio::test]
    async fn items_and_queue_round_trip_through_store() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cache = DurableCache::new(store.clone());

        let item = ItemDraft::new("water plants")
            .into_item("1".into(), Utc::now())
            .unwrap();
        cache.store_items(&[item.clone()]).await.unwrap();
        cache
            .store_queue(&[QueuedAction::new(PendingAction::Add { item: item.clone() })])
            .await
            .unwrap();

        let reopened = DurableCache::new(store);
        assert_eq!(reopened.load_items().await.unwrap(), vec![item]);
        let queue = reopened.load_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].item_id(), "1");
    }

    #[tokio::test]
    async fn empty_queue_removes_key() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cache = DurableCache::new(store.clone());
        cache
            .store_queue(&[QueuedAction::new(PendingAction::Delete { id: "1".into() })])
            .await
            .unwrap();
        cache.store_queue(&[]).await.unwrap();
        assert!(store.get(PENDING_QUEUE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_entries_load_as_empty() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store
            .set(ITEMS_CACHE_KEY, b"{not json".to_vec())
            .await
            .unwrap();
        let cache = DurableCache::new(store);
        assert!(cache.load_items().await.unwrap().is_empty());
        assert!(cache.load_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_queue_is_kept_aside_before_it_is_replaced() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let garbage = br#"[{"type":"add","todo":"#.to_vec();
        store.set(PENDING_QUEUE_KEY, garbage.clone()).await.unwrap();
        let cache = DurableCache::new(store.clone());

        assert!(cache.load_queue().await.unwrap().is_empty());
        cache
            .store_queue(&[QueuedAction::new(PendingAction::Delete { id: "2".into() })])
            .await
            .unwrap();

        let backup = format!("{}{}", PENDING_QUEUE_KEY, CORRUPT_ENTRY_SUFFIX);
        assert_eq!(store.get(&backup).await.unwrap(), Some(garbage));
    }

    #[tokio::test]
    async fn in_flight_actions_round_trip_and_clear() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cache = DurableCache::new(store.clone());
        cache
            .store_in_flight(&[QueuedAction::new(PendingAction::Delete { id: "7".into() })])
            .await
            .unwrap();
        let loaded = cache.load_in_flight().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].item_id(), "7");

        cache.store_in_flight(&[]).await.unwrap();
        assert!(store.get(IN_FLIGHT_KEY).await.unwrap().is_none());
    }
}
