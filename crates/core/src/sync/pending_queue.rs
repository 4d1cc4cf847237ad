//! Append-only, FIFO, durable log of unconfirmed mutations.

use log::debug;

use super::sync_model::QueuedAction;
use crate::errors::Result;
use crate::storage::DurableCache;

/// Pending action queue.
///
/// Entries are only ever appended. Removal happens as a whole-cycle commit
/// once a drain cycle has processed its snapshot: the drained prefix is
/// replaced by the entries that cycle retained, and anything appended during
/// the cycle stays behind them.
pub struct PendingActionQueue {
    entries: Vec<QueuedAction>,
    cache: DurableCache,
}

impl PendingActionQueue {
    /// Load the persisted queue.
    pub async fn load(cache: DurableCache) -> Result<Self> {
        let entries = cache.load_queue().await?;
        Ok(Self { entries, cache })
    }

    /// Append an action and persist the queue.
    ///
    /// The entry is kept in memory even if persisting fails, so the action
    /// is still retried this session.
    pub async fn enqueue(&mut self, entry: QueuedAction) -> Result<()> {
        debug!(
            "[TodoSync] Enqueue {:?} for item {} (event {})",
            entry.action.kind(),
            entry.item_id(),
            entry.event_id
        );
        self.entries.push(entry);
        self.persist().await
    }

    /// Put actions that were in flight when the process stopped back at the
    /// front, in their original order. Entries already queued are skipped.
    pub async fn restore_in_flight(&mut self, in_flight: Vec<QueuedAction>) -> Result<()> {
        let mut restored: Vec<QueuedAction> = in_flight
            .into_iter()
            .filter(|entry| {
                !self
                    .entries
                    .iter()
                    .any(|queued| queued.event_id == entry.event_id)
            })
            .collect();
        if restored.is_empty() {
            return Ok(());
        }
        debug!(
            "[TodoSync] Requeued {} actions left in flight by the previous session",
            restored.len()
        );
        restored.append(&mut self.entries);
        self.entries = restored;
        self.persist().await
    }

    pub fn peek_all(&self) -> &[QueuedAction] {
        &self.entries
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.cache.clear_queue().await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_item(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.item_id() == id)
    }

    /// Commit a finished drain cycle that started from the first `drained` entries.
    pub async fn complete_drain(
        &mut self,
        drained: usize,
        retained: Vec<QueuedAction>,
    ) -> Result<()> {
        let drained = drained.min(self.entries.len());
        let appended = self.entries.split_off(drained);
        self.entries = retained;
        self.entries.extend(appended);
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        self.cache.store_queue(&self.entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use crate::sync::PendingAction;
    use std::sync::Arc;

    fn delete(id: &str) -> QueuedAction {
        QueuedAction::new(PendingAction::Delete { id: id.to_string() })
    }

    fn ids(queue: &PendingActionQueue) -> Vec<String> {
        queue
            .peek_all()
            .iter()
            .map(|e| e.item_id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn enqueue_is_fifo_and_durable() {
        let cache = DurableCache::new(Arc::new(MemoryKeyValueStore::new()));
        let mut queue = PendingActionQueue::load(cache.clone()).await.unwrap();
        queue.enqueue(delete("a")).await.unwrap();
        queue.enqueue(delete("b")).await.unwrap();
        queue.enqueue(delete("c")).await.unwrap();
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);

        let reloaded = PendingActionQueue::load(cache).await.unwrap();
        assert_eq!(ids(&reloaded), vec!["a", "b", "c"]);
        assert!(reloaded.contains_item("b"));
        assert!(!reloaded.contains_item("z"));
    }

    #[tokio::test]
    async fn complete_drain_keeps_retained_ahead_of_appended() {
        let cache = DurableCache::new(Arc::new(MemoryKeyValueStore::new()));
        let mut queue = PendingActionQueue::load(cache.clone()).await.unwrap();
        for id in ["a", "b", "c"] {
            queue.enqueue(delete(id)).await.unwrap();
        }
        let snapshot = queue.peek_all().to_vec();

        // appended while the cycle was running
        queue.enqueue(delete("d")).await.unwrap();

        let mut retained = snapshot[1].clone();
        retained.record_failure("offline");
        queue
            .complete_drain(snapshot.len(), vec![retained])
            .await
            .unwrap();

        assert_eq!(ids(&queue), vec!["b", "d"]);
        assert_eq!(queue.peek_all()[0].retry_count, 1);
        let reloaded = PendingActionQueue::load(cache).await.unwrap();
        assert_eq!(ids(&reloaded), vec!["b", "d"]);
    }

    #[tokio::test]
    async fn in_flight_actions_go_back_to_the_front() {
        let cache = DurableCache::new(Arc::new(MemoryKeyValueStore::new()));
        let mut queue = PendingActionQueue::load(cache.clone()).await.unwrap();
        let sent = delete("a");
        queue.enqueue(delete("b")).await.unwrap();
        queue.enqueue(sent.clone()).await.unwrap();

        // "a" was both in flight and already requeued after a failure
        queue
            .restore_in_flight(vec![delete("x"), sent])
            .await
            .unwrap();
        assert_eq!(ids(&queue), vec!["x", "b", "a"]);

        let reloaded = PendingActionQueue::load(cache).await.unwrap();
        assert_eq!(ids(&reloaded), vec!["x", "b", "a"]);
    }

    #[tokio::test]
    async fn clear_empties_durable_copy() {
        let cache = DurableCache::new(Arc::new(MemoryKeyValueStore::new()));
        let mut queue = PendingActionQueue::load(cache.clone()).await.unwrap();
        queue.enqueue(delete("a")).await.unwrap();
        queue.clear().await.unwrap();
        assert!(queue.is_empty());
        assert!(PendingActionQueue::load(cache).await.unwrap().is_empty());
    }
}
