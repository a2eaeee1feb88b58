//! Durable, ordered log of local mutations not yet confirmed remotely.
//!
//! Items are persisted through the `LocalStore`, so a queue survives restarts.
//! Status transitions are serialized through a lock shared by every clone of
//! a `SyncQueue` handle, which keeps two drains from claiming the same item.

use crate::model::{Entity, EntityType};
use crate::store::{LocalChange, LocalStore, StoreError};
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("Queue item {id} is {status:?}, cannot move to {target:?}")]
    InvalidTransition {
        id: String,
        status: QueueStatus,
        target: QueueStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Kind of mutation to replay remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for the next drain
    Pending,
    /// Claimed by a running drain
    InFlight,
    /// Last attempt failed, will be retried
    Failed,
    /// Retry budget exhausted; kept for the user to inspect or requeue
    Terminal,
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Queue entry id (distinct from the entity id)
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Owner of the mutated entity
    pub user_id: String,
    pub operation: SyncOperation,
    /// Entity snapshot for create/update; absent for delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Entity>,
    pub status: QueueStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// Create or update item carrying a snapshot of `entity`.
    pub fn for_entity(operation: SyncOperation, entity: &Entity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity.entity_type(),
            entity_id: entity.id().to_string(),
            user_id: entity.user_id().to_string(),
            operation,
            payload: Some(entity.clone()),
            status: QueueStatus::Pending,
            timestamp: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Delete item; carries no payload.
    pub fn for_delete(entity_type: EntityType, entity_id: &str, user_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
            operation: SyncOperation::Delete,
            payload: None,
            status: QueueStatus::Pending,
            timestamp: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Whether a drain should pick this item up.
    pub fn is_drainable(&self) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Failed)
    }
}

/// Item counts for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Not yet confirmed and still retryable
    pub pending: usize,
    /// Gave up retrying
    pub terminal: usize,
}

/// Handle to the sync queue. Cheap to clone; clones share state.
pub struct SyncQueue<L: LocalStore> {
    store: Arc<L>,
    transitions: Arc<Mutex<()>>,
}

impl<L: LocalStore> Clone for SyncQueue<L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transitions: Arc::clone(&self.transitions),
        }
    }
}

impl<L: LocalStore> SyncQueue<L> {
    pub fn new(store: Arc<L>) -> Self {
        Self {
            store,
            transitions: Arc::new(Mutex::new(())),
        }
    }

    /// Append an item with status pending.
    ///
    /// A persistence failure is returned to the caller; the item is then not
    /// queued and nothing retries it.
    pub async fn enqueue(&self, mut item: SyncQueueItem) -> Result<SyncQueueItem> {
        item.status = QueueStatus::Pending;
        self.store.put_queue_item(&item).await?;
        debug!(
            "Enqueued {:?} {} {} ({})",
            item.operation, item.entity_type, item.entity_id, item.id
        );
        Ok(item)
    }

    /// Apply a local change and enqueue its item as one unit.
    pub async fn record(
        &self,
        change: LocalChange,
        mut item: SyncQueueItem,
    ) -> Result<SyncQueueItem> {
        item.status = QueueStatus::Pending;
        self.store.commit(change, &item).await?;
        debug!(
            "Recorded {:?} {} {} ({})",
            item.operation, item.entity_type, item.entity_id, item.id
        );
        Ok(item)
    }

    /// Remove a confirmed item. Removing an unknown id is a no-op.
    pub async fn dequeue(&self, item_id: &str) -> Result<()> {
        let _guard = self.transitions.lock().await;
        if !self.store.remove_queue_item(item_id).await? {
            debug!("Dequeue of unknown item {}", item_id);
        }
        Ok(())
    }

    /// Pending and failed items, oldest first. Ties keep enqueue order.
    pub async fn list_pending(&self) -> Result<Vec<SyncQueueItem>> {
        let mut items: Vec<_> = self
            .store
            .queue_items()
            .await?
            .into_iter()
            .filter(SyncQueueItem::is_drainable)
            .collect();
        items.sort_by_key(|i| i.timestamp);
        Ok(items)
    }

    /// Pending and failed items owned by `user_id`, oldest first.
    pub async fn list_pending_for(&self, user_id: &str) -> Result<Vec<SyncQueueItem>> {
        let mut items = self.list_pending().await?;
        items.retain(|i| i.user_id == user_id);
        Ok(items)
    }

    /// Items that exhausted their retries.
    pub async fn list_terminal(&self) -> Result<Vec<SyncQueueItem>> {
        let mut items: Vec<_> = self
            .store
            .queue_items()
            .await?
            .into_iter()
            .filter(|i| i.status == QueueStatus::Terminal)
            .collect();
        items.sort_by_key(|i| i.timestamp);
        Ok(items)
    }

    /// Every item regardless of status, in enqueue order.
    pub async fn list_all(&self) -> Result<Vec<SyncQueueItem>> {
        Ok(self.store.queue_items().await?)
    }

    pub async fn counts(&self, user_id: &str) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for item in self.store.queue_items().await? {
            if item.user_id != user_id {
                continue;
            }
            match item.status {
                QueueStatus::Terminal => counts.terminal += 1,
                _ => counts.pending += 1,
            }
        }
        Ok(counts)
    }

    /// Claim an item for dispatch.
    ///
    /// Fails if the item is already in flight or terminal.
    pub async fn mark_in_flight(&self, item_id: &str) -> Result<SyncQueueItem> {
        self.transition(item_id, |item| {
            if !item.is_drainable() {
                return Err(QueueError::InvalidTransition {
                    id: item.id.clone(),
                    status: item.status,
                    target: QueueStatus::InFlight,
                });
            }
            item.status = QueueStatus::InFlight;
            Ok(())
        })
        .await
    }

    /// Record a failed attempt.
    ///
    /// Increments the retry count; once it reaches `retry_limit` the item goes
    /// terminal instead of failed. `None` never goes terminal.
    pub async fn mark_failed(
        &self,
        item_id: &str,
        reason: &str,
        retry_limit: Option<u32>,
    ) -> Result<SyncQueueItem> {
        self.transition(item_id, |item| {
            item.retry_count += 1;
            item.last_error = Some(reason.to_string());
            item.status = match retry_limit {
                Some(max) if item.retry_count >= max => QueueStatus::Terminal,
                _ => QueueStatus::Failed,
            };
            Ok(())
        })
        .await
    }

    /// Return an in-flight item to pending without counting a retry.
    pub async fn release(&self, item_id: &str) -> Result<SyncQueueItem> {
        self.transition(item_id, |item| {
            if item.status == QueueStatus::InFlight {
                item.status = QueueStatus::Pending;
            }
            Ok(())
        })
        .await
    }

    /// Give a terminal item a fresh retry budget.
    pub async fn requeue(&self, item_id: &str) -> Result<SyncQueueItem> {
        self.transition(item_id, |item| {
            if item.status != QueueStatus::Terminal {
                return Err(QueueError::InvalidTransition {
                    id: item.id.clone(),
                    status: item.status,
                    target: QueueStatus::Pending,
                });
            }
            item.status = QueueStatus::Pending;
            item.retry_count = 0;
            Ok(())
        })
        .await
    }

    /// Reset items left in flight by an interrupted drain.
    ///
    /// Only call while no drain is running.
    pub async fn reset_in_flight(&self) -> Result<usize> {
        let _guard = self.transitions.lock().await;
        let mut reset = 0;
        for mut item in self.store.queue_items().await? {
            if item.status == QueueStatus::InFlight {
                item.status = QueueStatus::Pending;
                self.store.put_queue_item(&item).await?;
                reset += 1;
            }
        }
        if reset > 0 {
            debug!("Recovered {} in-flight queue item(s)", reset);
        }
        Ok(reset)
    }

    async fn transition(
        &self,
        item_id: &str,
        apply: impl FnOnce(&mut SyncQueueItem) -> Result<()>,
    ) -> Result<SyncQueueItem> {
        let _guard = self.transitions.lock().await;
        let mut item = self
            .store
            .get_queue_item(item_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(item_id.to_string()))?;
        apply(&mut item)?;
        self.store.put_queue_item(&item).await?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{at, gift};
    use crate::store::InMemoryLocalStore;

    fn queue() -> (Arc<InMemoryLocalStore>, SyncQueue<InMemoryLocalStore>) {
        let store = Arc::new(InMemoryLocalStore::new());
        (Arc::clone(&store), SyncQueue::new(store))
    }

    fn item_at(id: &str, secs: i64) -> SyncQueueItem {
        let mut item = SyncQueueItem::for_entity(SyncOperation::Update, &gift(id, "u1", id, secs));
        item.timestamp = at(secs);
        item
    }

    #[tokio::test]
    async fn test_list_pending_orders_by_timestamp() {
        let (_, queue) = queue();
        queue.enqueue(item_at("late", 30)).await.unwrap();
        queue.enqueue(item_at("early", 10)).await.unwrap();
        queue.enqueue(item_at("middle", 20)).await.unwrap();

        let ids: Vec<_> = queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.entity_id)
            .collect();
        assert_eq!(ids, vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_list_pending_keeps_enqueue_order_on_ties() {
        let (_, queue) = queue();
        let create = item_at("g1", 10);
        let mut delete = SyncQueueItem::for_delete(EntityType::Gift, "g1", "u1");
        delete.timestamp = at(10);

        queue.enqueue(create).await.unwrap();
        queue.enqueue(delete).await.unwrap();

        let ops: Vec<_> = queue
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.operation)
            .collect();
        assert_eq!(ops, vec![SyncOperation::Update, SyncOperation::Delete]);
    }

    #[tokio::test]
    async fn test_in_flight_items_cannot_be_claimed_twice() {
        let (_, queue) = queue();
        let item = queue.enqueue(item_at("g1", 1)).await.unwrap();

        queue.mark_in_flight(&item.id).await.unwrap();
        let err = queue.mark_in_flight(&item.id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        // In-flight items are not listed as pending
        assert!(queue.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_goes_terminal_at_limit() {
        let (_, queue) = queue();
        let item = queue.enqueue(item_at("g1", 1)).await.unwrap();

        let failed = queue.mark_failed(&item.id, "rejected", Some(2)).await.unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(queue.list_pending().await.unwrap().len(), 1);

        let terminal = queue.mark_failed(&item.id, "rejected", Some(2)).await.unwrap();
        assert_eq!(terminal.status, QueueStatus::Terminal);
        assert!(queue.list_pending().await.unwrap().is_empty());
        assert_eq!(queue.list_terminal().await.unwrap().len(), 1);

        let counts = queue.counts("u1").await.unwrap();
        assert_eq!(counts, QueueCounts { pending: 0, terminal: 1 });
    }

    #[tokio::test]
    async fn test_unbounded_failures_never_go_terminal() {
        let (_, queue) = queue();
        let item = queue.enqueue(item_at("g1", 1)).await.unwrap();

        for _ in 0..20 {
            queue.mark_failed(&item.id, "timeout", None).await.unwrap();
        }
        let items = queue.list_pending().await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(items[0].retry_count, 20);
    }

    #[tokio::test]
    async fn test_requeue_resets_retry_budget() {
        let (_, queue) = queue();
        let item = queue.enqueue(item_at("g1", 1)).await.unwrap();
        queue.mark_failed(&item.id, "rejected", Some(1)).await.unwrap();

        let requeued = queue.requeue(&item.id).await.unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.retry_count, 0);

        // Only terminal items can be requeued
        assert!(queue.requeue(&item.id).await.is_err());
    }

    #[tokio::test]
    async fn test_release_and_reset_in_flight() {
        let (_, queue) = queue();
        let a = queue.enqueue(item_at("a", 1)).await.unwrap();
        let b = queue.enqueue(item_at("b", 2)).await.unwrap();
        queue.mark_in_flight(&a.id).await.unwrap();
        queue.mark_in_flight(&b.id).await.unwrap();

        let released = queue.release(&a.id).await.unwrap();
        assert_eq!(released.status, QueueStatus::Pending);
        assert_eq!(released.retry_count, 0);

        assert_eq!(queue.reset_in_flight().await.unwrap(), 1);
        assert_eq!(queue.list_pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_reported() {
        let (store, queue) = queue();
        store.set_fail_writes(true);

        let err = queue.enqueue(item_at("g1", 1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::Io(_))));

        store.set_fail_writes(false);
        assert!(queue.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_removes_item() {
        let (_, queue) = queue();
        let item = queue.enqueue(item_at("g1", 1)).await.unwrap();
        queue.dequeue(&item.id).await.unwrap();
        queue.dequeue(&item.id).await.unwrap();

        assert!(queue.list_all().await.unwrap().is_empty());
        assert!(matches!(
            queue.mark_in_flight(&item.id).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_counts_are_per_user() {
        let (_, queue) = queue();
        queue.enqueue(item_at("g1", 1)).await.unwrap();
        queue
            .enqueue(SyncQueueItem::for_delete(EntityType::Gift, "g9", "someone-else"))
            .await
            .unwrap();

        assert_eq!(queue.counts("u1").await.unwrap().pending, 1);
        assert_eq!(queue.list_pending_for("someone-else").await.unwrap().len(), 1);
    }
}
