//! Local-first entity writes that always leave a queue trail.

use crate::model::{Entity, EntityType};
use crate::queue::{Result, SyncOperation, SyncQueue, SyncQueueItem};
use crate::store::{LocalChange, LocalStore};
use chrono::Utc;
use std::sync::Arc;

/// Reads go straight to the local store; writes are recorded with a queue
/// item in the same commit so the remote store eventually sees them.
pub struct OfflineRepository<L: LocalStore> {
    queue: SyncQueue<L>,
    local: Arc<L>,
}

impl<L: LocalStore> OfflineRepository<L> {
    pub fn new(queue: SyncQueue<L>, local: Arc<L>) -> Self {
        Self { queue, local }
    }

    /// Store a new entity, stamping its creation time.
    pub async fn create(&self, mut entity: Entity) -> Result<Entity> {
        entity.stamp_created(Utc::now());
        self.write(SyncOperation::Create, entity).await
    }

    /// Replace an entity, stamping its modification time.
    pub async fn update(&self, mut entity: Entity) -> Result<Entity> {
        entity.touch(Utc::now());
        self.write(SyncOperation::Update, entity).await
    }

    pub async fn delete(&self, user_id: &str, entity_type: EntityType, id: &str) -> Result<()> {
        let item = SyncQueueItem::for_delete(entity_type, id, user_id);
        let change = LocalChange::Delete {
            entity_type,
            id: id.to_string(),
        };
        self.queue.record(change, item).await?;
        Ok(())
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        Ok(self.local.get(entity_type, id).await?)
    }

    pub async fn list(&self, entity_type: EntityType, user_id: &str) -> Result<Vec<Entity>> {
        Ok(self.local.get_all(entity_type, user_id).await?)
    }

    async fn write(&self, operation: SyncOperation, entity: Entity) -> Result<Entity> {
        let item = SyncQueueItem::for_entity(operation, &entity);
        self.queue
            .record(LocalChange::Put(entity.clone()), item)
            .await?;
        Ok(entity)
    }
}
