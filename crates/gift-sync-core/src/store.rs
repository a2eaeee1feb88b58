//! LocalStore trait abstraction for on-device persistence.
//!
//! Implementations:
//! - `InMemoryLocalStore` - For testing
//! - `FileLocalStore` (in gift-sync-daemon) - JSON snapshot on disk
//!
//! A local store holds two things: the entity collections and the sync queue.
//! Keeping both behind one trait lets `commit` write an entity and its queue
//! entry as a single unit.

use crate::model::{Entity, EntityType};
use crate::queue::SyncQueueItem;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Local store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A local mutation recorded together with its queue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    Put(Entity),
    Delete { entity_type: EntityType, id: String },
}

/// On-device persistence for entities and the sync queue.
///
/// Always resolvable without network access.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get one entity by id
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>>;

    /// All entities of a type owned by a user
    async fn get_all(&self, entity_type: EntityType, user_id: &str) -> Result<Vec<Entity>>;

    /// Insert or replace an entity (no queue entry)
    async fn put(&self, entity: &Entity) -> Result<()>;

    /// Remove an entity (no queue entry). Missing ids are not an error.
    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()>;

    /// Apply a change and append its queue item atomically.
    ///
    /// On error neither the change nor the item may be visible.
    async fn commit(&self, change: LocalChange, item: &SyncQueueItem) -> Result<()>;

    /// All queue items in the order they were appended
    async fn queue_items(&self) -> Result<Vec<SyncQueueItem>>;

    async fn get_queue_item(&self, item_id: &str) -> Result<Option<SyncQueueItem>>;

    /// Insert a queue item or replace the one with the same id
    async fn put_queue_item(&self, item: &SyncQueueItem) -> Result<()>;

    /// Remove a queue item. Returns false if it was not present.
    async fn remove_queue_item(&self, item_id: &str) -> Result<bool>;

    /// Store a pulled remote copy unless the local one is newer.
    ///
    /// The comparison and the write happen under one lock, so a local edit
    /// committed concurrently is never replaced by an older remote copy.
    /// Returns whether the remote copy was stored.
    async fn merge_remote(&self, entity: &Entity) -> Result<bool>;
}

/// Whether a pulled remote copy should replace the local one.
///
/// Remote wins when it is strictly newer or on a timestamp tie; identical
/// copies are left alone.
pub fn should_apply_remote(local: Option<&Entity>, remote: &Entity) -> bool {
    match local {
        None => true,
        Some(local) => remote.updated_at() >= local.updated_at() && local != remote,
    }
}

/// Entity collections plus queue, shared by the in-memory and file stores.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub entities: BTreeMap<EntityType, BTreeMap<String, Entity>>,
    #[serde(default)]
    pub queue: Vec<SyncQueueItem>,
}

impl StoreSnapshot {
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.entities.get(&entity_type).and_then(|c| c.get(id))
    }

    pub fn get_all(&self, entity_type: EntityType, user_id: &str) -> Vec<Entity> {
        self.entities
            .get(&entity_type)
            .map(|c| {
                c.values()
                    .filter(|e| e.user_id() == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn put(&mut self, entity: Entity) {
        self.entities
            .entry(entity.entity_type())
            .or_default()
            .insert(entity.id().to_string(), entity);
    }

    pub fn delete(&mut self, entity_type: EntityType, id: &str) {
        if let Some(collection) = self.entities.get_mut(&entity_type) {
            collection.remove(id);
        }
    }

    pub fn merge_remote(&mut self, entity: Entity) -> bool {
        if !should_apply_remote(self.get(entity.entity_type(), entity.id()), &entity) {
            return false;
        }
        self.put(entity);
        true
    }

    pub fn apply(&mut self, change: LocalChange) {
        match change {
            LocalChange::Put(entity) => self.put(entity),
            LocalChange::Delete { entity_type, id } => self.delete(entity_type, &id),
        }
    }

    pub fn put_queue_item(&mut self, item: &SyncQueueItem) {
        if let Some(existing) = self.queue.iter_mut().find(|i| i.id == item.id) {
            *existing = item.clone();
        } else {
            self.queue.push(item.clone());
        }
    }

    pub fn remove_queue_item(&mut self, item_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|i| i.id != item_id);
        self.queue.len() != before
    }
}

/// In-memory local store for testing
pub struct InMemoryLocalStore {
    data: RwLock<StoreSnapshot>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreSnapshot::default()),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make every write fail, for testing durability errors
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail, for testing an unreadable store
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("write rejected".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("read rejected".into()));
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreSnapshot> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreSnapshot> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        self.check_read()?;
        Ok(self.read().get(entity_type, id).cloned())
    }

    async fn get_all(&self, entity_type: EntityType, user_id: &str) -> Result<Vec<Entity>> {
        self.check_read()?;
        Ok(self.read().get_all(entity_type, user_id))
    }

    async fn put(&self, entity: &Entity) -> Result<()> {
        self.check_write()?;
        self.write().put(entity.clone());
        Ok(())
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.check_write()?;
        self.write().delete(entity_type, id);
        Ok(())
    }

    async fn commit(&self, change: LocalChange, item: &SyncQueueItem) -> Result<()> {
        self.check_write()?;
        let mut data = self.write();
        data.apply(change);
        data.put_queue_item(item);
        Ok(())
    }

    async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
        self.check_read()?;
        Ok(self.read().queue.clone())
    }

    async fn get_queue_item(&self, item_id: &str) -> Result<Option<SyncQueueItem>> {
        self.check_read()?;
        Ok(self.read().queue.iter().find(|i| i.id == item_id).cloned())
    }

    async fn put_queue_item(&self, item: &SyncQueueItem) -> Result<()> {
        self.check_write()?;
        self.write().put_queue_item(item);
        Ok(())
    }

    async fn remove_queue_item(&self, item_id: &str) -> Result<bool> {
        self.check_write()?;
        Ok(self.write().remove_queue_item(item_id))
    }

    async fn merge_remote(&self, entity: &Entity) -> Result<bool> {
        self.check_write()?;
        Ok(self.write().merge_remote(entity.clone()))
    }
}
