//! RemoteStore trait for the cloud document collections.
//!
//! Implementations:
//! - `InMemoryRemoteStore` - For testing, with failure injection
//! - `HttpRemoteStore` (in gift-sync-daemon) - REST document API
//!
//! Every call may fail at any time; callers classify failures with
//! `RemoteError::kind`.

use crate::model::{Entity, EntityType};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rejected by remote store: {0}")]
    Rejected(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),
}

/// How a failure should be handled by the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry on the next cycle
    Transient,
    /// Retry a bounded number of times, then give up visibly
    Permanent,
    /// Stop the cycle; the user must sign in again
    AuthExpired,
}

impl RemoteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Unavailable(_) => {
                FailureKind::Transient
            }
            RemoteError::PermissionDenied(_) => FailureKind::AuthExpired,
            RemoteError::Rejected(_) | RemoteError::NotFound(_) | RemoteError::AlreadyExists(_) => {
                FailureKind::Permanent
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Per-user remote document collections.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a new document. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, user_id: &str, entity: &Entity) -> Result<()>;

    /// Insert or replace a document.
    async fn update(&self, user_id: &str, entity: &Entity) -> Result<()>;

    /// Remove a document. Fails with `NotFound` if it is absent.
    async fn delete(&self, user_id: &str, entity_type: EntityType, id: &str) -> Result<()>;

    /// Every document of a type in the user's collection.
    async fn get_all(&self, user_id: &str, entity_type: EntityType) -> Result<Vec<Entity>>;
}

type Collections = HashMap<(String, EntityType), BTreeMap<String, Entity>>;

/// In-memory remote store for testing
pub struct InMemoryRemoteStore {
    collections: RwLock<Collections>,
    /// Errors returned for specific entity ids
    entity_failures: RwLock<HashMap<String, RemoteError>>,
    /// Error returned for every call
    global_failure: RwLock<Option<RemoteError>>,
    writes: AtomicUsize,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            entity_failures: RwLock::new(HashMap::new()),
            global_failure: RwLock::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    /// Seed a document without counting it as a write
    pub fn insert_document(&self, user_id: &str, entity: Entity) {
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry((user_id.to_string(), entity.entity_type()))
            .or_default()
            .insert(entity.id().to_string(), entity);
    }

    pub fn document(&self, user_id: &str, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_string(), entity_type))
            .and_then(|c| c.get(id))
            .cloned()
    }

    pub fn document_count(&self, user_id: &str, entity_type: EntityType) -> usize {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_string(), entity_type))
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Fail every call touching `entity_id` until cleared
    pub fn fail_entity(&self, entity_id: &str, error: RemoteError) {
        self.entity_failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string(), error);
    }

    pub fn clear_entity_failure(&self, entity_id: &str) {
        self.entity_failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
    }

    /// Fail every call until cleared with `None`
    pub fn set_global_failure(&self, error: Option<RemoteError>) {
        *self.global_failure.write().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Number of successful create/update/delete calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, entity_id: Option<&str>) -> Result<()> {
        if let Some(err) = self
            .global_failure
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        if let Some(id) = entity_id {
            if let Some(err) = self
                .entity_failures
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(id)
            {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn key(user_id: &str, entity_type: EntityType) -> (String, EntityType) {
        (user_id.to_string(), entity_type)
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, user_id: &str, entity: &Entity) -> Result<()> {
        self.check(Some(entity.id()))?;
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let collection = collections
            .entry(Self::key(user_id, entity.entity_type()))
            .or_default();
        if collection.contains_key(entity.id()) {
            return Err(RemoteError::AlreadyExists(entity.id().to_string()));
        }
        collection.insert(entity.id().to_string(), entity.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, user_id: &str, entity: &Entity) -> Result<()> {
        self.check(Some(entity.id()))?;
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(Self::key(user_id, entity.entity_type()))
            .or_default()
            .insert(entity.id().to_string(), entity.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, user_id: &str, entity_type: EntityType, id: &str) -> Result<()> {
        self.check(Some(id))?;
        let removed = self
            .collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&Self::key(user_id, entity_type))
            .and_then(|c| c.remove(id));
        match removed {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RemoteError::NotFound(id.to_string())),
        }
    }

    async fn get_all(&self, user_id: &str, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.check(None)?;
        Ok(self
            .collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::key(user_id, entity_type))
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::gift;

    #[test]
    fn test_failure_classification() {
        assert_eq!(RemoteError::Timeout.kind(), FailureKind::Transient);
        assert_eq!(
            RemoteError::Unavailable("503".into()).kind(),
            FailureKind::Transient
        );
        assert_eq!(
            RemoteError::PermissionDenied("token expired".into()).kind(),
            FailureKind::AuthExpired
        );
        assert_eq!(
            RemoteError::Rejected("bad field".into()).kind(),
            FailureKind::Permanent
        );
    }

    #[tokio::test]
    async fn test_inmemory_remote_collections_are_per_user() {
        let remote = InMemoryRemoteStore::new();
        remote.create("u1", &gift("g1", "u1", "A", 1)).await.unwrap();

        assert_eq!(remote.get_all("u1", EntityType::Gift).await.unwrap().len(), 1);
        assert!(remote.get_all("u2", EntityType::Gift).await.unwrap().is_empty());
        assert!(matches!(
            remote.create("u1", &gift("g1", "u1", "A", 1)).await,
            Err(RemoteError::AlreadyExists(_))
        ));
        assert!(matches!(
            remote.delete("u2", EntityType::Gift, "g1").await,
            Err(RemoteError::NotFound(_))
        ));
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let remote = InMemoryRemoteStore::new();
        remote.fail_entity("g1", RemoteError::Timeout);

        assert_eq!(
            remote.update("u1", &gift("g1", "u1", "A", 1)).await,
            Err(RemoteError::Timeout)
        );
        remote.update("u1", &gift("g2", "u1", "B", 1)).await.unwrap();

        remote.clear_entity_failure("g1");
        remote.update("u1", &gift("g1", "u1", "A", 1)).await.unwrap();

        remote.set_global_failure(Some(RemoteError::Network("offline".into())));
        assert!(remote.get_all("u1", EntityType::Gift).await.is_err());
        remote.set_global_failure(None);
        assert_eq!(remote.document_count("u1", EntityType::Gift), 2);
    }
}
