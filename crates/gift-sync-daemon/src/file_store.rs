//! LocalStore backed by a single JSON snapshot on disk.
//!
//! Entities and the sync queue are kept together in `store.json`. Every write
//! serializes the whole snapshot to `store.json.tmp` and renames it over the
//! previous file, so a crash leaves either the old or the new snapshot and an
//! entity change can never be persisted without its queue item.
//!
//! Several `gift-sync` processes may share one data directory (a running
//! daemon plus `import` or `retry` from the command line). Every operation
//! takes an advisory lock on `store.lock` and works on the snapshot as it is
//! on disk, so no handle ever writes back a stale copy.

use async_trait::async_trait;
use fs2::FileExt;
use gift_sync_core::store::{LocalChange, LocalStore, Result, StoreError, StoreSnapshot};
use gift_sync_core::{Entity, EntityType, SyncQueueItem};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::debug;

const STORE_FILE: &str = "store.json";
const LOCK_FILE: &str = "store.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Shared,
    Exclusive,
}

pub struct FileLocalStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileLocalStore {
    /// Open the store in `dir`, creating the directory if needed.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await.map_err(io_error)?;

        let store = Self {
            path: dir.join(STORE_FILE),
            lock_path: dir.join(LOCK_FILE),
        };
        // Report a corrupt snapshot now rather than on first use
        store.read(|_| ()).await?;
        debug!("Opened local store at {:?}", store.path);

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T: Send + 'static>(
        &self,
        view: impl FnOnce(&StoreSnapshot) -> T + Send + 'static,
    ) -> Result<T> {
        self.locked(Access::Shared, move |path| Ok(view(&load(path)?))).await
    }

    /// Apply `change` to the current snapshot and persist it.
    async fn mutate<T: Send + 'static>(
        &self,
        change: impl FnOnce(&mut StoreSnapshot) -> T + Send + 'static,
    ) -> Result<T> {
        self.locked(Access::Exclusive, move |path| {
            let mut snapshot = load(path)?;
            let out = change(&mut snapshot);
            persist(path, &snapshot)?;
            Ok(out)
        })
        .await
    }

    /// Run `op` on a blocking thread while holding the store lock.
    async fn locked<T: Send + 'static>(
        &self,
        access: Access,
        op: impl FnOnce(&Path) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        task::spawn_blocking(move || {
            let lock = acquire(&lock_path, access)?;
            let out = op(&path);
            drop(lock);
            out
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Open the lock file and block until the lock is granted.
///
/// Closing the returned file also releases the lock.
fn acquire(lock_path: &Path, access: Access) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| StoreError::Io(format!("{}: {}", lock_path.display(), e)))?;

    match access {
        Access::Shared => FileExt::lock_shared(&file),
        Access::Exclusive => FileExt::lock_exclusive(&file),
    }
    .map_err(|e| StoreError::Unavailable(format!("{}: {}", lock_path.display(), e)))?;

    Ok(file)
}

fn load(path: &Path) -> Result<StoreSnapshot> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreSnapshot::default()),
        Err(e) => Err(io_error(e)),
    }
}

fn persist(path: &Path, snapshot: &StoreSnapshot) -> Result<()> {
    let bytes =
        serde_json::to_vec_pretty(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)
}

#[async_trait]
impl LocalStore for FileLocalStore {
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>> {
        let id = id.to_string();
        self.read(move |s| s.get(entity_type, &id).cloned()).await
    }

    async fn get_all(&self, entity_type: EntityType, user_id: &str) -> Result<Vec<Entity>> {
        let user_id = user_id.to_string();
        self.read(move |s| s.get_all(entity_type, &user_id)).await
    }

    async fn put(&self, entity: &Entity) -> Result<()> {
        let entity = entity.clone();
        self.mutate(move |s| s.put(entity)).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(move |s| s.delete(entity_type, &id)).await
    }

    async fn commit(&self, change: LocalChange, item: &SyncQueueItem) -> Result<()> {
        let item = item.clone();
        self.mutate(move |s| {
            s.apply(change);
            s.put_queue_item(&item);
        })
        .await
    }

    async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
        self.read(|s| s.queue.clone()).await
    }

    async fn get_queue_item(&self, item_id: &str) -> Result<Option<SyncQueueItem>> {
        let item_id = item_id.to_string();
        self.read(move |s| s.queue.iter().find(|i| i.id == item_id).cloned()).await
    }

    async fn put_queue_item(&self, item: &SyncQueueItem) -> Result<()> {
        let item = item.clone();
        self.mutate(move |s| s.put_queue_item(&item)).await
    }

    async fn remove_queue_item(&self, item_id: &str) -> Result<bool> {
        let item_id = item_id.to_string();
        self.mutate(move |s| s.remove_queue_item(&item_id)).await
    }

    async fn merge_remote(&self, entity: &Entity) -> Result<bool> {
        let entity = entity.clone();
        self.locked(Access::Exclusive, move |path| {
            let mut snapshot = load(path)?;
            // Unchanged snapshots are not rewritten
            let applied = snapshot.merge_remote(entity);
            if applied {
                persist(path, &snapshot)?;
            }
            Ok(applied)
        })
        .await
    }
}
