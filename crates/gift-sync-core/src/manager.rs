//! SyncManager: reconciles the local store with the remote document store.
//!
//! A sync cycle works as follows:
//!
//! 1. The connectivity gate is consulted; if sync is impossible the call is a
//!    no-op (sync is opportunistic, never blocking)
//! 2. Drain: pending queue items for the user are dispatched to the remote
//!    store oldest first, one at a time
//!    - success removes the item
//!    - transient and rejected failures keep the item (failed or terminal) and
//!      skip later items for the same entity until the next cycle
//!    - permission denied stops the cycle with `AuthExpired`
//! 3. Pull: each remote collection is fetched and entities that are missing
//!    locally, or at least as new as the local copy, are written locally
//! 4. `SyncState` is recomputed
//!
//! At most one cycle runs at a time. A caller arriving while a cycle is in
//! flight waits for it and returns its result instead of starting another.

use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent, now_millis};
use crate::gate::ConnectivityGate;
use crate::model::{Entity, EntityType};
use crate::queue::{QueueError, SyncOperation, SyncQueue, SyncQueueItem};
use crate::remote::{FailureKind, RemoteError, RemoteStore};
use crate::store::{LocalStore, StoreError};
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use web_time::Instant;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Authentication expired for user {user_id}")]
    AuthExpired { user_id: String },

    #[error("Failed to {operation:?} {entity_type} {entity_id}: {message}")]
    Item {
        entity_type: EntityType,
        entity_id: String,
        operation: SyncOperation,
        message: String,
        terminal: bool,
    },

    #[error("Failed to pull {entity_type}: {message}")]
    Pull {
        entity_type: EntityType,
        message: String,
    },

    #[error("Local store error: {0}")]
    Local(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Local(e.to_string())
    }
}

impl From<QueueError> for SyncError {
    fn from(e: QueueError) -> Self {
        SyncError::Local(e.to_string())
    }
}

/// UI-facing summary of sync progress. Always handed out as a copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Queue items not yet confirmed (excluding terminal ones)
    pub pending_operations: usize,
    /// Queue items that exhausted their retries
    pub failed_operations: usize,
    /// Most recent error, cleared by a clean cycle
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
}

fn serialize_error<S: Serializer>(error: &Option<SyncError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Default)]
struct CycleReport {
    pushed: usize,
    pulled: usize,
    failed: usize,
    error: Option<SyncError>,
    auth_expired: bool,
}

pub struct SyncManager<L: LocalStore, R: RemoteStore> {
    local: Arc<L>,
    remote: Arc<R>,
    queue: SyncQueue<L>,
    gate: Arc<dyn ConnectivityGate>,
    config: SyncConfig,
    events: Arc<EventBus>,
    state: RwLock<SyncState>,
    /// Held for the duration of a cycle
    cycle_lock: Mutex<()>,
    /// Incremented when a cycle ends, under `cycle_lock`
    completed_cycles: AtomicU64,
}

impl<L: LocalStore, R: RemoteStore> SyncManager<L, R> {
    pub fn new(
        local: Arc<L>,
        remote: Arc<R>,
        gate: Arc<dyn ConnectivityGate>,
        config: SyncConfig,
    ) -> Self {
        let queue = SyncQueue::new(Arc::clone(&local));
        Self {
            local,
            remote,
            queue,
            gate,
            config,
            events: Arc::new(EventBus::new()),
            state: RwLock::new(SyncState::default()),
            cycle_lock: Mutex::new(()),
            completed_cycles: AtomicU64::new(0),
        }
    }

    /// Queue handle sharing this manager's transition lock.
    pub fn queue(&self) -> &SyncQueue<L> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SyncState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recompute queue counts, e.g. after local mutations.
    pub async fn refresh_pending(&self, user_id: &str) -> Result<SyncState, SyncError> {
        let counts = self.queue.counts(user_id).await?;
        Ok(self.update_state(|s| {
            s.pending_operations = counts.pending;
            s.failed_operations = counts.terminal;
        }))
    }

    /// Run one drain-and-pull cycle for `user_id`.
    ///
    /// Item failures never make this fail; they are reported through
    /// `SyncState::error`. Only an unusable local store returns `Err`.
    pub async fn trigger_sync(&self, user_id: &str) -> Result<SyncState, SyncError> {
        let status = self.gate.status(user_id);
        if !status.is_ready() {
            debug!("Sync skipped for {}: {:?}", user_id, status);
            return Ok(self.state());
        }

        let seen = self.completed_cycles.load(Ordering::Acquire);
        let _guard = self.cycle_lock.lock().await;
        if self.completed_cycles.load(Ordering::Acquire) != seen {
            debug!("Joined in-flight sync cycle for {}", user_id);
            return Ok(self.state());
        }

        let result = self.run_cycle(user_id).await;
        self.completed_cycles.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn run_cycle(&self, user_id: &str) -> Result<SyncState, SyncError> {
        let started = Instant::now();
        self.update_state(|s| s.is_syncing = true);

        let mut report = CycleReport::default();
        let outcome = self.drain_and_pull(user_id, &mut report).await;
        let counts = self.queue.counts(user_id).await;

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.events.emit(SyncEvent::CycleFinished {
            user_id: user_id.to_string(),
            pushed: report.pushed,
            pulled: report.pulled,
            failed: report.failed,
            duration_ms,
            timestamp: now_millis(),
        });

        let counts = match outcome.and(counts.map_err(SyncError::from)) {
            Ok(counts) => counts,
            Err(e) => {
                error!("Sync cycle for {} aborted: {}", user_id, e);
                self.update_state(|s| {
                    s.is_syncing = false;
                    s.error = Some(e.clone());
                });
                return Err(e);
            }
        };

        info!(
            "Sync cycle for {} finished in {:.0}ms: {} pushed, {} pulled, {} failed, {} pending",
            user_id, duration_ms, report.pushed, report.pulled, report.failed, counts.pending
        );

        let auth_expired = report.auth_expired;
        Ok(self.update_state(|s| {
            s.is_syncing = false;
            s.pending_operations = counts.pending;
            s.failed_operations = counts.terminal;
            s.error = report.error;
            if !auth_expired {
                s.last_sync_time = Some(Utc::now());
            }
        }))
    }

    async fn drain_and_pull(
        &self,
        user_id: &str,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        // Only one cycle runs at a time, so anything in flight is stale
        self.queue.reset_in_flight().await?;

        self.drain(user_id, report).await?;
        if report.auth_expired || !self.config.pull_enabled {
            return Ok(());
        }
        self.pull(user_id, report).await
    }

    async fn drain(&self, user_id: &str, report: &mut CycleReport) -> Result<(), SyncError> {
        let items = self.queue.list_pending_for(user_id).await?;
        self.events.emit(SyncEvent::CycleStarted {
            user_id: user_id.to_string(),
            pending: items.len(),
            timestamp: now_millis(),
        });
        if !items.is_empty() {
            debug!("Draining {} queue item(s) for {}", items.len(), user_id);
        }

        // Entities with a failed item this cycle; later items must wait
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        for item in items {
            if blocked.contains(&(item.entity_type, item.entity_id.clone())) {
                debug!(
                    "Holding {:?} {} {}: earlier mutation failed",
                    item.operation, item.entity_type, item.entity_id
                );
                continue;
            }

            match self.queue.mark_in_flight(&item.id).await {
                Ok(_) => {}
                Err(QueueError::NotFound(_)) | Err(QueueError::InvalidTransition { .. }) => {
                    debug!("Queue item {} no longer drainable, skipping", item.id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            match self.dispatch(user_id, &item).await {
                Ok(()) => {
                    self.queue.dequeue(&item.id).await?;
                    report.pushed += 1;
                    debug!(
                        "Synced {:?} {} {}",
                        item.operation, item.entity_type, item.entity_id
                    );
                    self.events.emit(SyncEvent::ItemSynced {
                        entity_type: item.entity_type,
                        entity_id: item.entity_id.clone(),
                        operation: item.operation,
                        timestamp: now_millis(),
                    });
                }
                Err(err) if err.kind() == FailureKind::AuthExpired => {
                    self.queue.release(&item.id).await?;
                    self.on_auth_expired(user_id, &err, report);
                    return Ok(());
                }
                Err(err) => {
                    let limit = match err.kind() {
                        FailureKind::Transient => self.config.max_transient_retries,
                        _ => Some(self.config.max_retries),
                    };
                    let message = err.to_string();
                    let updated = self.queue.mark_failed(&item.id, &message, limit).await?;
                    let terminal = !updated.is_drainable();

                    warn!(
                        "Failed to sync {:?} {} {} (attempt {}{}): {}",
                        item.operation,
                        item.entity_type,
                        item.entity_id,
                        updated.retry_count,
                        if terminal { ", giving up" } else { "" },
                        message
                    );

                    blocked.insert((item.entity_type, item.entity_id.clone()));
                    report.failed += 1;
                    report.error = Some(SyncError::Item {
                        entity_type: item.entity_type,
                        entity_id: item.entity_id.clone(),
                        operation: item.operation,
                        message: message.clone(),
                        terminal,
                    });
                    self.events.emit(SyncEvent::ItemFailed {
                        entity_type: item.entity_type,
                        entity_id: item.entity_id.clone(),
                        operation: item.operation,
                        error: message,
                        terminal,
                        timestamp: now_millis(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replay one queue item against the remote store.
    async fn dispatch(&self, user_id: &str, item: &SyncQueueItem) -> Result<(), RemoteError> {
        match item.operation {
            SyncOperation::Create => {
                let entity = Self::payload(item)?;
                match self.remote.create(user_id, entity).await {
                    // An earlier attempt landed but its confirmation was lost
                    Err(RemoteError::AlreadyExists(_)) => self.remote.update(user_id, entity).await,
                    other => other,
                }
            }
            SyncOperation::Update => {
                let entity = Self::payload(item)?;
                self.remote.update(user_id, entity).await
            }
            SyncOperation::Delete => {
                match self
                    .remote
                    .delete(user_id, item.entity_type, &item.entity_id)
                    .await
                {
                    Err(RemoteError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        }
    }

    fn payload(item: &SyncQueueItem) -> Result<&Entity, RemoteError> {
        item.payload
            .as_ref()
            .ok_or_else(|| RemoteError::Rejected(format!("queue item {} has no payload", item.id)))
    }

    async fn pull(&self, user_id: &str, report: &mut CycleReport) -> Result<(), SyncError> {
        // Never resurrect an entity whose local delete is still unconfirmed
        let deleting: HashSet<(EntityType, String)> = self
            .queue
            .list_all()
            .await?
            .into_iter()
            .filter(|i| i.operation == SyncOperation::Delete && i.user_id == user_id)
            .map(|i| (i.entity_type, i.entity_id))
            .collect();

        for entity_type in &self.config.entity_types {
            let entity_type = *entity_type;
            let remote_entities = match self.remote.get_all(user_id, entity_type).await {
                Ok(entities) => entities,
                Err(err) if err.kind() == FailureKind::AuthExpired => {
                    self.on_auth_expired(user_id, &err, report);
                    return Ok(());
                }
                Err(err) => {
                    warn!("Failed to pull {} for {}: {}", entity_type, user_id, err);
                    report.error = Some(SyncError::Pull {
                        entity_type,
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            for entity in remote_entities {
                if entity.user_id() != user_id {
                    debug!(
                        "Ignoring remote {} {} owned by another user",
                        entity_type,
                        entity.id()
                    );
                    continue;
                }
                if deleting.contains(&(entity_type, entity.id().to_string())) {
                    continue;
                }

                if self.local.merge_remote(&entity).await? {
                    report.pulled += 1;
                    debug!("Pulled {} {}", entity_type, entity.id());
                    self.events.emit(SyncEvent::EntityPulled {
                        entity_type,
                        entity_id: entity.id().to_string(),
                        timestamp: now_millis(),
                    });
                }
            }
        }
        Ok(())
    }

    fn on_auth_expired(&self, user_id: &str, err: &RemoteError, report: &mut CycleReport) {
        warn!("Remote store refused credentials for {}: {}", user_id, err);
        report.auth_expired = true;
        report.error = Some(SyncError::AuthExpired {
            user_id: user_id.to_string(),
        });
        self.events.emit(SyncEvent::AuthExpired {
            user_id: user_id.to_string(),
            timestamp: now_millis(),
        });
    }

    fn update_state(&self, apply: impl FnOnce(&mut SyncState)) -> SyncState {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut state);
        state.clone()
    }
}
