//! gift-sync-core: offline-first synchronization engine for the gift tracker.
//!
//! This crate provides:
//! - The entity model (gifts, people, returns, reminders, images)
//! - A durable sync queue of local mutations awaiting remote confirmation
//! - LocalStore and RemoteStore trait abstractions with in-memory versions
//! - The SyncManager that drains the queue and pulls remote changes

pub mod adapter;
pub mod config;
pub mod events;
pub mod gate;
pub mod manager;
pub mod model;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod store;

pub use adapter::{AdapterError, decode_document, encode_document};
pub use config::SyncConfig;
pub use events::{EventBus, Subscription, SyncEvent};
pub use gate::{ConnectivityGate, GateStatus, SharedGate};
pub use manager::{SyncError, SyncManager, SyncState};
pub use model::{
    Entity, EntityType, EntityTypeError, Gift, GiftImage, Person, Reminder, ReturnGift,
    ReturnStatus,
};
pub use queue::{QueueCounts, QueueError, QueueStatus, SyncOperation, SyncQueue, SyncQueueItem};
pub use remote::{FailureKind, InMemoryRemoteStore, RemoteError, RemoteStore};
pub use repository::OfflineRepository;
pub use store::{
    InMemoryLocalStore, LocalChange, LocalStore, StoreError, StoreSnapshot, should_apply_remote,
};
