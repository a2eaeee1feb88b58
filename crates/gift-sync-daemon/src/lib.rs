//! gift-sync-daemon library: native host components for the sync engine.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access them.

pub mod config;
pub mod connectivity;
pub mod file_store;
pub mod http_remote;
pub mod scheduler;

// Re-export key types for convenience
pub use config::{BackoffConfig, DaemonConfig, RemoteConfig};
pub use connectivity::NetworkProbe;
pub use file_store::FileLocalStore;
pub use http_remote::HttpRemoteStore;
pub use scheduler::{CycleOutcome, SyncSchedule};
