//! Auth/connectivity gate: may the sync manager talk to the remote store now?
//!
//! A gate only reads signals owned elsewhere (auth session, network monitor).

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Why a sync may or may not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Ready,
    /// No remote backend configured
    Disabled,
    /// Nobody is signed in
    SignedOut,
    /// A different user is signed in
    UserMismatch,
    Offline,
}

impl GateStatus {
    pub fn is_ready(self) -> bool {
        self == GateStatus::Ready
    }
}

/// Ambient auth and network signals.
pub trait ConnectivityGate: Send + Sync {
    /// Remote backend configured
    fn is_enabled(&self) -> bool;

    fn current_user_id(&self) -> Option<String>;

    fn is_online(&self) -> bool;

    /// Combined check for a sync on behalf of `user_id`.
    fn status(&self, user_id: &str) -> GateStatus {
        if !self.is_enabled() {
            return GateStatus::Disabled;
        }
        match self.current_user_id() {
            None => return GateStatus::SignedOut,
            Some(current) if current != user_id => return GateStatus::UserMismatch,
            Some(_) => {}
        }
        if !self.is_online() {
            return GateStatus::Offline;
        }
        GateStatus::Ready
    }
}

/// Gate whose signals are pushed in by the host.
#[derive(Debug, Default)]
pub struct SharedGate {
    enabled: AtomicBool,
    online: AtomicBool,
    user_id: RwLock<Option<String>>,
}

impl SharedGate {
    pub fn new(enabled: bool, online: bool, user_id: Option<String>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            online: AtomicBool::new(online),
            user_id: RwLock::new(user_id),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_user(&self, user_id: Option<String>) {
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = user_id;
    }
}

impl ConnectivityGate for SharedGate {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
