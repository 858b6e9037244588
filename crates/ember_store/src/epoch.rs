//! Process-wide RPC epoch tracking.
//!
//! Migration phase 2 needs to know when every write that raced phase 1 has
//! drained. Each in-flight RPC registers itself tagged with the epoch counter
//! at arrival; the migration bumps the counter, re-tags itself past it, and
//! waits until the earliest outstanding epoch exceeds its snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct EpochTracker {
    current: AtomicU64,
    next_token: AtomicU64,
    active: Mutex<HashMap<u64, u64>>,
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochTracker {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register an in-flight RPC at the current epoch. The guard deregisters
    /// on drop.
    pub fn register(self: &Arc<Self>) -> RpcEpochGuard {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let epoch = self.current.load(Ordering::SeqCst);
        self.active.lock().expect("epoch lock").insert(token, epoch);
        RpcEpochGuard {
            tracker: Arc::clone(self),
            token,
        }
    }

    /// Advance the process epoch, returning the value it had before.
    pub fn increment_epoch(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    /// Smallest epoch among in-flight RPCs; `u64::MAX` when idle.
    pub fn earliest_outstanding(&self) -> u64 {
        self.active
            .lock()
            .expect("epoch lock")
            .values()
            .copied()
            .min()
            .unwrap_or(u64::MAX)
    }

    fn retag(&self, token: u64, epoch: u64) {
        if let Some(slot) = self.active.lock().expect("epoch lock").get_mut(&token) {
            *slot = epoch;
        }
    }

    fn deregister(&self, token: u64) {
        self.active.lock().expect("epoch lock").remove(&token);
    }
}

/// Presence of one RPC in the epoch registry.
pub struct RpcEpochGuard {
    tracker: Arc<EpochTracker>,
    token: u64,
}

impl RpcEpochGuard {
    /// Move this RPC's tag forward so it does not wait on itself during a
    /// drain it is driving.
    pub fn set_epoch(&self, epoch: u64) {
        self.tracker.retag(self.token, epoch);
    }
}

impl Drop for RpcEpochGuard {
    fn drop(&mut self) {
        self.tracker.deregister(self.token);
    }
}
