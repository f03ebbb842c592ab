//! Deterministic supervisor loops.
//!
//! Each loop is an independent cooperative task with its own cadence; none
//! blocks on another, all state flows through the store, and every loop
//! swallows its own errors and retries at the next tick. Shutdown is a
//! watch-channel flip observed at the next tick.

pub mod bridge;
pub mod hardware;
pub mod music;
pub mod presence;
pub mod watch;

use std::sync::Arc;
use tokio::sync::watch as watch_channel;
use tokio::task::JoinHandle;

use crate::runtime::Runtime;

pub type Shutdown = watch_channel::Receiver<bool>;

pub fn shutdown_requested(shutdown: &Shutdown) -> bool {
    *shutdown.borrow()
}

/// Spawn the full loop set.
pub fn spawn_all(rt: Arc<Runtime>, shutdown: Shutdown) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(presence::run(Arc::clone(&rt), shutdown.clone())),
        tokio::spawn(hardware::run(Arc::clone(&rt), shutdown.clone())),
        tokio::spawn(music::run(Arc::clone(&rt), shutdown.clone())),
        tokio::spawn(watch::run(Arc::clone(&rt), shutdown.clone())),
        tokio::spawn(bridge::run(rt, shutdown)),
    ]
}

/// Sleep for the cadence or wake early on shutdown. Returns false when the
/// loop should exit.
pub async fn tick(shutdown: &mut Shutdown, cadence: std::time::Duration) -> bool {
    if shutdown_requested(shutdown) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(cadence) => true,
        _ = shutdown.changed() => !shutdown_requested(shutdown),
    }
}

/// Read a small JSON file; missing or malformed files read as `None`.
pub(crate) fn read_json_file(path: &std::path::Path) -> Option<serde_json::Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
