//! Process-wide cooperative shutdown signal.
//!
//! One watch channel is created by the daemon and its receiver is threaded
//! through every blocking call: rate-limit waits, HTTP sends, claim polls,
//! worker sleeps. Flipping the sender makes all of them return within a
//! second.

use tokio::sync::watch;

/// Receiver half of the shutdown channel. Cheap to clone.
pub type Signal = watch::Receiver<bool>;

/// Create the shutdown channel. The daemon keeps the sender; everything
/// else gets a clone of the receiver.
pub fn channel() -> (watch::Sender<bool>, Signal) {
    watch::channel(false)
}

/// True once shutdown has been requested.
pub fn is_triggered(signal: &Signal) -> bool {
    *signal.borrow()
}

/// Resolves when shutdown is requested. A dropped sender counts as
/// shutdown; the process is tearing down either way.
pub async fn triggered(signal: &Signal) {
    let mut rx = signal.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep that wakes early on shutdown. Returns `false` when interrupted.
pub async fn sleep(signal: &Signal, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = triggered(signal) => false,
    }
}
