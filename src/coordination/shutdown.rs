//! Shutdown signalling for the engine's long-lived loops
//!
//! Every loop checks a shared running flag between iterations and also
//! listens on a broadcast channel so a pending sleep or dequeue wakes up as
//! soon as shutdown is requested.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shared running flag plus wake-up broadcast
#[derive(Clone)]
pub struct ShutdownController {
    running: Arc<AtomicBool>,
    signal_tx: broadcast::Sender<()>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(1);
        Self {
            running: Arc::new(AtomicBool::new(true)),
            signal_tx,
        }
    }

    /// Whether loops should keep iterating
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to the wake-up signal. Subscribe before checking
    /// [`is_running`](Self::is_running) to avoid missing a request.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal_tx.subscribe()
    }

    /// Flip the running flag and wake every loop. Returns false if shutdown
    /// had already been requested.
    pub fn request_shutdown(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate request");
            return false;
        }

        info!("Shutdown requested");
        let _ = self.signal_tx.send(());
        true
    }
}
