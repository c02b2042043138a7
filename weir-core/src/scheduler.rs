//! Tracked fire-and-forget background work.
//!
//! Dedup calls, overflow re-publishing and deferred post-processing run off
//! the critical path, but the process must still be able to await them all
//! before shutdown or before acknowledging a batch. The scheduler keeps the
//! join handles so `wait_for_all` can drain everything that was spawned.
//! Work whose completion affects correctness must not go through here.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

/// Tracks spawned background tasks for later draining
#[derive(Debug, Default, Clone)]
pub struct BackgroundScheduler {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a future and track its handle. The future's own failures are
    /// its responsibility; panics are logged when drained.
    pub fn schedule<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.handles.lock().push(handle);
    }

    /// Await every task scheduled so far. Tasks scheduled while draining
    /// are drained too.
    pub async fn wait_for_all(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                if let Err(e) = handle.await {
                    error!(error = %e, "Background task panicked");
                }
            }
        }
    }

    /// Number of tasks currently tracked
    pub fn pending(&self) -> usize {
        self.handles.lock().len()
    }
}
