//! Background task runner
//!
//! Detached learning work (evaluation, extraction, curriculum ticks, outlet
//! persistence) runs through a tracked runner instead of bare `spawn`:
//! handles are held in a strong-reference registry keyed by purpose, so
//! nothing is dropped mid-flight and tests can deterministically drain a
//! purpose before asserting.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Named, tracked background task runner.
#[derive(Clone, Default)]
pub struct TaskRunner {
    tasks: Arc<Mutex<HashMap<String, Vec<JoinHandle<()>>>>>,
}

impl TaskRunner {
    /// Create an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a future under a purpose label ("learning", "curriculum", ...).
    pub async fn spawn(&self, purpose: &str, future: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().await;
        let bucket = tasks.entry(purpose.to_string()).or_default();
        // Handles for completed tasks accumulate; sweep them while we hold
        // the lock anyway
        bucket.retain(|h| !h.is_finished());
        bucket.push(handle);
    }

    /// Await every pending task under a purpose. Returns how many were
    /// drained. Panicked tasks are logged, never propagated.
    pub async fn drain_pending(&self, purpose: &str) -> usize {
        let handles = {
            let mut tasks = self.tasks.lock().await;
            tasks.remove(purpose).unwrap_or_default()
        };
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!("Background task ({purpose}) panicked: {e}");
                }
            }
        }
        count
    }

    /// Pending (not yet finished) task count for a purpose.
    pub async fn pending(&self, purpose: &str) -> usize {
        let tasks = self.tasks.lock().await;
        tasks
            .get(purpose)
            .map(|bucket| bucket.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Drain every purpose (used at shutdown).
    pub async fn drain_all(&self) -> usize {
        let purposes: Vec<String> = {
            let tasks = self.tasks.lock().await;
            tasks.keys().cloned().collect()
        };
        let mut total = 0;
        for purpose in purposes {
            total += self.drain_pending(&purpose).await;
        }
        total
    }
}
