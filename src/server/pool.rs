use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::log_error;

/// Runs handler bodies on blocking threads, optionally capped.
///
/// Without a cap every submitted job starts immediately on tokio's
/// blocking pool. With a cap, at most `n` run at once and the rest wait
/// for a permit in submission order.
pub struct WorkerPool {
    limit: Option<Arc<Semaphore>>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    // ---
    /// `None` or `Some(0)` means unbounded.
    pub fn new(max_workers: Option<usize>) -> Self {
        // ---
        let limit = max_workers
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            limit,
            tasks: JoinSet::new(),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.limit.is_some()
    }

    /// Queue `job` for execution.
    pub fn submit<F>(&mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // ---
        self.reap();

        let limit = self.limit.clone();
        self.tasks.spawn(async move {
            let _permit = match limit {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };

            if let Err(e) = tokio::task::spawn_blocking(job).await {
                log_error!("worker job failed: {e}");
            }
        });
    }

    /// Jobs submitted and not yet finished (or not yet reaped).
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every submitted job to finish.
    pub async fn drain(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    fn reap(&mut self) {
        while self.tasks.try_join_next().is_some() {}
    }
}
