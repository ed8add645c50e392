//! Worker pool draining a `WorkQueue` into a sync function.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{counter, histogram};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::WorkQueue;

/// Failures per key before the queue stops retrying and drops it.
pub const UPDATE_MAX_RETRIES: u32 = 10;

pub type SyncFn = Arc<dyn Fn(String) -> BoxFuture<'static, nimbus_core::Result<()>> + Send + Sync>;

/// Handle over the spawned workers. `shutdown` closes the queue and
/// waits for every worker's completion signal.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    completions: Vec<oneshot::Receiver<()>>,
}

impl WorkerPool {
    pub async fn shutdown(self) {
        self.queue.shutdown();
        for rx in self.completions {
            // A worker that panicked drops its sender; nothing to wait for.
            let _ = rx.await;
        }
    }
}

/// Spawn `n` workers. Each blocks on `get`, runs the sync function,
/// requeues retryable errors rate-limited, and drops keys that keep
/// failing past [`UPDATE_MAX_RETRIES`].
pub fn run_workers(queue: Arc<WorkQueue>, n: usize, sync: SyncFn) -> WorkerPool {
    let mut completions = Vec::with_capacity(n);
    for worker in 0..n {
        let (done_tx, done_rx) = oneshot::channel();
        completions.push(done_rx);
        let queue = Arc::clone(&queue);
        let sync = Arc::clone(&sync);
        tokio::spawn(async move {
            debug!(queue = queue.name(), worker, "worker started");
            while let Some(key) = queue.get().await {
                let t0 = Instant::now();
                let result = sync(key.clone()).await;
                histogram!(
                    "queue_work_duration_seconds",
                    t0.elapsed().as_secs_f64(),
                    "queue" => queue.name()
                );
                match result {
                    Ok(()) => queue.forget(&key),
                    Err(e) if e.is_retryable() && queue.num_requeues(&key) < UPDATE_MAX_RETRIES => {
                        warn!(queue = queue.name(), key = %key, error = %e, "sync failed, requeueing");
                        queue.add_rate_limited(&key);
                    }
                    Err(e) => {
                        error!(queue = queue.name(), key = %key, error = %e, "sync failed, dropping key");
                        counter!("queue_dropped_total", 1u64, "queue" => queue.name());
                        queue.forget(&key);
                    }
                }
                queue.done(&key);
            }
            debug!(queue = queue.name(), worker, "worker stopped");
            let _ = done_tx.send(());
        });
    }
    WorkerPool { queue, completions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemExponentialBackoff;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_queue() -> Arc<WorkQueue> {
        WorkQueue::new(
            "worker-test",
            Box::new(ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(4))),
        )
    }

    #[tokio::test]
    async fn success_resets_requeue_count() {
        let q = fast_queue();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let pool = run_workers(
            Arc::clone(&q),
            2,
            Arc::new(move |_key| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        q.add("a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.num_requeues("a"), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn retryable_error_is_retried_until_success() {
        let q = fast_queue();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let pool = run_workers(
            Arc::clone(&q),
            1,
            Arc::new(move |_key| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(nimbus_core::Error::Transient("flaky".into()))
                    } else {
                        Ok(())
                    }
                })
            }),
        );
        q.add("a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(q.num_requeues("a"), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn terminal_error_drops_without_retry() {
        let q = fast_queue();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let pool = run_workers(
            Arc::clone(&q),
            1,
            Arc::new(move |_key| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(nimbus_core::Error::Parse("bad".into()))
                })
            }),
        );
        q.add("a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_all_workers() {
        let q = fast_queue();
        let pool = run_workers(
            Arc::clone(&q),
            4,
            Arc::new(|_key| Box::pin(async { Ok(()) })),
        );
        q.add("a");
        pool.shutdown().await;
        assert!(q.shutting_down());
    }
}
