//! Bounded-concurrency worker pool (spec §4.E). Generalizes the teacher's
//! ad hoc `Arc<Semaphore>` + `tokio::spawn` loop (`registry.rs::resolve_all_tags`)
//! into a reusable executor: run up to N futures concurrently, capture the
//! first error, and let outstanding work observe cancellation cooperatively.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;

use crate::error::{PurgeError, Result};

/// Cancellation flag shared between the pool and the closures it runs.
/// A `tokio-util`-free stand-in for `CancellationToken`, built from
/// primitives already in `tokio` (spec §4.E "cooperative cancellation").
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of [`WorkerPool::run`]: how many tasks completed successfully,
/// and the first error observed, if any (spec §4.E `Wait() ->
/// (successCount, firstError)`).
#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub success_count: usize,
    pub first_error: Option<PurgeError>,
}

/// Runs a batch of futures with at most `concurrency` running at once,
/// stopping early once the first task fails (remaining queued tasks are
/// never started; in-flight tasks observe [`CancelToken::is_cancelled`]
/// and should wind down on their own).
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// `concurrency` of `0` is treated as `1` — a pool that never runs
    /// anything would violate the spec's forward-progress guarantee.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Runs `items` through `work`, at most `self.concurrency` concurrently.
    /// `work` receives the item and the pool's [`CancelToken`]; it should
    /// check [`CancelToken::is_cancelled`] at safe points and return early.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, work: F) -> PoolOutcome
    where
        T: Send + 'static,
        F: Fn(T, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let cancel = CancelToken::new();
        let work = Arc::new(work);
        let first_error: Arc<Mutex<Option<PurgeError>>> = Arc::new(Mutex::new(None));
        let success_count = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for item in items {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let work = Arc::clone(&work);
            let cancel_for_task = cancel.clone();
            let first_error = Arc::clone(&first_error);
            let success_count = Arc::clone(&success_count);

            tasks.spawn(async move {
                let _permit = permit;
                if cancel_for_task.is_cancelled() {
                    return;
                }
                match work(item, cancel_for_task.clone()).await {
                    Ok(()) => {
                        success_count.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        let mut slot = first_error.lock().await;
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        cancel_for_task.cancel();
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        let error = Arc::try_unwrap(first_error)
            .map(Mutex::into_inner)
            .unwrap_or(None);

        PoolOutcome {
            success_count: success_count.load(Ordering::SeqCst),
            first_error: error,
        }
    }
}
