//! # Task Queue
//!
//! Per-key ordered execution on top of [`GroupLock`]. [`TaskQueue::enqueue`]
//! appends a future to its key's queue and returns immediately. One drain task
//! per non-empty key runs the queue head to completion while holding the group
//! lock for that key, then moves on to the next entry.
//!
//! A tokio [`Semaphore`] bounds how many keys execute at the same time. Tasks
//! are caught with `catch_unwind`, so a panicking task never stalls its key.

use super::lock::GroupLock;
use crate::error::FrameworkError;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info};

type Task = BoxFuture<'static, ()>;

struct Inner {
    lock: GroupLock,
    queues: Mutex<HashMap<String, VecDeque<Task>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    idle: Notify,
}

/// FIFO-per-key async work queue with cross-key parallelism.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Creates a queue that runs at most `workers` keys concurrently.
    pub fn new(lock: GroupLock, workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                lock,
                queues: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// The lock the queue serializes through.
    pub fn lock(&self) -> &GroupLock {
        &self.inner.lock
    }

    /// Appends `task` to the queue of `key`.
    ///
    /// After [`shutdown`](Self::shutdown) has begun, tasks are still accepted for
    /// keys with queued work, but a key with nothing pending is refused with
    /// [`FrameworkError::QueueClosed`]. Must be called within a tokio runtime.
    pub fn enqueue<F>(&self, key: impl Into<String>, task: F) -> Result<(), FrameworkError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut queues = self.inner.queues.lock();
        if let Some(queue) = queues.get_mut(&key) {
            queue.push_back(task.boxed());
            return Ok(());
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FrameworkError::QueueClosed);
        }
        queues.insert(key.clone(), VecDeque::from([task.boxed()]));
        drop(queues);

        tokio::spawn(self.clone().drain(key));
        Ok(())
    }

    /// Number of tasks waiting (not yet started) for `key`.
    pub fn pending(&self, key: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Returns true when no key has queued or running work.
    pub fn is_idle(&self) -> bool {
        self.inner.queues.lock().is_empty()
    }

    /// Stops accepting new keys and waits for all queued work to finish.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        info!("Draining task queue");
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                break;
            }
            notified.await;
        }
        info!("Task queue drained");
    }

    async fn drain(self, key: String) {
        debug!(group = %key, "Drain started");
        loop {
            {
                let mut queues = self.inner.queues.lock();
                let empty = queues.get(&key).map_or(true, VecDeque::is_empty);
                if empty {
                    queues.remove(&key);
                    drop(queues);
                    self.inner.idle.notify_waiters();
                    debug!(group = %key, "Drain finished");
                    return;
                }
            }

            let guard = match self.inner.lock.acquire(&key).await {
                Ok(guard) => guard,
                Err(e) => {
                    // Drain tasks never hold a key when they start waiting.
                    error!(group = %key, error = %e, "Failed to acquire group, dropping queued tasks");
                    self.inner.queues.lock().remove(&key);
                    self.inner.idle.notify_waiters();
                    return;
                }
            };
            // The semaphore is never closed.
            let Ok(permit) = self.inner.permits.clone().acquire_owned().await else {
                return;
            };

            // Only this drain task pops entries for `key`.
            let task = self
                .inner
                .queues
                .lock()
                .get_mut(&key)
                .and_then(VecDeque::pop_front);

            if let Some(task) = task {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    error!(group = %key, cause = %panic_message(panic.as_ref()), "Task panicked");
                }
            }

            drop(permit);
            drop(guard);
        }
    }
}

/// Renders a panic payload for logging.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn queue(workers: usize) -> TaskQueue {
        TaskQueue::new(GroupLock::new(), workers)
    }

    #[tokio::test]
    async fn test_same_key_tasks_run_in_submission_order() {
        let queue = queue(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            queue
                .enqueue("books", async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    log.lock().push(i);
                })
                .unwrap();
        }
        queue.shutdown().await;
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_same_key_tasks_never_overlap() {
        let queue = queue(8);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            queue
                .enqueue("k", async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.shutdown().await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocked_key_does_not_block_other_keys() {
        let queue = queue(4);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        queue
            .enqueue("slow", async move {
                let _ = release_rx.await;
            })
            .unwrap();
        queue
            .enqueue("fast", async move {
                let _ = done_tx.send(());
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("fast key must run while slow key is busy")
            .unwrap();
        release_tx.send(()).unwrap();
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stall_its_key() {
        let queue = queue(2);
        let (tx, rx) = oneshot::channel();
        queue.enqueue("k", async { panic!("boom"); }).unwrap();
        queue
            .enqueue("k", async move {
                let _ = tx.send(());
            })
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_keys_but_finishes_queued_work() {
        let queue = queue(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            queue
                .enqueue("k", async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(matches!(
            queue.enqueue("other", async {}),
            Err(FrameworkError::QueueClosed)
        ));
    }
}
