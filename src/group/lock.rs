//! # Group Lock
//!
//! A keyed mutual-exclusion primitive. Each key behaves like its own async mutex:
//! acquiring it suspends until every earlier holder and waiter for the same key
//! is gone, while distinct keys never block each other.
//!
//! ## Ordering
//!
//! Waiters are queued per key in the order they called [`GroupLock::acquire`].
//! Releasing hands ownership directly to the oldest waiter (no barging), or frees
//! the key when nobody waits. A waiter that is cancelled before it is woken is
//! skipped.
//!
//! ## Re-entrancy
//!
//! Acquiring a key that the *current task* already holds would deadlock, so it
//! is rejected with [`FrameworkError::ReentrantLock`]. Detection relies on the
//! tokio task id and therefore only applies inside spawned tasks; code running
//! directly inside `block_on` must not nest acquisitions of the same key.

use crate::error::FrameworkError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task;
use tracing::trace;

struct Waiter {
    task: Option<task::Id>,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct Slot {
    holder: Option<task::Id>,
    waiters: VecDeque<Waiter>,
}

/// A set of independently lockable string keys.
#[derive(Clone, Default)]
pub struct GroupLock {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl GroupLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `key`, suspending until it is free.
    pub async fn acquire(&self, key: &str) -> Result<GroupGuard, FrameworkError> {
        let current = task::try_id();
        let wake = {
            let mut slots = self.slots.lock();
            match slots.get_mut(key) {
                None => {
                    slots.insert(
                        key.to_string(),
                        Slot {
                            holder: current,
                            waiters: VecDeque::new(),
                        },
                    );
                    trace!(group = key, "Acquired");
                    return Ok(self.guard(key));
                }
                Some(slot) => {
                    if current.is_some() && slot.holder == current {
                        return Err(FrameworkError::ReentrantLock(key.to_string()));
                    }
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push_back(Waiter {
                        task: current,
                        wake: tx,
                    });
                    rx
                }
            }
        };

        let mut pending = PendingAcquire {
            lock: self,
            key,
            wake,
            done: false,
        };
        // The sender is only dropped once it has handed us the key.
        let _ = (&mut pending.wake).await;
        pending.done = true;
        trace!(group = key, "Acquired after wait");
        Ok(self.guard(key))
    }

    /// Returns true if some holder currently owns `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of keys that are currently held.
    pub fn held(&self) -> usize {
        self.slots.lock().len()
    }

    fn guard(&self, key: &str) -> GroupGuard {
        GroupGuard {
            lock: self.clone(),
            key: key.to_string(),
        }
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        while let Some(waiter) = slot.waiters.pop_front() {
            slot.holder = waiter.task;
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
        slots.remove(key);
        trace!(group = key, "Released");
    }
}

/// Releases the woken-but-unclaimed key if the acquiring future is dropped.
struct PendingAcquire<'a> {
    lock: &'a GroupLock,
    key: &'a str,
    wake: oneshot::Receiver<()>,
    done: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.wake.close();
        if self.wake.try_recv().is_ok() {
            self.lock.release(self.key);
        }
    }
}

/// Ownership of one key. The key is released when the guard drops.
pub struct GroupGuard {
    lock: GroupLock,
    key: String,
}

impl GroupGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

impl std::fmt::Debug for GroupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let lock = GroupLock::new();
        let a = lock.acquire("a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), lock.acquire("b"))
            .await
            .expect("b must not wait for a")
            .unwrap();
        assert_eq!(lock.held(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.held(), 0);
    }

    #[tokio::test]
    async fn test_same_key_wakes_waiters_in_fifo_order() {
        let lock = GroupLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = lock.acquire("k").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire("k").await.unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(order.lock().is_empty());
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(!lock.is_locked("k"));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_the_key() {
        let lock = GroupLock::new();
        let first = lock.acquire("k").await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(10), lock.acquire("k")).await;
        assert!(waiting.is_err());
        drop(first);
        assert!(!lock.is_locked("k"));
        let _again = lock.acquire("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_reentrant_acquire_is_rejected() {
        let lock = GroupLock::new();
        let result = tokio::spawn(async move {
            let _outer = lock.acquire("k").await.unwrap();
            lock.acquire("k").await.map(|_| ())
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(FrameworkError::ReentrantLock(k)) if k == "k"));
    }
}
