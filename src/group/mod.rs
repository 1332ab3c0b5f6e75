//! Group serialization.
//!
//! - [`GroupLock`]: keyed mutual exclusion with FIFO waiters.
//! - [`TaskQueue`]: submit-and-return work queues, one per key, drained through the lock.

pub mod lock;
pub mod queue;

pub use lock::{GroupGuard, GroupLock};
pub use queue::TaskQueue;
