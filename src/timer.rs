//! # Timer Queue
//!
//! Deadline bookkeeping for requests whose handlers asked the client to wait
//! longer. Each id has at most one deadline; scheduling it again replaces the
//! previous one. [`TimerQueue::pop_expired`] yields (and removes) every id whose
//! deadline is at or before `now`, earliest first.
//!
//! The queue never touches the running handler. It only tells the service when
//! it should stop expecting a reply. [`Deadlines`] is the shared form the
//! service uses: requests extend and clear their entry, and a driver task logs
//! every deadline that passes without a reply.

use crate::error::FrameworkError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ordered set of `(deadline, id)` entries with O(log n) reset and cancel.
#[derive(Debug)]
pub struct TimerQueue<K> {
    // (deadline, insertion sequence) keeps entries with equal deadlines distinct.
    entries: BTreeMap<(Instant, u64), K>,
    index: HashMap<K, (Instant, u64)>,
    seq: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }
}

impl<K: Hash + Eq + Clone> TimerQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline of `id`, replacing any earlier entry.
    /// Returns the replaced deadline, if any.
    pub fn schedule(&mut self, id: K, deadline: Instant) -> Option<Instant> {
        let previous = self.cancel(&id);
        self.seq += 1;
        let slot = (deadline, self.seq);
        self.entries.insert(slot, id.clone());
        self.index.insert(id, slot);
        previous
    }

    /// Same as [`schedule`](Self::schedule); reads better at reset call sites.
    pub fn reschedule(&mut self, id: K, deadline: Instant) -> Option<Instant> {
        self.schedule(id, deadline)
    }

    /// Schedules `id` to expire `millis` milliseconds after `now`.
    ///
    /// A negative duration is rejected and leaves any prior deadline untouched.
    pub fn schedule_in(&mut self, id: K, now: Instant, millis: i64) -> Result<Instant, FrameworkError> {
        let Ok(millis) = u64::try_from(millis) else {
            return Err(FrameworkError::NegativeTimeout(millis));
        };
        let deadline = now + Duration::from_millis(millis);
        self.schedule(id, deadline);
        Ok(deadline)
    }

    /// Removes the deadline of `id`, returning it if one was set.
    pub fn cancel(&mut self, id: &K) -> Option<Instant> {
        let slot = self.index.remove(id)?;
        self.entries.remove(&slot);
        Some(slot.0)
    }

    pub fn deadline(&self, id: &K) -> Option<Instant> {
        self.index.get(id).map(|slot| slot.0)
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|slot| slot.0)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Lazily removes and yields ids whose deadline is `<= now`.
    ///
    /// Entries not consumed from the iterator stay in the queue.
    pub fn pop_expired(&mut self, now: Instant) -> Expired<'_, K> {
        Expired { queue: self, now }
    }
}

/// Iterator returned by [`TimerQueue::pop_expired`].
pub struct Expired<'a, K> {
    queue: &'a mut TimerQueue<K>,
    now: Instant,
}

impl<K: Hash + Eq + Clone> Iterator for Expired<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let (&(deadline, _), _) = self.queue.entries.first_key_value()?;
        if deadline > self.now {
            return None;
        }
        let (_, id) = self.queue.entries.pop_first()?;
        self.queue.index.remove(&id);
        Some(id)
    }
}

#[derive(Default)]
struct DeadlineState {
    timers: TimerQueue<u64>,
    subjects: HashMap<u64, String>,
}

/// Request deadlines shared between the requests of a service and its timer
/// driver.
#[derive(Default)]
pub(crate) struct Deadlines {
    state: Mutex<DeadlineState>,
    changed: Notify,
}

impl Deadlines {
    /// Sets the deadline of request `id` to `millis` from now.
    pub(crate) fn extend(&self, id: u64, subject: &str, millis: i64) -> Result<Instant, FrameworkError> {
        let at = {
            let mut state = self.state.lock();
            let at = state.timers.schedule_in(id, Instant::now(), millis)?;
            state.subjects.insert(id, subject.to_string());
            at
        };
        self.changed.notify_one();
        Ok(at)
    }

    /// Drops the deadline of request `id`, if any.
    pub(crate) fn clear(&self, id: u64) {
        let mut state = self.state.lock();
        if state.timers.cancel(&id).is_some() {
            state.subjects.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, id: u64) -> Option<Instant> {
        self.state.lock().timers.deadline(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn take_expired(&self, now: Instant) -> Vec<(u64, String)> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let ids: Vec<u64> = state.timers.pop_expired(now).collect();
        ids.into_iter()
            .map(|id| (id, state.subjects.remove(&id).unwrap_or_default()))
            .collect()
    }

    /// Sleeps until the earliest deadline, reports what expired, and repeats
    /// until `stop` flips or its sender goes away.
    pub(crate) async fn run(&self, mut stop: watch::Receiver<bool>) {
        debug!("Timer driver started");
        while !*stop.borrow() {
            let next = self.state.lock().timers.next_deadline();
            let sleep = async {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = sleep => {
                    for (id, subject) in self.take_expired(Instant::now()) {
                        warn!(subject = %subject, request = id, "Request deadline elapsed without a reply");
                    }
                }
                _ = self.changed.notified() => {}
                res = stop.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Timer driver stopped");
    }
}
