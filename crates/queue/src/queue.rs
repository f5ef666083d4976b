//! Deduplicating work queue with per-item serialization.
//!
//! An item is in at most one of two places at a time: waiting in `queue`, or being
//! handled by a worker (`processing`). Adds for an item that is already waiting are
//! coalesced; adds for an item in flight are parked in `dirty` and the item is
//! queued again when the worker calls [`WorkQueue::done`].

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::rate_limiter::RateLimiter;

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// Cloneable handle; all clones share one queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    pub fn name(&self) -> &'static str { self.shared.name }

    /// Idempotent: no duplicate entries, and never a second concurrent delivery.
    pub fn add(&self, item: T) {
        let mut st = self.shared.lock();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        st.dirty.insert(item.clone());
        counter!("workqueue_adds_total", 1u64, "name" => self.shared.name);
        if st.processing.contains(&item) {
            return;
        }
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next item. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
                    drop(st);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark the end of processing for an item returned by [`WorkQueue::get`].
    /// An add that arrived meanwhile makes the item immediately available again.
    pub fn done(&self, item: &T) {
        let mut st = self.shared.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Add once `delay` has elapsed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let q = self.clone();
                rt.spawn(async move {
                    tokio::time::sleep(delay).await;
                    q.add(item);
                });
            }
            Err(_) => {
                warn!(queue = self.shared.name, "no runtime for delayed add; adding immediately");
                self.add(item);
            }
        }
    }

    /// Requeue with the limiter's backoff; counts as one failure for `item`.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "name" => self.shared.name);
        debug!(queue = self.shared.name, delay_ms = delay.as_millis() as u64, "requeue rate limited");
        self.add_after(item, delay);
    }

    /// Clear the failure history of `item` (after a successful pass).
    pub fn forget(&self, item: &T) { self.shared.limiter.forget(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.shared.limiter.num_requeues(item) }

    /// Stop handing out items. In-flight items may still call `done`.
    pub fn shut_down(&self) {
        self.shared.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.shared.lock().shutting_down }

    /// Items waiting for a worker (excludes in-flight items).
    pub fn len(&self) -> usize { self.shared.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
