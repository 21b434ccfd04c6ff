use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};

use crate::rate_limiter::RateLimiter;

struct State<T> {
    /// Items ready to be handed out, in order.
    queue: VecDeque<T>,
    /// Items which need processing, queued or waiting for `done`.
    dirty: HashSet<T>,
    /// Items currently handed out to a worker.
    processing: HashSet<T>,
    /// Deadlines of delayed adds.
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Deduplicating FIFO of work items.
///
/// An item is never handed out to two workers at the same time: adding an item
/// which is being processed marks it dirty and it is queued again once the
/// worker calls [`WorkQueue::done`].
pub(crate) struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: Default::default(),
                    dirty: Default::default(),
                    processing: Default::default(),
                    waiting: Default::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` for processing, no-op if it is already pending.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed. Of several delayed adds for the
    /// same item the earliest deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&item) {
                if *existing <= deadline {
                    return;
                }
            }
            state.waiting.insert(item.clone(), deadline);
        }
        let inner: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                WorkQueue { inner }.fire(item, deadline);
            }
        });
    }

    fn fire(&self, item: T, deadline: Instant) {
        let due = {
            let mut state = self.lock();
            match state.waiting.get(&item) {
                Some(d) if *d == deadline => {
                    state.waiting.remove(&item);
                    true
                }
                _ => false,
            }
        };
        if due {
            self.add(item);
        }
    }

    /// Wait for the next item. Returns `None` once the queue is shut down and
    /// all queued items have been handed out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing, re-queue it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Stop accepting new items, workers drain what is already queued.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

/// [`WorkQueue`] with per-item rate limited re-delivery.
pub(crate) struct RateLimitingQueue<T> {
    queue: WorkQueue<T>,
    limiter: Arc<dyn RateLimiter<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<T> Deref for RateLimitingQueue<T> {
    type Target = WorkQueue<T>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            queue: WorkQueue::new(),
            limiter: Arc::new(limiter),
        }
    }

    /// Add `item` after the delay the rate limiter assigns to it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        self.queue.add_after(item, delay);
    }

    /// Clear the retry history of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::ItemExponentialFailureRateLimiter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("ns/a"));
        assert_eq!(queue.get().await, Some("ns/b"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn add_while_processing_is_redelivered_once_after_done() {
        let queue = WorkQueue::new();
        queue.add("ns/a");
        let item = queue.get().await.unwrap();
        queue.add("ns/a");
        queue.add("ns/a");
        // not handed out while in flight
        assert_eq!(queue.len(), 0);
        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("ns/a"));
        queue.done(&"ns/a");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("ns/a");
        assert_eq!(waiter.await.unwrap(), Some("ns/a"));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_items_first() {
        let queue = WorkQueue::new();
        queue.add("ns/a");
        queue.shut_down();
        queue.add("ns/b");
        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await, Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue: WorkQueue<&'static str> = WorkQueue::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.shut_down();
        for waiter in waiters {
            let got = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
            assert_eq!(got, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_becomes_visible_after_delay() {
        let queue = WorkQueue::new();
        queue.add_after("ns/a", Duration::from_secs(10));
        queue.add_after("ns/a", Duration::from_secs(20));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(queue.len(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("ns/a"));
        queue.done(&"ns/a");
        // the later duplicate was superseded by the earlier deadline
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_adds_are_dropped_after_shutdown() {
        let queue = WorkQueue::new();
        queue.add_after("ns/a", Duration::from_secs(1));
        queue.shut_down();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_and_forget() {
        let queue = RateLimitingQueue::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        ));
        queue.add_rate_limited("ns/a");
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.num_requeues(&"ns/a"), 1);
        assert_eq!(queue.get().await, Some("ns/a"));
        queue.forget(&"ns/a");
        queue.done(&"ns/a");
        assert_eq!(queue.num_requeues(&"ns/a"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_worker_per_item() {
        let queue: WorkQueue<u8> = WorkQueue::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                let processed = processed.clone();
                tokio::spawn(async move {
                    while let Some(item) = queue.get().await {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        processed.fetch_add(1, Ordering::SeqCst);
                        queue.done(&item);
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            queue.add(1);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(processed.load(Ordering::SeqCst) >= 1);
    }
}
