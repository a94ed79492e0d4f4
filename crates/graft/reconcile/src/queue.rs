use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bound for queue keys: any hashable, cloneable, displayable identifier.
pub trait ReconcileKey: Clone + Eq + Hash + Display + Send + Sync + 'static {}

impl<T> ReconcileKey for T where T: Clone + Eq + Hash + Display + Send + Sync + 'static {}

/// Nominal delay before a failed key becomes eligible again.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Cadence of the sweep that moves due retries back to pending.
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Randomize a delay within ±20% of its nominal value, so synchronized
/// failures do not retry in lockstep.
fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

struct QueueState<K> {
    pending: HashSet<K>,
    running: HashSet<K>,
    retry: HashMap<K, Instant>,
}

/// Deduplicating work queue.
///
/// A key lives in at most one of the three states at any instant: pending
/// (waiting for a worker), running (popped, not yet settled), or retry
/// (failed, waiting out its backoff). [`add`](Self::add) is idempotent
/// across all three, so scans can re-enqueue everything they see without
/// flooding workers.
///
/// Iteration order over pending keys is unspecified; nothing downstream may
/// rely on it.
pub struct ReconcileQueue<K: ReconcileKey> {
    state: Mutex<QueueState<K>>,
    wakeup: Notify,
    shutdown: CancellationToken,
}

impl<K: ReconcileKey> ReconcileQueue<K> {
    /// Create a queue and spawn its background retry sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState {
                pending: HashSet::new(),
                running: HashSet::new(),
                retry: HashMap::new(),
            }),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let sweeper = Arc::clone(&queue);
        tokio::spawn(async move { sweeper.run_retry_sweep().await });

        queue
    }

    // The lock is never held across an await; recover the guard on poison.
    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a key unless it is already pending, running, or awaiting
    /// retry. Wakes at most one blocked [`pop`](Self::pop).
    pub fn add(&self, key: K) {
        {
            let mut state = self.state();
            if state.pending.contains(&key)
                || state.running.contains(&key)
                || state.retry.contains_key(&key)
            {
                return;
            }
            state.pending.insert(key);
        }
        self.wakeup.notify_one();
    }

    /// Move up to `max` pending keys into the running state and return them.
    ///
    /// Blocks (without polling) while no work is pending. Returns an empty
    /// batch only once the queue is shutting down.
    pub async fn pop(self: &Arc<Self>, max: usize) -> Vec<ReconcileItem<K>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Vec::new();
            }

            // Register interest before re-checking state so an add racing
            // this pop leaves a stored wakeup permit behind.
            let notified = self.wakeup.notified();

            let popped = {
                let mut state = self.state();
                if state.pending.is_empty() {
                    None
                } else {
                    let keys: Vec<K> = state.pending.iter().take(max).cloned().collect();
                    for key in &keys {
                        state.pending.remove(key);
                        state.running.insert(key.clone());
                    }
                    Some(keys)
                }
            };

            if let Some(keys) = popped {
                return keys
                    .into_iter()
                    .map(|key| ReconcileItem::new(key, Arc::clone(self)))
                    .collect();
            }

            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return Vec::new(),
            }
        }
    }

    /// Flip the queue into shutdown: blocked and future pops return empty.
    pub fn shut_down(&self) {
        self.shutdown.cancel();
        self.wakeup.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn settle(&self, key: &K, retry: bool) {
        let mut state = self.state();
        state.running.remove(key);
        if retry {
            state
                .retry
                .insert(key.clone(), Instant::now() + jittered(RETRY_BACKOFF));
        }
    }

    async fn run_retry_sweep(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = sleep(jittered(RETRY_SWEEP_INTERVAL)) => {}
                _ = self.shutdown.cancelled() => {
                    // one last wakeup so a blocked pop observes the shutdown
                    self.wakeup.notify_one();
                    return;
                }
            }

            let moved = {
                let mut state = self.state();
                let now = Instant::now();
                let due: Vec<K> = state
                    .retry
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &due {
                    state.retry.remove(key);
                    state.pending.insert(key.clone());
                }
                due.len()
            };

            if moved > 0 {
                debug!(moved, "rescheduled keys past their retry backoff");
                self.wakeup.notify_one();
            }
        }
    }
}

/// One popped unit of work. The key stays in the running state until the
/// item is settled, exactly once, by [`complete`](Self::complete) or
/// [`fail`](Self::fail).
pub struct ReconcileItem<K: ReconcileKey> {
    key: K,
    queue: Arc<ReconcileQueue<K>>,
    settled: bool,
}

impl<K: ReconcileKey> ReconcileItem<K> {
    fn new(key: K, queue: Arc<ReconcileQueue<K>>) -> Self {
        Self {
            key,
            queue,
            settled: false,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The key is done; it leaves the queue entirely and may be added again.
    pub fn complete(mut self) {
        self.settled = true;
        self.queue.settle(&self.key, false);
    }

    /// The key failed; it is rescheduled after a jittered backoff.
    pub fn fail(mut self, error: impl Display) {
        self.settled = true;
        debug!(key = %self.key, error = %error, "scheduling retry");
        self.queue.settle(&self.key, true);
    }
}

impl<K: ReconcileKey> Drop for ReconcileItem<K> {
    fn drop(&mut self) {
        // A dropped-but-unsettled item must not strand its key in running.
        if !self.settled {
            debug!(key = %self.key, "item dropped without explicit settle, treating as done");
            self.queue.settle(&self.key, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    fn counts(queue: &ReconcileQueue<i64>) -> (usize, usize, usize) {
        let state = queue.state();
        (state.pending.len(), state.running.len(), state.retry.len())
    }

    #[tokio::test]
    async fn add_is_idempotent_across_all_states() {
        let queue = ReconcileQueue::new();
        queue.add(7);
        queue.add(7);
        assert_eq!(counts(&queue), (1, 0, 0));

        let items = queue.pop(10).await;
        assert_eq!(items.len(), 1);
        queue.add(7);
        assert_eq!(counts(&queue), (0, 1, 0));

        items.into_iter().next().unwrap().fail("backend unavailable");
        queue.add(7);
        assert_eq!(counts(&queue), (0, 0, 1));
    }

    #[tokio::test]
    async fn pop_respects_batch_limit() {
        let queue = ReconcileQueue::new();
        for key in 0..10 {
            queue.add(key);
        }

        let items = queue.pop(3).await;
        assert_eq!(items.len(), 3);
        assert_eq!(counts(&queue), (7, 3, 0));

        for item in items {
            item.complete();
        }
        assert_eq!(counts(&queue), (7, 0, 0));
    }

    #[tokio::test]
    async fn pop_blocks_until_work_arrives() {
        let queue = ReconcileQueue::new();
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.pop(1).await });

        sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        queue.add(42);
        let items = timeout(Duration::from_secs(1), handle)
            .await
            .expect("pop stayed blocked after add")
            .unwrap();
        assert_eq!(*items[0].key(), 42);
    }

    #[tokio::test]
    async fn completed_keys_can_be_added_again() {
        let queue = ReconcileQueue::new();
        queue.add(9);
        queue.pop(1).await.into_iter().next().unwrap().complete();
        assert_eq!(counts(&queue), (0, 0, 0));

        queue.add(9);
        assert_eq!(counts(&queue), (1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_honors_backoff_window() {
        let queue = ReconcileQueue::new();
        queue.add(5);
        queue
            .pop(1)
            .await
            .into_iter()
            .next()
            .unwrap()
            .fail("transient");

        // Still below the 5s -20% backoff floor, sweeps included.
        advance(Duration::from_secs(3)).await;
        assert_eq!(counts(&queue), (0, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keys_return_after_backoff() {
        let queue = ReconcileQueue::new();
        queue.add(1);
        queue
            .pop(1)
            .await
            .into_iter()
            .next()
            .unwrap()
            .fail("transient");

        // Let the spawned sweep task register its timer before the clock
        // jumps; a paused-clock advance only fires already-registered timers.
        tokio::task::yield_now().await;

        // Worst case: 5s +20% backoff plus one full sweep interval.
        advance(Duration::from_secs(8)).await;
        // The advance wakes the sweep task; yield so it runs before we look.
        tokio::task::yield_now().await;
        assert_eq!(counts(&queue), (1, 0, 0));

        let retried = queue.pop(1).await;
        assert_eq!(*retried[0].key(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_pop() {
        let queue: Arc<ReconcileQueue<i64>> = ReconcileQueue::new();
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.pop(4).await });

        sleep(Duration::from_millis(20)).await;
        queue.shut_down();

        let items = timeout(Duration::from_secs(1), handle)
            .await
            .expect("pop stayed blocked after shutdown")
            .unwrap();
        assert!(items.is_empty());
        assert!(queue.pop(4).await.is_empty());
    }

    #[tokio::test]
    async fn dropped_items_are_treated_as_done() {
        let queue = ReconcileQueue::new();
        queue.add(3);
        let items = queue.pop(1).await;
        drop(items);
        assert_eq!(counts(&queue), (0, 0, 0));

        queue.add(3);
        assert_eq!(counts(&queue), (1, 0, 0));
    }
}
