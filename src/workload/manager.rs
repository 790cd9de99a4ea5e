//! Thread-safe work queues with dispatch caps, jittered rate throttling,
//! and dynamic insertion.
//!
//! All mutable queue state lives behind a single mutex per manager; the
//! throttle delay is reserved under the lock but awaited outside it, so one
//! worker's wait never serializes other dispatch attempts.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of asking a work source for the next item.
#[derive(Debug)]
pub enum WorkRequest<T> {
    /// A dispatched item. The caller must report [`WorkSource::item_done`]
    /// when it finishes processing it.
    Item(T),
    /// Nothing is pending right now, but items already dispatched are still
    /// being processed and may generate more work.
    Empty,
    /// No item will ever be dispatched again: the cap was reached, or the
    /// queue is drained with nothing in flight.
    Exhausted,
}

impl<T> WorkRequest<T> {
    pub fn has_item(&self) -> bool {
        matches!(self, WorkRequest::Item(_))
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            WorkRequest::Item(item) => Some(item),
            _ => None,
        }
    }
}

/// Jittered dispatch throttle, in items per second. Each dispatch samples a
/// rate uniformly between the bounds and spaces itself accordingly.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    min_per_sec: f64,
    max_per_sec: f64,
}

impl RateLimit {
    /// Fixed dispatch rate with no jitter.
    pub fn per_sec(rate: f64) -> Self {
        Self::jittered(rate, rate)
    }

    /// Dispatch rate sampled uniformly from `min_per_sec..=max_per_sec`.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min_per_sec <= max_per_sec`.
    pub fn jittered(min_per_sec: f64, max_per_sec: f64) -> Self {
        assert!(
            min_per_sec > 0.0 && min_per_sec <= max_per_sec,
            "dispatch rates must be positive and min <= max"
        );
        Self {
            min_per_sec,
            max_per_sec,
        }
    }

    fn sample_delay(&self) -> Duration {
        let rate = if self.min_per_sec == self.max_per_sec {
            self.min_per_sec
        } else {
            rand::thread_rng().gen_range(self.min_per_sec..=self.max_per_sec)
        };
        Duration::from_secs_f64(1.0 / rate)
    }
}

/// Configuration recognized by the workload managers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadOptions {
    /// Cap on the total number of items ever dispatched.
    pub max_items: Option<usize>,
    /// Optional dispatch-rate throttle.
    pub throttle: Option<RateLimit>,
    /// Dispatch a uniformly random pending item instead of FIFO order.
    pub randomize_order: bool,
}

impl WorkloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn throttle(mut self, limit: RateLimit) -> Self {
        self.throttle = Some(limit);
        self
    }

    pub fn randomize_order(mut self) -> Self {
        self.randomize_order = true;
        self
    }
}

/// Dispatch bookkeeping shared by the plain and prioritized managers: the
/// cap, the throttle slots, and the dispatched / in-flight counters.
pub(crate) struct DispatchGate {
    dispatched: usize,
    in_flight: usize,
    total: usize,
    max_items: Option<usize>,
    throttle: Option<RateLimit>,
    next_ready: Option<Instant>,
}

impl DispatchGate {
    pub(crate) fn new(max_items: Option<usize>, throttle: Option<RateLimit>) -> Self {
        Self {
            dispatched: 0,
            in_flight: 0,
            total: 0,
            max_items,
            throttle,
            next_ready: None,
        }
    }

    pub(crate) fn cap_reached(&self) -> bool {
        self.max_items
            .map_or(false, |max| self.dispatched >= max)
    }

    /// Count a dispatch and reserve its throttle slot. Returns the deadline
    /// the caller must await, outside the lock, before handing the item out.
    pub(crate) fn reserve(&mut self) -> Option<Instant> {
        self.dispatched += 1;
        self.in_flight += 1;

        let throttle = self.throttle?;
        let now = Instant::now();
        let ready = match self.next_ready {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        self.next_ready = Some(ready + throttle.sample_delay());
        (ready > now).then_some(ready)
    }

    pub(crate) fn item_added(&mut self) {
        self.total += 1;
    }

    pub(crate) fn item_done(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub(crate) fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn percent_complete(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.dispatched as f32 / self.total as f32
    }
}

/// A queue of not-yet-dispatched work items, safe to use from any number of
/// concurrent workers.
#[async_trait]
pub trait WorkSource: Send + Sync {
    type Item: Send;

    /// Dispatch the next item, applying the cap and the rate throttle. An
    /// item is removed from the pending queue atomically with being handed
    /// out and is never dispatched twice.
    async fn next_item(&self) -> WorkRequest<Self::Item>;

    /// Append an item. Safe to call concurrently with dispatch, including
    /// from a worker currently processing an item from this same source.
    fn add_item(&self, item: Self::Item);

    /// Report that a previously dispatched item has been fully processed
    /// (successfully or not). Runners call this; it is what lets the source
    /// distinguish "empty for now" from "exhausted".
    fn item_done(&self);

    /// Wait until the pending queue may have changed: an item was added or
    /// an in-flight item finished.
    async fn wait_for_work(&self);
}

struct ManagerState<T> {
    pending: VecDeque<T>,
    gate: DispatchGate,
    randomize: bool,
}

/// Keeps track of the units of work that still need to be done.
///
/// Dispatch order is FIFO unless [`WorkloadOptions::randomize_order`] is
/// set, in which case a uniformly random pending item is chosen.
pub struct WorkloadManager<T> {
    state: Mutex<ManagerState<T>>,
    changed: Notify,
}

impl<T: Send> WorkloadManager<T> {
    pub fn new(options: WorkloadOptions) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                pending: VecDeque::new(),
                gate: DispatchGate::new(options.max_items, options.throttle),
                randomize: options.randomize_order,
            }),
            changed: Notify::new(),
        }
    }

    /// Create a manager seeded with initial work items.
    pub fn with_items(items: impl IntoIterator<Item = T>, options: WorkloadOptions) -> Self {
        let manager = Self::new(options);
        {
            let mut state = manager.state.lock().unwrap();
            for item in items {
                state.pending.push_back(item);
                state.gate.item_added();
            }
        }
        manager
    }

    /// Number of items waiting to be dispatched.
    pub fn remaining_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Number of items handed out so far.
    pub fn dispatched_count(&self) -> usize {
        self.state.lock().unwrap().gate.dispatched()
    }

    /// Total number of items ever added, including already dispatched ones.
    pub fn total_items(&self) -> usize {
        self.state.lock().unwrap().gate.total()
    }

    /// Fraction of all added items that have been dispatched.
    pub fn percent_complete(&self) -> f32 {
        self.state.lock().unwrap().gate.percent_complete()
    }
}

#[async_trait]
impl<T: Send> WorkSource for WorkloadManager<T> {
    type Item = T;

    async fn next_item(&self) -> WorkRequest<T> {
        let (item, deadline) = {
            let mut state = self.state.lock().unwrap();
            if state.gate.cap_reached() {
                return WorkRequest::Exhausted;
            }
            let index = if state.randomize && state.pending.len() > 1 {
                rand::thread_rng().gen_range(0..state.pending.len())
            } else {
                0
            };
            let Some(item) = state.pending.remove(index) else {
                return if state.gate.in_flight() == 0 {
                    WorkRequest::Exhausted
                } else {
                    WorkRequest::Empty
                };
            };
            let deadline = state.gate.reserve();
            (item, deadline)
        };

        if let Some(deadline) = deadline {
            // Throttle outside the lock so other workers can keep dispatching.
            debug!("throttling dispatch");
            tokio::time::sleep_until(deadline).await;
        }

        WorkRequest::Item(item)
    }

    fn add_item(&self, item: T) {
        {
            let mut state = self.state.lock().unwrap();
            state.pending.push_back(item);
            state.gate.item_added();
        }
        self.changed.notify_waiters();
    }

    fn item_done(&self) {
        self.state.lock().unwrap().gate.item_done();
        self.changed.notify_waiters();
    }

    async fn wait_for_work(&self) {
        self.changed.notified().await;
    }
}
