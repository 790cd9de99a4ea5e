//! Priority-bucketed work dispatch.
//!
//! Items are partitioned into buckets keyed by an integer priority; lower
//! numbers dispatch first. Within a bucket the order is FIFO. This is a
//! simple multi-queue scheduler, not a heap: the number of distinct
//! priority levels is expected to stay small.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::manager::{DispatchGate, WorkRequest, WorkSource, WorkloadOptions};

/// A work item tagged with its dispatch priority. Lower numbers go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityItem<T> {
    pub priority: i32,
    pub item: T,
}

impl<T> PriorityItem<T> {
    pub fn new(priority: i32, item: T) -> Self {
        Self { priority, item }
    }
}

struct PriorityState<T> {
    buckets: BTreeMap<i32, VecDeque<T>>,
    pending: usize,
    gate: DispatchGate,
}

/// Workload manager that dispatches strictly in ascending priority order.
///
/// Adding an item with an unseen priority creates a new bucket; the
/// `BTreeMap` keeps the bucket index sorted. `randomize_order` has no
/// effect here, since the dispatch order is defined by priority.
pub struct PriorityWorkloadManager<T> {
    state: Mutex<PriorityState<T>>,
    changed: Notify,
}

impl<T: Send> PriorityWorkloadManager<T> {
    pub fn new(options: WorkloadOptions) -> Self {
        Self {
            state: Mutex::new(PriorityState {
                buckets: BTreeMap::new(),
                pending: 0,
                gate: DispatchGate::new(options.max_items, options.throttle),
            }),
            changed: Notify::new(),
        }
    }

    /// Append an item under the given priority.
    pub fn add_with_priority(&self, priority: i32, item: T) {
        self.add_item(PriorityItem::new(priority, item));
    }

    /// Number of items waiting to be dispatched, across all buckets.
    pub fn remaining_count(&self) -> usize {
        self.state.lock().unwrap().pending
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

    /// The priority levels that currently hold pending items, ascending.
    pub fn priority_levels(&self) -> Vec<i32> {
        self.state.lock().unwrap().buckets.keys().copied().collect()
    }
}

#[async_trait]
impl<T: Send> WorkSource for PriorityWorkloadManager<T> {
    type Item = PriorityItem<T>;

    async fn next_item(&self) -> WorkRequest<PriorityItem<T>> {
        let (dispatched, deadline) = {
            let mut state = self.state.lock().unwrap();
            if state.gate.cap_reached() {
                return WorkRequest::Exhausted;
            }
            // Lowest-numbered bucket first; drained buckets are removed so
            // every bucket present holds at least one item.
            let popped = loop {
                let Some(mut entry) = state.buckets.first_entry() else {
                    break None;
                };
                let priority = *entry.key();
                match entry.get_mut().pop_front() {
                    Some(item) => {
                        if entry.get().is_empty() {
                            entry.remove();
                        }
                        break Some((priority, item));
                    }
                    None => {
                        entry.remove();
                    }
                }
            };
            let Some((priority, item)) = popped else {
                return if state.gate.in_flight() == 0 {
                    WorkRequest::Exhausted
                } else {
                    WorkRequest::Empty
                };
            };
            state.pending -= 1;

            let deadline = state.gate.reserve();
            (PriorityItem::new(priority, item), deadline)
        };

        if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
        }

        WorkRequest::Item(dispatched)
    }

    fn add_item(&self, item: PriorityItem<T>) {
        {
            let mut state = self.state.lock().unwrap();
            state
                .buckets
                .entry(item.priority)
                .or_default()
                .push_back(item.item);
            state.pending += 1;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lower_priority_numbers_dispatch_first() {
        let manager = PriorityWorkloadManager::new(WorkloadOptions::new());
        manager.add_with_priority(5, "low");
        manager.add_with_priority(1, "high");
        manager.add_with_priority(3, "mid");

        let mut order = Vec::new();
        while let WorkRequest::Item(dispatched) = manager.next_item().await {
            manager.item_done();
            order.push((dispatched.priority, dispatched.item));
        }

        assert_eq!(order, vec![(1, "high"), (3, "mid"), (5, "low")]);
    }

    #[tokio::test]
    async fn dispatch_is_fifo_within_a_bucket() {
        let manager = PriorityWorkloadManager::new(WorkloadOptions::new());
        for n in 0..4 {
            manager.add_with_priority(2, n);
        }

        let mut order = Vec::new();
        while let WorkRequest::Item(dispatched) = manager.next_item().await {
            manager.item_done();
            order.push(dispatched.item);
        }

        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn unseen_priority_creates_a_sorted_bucket() {
        let manager = PriorityWorkloadManager::new(WorkloadOptions::new());
        manager.add_with_priority(7, "a");
        manager.add_with_priority(2, "b");
        assert_eq!(manager.priority_levels(), vec![2, 7]);

        manager.add_with_priority(4, "c");
        assert_eq!(manager.priority_levels(), vec![2, 4, 7]);
    }
}
