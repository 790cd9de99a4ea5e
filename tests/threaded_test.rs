//! Worker-pool runs: concurrent dispatch, workers that outlive momentary
//! queue drains, cancellation, and configuration validation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use jobflow::{
    ThreadedWorkloadRunner, WorkSource, WorkloadError, WorkloadManager, WorkloadOptions,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_drains_a_seeded_queue() {
    let manager = Arc::new(WorkloadManager::with_items(0..50u32, WorkloadOptions::new()));
    let runner = ThreadedWorkloadRunner::new(manager.clone(), 8);

    let processed = Arc::new(AtomicUsize::new(0));
    let counted = processed.clone();
    runner
        .do_work(
            move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_, _| {},
            false,
        )
        .await
        .unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 50);
    assert_eq!(manager.remaining_count(), 0);
    assert!(runner.is_complete());
    assert!(!runner.was_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_workers_wait_for_work_generated_by_busy_ones() {
    // One seed item fans out into a depth-3 binary tree of work, so most of
    // the pool starts out with an empty queue. If idle workers exited on the
    // first empty read, the later generations would never be processed.
    let manager = Arc::new(WorkloadManager::with_items([0u32], WorkloadOptions::new()));
    let runner = ThreadedWorkloadRunner::new(manager.clone(), 4);

    let processed = Arc::new(AtomicUsize::new(0));
    let counted = processed.clone();
    runner
        .do_work(
            move |depth, mgr| {
                counted.fetch_add(1, Ordering::SeqCst);
                if *depth < 3 {
                    mgr.add_item(depth + 1);
                    mgr.add_item(depth + 1);
                }
                Ok(())
            },
            |_, _| {},
            false,
        )
        .await
        .unwrap();

    // 1 + 2 + 4 + 8 items across the four generations.
    assert_eq!(processed.load(Ordering::SeqCst), 15);
    assert_eq!(manager.total_items(), 15);
    assert!(runner.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_fault_cancels_the_whole_pool() {
    let manager = Arc::new(WorkloadManager::with_items(
        0..200u32,
        WorkloadOptions::new(),
    ));
    let runner = ThreadedWorkloadRunner::new(manager.clone(), 3);

    runner
        .do_work(
            |item, _| {
                if *item == 7 {
                    return Err(anyhow!("worker hit a wall"));
                }
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            },
            |_, _| {},
            true,
        )
        .await
        .unwrap();

    assert!(runner.was_cancelled());
    assert!(!runner.is_complete());
    assert!(manager.remaining_count() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_cancellation_stops_the_pool() {
    let manager = Arc::new(WorkloadManager::with_items(
        0..1_000u32,
        WorkloadOptions::new(),
    ));
    let runner = Arc::new(ThreadedWorkloadRunner::new(manager.clone(), 2));

    let canceller = runner.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    runner
        .do_work(
            |_, _| {
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            },
            |_, _| {},
            false,
        )
        .await
        .unwrap();
    cancel_handle.await.unwrap();

    assert!(runner.was_cancelled());
    assert!(!runner.is_complete());
    assert!(manager.remaining_count() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_panicking_work_action_is_reported_and_the_pool_drains() {
    let manager = Arc::new(WorkloadManager::with_items(0..4u32, WorkloadOptions::new()));
    let runner = ThreadedWorkloadRunner::new(manager.clone(), 2);

    let processed = Arc::new(AtomicUsize::new(0));
    let counted = processed.clone();
    let faults = Arc::new(Mutex::new(Vec::new()));
    let recorded = faults.clone();
    runner
        .do_work(
            move |item, _| {
                if *item == 0 {
                    panic!("worker fell over");
                }
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move |item, fault| {
                recorded.lock().unwrap().push((*item, fault.to_string()));
            },
            false,
        )
        .await
        .unwrap();

    // The panic surfaced through the error handler and its item was still
    // accounted for, so the remaining items all got processed.
    assert_eq!(processed.load(Ordering::SeqCst), 3);
    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, 0);
    assert!(faults[0].1.contains("fell over"));
    assert_eq!(manager.remaining_count(), 0);
    assert!(runner.is_complete());
    assert!(!runner.was_cancelled());
}

#[tokio::test]
async fn a_pool_without_workers_is_rejected() {
    let manager = Arc::new(WorkloadManager::with_items([1u32], WorkloadOptions::new()));
    let runner = ThreadedWorkloadRunner::new(manager, 0);

    let outcome = runner.do_work(|_, _| Ok(()), |_, _| {}, false).await;
    assert!(matches!(outcome, Err(WorkloadError::NoWorkers)));
}
