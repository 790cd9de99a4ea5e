//! Prioritized dispatch: high-priority work inserted mid-run preempts the
//! remaining low-priority backlog.

use std::sync::{Arc, Mutex};

use jobflow::{
    PriorityItem, PriorityWorkloadManager, SequentialWorkloadRunner, WorkSource, WorkloadManager,
    WorkloadOptions,
};

const HIGH: i32 = 1;
const LOW: i32 = 2;

#[tokio::test]
async fn urgent_work_preempts_the_backlog() {
    let manager = Arc::new(PriorityWorkloadManager::new(WorkloadOptions::new()));
    for n in 0..5 {
        manager.add_with_priority(LOW, n);
    }

    // Each low-priority item enqueues two urgent items; those must drain
    // before the next low-priority item is dispatched.
    let sequence = Arc::new(Mutex::new(Vec::new()));
    let recorded = sequence.clone();
    let runner = SequentialWorkloadRunner::new(manager.clone());
    runner
        .do_work(
            move |dispatched: &PriorityItem<i32>, mgr| {
                recorded.lock().unwrap().push(dispatched.priority);
                if dispatched.priority == LOW {
                    mgr.add_with_priority(HIGH, 100 + dispatched.item);
                    mgr.add_with_priority(HIGH, 200 + dispatched.item);
                }
                Ok(())
            },
            |_, _| {},
            false,
        )
        .await;

    let expected: Vec<i32> = (0..5).flat_map(|_| [LOW, HIGH, HIGH]).collect();
    assert_eq!(*sequence.lock().unwrap(), expected);
    assert_eq!(manager.total_items(), 15);
    assert_eq!(manager.dispatched_count(), 15);
    assert!(runner.is_complete());
    assert!(!runner.was_cancelled());
}

#[tokio::test]
async fn mixed_priorities_drain_in_ascending_order() {
    let manager = Arc::new(PriorityWorkloadManager::new(WorkloadOptions::new()));
    manager.add_item(PriorityItem::new(9, "cleanup"));
    manager.add_item(PriorityItem::new(1, "page"));
    manager.add_item(PriorityItem::new(5, "refresh"));
    manager.add_item(PriorityItem::new(1, "alert"));
    assert_eq!(manager.priority_levels(), vec![1, 5, 9]);

    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = order.clone();
    let runner = SequentialWorkloadRunner::new(manager);
    runner
        .do_work(
            move |dispatched: &PriorityItem<&str>, _| {
                recorded.lock().unwrap().push(dispatched.item);
                Ok(())
            },
            |_, _| {},
            false,
        )
        .await;

    assert_eq!(
        *order.lock().unwrap(),
        vec!["page", "alert", "refresh", "cleanup"]
    );
}

#[tokio::test]
async fn dispatch_cap_applies_to_prioritized_work_too() {
    let manager = Arc::new(PriorityWorkloadManager::new(
        WorkloadOptions::new().max_items(3),
    ));
    for n in 0..6 {
        manager.add_with_priority(if n % 2 == 0 { HIGH } else { LOW }, n);
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = order.clone();
    let runner = SequentialWorkloadRunner::new(manager.clone());
    runner
        .do_work(
            move |dispatched: &PriorityItem<i32>, _| {
                recorded.lock().unwrap().push(dispatched.item);
                Ok(())
            },
            |_, _| {},
            false,
        )
        .await;

    // Only the three urgent items made it under the cap.
    assert_eq!(*order.lock().unwrap(), vec![0, 2, 4]);
    assert_eq!(manager.remaining_count(), 3);
    assert!(runner.is_complete());
}

#[tokio::test]
async fn plain_and_prioritized_managers_share_the_runner_contract() {
    // The same runner drives either manager flavor.
    let plain = Arc::new(WorkloadManager::with_items([1, 2, 3], WorkloadOptions::new()));
    let runner = SequentialWorkloadRunner::new(plain);
    runner.do_work(|_, _| Ok(()), |_, _| {}, false).await;
    assert!(runner.is_complete());

    let prioritized: Arc<PriorityWorkloadManager<i32>> =
        Arc::new(PriorityWorkloadManager::new(WorkloadOptions::new()));
    prioritized.add_with_priority(HIGH, 1);
    let runner = SequentialWorkloadRunner::new(prioritized);
    runner.do_work(|_, _| Ok(()), |_, _| {}, false).await;
    assert!(runner.is_complete());
}
