//! Workload runners: drive one or many workers against a work source until
//! exhaustion or cancellation.
//!
//! Both runners share the same contract: the work action receives each item
//! together with a reference to the manager, so processing an item may
//! enqueue more items; faults are routed to a caller-supplied handler and
//! never swallowed. Cancellation is cooperative and is observed between
//! items, never mid-item.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::manager::{WorkRequest, WorkSource};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error raised when a runner is configured so it could never make progress.
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("a workload runner needs at least one worker")]
    NoWorkers,
}

/// Shared, observable run status. `cancel` is idempotent.
#[derive(Default)]
struct RunStatus {
    running: AtomicBool,
    complete: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
}

impl RunStatus {
    fn begin(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.complete.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.complete
            .store(!self.cancelled.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.wake.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Run the work action, converting a panic into an ordinary fault. The
/// caller always regains control, so the item is reported done and the
/// fault reaches the error handler instead of unwinding through the run.
fn run_work_action<M, W>(work: &W, item: &M::Item, manager: &M) -> anyhow::Result<()>
where
    M: WorkSource,
    W: Fn(&M::Item, &M) -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| work(item, manager))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(anyhow!("work action panicked: {}", panic_text(payload.as_ref()))),
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Processes every work item on the calling task, one at a time.
pub struct SequentialWorkloadRunner<M: WorkSource> {
    manager: Arc<M>,
    status: Arc<RunStatus>,
}

impl<M: WorkSource> SequentialWorkloadRunner<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self {
            manager,
            status: Arc::new(RunStatus::default()),
        }
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.status.running.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.status.complete.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    /// Request cooperative cancellation; the current item runs to completion.
    pub fn cancel(&self) {
        self.status.cancel();
    }

    /// Pull items until the source is exhausted or the run is cancelled.
    ///
    /// A fault from `work` is routed to `on_error`; when `cancel_on_error`
    /// is set it also cancels the run. A panic inside `work` is caught and
    /// reported as a fault.
    pub async fn do_work<W, E>(&self, work: W, on_error: E, cancel_on_error: bool)
    where
        W: Fn(&M::Item, &M) -> anyhow::Result<()>,
        E: Fn(&M::Item, &anyhow::Error),
    {
        self.status.begin();

        loop {
            if self.status.is_cancelled() {
                break;
            }
            match self.manager.next_item().await {
                WorkRequest::Item(item) => {
                    if self.status.is_cancelled() {
                        self.manager.item_done();
                        break;
                    }
                    if let Err(fault) = run_work_action(&work, &item, self.manager.as_ref()) {
                        on_error(&item, &fault);
                        if cancel_on_error {
                            self.status.cancel();
                        }
                    }
                    self.manager.item_done();
                }
                // A single worker cannot be waiting on itself: Empty means
                // an in-flight item, and nothing is in flight between items.
                WorkRequest::Empty | WorkRequest::Exhausted => break,
            }
        }

        self.status.finish();
        debug!(
            cancelled = self.was_cancelled(),
            "sequential workload run finished"
        );
    }
}

/// Drives a fixed-size pool of concurrent workers against one work source.
///
/// A worker that finds the queue momentarily empty does not exit: as long
/// as another worker is still processing an item, that item may generate
/// more work, so the idle worker waits for a wake signal (bounded by a
/// poll interval). The pool only winds down once the source reports true
/// exhaustion.
pub struct ThreadedWorkloadRunner<M: WorkSource> {
    manager: Arc<M>,
    max_workers: usize,
    poll_interval: Duration,
    status: Arc<RunStatus>,
}

impl<M: WorkSource + 'static> ThreadedWorkloadRunner<M> {
    pub fn new(manager: Arc<M>, max_workers: usize) -> Self {
        Self {
            manager,
            max_workers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            status: Arc::new(RunStatus::default()),
        }
    }

    /// Upper bound on how long an idle worker waits before re-checking the
    /// source, as a fallback for a missed wake signal.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.status.running.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.status.complete.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    /// Request cooperative cancellation; each worker finishes its current
    /// item first.
    pub fn cancel(&self) {
        self.status.cancel();
    }

    /// Run the pool until the source is exhausted or the run is cancelled,
    /// then wait for every worker to wind down. A panic inside `work` is
    /// caught, reported as a fault, and does not take its worker down.
    pub async fn do_work<W, E>(
        &self,
        work: W,
        on_error: E,
        cancel_on_error: bool,
    ) -> Result<(), WorkloadError>
    where
        W: Fn(&M::Item, &M) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(&M::Item, &anyhow::Error) + Send + Sync + 'static,
        M::Item: 'static,
    {
        if self.max_workers == 0 {
            return Err(WorkloadError::NoWorkers);
        }

        self.status.begin();
        let work = Arc::new(work);
        let on_error = Arc::new(on_error);

        let mut workers = JoinSet::new();
        for worker in 0..self.max_workers {
            let manager = self.manager.clone();
            let status = self.status.clone();
            let work = work.clone();
            let on_error = on_error.clone();
            let poll_interval = self.poll_interval;
            workers.spawn(async move {
                worker_loop(
                    worker,
                    manager,
                    status,
                    work,
                    on_error,
                    cancel_on_error,
                    poll_interval,
                )
                .await;
            });
        }
        info!(workers = self.max_workers, "worker pool started");

        while let Some(joined) = workers.join_next().await {
            if let Err(join_error) = joined {
                error!(%join_error, "worker task did not shut down cleanly");
            }
        }

        self.status.finish();
        if self.was_cancelled() {
            error!("worker pool cancelled before the workload was exhausted");
        } else {
            info!("worker pool drained the workload");
        }
        Ok(())
    }
}

async fn worker_loop<M, W, E>(
    worker: usize,
    manager: Arc<M>,
    status: Arc<RunStatus>,
    work: Arc<W>,
    on_error: Arc<E>,
    cancel_on_error: bool,
    poll_interval: Duration,
) where
    M: WorkSource,
    W: Fn(&M::Item, &M) -> anyhow::Result<()> + Send + Sync,
    E: Fn(&M::Item, &anyhow::Error) + Send + Sync,
{
    loop {
        if status.is_cancelled() {
            debug!(worker, "worker observed cancellation");
            break;
        }
        match manager.next_item().await {
            WorkRequest::Item(item) => {
                // A panic must not skip `item_done`: a leaked in-flight
                // count would keep every other worker waiting on Empty
                // forever.
                if let Err(fault) = run_work_action(work.as_ref(), &item, manager.as_ref()) {
                    on_error(&item, &fault);
                    if cancel_on_error {
                        status.cancel();
                    }
                }
                manager.item_done();
            }
            WorkRequest::Exhausted => {
                debug!(worker, "work source exhausted");
                break;
            }
            WorkRequest::Empty => {
                // Another worker is mid-item and may still add work; wait
                // for a wake instead of exiting early. The poll fallback
                // covers a wake that fires between the empty check and
                // this wait.
                tokio::select! {
                    _ = manager.wait_for_work() => {}
                    _ = status.wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}
