//! # Jobflow
//!
//! Embeddable work orchestration. Runs in your process, no infrastructure
//! required.
//!
//! Two engines, usable independently:
//!
//! - **Job pipelines** - an ordered chain of typed steps where each step
//!   consumes its predecessor's output. Runs can be restricted to a step
//!   window; anything upstream that a windowed step still needs is pulled
//!   and re-materialized transparently, and step outputs can be persisted
//!   through a [`StepStore`] so expensive steps are not recomputed.
//! - **Workload dispatch** - thread-safe work queues (FIFO, randomized, or
//!   priority-bucketed) with dispatch caps and jittered rate throttling,
//!   driven by a sequential or pooled runner. Workers may enqueue new work
//!   while processing, crawler-style.
//!
//! ## Pipelines
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jobflow::{JobPipelineRunner, JobStep, StepOptions};
//!
//! let emit = Arc::new(JobStep::source("emit", || Ok(vec![1, 2, 3])));
//! let sum = Arc::new(JobStep::after(&emit, "sum", |v: Vec<i32>| {
//!     Ok(v.iter().sum::<i32>())
//! }));
//! let triple = Arc::new(JobStep::after(&sum, "triple", |n: i32| Ok(n * 3)));
//!
//! let runner = JobPipelineRunner::new("numbers", &triple);
//! // Only step 3 is in the window; steps 1 and 2 rerun on demand.
//! let result = runner.execute(&StepOptions::from_step(3)).await?;
//! assert_eq!(runner.output()?, 18);
//! ```
//!
//! ## Workloads
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jobflow::{SequentialWorkloadRunner, WorkloadManager, WorkloadOptions};
//!
//! let manager = Arc::new(WorkloadManager::with_items(urls, WorkloadOptions::new()));
//! let runner = SequentialWorkloadRunner::new(manager);
//! runner
//!     .do_work(
//!         |url, mgr| {
//!             for discovered in crawl(url)? {
//!                 mgr.add_item(discovered); // work generates more work
//!             }
//!             Ok(())
//!         },
//!         |url, fault| eprintln!("{url}: {fault}"),
//!         false,
//!     )
//!     .await;
//! ```

pub mod pipeline;
pub mod step;
pub mod store;
pub mod workload;

pub use pipeline::{
    JobPipelineRunner, PipelineError, PipelineRunResult, StepOptions, StepRunRecord,
};
pub use step::{DataSource, JobState, JobStep, PipelineStep, StepError};
pub use store::{JsonFileStore, MemoryStore, StepStore};
pub use workload::{
    PriorityItem, PriorityWorkloadManager, RateLimit, SequentialWorkloadRunner,
    ThreadedWorkloadRunner, WorkRequest, WorkSource, WorkloadError, WorkloadManager,
    WorkloadOptions,
};
