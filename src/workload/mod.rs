//! Concurrent workload dispatch: managers that hand out work items under a
//! cap, a rate throttle, and an ordering policy, plus the runners that
//! drive workers against them.

pub mod manager;
pub mod priority;
pub mod runner;

pub use manager::{RateLimit, WorkRequest, WorkSource, WorkloadManager, WorkloadOptions};
pub use priority::{PriorityItem, PriorityWorkloadManager};
pub use runner::{SequentialWorkloadRunner, ThreadedWorkloadRunner, WorkloadError};
