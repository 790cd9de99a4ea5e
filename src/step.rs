//! Job steps: typed computation nodes linked into a single predecessor chain.
//!
//! A [`JobStep`] wraps a transform from its predecessor's output to its own
//! output. Steps memoize their result, so pulling a step twice runs the
//! transform once. A step that was skipped by an execution window but is
//! pulled on demand by a downstream step ends up in [`JobState::Rerun`]
//! rather than [`JobState::Success`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::store::StepStore;

/// State of a single step or an aggregate pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    /// Not yet part of a run.
    Invalid,
    /// Waiting its turn in the current run.
    Pending,
    /// Currently executing.
    Active,
    /// Ran inside the execution window and completed.
    Success,
    /// The step's own transform faulted.
    Failed,
    /// Outside the execution window; never executed.
    Skipped,
    /// Outside the execution window, but executed anyway because a
    /// downstream step needed its output.
    Rerun,
    /// Never executed because an upstream step failed first.
    Cancelled,
}

impl JobState {
    /// Returns true for states that mean the step produced its output.
    pub fn produced_output(&self) -> bool {
        matches!(self, JobState::Success | JobState::Rerun)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobState::Invalid => "invalid",
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Rerun => "rerun",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Error raised while executing a single step.
#[derive(Error, Debug)]
pub enum StepError {
    /// The step's transform faulted.
    #[error("step '{step}' failed: {source}")]
    Transform {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// A chained step was asked to run without a predecessor to pull from.
    #[error("step '{step}' has no predecessor to pull input from")]
    MissingInput { step: String },
}

type SourceFn<O> = Box<dyn Fn() -> anyhow::Result<O> + Send + Sync>;
type ChainFn<I, O> = Box<dyn Fn(I) -> anyhow::Result<O> + Send + Sync>;
type CacheLoadFn = Arc<dyn Fn(&str) + Send + Sync>;

enum Transform<I, O> {
    /// First step of a chain; takes no input.
    Source(SourceFn<O>),
    /// Takes the predecessor's output.
    Chained(ChainFn<I, O>),
}

/// Uniform, type-erased view of a step, independent of its input/output
/// types. The pipeline runner drives steps exclusively through this trait,
/// so no runtime type lookup is ever needed.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str>;

    fn state(&self) -> JobState;

    fn set_state(&self, state: JobState);

    /// 1-based position in the pipeline, assigned when the runner is built.
    fn ordinal(&self) -> usize;

    fn set_ordinal(&self, ordinal: usize);

    /// Whether a failure of this step cancels all subsequent steps.
    fn stop_if_failed(&self) -> bool;

    fn predecessor(&self) -> Option<Arc<dyn PipelineStep>>;

    /// Execute the step if its output is not already available.
    async fn run_step(&self) -> Result<(), StepError>;
}

/// A step viewed by the type of data it produces. Successors pull their
/// input through this trait; the pull transparently forces the whole
/// upstream chain if it has not produced data yet.
#[async_trait]
pub trait DataSource<T>: PipelineStep {
    /// Return the step's output, executing it (and any upstream steps) on
    /// demand. Idempotent after the first successful call.
    async fn get_data(&self) -> Result<T, StepError>;

    /// Return the memoized output without triggering execution.
    fn peek(&self) -> Option<T>;
}

/// A single named computation node in a job pipeline.
///
/// `I` is the predecessor's output type, `O` the step's own output type.
/// The predecessor is shared, never owned; a step only ever looks it up.
pub struct JobStep<I, O> {
    name: String,
    description: Option<String>,
    stop_if_failed: bool,
    transform: Transform<I, O>,
    pred_data: Option<Arc<dyn DataSource<I>>>,
    pred_step: Option<Arc<dyn PipelineStep>>,
    store: Option<Arc<dyn StepStore<O>>>,
    on_cache_load: Option<CacheLoadFn>,
    state: Mutex<JobState>,
    ordinal: AtomicUsize,
    memo: Mutex<Option<O>>,
}

impl<O> JobStep<(), O> {
    /// Create the first step of a chain. It has no predecessor and its
    /// transform takes no input.
    pub fn source<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn() -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            stop_if_failed: true,
            transform: Transform::Source(Box::new(transform)),
            pred_data: None,
            pred_step: None,
            store: None,
            on_cache_load: None,
            state: Mutex::new(JobState::Invalid),
            ordinal: AtomicUsize::new(0),
            memo: Mutex::new(None),
        }
    }
}

impl<I, O> JobStep<I, O> {
    /// Create a step that consumes the output of `predecessor`.
    pub fn after<P, F>(predecessor: &Arc<P>, name: impl Into<String>, transform: F) -> Self
    where
        P: DataSource<I> + 'static,
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            stop_if_failed: true,
            transform: Transform::Chained(Box::new(transform)),
            pred_data: Some(predecessor.clone() as Arc<dyn DataSource<I>>),
            pred_step: Some(predecessor.clone() as Arc<dyn PipelineStep>),
            store: None,
            on_cache_load: None,
            state: Mutex::new(JobState::Invalid),
            ordinal: AtomicUsize::new(0),
            memo: Mutex::new(None),
        }
    }

    /// Attach a human-readable description.
    pub fn desc(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Control whether a failure of this step cancels all subsequent steps.
    /// Defaults to true.
    pub fn with_stop_if_failed(mut self, stop: bool) -> Self {
        self.stop_if_failed = stop;
        self
    }

    /// Attach a persistence handle. A previously saved output is adopted
    /// instead of recomputing; a fresh output is saved after computation.
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: StepStore<O> + 'static,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Observe cache hits: called with the step name whenever the output is
    /// adopted from the store instead of being computed.
    pub fn on_cache_load<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_cache_load = Some(Arc::new(observer));
        self
    }
}

impl<I, O> JobStep<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Produce the output: adopt it from the store if available, otherwise
    /// pull the predecessor and apply the transform. Memoizes either way, so
    /// a cache load and a fresh computation behave identically afterwards.
    async fn compute(&self) -> Result<O, StepError> {
        if let Some(store) = &self.store {
            match store.load().await {
                Ok(Some(data)) => {
                    *self.memo.lock().unwrap() = Some(data.clone());
                    info!(step = %self.name, "step output loaded from store");
                    if let Some(observer) = &self.on_cache_load {
                        observer(&self.name);
                    }
                    return Ok(data);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(step = %self.name, %error, "store load failed; recomputing");
                }
            }
        }

        let output = match &self.transform {
            Transform::Source(transform) => transform().map_err(|source| StepError::Transform {
                step: self.name.clone(),
                source,
            })?,
            Transform::Chained(transform) => {
                let Some(predecessor) = &self.pred_data else {
                    return Err(StepError::MissingInput {
                        step: self.name.clone(),
                    });
                };
                let input = predecessor.get_data().await?;
                transform(input).map_err(|source| StepError::Transform {
                    step: self.name.clone(),
                    source,
                })?
            }
        };

        *self.memo.lock().unwrap() = Some(output.clone());

        if let Some(store) = &self.store {
            if let Err(error) = store.save(&output).await {
                warn!(step = %self.name, %error, "store save failed; continuing");
            }
        }

        Ok(output)
    }
}

#[async_trait]
impl<I, O> PipelineStep for JobStep<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap() = state;
    }

    fn ordinal(&self) -> usize {
        self.ordinal.load(Ordering::Relaxed)
    }

    fn set_ordinal(&self, ordinal: usize) {
        self.ordinal.store(ordinal, Ordering::Relaxed);
    }

    fn stop_if_failed(&self) -> bool {
        self.stop_if_failed
    }

    fn predecessor(&self) -> Option<Arc<dyn PipelineStep>> {
        self.pred_step.clone()
    }

    async fn run_step(&self) -> Result<(), StepError> {
        self.get_data().await.map(|_| ())
    }
}

#[async_trait]
impl<I, O> DataSource<O> for JobStep<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn get_data(&self) -> Result<O, StepError> {
        if let Some(data) = self.peek() {
            return Ok(data);
        }

        // A skipped step pulled on demand runs anyway, and its state is
        // corrected to Rerun so the run result shows it was executed even
        // though it was nominally out of range.
        let was_skipped = self.state() == JobState::Skipped;
        if was_skipped {
            self.set_state(JobState::Active);
        }

        let output = match self.compute().await {
            Ok(output) => output,
            Err(error) => {
                if was_skipped {
                    self.set_state(JobState::Failed);
                }
                return Err(error);
            }
        };

        if was_skipped {
            self.set_state(JobState::Rerun);
            info!(step = %self.name, "out-of-window step re-materialized on demand");
        }

        Ok(output)
    }

    fn peek(&self) -> Option<O> {
        self.memo.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(JobState::Rerun.to_string(), "rerun");
        assert_eq!(JobState::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn produced_output_covers_success_and_rerun() {
        assert!(JobState::Success.produced_output());
        assert!(JobState::Rerun.produced_output());
        assert!(!JobState::Skipped.produced_output());
        assert!(!JobState::Failed.produced_output());
    }

    #[tokio::test]
    async fn get_data_memoizes_after_first_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let step = Arc::new(JobStep::source("numbers", move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        }));

        assert_eq!(step.get_data().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(step.get_data().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pull_forces_the_whole_upstream_chain() {
        let first = Arc::new(JobStep::source("emit", || Ok(vec![1, 2, 3])));
        let second = Arc::new(JobStep::after(&first, "sum", |values: Vec<i32>| {
            Ok(values.iter().sum::<i32>())
        }));
        let third = Arc::new(JobStep::after(&second, "triple", |sum: i32| Ok(sum * 3)));

        assert_eq!(third.get_data().await.unwrap(), 18);
        assert_eq!(first.peek(), Some(vec![1, 2, 3]));
        assert_eq!(second.peek(), Some(6));
    }
}
