//! Pipeline runner: ordered execution of a step chain with an execution
//! window and transparent upstream re-materialization.
//!
//! The runner is built from the terminal step of a chain and walks the
//! predecessor links backward to recover the full ordered step list. A run
//! may be restricted to an inclusive 1-based window of steps; anything a
//! windowed step needs from upstream is pulled on demand and shows up as
//! [`JobState::Rerun`] in the run result.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::step::{DataSource, JobState, PipelineStep, StepError};

/// Inclusive, 1-based window over the ordinal step sequence.
///
/// Out-of-range bounds are clamped silently; a window that selects no steps
/// at all is rejected when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    pub start_step: usize,
    pub end_step: usize,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            start_step: 1,
            end_step: usize::MAX,
        }
    }
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run only steps `start..=end`.
    pub fn range(start_step: usize, end_step: usize) -> Self {
        Self {
            start_step,
            end_step,
        }
    }

    /// Run from `start_step` through the end of the pipeline.
    pub fn from_step(start_step: usize) -> Self {
        Self {
            start_step,
            end_step: usize::MAX,
        }
    }

    fn clamp(&self, total: usize) -> Result<(usize, usize), PipelineError> {
        let start = self.start_step.max(1);
        let end = self.end_step.min(total);
        if start > end {
            return Err(PipelineError::EmptyWindow {
                start: self.start_step,
                end: self.end_step,
                total,
            });
        }
        Ok((start, end))
    }
}

/// Error returned by the pipeline runner itself. Step faults are captured
/// in the run result, not raised through this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The requested step window selects no steps.
    #[error("step window [{start}, {end}] selects no steps in a {total}-step pipeline")]
    EmptyWindow {
        start: usize,
        end: usize,
        total: usize,
    },

    /// Output was requested before a successful run.
    #[error("pipeline '{pipeline}' has not completed successfully; no output available")]
    NotComplete { pipeline: String },
}

/// Result entry for one step of a run.
///
/// Timestamps are present only for steps the runner invoked directly;
/// a skipped step pulled on demand executes inside its puller's slot.
#[derive(Debug, Clone, Serialize)]
pub struct StepRunRecord {
    pub name: String,
    pub ordinal: usize,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Path of the captured failure detail, when a detail directory is set.
    pub failure_detail: Option<PathBuf>,
}

impl StepRunRecord {
    fn bare(step: &Arc<dyn PipelineStep>, ordinal: usize) -> Self {
        Self {
            name: step.name().to_string(),
            ordinal,
            state: step.state(),
            started_at: None,
            completed_at: None,
            error: None,
            failure_detail: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state.produced_output()
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Aggregate result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    pub pipeline: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub step_results: Vec<StepRunRecord>,
}

impl PipelineRunResult {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Success
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    /// Look up a step's record by name.
    pub fn step(&self, name: &str) -> Option<&StepRunRecord> {
        self.step_results.iter().find(|record| record.name == name)
    }
}

/// Runs a chain of steps in ordinal order.
///
/// `O` is the terminal step's output type. A single run executes steps on
/// one logical task; the only recursion is the synchronous pull of
/// predecessor data.
pub struct JobPipelineRunner<O> {
    name: String,
    description: Option<String>,
    steps: Vec<Arc<dyn PipelineStep>>,
    terminal: Arc<dyn DataSource<O>>,
    failure_detail_dir: Option<PathBuf>,
    last_state: Mutex<JobState>,
}

impl<O> JobPipelineRunner<O> {
    /// Build a runner from the terminal step of a chain. Predecessor links
    /// are walked backward to produce the ordered step list, and each step
    /// is assigned its 1-based ordinal.
    pub fn new<S>(name: impl Into<String>, terminal: &Arc<S>) -> Self
    where
        S: DataSource<O> + 'static,
    {
        let mut steps: Vec<Arc<dyn PipelineStep>> = Vec::new();
        let mut cursor: Option<Arc<dyn PipelineStep>> =
            Some(terminal.clone() as Arc<dyn PipelineStep>);
        while let Some(step) = cursor {
            cursor = step.predecessor();
            steps.push(step);
        }
        steps.reverse();
        for (index, step) in steps.iter().enumerate() {
            step.set_ordinal(index + 1);
        }

        Self {
            name: name.into(),
            description: None,
            steps,
            terminal: terminal.clone() as Arc<dyn DataSource<O>>,
            failure_detail_dir: None,
            last_state: Mutex::new(JobState::Invalid),
        }
    }

    /// Attach a human-readable description.
    pub fn desc(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Write a detail file for every failed step into `dir` and record its
    /// path in the step's result.
    pub fn with_failure_detail_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.failure_detail_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Aggregate state of the most recent run.
    pub fn state(&self) -> JobState {
        *self.last_state.lock().unwrap()
    }

    /// Terminal step output of the last run. Valid only after a successful
    /// run; never triggers computation.
    pub fn output(&self) -> Result<O, PipelineError> {
        if self.state() != JobState::Success {
            return Err(PipelineError::NotComplete {
                pipeline: self.name.clone(),
            });
        }
        self.terminal.peek().ok_or_else(|| PipelineError::NotComplete {
            pipeline: self.name.clone(),
        })
    }

    /// Run every step with default options.
    pub async fn run(&self) -> Result<PipelineRunResult, PipelineError> {
        self.execute(&StepOptions::default()).await
    }

    /// Run the steps selected by `options`, in ordinal order.
    ///
    /// Steps outside the window are marked [`JobState::Skipped`] and never
    /// invoked directly; if an in-window step pulls one, the pulled step
    /// runs as a side effect and its record shows [`JobState::Rerun`]. A
    /// failure of a step whose `stop_if_failed` flag is set cancels every
    /// remaining step and fails the run.
    pub async fn execute(&self, options: &StepOptions) -> Result<PipelineRunResult, PipelineError> {
        let total = self.steps.len();
        let (start, end) = options.clamp(total)?;

        info!(pipeline = %self.name, start, end, total, "starting job pipeline");

        for (index, step) in self.steps.iter().enumerate() {
            let ordinal = index + 1;
            let state = if ordinal < start || ordinal > end {
                JobState::Skipped
            } else {
                JobState::Pending
            };
            step.set_state(state);
        }
        *self.last_state.lock().unwrap() = JobState::Active;

        let run_started = Utc::now();
        let mut records = Vec::with_capacity(total);
        let mut halted = false;

        for (index, step) in self.steps.iter().enumerate() {
            let ordinal = index + 1;

            if step.state() == JobState::Skipped {
                info!(pipeline = %self.name, step = %step.name(), ordinal, "step skipped");
                records.push(StepRunRecord::bare(step, ordinal));
                continue;
            }

            info!(pipeline = %self.name, step = %step.name(), ordinal, "step started");
            step.set_state(JobState::Active);
            let started_at = Utc::now();
            let outcome = step.run_step().await;
            let completed_at = Utc::now();

            let mut record = StepRunRecord::bare(step, ordinal);
            record.started_at = Some(started_at);
            record.completed_at = Some(completed_at);

            match outcome {
                Ok(()) => {
                    // A pull during this same execution may already have
                    // promoted the step to Rerun; leave that intact.
                    if step.state() != JobState::Rerun {
                        step.set_state(JobState::Success);
                    }
                    record.state = step.state();
                    info!(
                        pipeline = %self.name,
                        step = %step.name(),
                        elapsed_ms = (completed_at - started_at).num_milliseconds(),
                        "step completed"
                    );
                    records.push(record);
                }
                Err(step_error) => {
                    step.set_state(JobState::Failed);
                    record.state = JobState::Failed;
                    record.error = Some(step_error.to_string());
                    record.failure_detail = self.write_failure_detail(step.name(), &step_error).await;
                    error!(pipeline = %self.name, step = %step.name(), error = %step_error, "step failed");
                    records.push(record);

                    if step.stop_if_failed() {
                        error!(pipeline = %self.name, "cancelling remaining steps after failure");
                        for (later_index, later) in self.steps.iter().enumerate().skip(index + 1) {
                            if matches!(later.state(), JobState::Pending | JobState::Skipped) {
                                later.set_state(JobState::Cancelled);
                            }
                            records.push(StepRunRecord::bare(later, later_index + 1));
                        }
                        halted = true;
                        break;
                    }
                }
            }
        }

        let completed_at = Utc::now();

        // On-demand pulls correct states (Skipped -> Rerun) after a record
        // was already written; refresh every record so the final states are
        // visible regardless of when the step actually ran.
        for record in &mut records {
            record.state = self.steps[record.ordinal - 1].state();
        }

        let state = if halted {
            JobState::Failed
        } else {
            JobState::Success
        };
        *self.last_state.lock().unwrap() = state;

        if state == JobState::Success {
            info!(
                pipeline = %self.name,
                elapsed_ms = (completed_at - run_started).num_milliseconds(),
                "job pipeline completed"
            );
        } else {
            error!(pipeline = %self.name, "job pipeline did not complete successfully");
        }

        Ok(PipelineRunResult {
            pipeline: self.name.clone(),
            state,
            started_at: run_started,
            completed_at,
            step_results: records,
        })
    }

    async fn write_failure_detail(&self, step_name: &str, step_error: &StepError) -> Option<PathBuf> {
        let dir = self.failure_detail_dir.as_ref()?;

        let safe_name: String = step_name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        let path = dir.join(format!("{safe_name}.failure.txt"));

        let mut body = step_error.to_string();
        let mut source = std::error::Error::source(step_error);
        while let Some(cause) = source {
            body.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        body.push('\n');

        if let Err(io_error) = tokio::fs::create_dir_all(dir).await {
            warn!(%io_error, "could not create failure detail directory");
            return None;
        }
        if let Err(io_error) = tokio::fs::write(&path, body).await {
            warn!(%io_error, "could not write failure detail file");
            return None;
        }
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_are_clamped() {
        let options = StepOptions::range(0, 99);
        assert_eq!(options.clamp(3).unwrap(), (1, 3));

        let options = StepOptions::default();
        assert_eq!(options.clamp(5).unwrap(), (1, 5));

        let options = StepOptions::range(2, 2);
        assert_eq!(options.clamp(3).unwrap(), (2, 2));
    }

    #[test]
    fn empty_window_is_rejected() {
        let options = StepOptions::range(5, 9);
        assert!(matches!(
            options.clamp(3),
            Err(PipelineError::EmptyWindow { total: 3, .. })
        ));

        let options = StepOptions::range(3, 2);
        assert!(options.clamp(3).is_err());
    }
}
