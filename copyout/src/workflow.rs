//! The copy-out workflow: a state machine that takes a job from its raw input to a copy summary.
//!
//! ```text
//! DefineDefaults -> ApplyDefaults -> CanWrite -> ThawAll -> CopyAll -> Summarise -> Succeed
//!                                     ^    |
//!                      AccessDenied   |    v
//!                                  WaitForWritable
//! ```
//!
//! Every state except `Succeed` may fail to `Fail`.  How each state responds to errors (which
//! are caught and where they lead, which are retried and how often) is plain data in a
//! [`WorkflowDefinition`], separate from the code that runs the states.
use crate::copy::{BatchCopyExecutor, CopyBatch, CopyTask, RcloneCopyTask, TransferRecord};
use crate::fanout::fan_out;
use crate::input::{EffectiveJobInput, JobInput};
use crate::manifest::{self, ManifestRow};
use crate::objstore::{ObjectLocation, ObjectStorage, ObjectStorageFactory};
use crate::permission::PermissionValidator;
use crate::results::{BatchResult, ResultWriter};
use crate::retry::RetryPolicy;
use crate::summary::{CopySummary, ResultSummarizer};
use crate::thaw::{StorageTier, ThawCoordinator};
use crate::{Config, CopyOutError, ErrorKind, Result};
use bytes::Bytes;
use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, instrument, warn};

/// A state of the copy-out workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum State {
    /// Compute the defaults for every optional input field
    DefineDefaults,
    /// Merge the caller's input over the defaults and validate it
    ApplyDefaults,
    /// Write the start marker to the destination, proving it's writable and in the right region
    CanWrite,
    /// Sleep before checking the destination again
    WaitForWritable,
    /// Restore every archived object in the manifest
    ThawAll,
    /// Copy the manifest's objects in batches
    CopyAll,
    /// Summarise the copy and write the end marker
    Summarise,
    Succeed,
    Fail,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeed | Self::Fail)
    }
}

/// Errors of the listed kinds move the workflow to `next` instead of failing it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catch {
    pub errors: Vec<ErrorKind>,
    pub next: State,
}

/// How one state behaves, as far as the state machine is concerned
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateDefinition {
    /// Where to go when the state completes.  `None` for terminal states.
    pub next: Option<State>,

    /// Evaluated in order; the first matching catch wins.  Uncaught errors lead to `Fail`.
    pub catch: Vec<Catch>,

    /// For waiting states, how long to wait
    pub wait: Option<Duration>,

    /// For fan-out states, the retry policy applied to each item
    pub item_retry: Option<RetryPolicy>,

    /// For fan-out states, how many items are processed at once
    pub max_concurrency: Option<usize>,

    /// For fan-out states, the percentage of items that may fail without failing the state
    pub tolerated_failure_percentage: Option<u8>,
}

/// The complete state machine: every state's behaviour plus the overall time limit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowDefinition {
    states: HashMap<State, StateDefinition>,
    pub timeout: Duration,
}

impl WorkflowDefinition {
    pub fn new(config: &Config) -> Self {
        let states = State::iter()
            .map(|state| {
                let definition = match state {
                    State::DefineDefaults => StateDefinition {
                        next: Some(State::ApplyDefaults),
                        ..Default::default()
                    },
                    State::ApplyDefaults => StateDefinition {
                        next: Some(State::CanWrite),
                        ..Default::default()
                    },
                    State::CanWrite => StateDefinition {
                        next: Some(State::ThawAll),
                        catch: vec![
                            Catch {
                                errors: vec![ErrorKind::AccessDenied],
                                next: State::WaitForWritable,
                            },
                            Catch {
                                errors: vec![ErrorKind::WrongRegion],
                                next: State::Fail,
                            },
                        ],
                        ..Default::default()
                    },
                    State::WaitForWritable => StateDefinition {
                        next: Some(State::CanWrite),
                        wait: Some(config.wait_for_writable_duration()),
                        ..Default::default()
                    },
                    State::ThawAll => StateDefinition {
                        next: Some(State::CopyAll),
                        item_retry: Some(RetryPolicy::fixed(
                            ErrorKind::IsThawing,
                            config.thaw_retry_interval,
                            config.thaw_max_retries,
                        )),
                        max_concurrency: Some(config.max_concurrent_thaws),
                        // Objects that never thaw are left for the copy to report
                        tolerated_failure_percentage: Some(100),
                        ..Default::default()
                    },
                    State::CopyAll => StateDefinition {
                        next: Some(State::Summarise),
                        item_retry: Some(RetryPolicy::fixed(
                            ErrorKind::TaskFailure,
                            Duration::ZERO,
                            config.copy_max_retries,
                        )),
                        max_concurrency: Some(config.max_concurrent_batches),
                        tolerated_failure_percentage: Some(25),
                        ..Default::default()
                    },
                    State::Summarise => StateDefinition {
                        next: Some(State::Succeed),
                        ..Default::default()
                    },
                    State::Succeed | State::Fail => StateDefinition::default(),
                };

                (state, definition)
            })
            .collect();

        Self {
            states,
            timeout: config.job_timeout_duration(),
        }
    }

    pub fn state(&self, state: State) -> Option<&StateDefinition> {
        self.states.get(&state)
    }

    /// The transition table: where the workflow goes after `state` completes with `outcome`.
    pub fn next_state(&self, state: State, outcome: std::result::Result<(), ErrorKind>) -> State {
        let definition = match self.state(state) {
            Some(definition) => definition,
            None => return State::Fail,
        };

        match outcome {
            Ok(()) => definition.next.unwrap_or(State::Fail),
            Err(kind) => definition
                .catch
                .iter()
                .find(|catch| catch.errors.contains(&kind))
                .map(|catch| catch.next)
                .unwrap_or(State::Fail),
        }
    }
}

/// A trait which callers can implement to get progress updates as a copy job runs.
///
/// Every method has a default no-op implementation.
#[allow(unused_variables)]
pub trait JobProgressCallback: Sync + Send {
    /// The workflow has entered `state`
    fn state_entered(&self, state: State) {}

    /// `state` failed.  The error may still be caught and lead to some other state than `Fail`.
    fn state_failed(&self, state: State, error: &CopyOutError) {}

    /// The destination isn't writable yet; the job will sleep for `wait` then check again
    fn waiting_for_writable(&self, bucket: &str, wait: Duration) {}

    /// The thaw stage is about to check `rows` manifest rows
    fn thaw_starting(&self, rows: usize) {}

    /// A row is ready to be copied.  `tier` is the archive tier it was restored from, or `None`
    /// if it didn't need restoring.
    fn row_thawed(&self, row: &ManifestRow, tier: Option<StorageTier>) {}

    /// Giving up on thawing a row.  The copy of this row will probably fail.
    fn row_thaw_failed(&self, row: &ManifestRow, error: &CopyOutError) {}

    /// The copy stage is about to copy `rows` manifest rows in `batches` batches
    fn copy_starting(&self, batches: usize, rows: usize) {}

    /// A batch was copied.  Individual transfers may still have failed.
    fn batch_copied(&self, batch: usize, transfers: &[TransferRecord]) {}

    /// A batch failed after exhausting its retries
    fn batch_failed(&self, batch: usize, error: &CopyOutError) {}

    /// The copy has been summarised and the end marker written
    fn summary_ready(&self, summary: &CopySummary) {}
}

/// How a finished job ended
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(CopySummary),
    Failed(JobFailure),
}

/// The error that failed a job, and the state it failed in
#[derive(Debug)]
pub struct JobFailure {
    pub state: State,
    pub error: CopyOutError,
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// The result of running a job to completion
#[derive(Debug)]
pub struct JobReport {
    pub run_id: String,

    /// Every state the workflow entered, in order, ending with `Succeed` or `Fail`
    pub history: Vec<State>,

    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded(_))
    }

    /// Convert into a `Result`, discarding the history
    pub fn into_result(self) -> Result<CopySummary> {
        match self.outcome {
            JobOutcome::Succeeded(summary) => Ok(summary),
            JobOutcome::Failed(failure) => Err(failure.error),
        }
    }
}

#[derive(Debug)]
pub struct CopyOutJobBuilder {
    config: Config,
    input: JobInput,
    storage: Option<Box<dyn ObjectStorage>>,
    copy_task: Option<Box<dyn CopyTask>>,
    run_id: Option<String>,
}

impl CopyOutJobBuilder {
    /// Initialize a new copy job builder, but don't yet start the job.
    pub fn new(config: Config, input: JobInput) -> Self {
        Self {
            config,
            input,
            storage: None,
            copy_task: None,
            run_id: None,
        }
    }

    /// Use this object storage instead of S3 configured from the [`Config`]
    pub fn storage(mut self, storage: Box<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Copy batches with this task instead of the configured copy tool
    pub fn copy_task(mut self, copy_task: Box<dyn CopyTask>) -> Self {
        self.copy_task = Some(copy_task);
        self
    }

    /// Use a specific run ID instead of one derived from the current time
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Validate the configuration and prepare the job
    pub async fn build(self) -> Result<CopyOutJob> {
        let working_bucket = self.config.validate()?.to_string();

        let storage = match self.storage {
            Some(storage) => storage,
            None => ObjectStorageFactory::new(self.config.clone()).s3().await,
        };
        let copy_task: Box<dyn CopyTask> = match self.copy_task {
            Some(copy_task) => copy_task,
            None => Box::new(RcloneCopyTask::new(&self.config.copy_tool)),
        };
        let run_id = self.run_id.unwrap_or_else(new_run_id);

        debug!(%run_id, %working_bucket, ?storage, "Prepared copy job");

        Ok(CopyOutJob {
            definition: WorkflowDefinition::new(&self.config),
            config: self.config,
            working_bucket,
            input: self.input,
            storage,
            copy_task,
            run_id,
        })
    }
}

/// A run ID unique enough to keep concurrent and repeated runs of one manifest apart
fn new_run_id() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Data passed from one state to the next
#[derive(Debug, Default)]
struct ExecutionContext {
    defaults: Option<JobInput>,
    input: Option<EffectiveJobInput>,
    result_manifest: Option<ObjectLocation>,
    summary: Option<CopySummary>,
}

/// A copy job, ready to run.
#[derive(Debug)]
pub struct CopyOutJob {
    config: Config,
    definition: WorkflowDefinition,
    working_bucket: String,
    input: JobInput,
    storage: Box<dyn ObjectStorage>,
    copy_task: Box<dyn CopyTask>,
    run_id: String,
}

impl CopyOutJob {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Alternative to [`Self::run`] which doesn't require a [`JobProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(self, abort: impl Future<Output = ()>) -> JobReport {
        struct NoProgress {}
        impl JobProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job until it reaches `Succeed` or `Fail`, or exceeds its timeout.
    ///
    /// If the `abort` future completes, the job is abandoned wherever it is and fails with
    /// [`CopyOutError::Aborted`].  Copy tool processes still running are killed.
    pub async fn run<Abort, Progress>(self, abort: Abort, progress: Progress) -> JobReport
    where
        Abort: Future<Output = ()>,
        Progress: JobProgressCallback + 'static,
    {
        let progress: Arc<dyn JobProgressCallback> = Arc::new(progress);
        let timeout = self.definition.timeout;
        let mut history = Vec::new();

        info!(run_id = %self.run_id, ?timeout, "Starting copy job");

        let states = tokio::time::timeout(timeout, self.run_states(&mut history, &progress));

        let interrupted = tokio::select! {
            outcome = states => match outcome {
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(crate::error::JobTimedOutSnafu { timeout }.build()),
            },
            _ = abort => Err(crate::error::AbortedSnafu.build()),
        };

        let outcome = match interrupted {
            Ok(outcome) => outcome,
            Err(error) => {
                let state = history.last().copied().unwrap_or(State::DefineDefaults);
                error!(%state, err = %error, "Copy job interrupted");

                progress.state_failed(state, &error);
                history.push(State::Fail);
                progress.state_entered(State::Fail);

                JobOutcome::Failed(JobFailure { state, error })
            }
        };

        match &outcome {
            JobOutcome::Succeeded(summary) => {
                info!(run_id = %self.run_id, objects = summary.len(), "Copy job succeeded")
            }
            JobOutcome::Failed(failure) => {
                error!(run_id = %self.run_id, state = %failure.state, err = %failure.error, "Copy job failed")
            }
        }

        JobReport {
            run_id: self.run_id,
            history,
            outcome,
        }
    }

    async fn run_states(
        &self,
        history: &mut Vec<State>,
        progress: &Arc<dyn JobProgressCallback>,
    ) -> JobOutcome {
        let mut context = ExecutionContext::default();
        let mut state = State::DefineDefaults;

        loop {
            history.push(state);
            progress.state_entered(state);

            let result = self.execute(state, &mut context, progress).await;
            let next = self
                .definition
                .next_state(state, result.as_ref().map(|_| ()).map_err(|e| e.kind()));

            if let Err(error) = result {
                progress.state_failed(state, &error);

                if next == State::Fail {
                    error!(%state, err = %error, "State failed");

                    history.push(State::Fail);
                    progress.state_entered(State::Fail);
                    return JobOutcome::Failed(JobFailure { state, error });
                }

                info!(%state, %next, err = %error, "Caught error");
            }

            if next == State::Succeed {
                history.push(State::Succeed);
                progress.state_entered(State::Succeed);
                return JobOutcome::Succeeded(context.summary.take().unwrap_or_default());
            }

            debug!(from = %state, to = %next, "State transition");
            state = next;
        }
    }

    #[instrument(skip(self, context, progress), fields(run_id = %self.run_id))]
    async fn execute(
        &self,
        state: State,
        context: &mut ExecutionContext,
        progress: &Arc<dyn JobProgressCallback>,
    ) -> Result<()> {
        match state {
            State::DefineDefaults => {
                context.defaults = Some(JobInput::defaults(self.deployment_region()));
            }
            State::ApplyDefaults => {
                let defaults = context
                    .defaults
                    .take()
                    .unwrap_or_else(|| JobInput::defaults(self.deployment_region()));
                let input = self.input.clone().overlay(defaults).resolve()?;

                self.persist_input(&input).await?;
                debug!(?input, "Resolved job input");

                context.input = Some(input);
            }
            State::CanWrite => {
                let input = Self::resolved(state, context)?;

                PermissionValidator::new(
                    self.storage.clone(),
                    self.config.allow_write_to_installed_account,
                )
                .can_write(&input.required_region, &input.start_marker())
                .await?;
            }
            State::WaitForWritable => {
                let input = Self::resolved(state, context)?;
                let wait = self
                    .state_definition(state)
                    .wait
                    .unwrap_or_else(|| self.config.wait_for_writable_duration());

                info!(bucket = %input.destination_bucket, ?wait, "Waiting for destination to become writable");
                progress.waiting_for_writable(&input.destination_bucket, wait);

                tokio::time::sleep(wait).await;
            }
            State::ThawAll => {
                let input = Self::resolved(state, context)?;
                self.thaw_all(input, progress).await?;
            }
            State::CopyAll => {
                let input = Self::resolved(state, context)?;
                let manifest = self.copy_all(input, progress).await?;
                context.result_manifest = Some(manifest);
            }
            State::Summarise => {
                let input = Self::resolved(state, context)?;
                let result_manifest = context
                    .result_manifest
                    .clone()
                    .unwrap_or_else(|| self.result_writer(input).manifest_location());

                let summary = ResultSummarizer::new(self.storage.clone())
                    .summarise(&result_manifest)
                    .await?;

                self.storage
                    .probe_write(
                        &input.required_region,
                        &input.end_marker(),
                        Bytes::from(summary.to_csv()),
                    )
                    .await?;

                progress.summary_ready(&summary);
                context.summary = Some(summary);
            }
            State::Succeed | State::Fail => {}
        }

        Ok(())
    }

    fn resolved(state: State, context: &ExecutionContext) -> Result<&EffectiveJobInput> {
        context
            .input
            .as_ref()
            .context(crate::error::InputNotResolvedSnafu { state })
    }

    fn state_definition(&self, state: State) -> StateDefinition {
        self.definition.state(state).cloned().unwrap_or_default()
    }

    /// The region destinations must be in if the job doesn't say otherwise
    fn deployment_region(&self) -> String {
        self.config
            .aws_region
            .clone()
            .unwrap_or_else(|| self.storage.region().to_string())
    }

    /// Where this run keeps its artifacts in the working area
    fn run_prefix(&self, input: &EffectiveJobInput) -> ObjectLocation {
        ObjectLocation::new(
            &self.working_bucket,
            format!(
                "{}{}/{}/",
                self.config.working_prefix, input.source_files_csv_key, self.run_id
            ),
        )
    }

    fn result_writer(&self, input: &EffectiveJobInput) -> ResultWriter {
        ResultWriter::new(
            self.storage.clone(),
            self.run_prefix(input),
            self.run_id.clone(),
        )
    }

    /// Keep the merged input in the working area, so later inspection of a run can see what it
    /// actually ran with
    async fn persist_input(&self, input: &EffectiveJobInput) -> Result<()> {
        let location = self.run_prefix(input).join("input.json");
        let json = serde_json::to_vec_pretty(input)
            .context(crate::error::SerializeJsonSnafu { what: "job input" })?;

        self.storage.put_object(&location, Bytes::from(json)).await?;
        debug!(%location, "Saved merged job input");

        Ok(())
    }

    /// Each stage reads the manifest for itself, rather than passing its contents along
    async fn read_manifest(&self, input: &EffectiveJobInput) -> Result<Vec<ManifestRow>> {
        let location = input.manifest();
        let data = self.storage.get_object(&location).await?;

        manifest::parse_bytes(&location, &data)
    }

    async fn thaw_all(
        &self,
        input: &EffectiveJobInput,
        progress: &Arc<dyn JobProgressCallback>,
    ) -> Result<()> {
        let definition = self.state_definition(State::ThawAll);
        let retry = definition.item_retry.clone().unwrap_or_else(RetryPolicy::never);
        let coordinator = ThawCoordinator::new(self.storage.clone(), self.config.thaw.clone());

        let rows = self.read_manifest(input).await?;
        info!(rows = rows.len(), "Thawing manifest rows");
        progress.thaw_starting(rows.len());

        let coordinator = &coordinator;
        let retry = &retry;
        let report = fan_out(
            rows,
            definition.max_concurrency.unwrap_or(1),
            definition.tolerated_failure_percentage.unwrap_or(0),
            |_, row| async move {
                let result = retry.retry(|_| coordinator.thaw_row(&row)).await;

                match &result {
                    Ok(thawed) => progress.row_thawed(&row, thawed.as_ref().map(|state| state.tier)),
                    Err(e) => {
                        warn!(bucket = %row.bucket, key = %row.key, err = %e, "Giving up on thawing object");
                        progress.row_thaw_failed(&row, e);
                    }
                }

                result
            },
        )
        .await;

        let restored = report
            .succeeded
            .iter()
            .filter(|(_, thawed)| thawed.is_some())
            .count();
        info!(
            readable = report.succeeded.len() - restored,
            restored,
            failed = report.failed.len(),
            "Thaw complete"
        );

        report.check_tolerance("thaw")
    }

    /// Copy every batch, record each batch's outcome, and return the location of the result
    /// manifest
    async fn copy_all(
        &self,
        input: &EffectiveJobInput,
        progress: &Arc<dyn JobProgressCallback>,
    ) -> Result<ObjectLocation> {
        let definition = self.state_definition(State::CopyAll);
        let executor = BatchCopyExecutor::new(
            self.copy_task.clone(),
            definition.item_retry.clone().unwrap_or_else(RetryPolicy::never),
        );
        let writer = self.result_writer(input);

        let rows = self.read_manifest(input).await?;
        let row_count = rows.len();
        let batches = manifest::partition(rows, input.max_items_per_batch)
            .iter()
            .map(|batch| CopyBatch::new(batch, input))
            .collect::<Vec<_>>();

        info!(rows = row_count, batches = batches.len(), "Copying manifest rows");
        progress.copy_starting(batches.len(), row_count);

        let executor = &executor;
        let writer_ref = &writer;
        let report = fan_out(
            batches.clone(),
            definition.max_concurrency.unwrap_or(1),
            definition.tolerated_failure_percentage.unwrap_or(0),
            |_, batch| async move {
                let transfers = executor.execute(&batch).await?;
                let result = writer_ref.write_batch(&batch, Ok(transfers.as_slice())).await?;

                progress.batch_copied(batch.index, &transfers);

                Ok(result)
            },
        )
        .await;

        let mut results: Vec<BatchResult> = report
            .succeeded
            .iter()
            .map(|(_, result)| result.clone())
            .collect();

        for (index, error) in &report.failed {
            progress.batch_failed(*index, error);
            results.push(writer.write_batch(&batches[*index], Err(error)).await?);
        }

        for index in &report.pending {
            results.push(writer.write_pending(&batches[*index]).await?);
        }

        let manifest = writer
            .write_manifest(&self.working_bucket, &results)
            .await?;

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            %manifest,
            "Copy complete"
        );

        report.check_tolerance("copy")?;

        Ok(manifest)
    }
}
