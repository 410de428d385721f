//! Copying batches of manifest rows to the destination with an external copy tool.
//!
//! Each [`CopyBatch`] is handed to a [`CopyTask`], which copies every source in the batch and
//! reports one [`TransferRecord`] per source.  A problem with an individual object (it's missing,
//! or still archived) is recorded in that object's transfer record; only a failure of the task as
//! a whole fails the batch, and that's what the [`BatchCopyExecutor`] retries.
use crate::input::EffectiveJobInput;
use crate::manifest::Batch;
use crate::retry::RetryPolicy;
use crate::Result;
use dyn_clone::DynClone;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, error, instrument, warn};

/// The work order for one copy task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyBatch {
    /// Position of the batch in the manifest
    pub index: usize,

    /// The objects to copy, in the copy tool's `s3:bucket/key` notation
    pub sources: Vec<String>,

    /// Where to copy them, in the copy tool's `s3:bucket/prefix` notation
    pub destination: String,

    /// How many of `sources` may be transferring at the same time
    pub copy_concurrency: usize,
}

impl CopyBatch {
    pub fn new(batch: &Batch, input: &EffectiveJobInput) -> Self {
        Self {
            index: batch.index,
            sources: batch.rows.iter().map(|row| row.copy_tool_source()).collect(),
            destination: input.destination().to_copy_tool_path(),
            copy_concurrency: input.copy_concurrency,
        }
    }
}

/// The copy tool's statistics for the transfer of one source object.
///
/// Field names follow the tool's JSON stats output.  Statistics the orchestrator doesn't use are
/// ignored when parsing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub bytes: u64,

    #[serde(default)]
    pub total_bytes: u64,

    #[serde(default)]
    pub checks: u64,

    #[serde(default)]
    pub transfers: u64,

    #[serde(default)]
    pub server_side_copies: u64,

    #[serde(default)]
    pub server_side_copy_bytes: u64,

    /// Seconds
    #[serde(default)]
    pub elapsed_time: f64,

    #[serde(default)]
    pub errors: u64,

    #[serde(default)]
    pub fatal_error: bool,

    #[serde(default)]
    pub retry_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Set when the copy tool itself failed, rather than reporting an error in its stats
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_error: Option<String>,
}

impl TransferRecord {
    pub fn succeeded(&self) -> bool {
        self.errors == 0 && self.last_error.is_none() && self.system_error.is_none()
    }
}

/// Something that can copy a whole batch.
///
/// The production implementation is [`RcloneCopyTask`]; tests substitute their own.
#[async_trait::async_trait]
pub trait CopyTask: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Copy every source of `batch` to its destination.
    ///
    /// Returns one record per source, in the same order as `batch.sources`.  Fails only if the
    /// task as a whole could not run.
    async fn run(&self, batch: &CopyBatch) -> Result<Vec<TransferRecord>>;
}

dyn_clone::clone_trait_object!(CopyTask);

/// Copies each source with its own invocation of `rclone copy`.
///
/// Credentials and any other rclone settings come from the environment (`RCLONE_CONFIG_S3_*`),
/// which child processes inherit.
#[derive(Clone, Debug)]
pub struct RcloneCopyTask {
    program: PathBuf,
    bandwidth_limit: String,
    env: Vec<(String, String)>,
}

impl RcloneCopyTask {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            bandwidth_limit: "0".to_string(),
            env: Vec::new(),
        }
    }

    /// Set environment variables for the copy tool, on top of those it inherits
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Throttle each transfer, using rclone's `--bwlimit` syntax.  Only useful for testing what
    /// happens to long-running copies.
    pub fn with_bandwidth_limit(mut self, limit: impl Into<String>) -> Self {
        self.bandwidth_limit = limit.into();
        self
    }

    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn copy_one(&self, source: &str, destination: &str) -> Result<TransferRecord> {
        let output = tokio::process::Command::new(&self.program)
            .args([
                "--use-json-log",
                "--stats-log-level",
                "NOTICE",
                "--stats-one-line",
                // Only print stats at the end, which will always come before 10000 hours
                "--stats",
                "10000h",
                "--bwlimit",
                self.bandwidth_limit.as_str(),
                "copy",
                source,
                destination,
            ])
            .envs(self.env.iter().map(|(name, value)| (name, value)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|_| crate::error::LaunchCopyToolSnafu {
                program: self.program.display().to_string(),
            })?;

        // Stats are logged to stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut record = parse_stats(&stderr).unwrap_or_default();
        record.source = source.to_string();

        if output.status.success() {
            debug!(
                bytes = record.bytes,
                server_side_copy_bytes = record.server_side_copy_bytes,
                elapsed_time = record.elapsed_time,
                "Copy succeeded"
            );
        } else {
            warn!(status = %output.status, last_error = ?record.last_error, "Copy failed");

            record
                .last_error
                .get_or_insert_with(|| "copy tool exited without reporting an error".to_string());
            record.system_error = Some(output.status.to_string());
        }

        Ok(record)
    }
}

#[async_trait::async_trait]
impl CopyTask for RcloneCopyTask {
    async fn run(&self, batch: &CopyBatch) -> Result<Vec<TransferRecord>> {
        let copies: Vec<_> = batch
            .sources
            .iter()
            .map(|source| self.copy_one(source, &batch.destination))
            .collect();
        let records = futures::stream::iter(copies)
        .buffered(batch.copy_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        // Failing to even launch the tool fails the whole task
        records.into_iter().collect()
    }
}

/// Find the last stats line in the copy tool's JSON log output.
///
/// Lines that aren't JSON, or are JSON log entries without stats, are ignored.
pub(crate) fn parse_stats(log: &str) -> Option<TransferRecord> {
    log.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|mut entry| entry.get_mut("stats").map(serde_json::Value::take))
        .filter_map(|stats| serde_json::from_value::<TransferRecord>(stats).ok())
        .last()
}

/// Runs copy batches on a [`CopyTask`], retrying failed tasks according to a policy
#[derive(Clone, Debug)]
pub struct BatchCopyExecutor {
    task: Box<dyn CopyTask>,
    retry: RetryPolicy,
}

impl BatchCopyExecutor {
    pub fn new(task: Box<dyn CopyTask>, retry: RetryPolicy) -> Self {
        Self { task, retry }
    }

    #[instrument(skip(self, batch), fields(batch = batch.index, sources = batch.sources.len()))]
    pub async fn execute(&self, batch: &CopyBatch) -> Result<Vec<TransferRecord>> {
        let result = self
            .retry
            .retry(|attempt| {
                debug!(attempt, "Running copy task");
                self.task.run(batch)
            })
            .await;

        if let Err(e) = &result {
            error!(err = %e, "Copy batch failed");
        }

        result
    }
}
