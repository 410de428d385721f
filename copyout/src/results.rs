//! The per-batch result records written during the copy stage, and the result manifest that
//! indexes them.
//!
//! Results for one run live under their own prefix in the working area:
//!
//! ```text
//! {results prefix}/SUCCEEDED_0.json
//! {results prefix}/FAILED_1.json
//! {results prefix}/PENDING_2.json
//! {results prefix}/manifest.json
//! ```
//!
//! Each result file is a JSON array of [`BatchOutcomeRecord`]s.  The manifest lists every result
//! file under the classification of the batches it holds.
use crate::copy::{CopyBatch, TransferRecord};
use crate::objstore::{ObjectLocation, ObjectStorage};
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, instrument};

/// The classification of a batch once the copy stage is over
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Succeeded,
    Failed,
    /// Never completed, because the copy stage was abandoned first
    Pending,
}

/// The output of a successful copy task, as stored in a result record
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyTaskOutput {
    #[serde(rename = "rcloneResult", default)]
    pub transfers: Vec<TransferRecord>,
}

/// One entry in a result file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchOutcomeRecord {
    /// The batch that was (or would have been) copied
    pub input: serde_json::Value,

    /// A JSON document, as a string, holding [`CopyTaskOutput`].  Only present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    pub status: BatchStatus,

    /// The kind of error that failed the batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// A description of the error that failed the batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl BatchOutcomeRecord {
    /// Parse this record's copy output, if it has one
    pub fn copy_output(&self) -> std::result::Result<Option<CopyTaskOutput>, serde_json::Error> {
        self.output
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }
}

/// A pointer to one result file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultFile {
    /// Object key within the working bucket
    pub key: String,
    pub size: u64,
}

/// The result files of a run, grouped by classification
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFiles {
    #[serde(rename = "SUCCEEDED", default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<Vec<ResultFile>>,

    #[serde(rename = "FAILED", default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<Vec<ResultFile>>,

    #[serde(rename = "PENDING", default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<ResultFile>>,
}

/// The index of all result files of one run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_run_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_files: Option<ResultFiles>,
}

/// The classification of one batch and the file its outcome record was written to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchResult {
    pub index: usize,
    pub status: BatchStatus,
    pub file: ResultFile,
}

/// Writes result files and the result manifest for one run into the working area
#[derive(Clone, Debug)]
pub struct ResultWriter {
    storage: Box<dyn ObjectStorage>,

    /// Every result file key starts with this
    prefix: ObjectLocation,

    run_id: String,
}

impl ResultWriter {
    /// `prefix` is used literally, so should normally end in `/`
    pub fn new(
        storage: Box<dyn ObjectStorage>,
        prefix: ObjectLocation,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            prefix,
            run_id: run_id.into(),
        }
    }

    pub fn manifest_location(&self) -> ObjectLocation {
        self.prefix.join("manifest.json")
    }

    /// Write the outcome of one batch to its own result file
    #[instrument(skip(self, batch, outcome), fields(batch = batch.index))]
    pub async fn write_batch(
        &self,
        batch: &CopyBatch,
        outcome: std::result::Result<&[TransferRecord], &crate::CopyOutError>,
    ) -> Result<BatchResult> {
        let input =
            serde_json::to_value(batch).context(crate::error::SerializeJsonSnafu { what: "copy batch" })?;

        let record = match outcome {
            Ok(transfers) => BatchOutcomeRecord {
                input,
                output: Some(
                    serde_json::to_string(&CopyTaskOutput {
                        transfers: transfers.to_vec(),
                    })
                    .context(crate::error::SerializeJsonSnafu { what: "copy output" })?,
                ),
                status: BatchStatus::Succeeded,
                error: None,
                cause: None,
            },
            Err(e) => BatchOutcomeRecord {
                input,
                output: None,
                status: BatchStatus::Failed,
                error: Some(e.kind().to_string()),
                cause: Some(e.to_string()),
            },
        };

        self.write_records(batch.index, record).await
    }

    /// Record a batch that never completed
    pub async fn write_pending(&self, batch: &CopyBatch) -> Result<BatchResult> {
        let input =
            serde_json::to_value(batch).context(crate::error::SerializeJsonSnafu { what: "copy batch" })?;

        self.write_records(
            batch.index,
            BatchOutcomeRecord {
                input,
                output: None,
                status: BatchStatus::Pending,
                error: None,
                cause: None,
            },
        )
        .await
    }

    async fn write_records(&self, index: usize, record: BatchOutcomeRecord) -> Result<BatchResult> {
        let status = record.status;
        let location = self.prefix.join(&format!("{status}_{index}.json"));
        let json = serde_json::to_vec_pretty(&[record])
            .context(crate::error::SerializeJsonSnafu { what: "result file" })?;
        let size = json.len() as u64;

        self.storage.put_object(&location, Bytes::from(json)).await?;

        debug!(%location, %status, size, "Wrote result file");

        Ok(BatchResult {
            index,
            status,
            file: ResultFile {
                key: location.key,
                size,
            },
        })
    }

    /// Write the manifest indexing all of `results`, returning its location.
    ///
    /// Every classification is listed, even if empty.
    pub async fn write_manifest(
        &self,
        destination_bucket: &str,
        results: &[BatchResult],
    ) -> Result<ObjectLocation> {
        let files = |status: BatchStatus| {
            let mut matching = results
                .iter()
                .filter(|result| result.status == status)
                .collect::<Vec<_>>();
            matching.sort_by_key(|result| result.index);
            Some(
                matching
                    .into_iter()
                    .map(|result| result.file.clone())
                    .collect::<Vec<_>>(),
            )
        };

        let manifest = ResultManifest {
            destination_bucket: Some(destination_bucket.to_string()),
            map_run_id: Some(self.run_id.clone()),
            result_files: Some(ResultFiles {
                succeeded: files(BatchStatus::Succeeded),
                failed: files(BatchStatus::Failed),
                pending: files(BatchStatus::Pending),
            }),
        };

        let location = self.manifest_location();
        let json = serde_json::to_vec_pretty(&manifest)
            .context(crate::error::SerializeJsonSnafu { what: "result manifest" })?;
        self.storage.put_object(&location, Bytes::from(json)).await?;

        debug!(%location, batches = results.len(), "Wrote result manifest");

        Ok(location)
    }
}
