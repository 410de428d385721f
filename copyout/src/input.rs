//! The caller-supplied input to a copy job, and how deployment defaults fill in what it omits.
use crate::objstore::ObjectLocation;
use crate::Result;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Default maximum number of manifest rows copied by one copy task
pub const DEFAULT_MAX_ITEMS_PER_BATCH: usize = 8;

/// Default number of concurrent transfers inside one copy task
pub const DEFAULT_COPY_CONCURRENCY: usize = 80;

pub const DEFAULT_START_COPY_RELATIVE_KEY: &str = "STARTED_COPY.txt";
pub const DEFAULT_END_COPY_RELATIVE_KEY: &str = "ENDED_COPY.csv";

/// A job input document, as supplied by the caller or as defaults.
///
/// Every field is optional here.  [`JobInput::overlay`] combines the caller's document with the
/// defaults, and [`JobInput::resolve`] checks that everything needed is present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_files_csv_bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_files_csv_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_bucket: Option<String>,

    /// Older callers name this `destinationKey`
    #[serde(
        default,
        alias = "destinationKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub destination_prefix_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_per_batch: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_concurrency: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_start_copy_relative_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_end_copy_relative_key: Option<String>,
}

impl JobInput {
    /// Parse a job input JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context(crate::error::ParseJobInputSnafu)
    }

    /// The defaults for every optional field, given the region the orchestrator is deployed in.
    pub fn defaults(deployment_region: impl Into<String>) -> Self {
        Self {
            max_items_per_batch: Some(DEFAULT_MAX_ITEMS_PER_BATCH),
            copy_concurrency: Some(DEFAULT_COPY_CONCURRENCY),
            required_region: Some(deployment_region.into()),
            destination_prefix_key: Some(String::new()),
            destination_start_copy_relative_key: Some(DEFAULT_START_COPY_RELATIVE_KEY.to_string()),
            destination_end_copy_relative_key: Some(DEFAULT_END_COPY_RELATIVE_KEY.to_string()),
            ..Default::default()
        }
    }

    /// Shallow merge: each field the caller supplied wins, any other field comes from `defaults`.
    ///
    /// Fields are never merged recursively; a supplied field replaces the default as a whole.
    pub fn overlay(self, defaults: JobInput) -> JobInput {
        JobInput {
            source_files_csv_bucket: self
                .source_files_csv_bucket
                .or(defaults.source_files_csv_bucket),
            source_files_csv_key: self.source_files_csv_key.or(defaults.source_files_csv_key),
            destination_bucket: self.destination_bucket.or(defaults.destination_bucket),
            destination_prefix_key: self
                .destination_prefix_key
                .or(defaults.destination_prefix_key),
            max_items_per_batch: self.max_items_per_batch.or(defaults.max_items_per_batch),
            copy_concurrency: self.copy_concurrency.or(defaults.copy_concurrency),
            required_region: self.required_region.or(defaults.required_region),
            destination_start_copy_relative_key: self
                .destination_start_copy_relative_key
                .or(defaults.destination_start_copy_relative_key),
            destination_end_copy_relative_key: self
                .destination_end_copy_relative_key
                .or(defaults.destination_end_copy_relative_key),
        }
    }

    /// Check that every field is present and valid, producing the input a job actually runs with.
    pub fn resolve(self) -> Result<EffectiveJobInput> {
        fn required(value: Option<String>, field: &'static str) -> Result<String> {
            let value = value.context(crate::error::MissingJobInputSnafu { field })?;
            ensure!(
                !value.is_empty(),
                crate::error::InvalidJobInputSnafu {
                    field,
                    reason: "must not be empty"
                }
            );
            Ok(value)
        }

        fn positive(value: Option<usize>, field: &'static str) -> Result<usize> {
            let value = value.context(crate::error::MissingJobInputSnafu { field })?;
            ensure!(
                value > 0,
                crate::error::InvalidJobInputSnafu {
                    field,
                    reason: "must be a positive integer"
                }
            );
            Ok(value)
        }

        Ok(EffectiveJobInput {
            source_files_csv_bucket: required(
                self.source_files_csv_bucket,
                "sourceFilesCsvBucket",
            )?,
            source_files_csv_key: required(self.source_files_csv_key, "sourceFilesCsvKey")?,
            destination_bucket: required(self.destination_bucket, "destinationBucket")?,
            destination_prefix_key: self.destination_prefix_key.unwrap_or_default(),
            max_items_per_batch: positive(self.max_items_per_batch, "maxItemsPerBatch")?,
            copy_concurrency: positive(self.copy_concurrency, "copyConcurrency")?,
            required_region: required(self.required_region, "requiredRegion")?,
            destination_start_copy_relative_key: required(
                self.destination_start_copy_relative_key,
                "destinationStartCopyRelativeKey",
            )?,
            destination_end_copy_relative_key: required(
                self.destination_end_copy_relative_key,
                "destinationEndCopyRelativeKey",
            )?,
        })
    }
}

/// The fully resolved input of a running job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveJobInput {
    pub source_files_csv_bucket: String,
    pub source_files_csv_key: String,
    pub destination_bucket: String,
    pub destination_prefix_key: String,
    pub max_items_per_batch: usize,
    pub copy_concurrency: usize,
    pub required_region: String,
    pub destination_start_copy_relative_key: String,
    pub destination_end_copy_relative_key: String,
}

impl EffectiveJobInput {
    pub fn manifest(&self) -> ObjectLocation {
        ObjectLocation::new(&self.source_files_csv_bucket, &self.source_files_csv_key)
    }

    /// The destination bucket and prefix, with the prefix as the key
    pub fn destination(&self) -> ObjectLocation {
        ObjectLocation::new(&self.destination_bucket, &self.destination_prefix_key)
    }

    pub fn start_marker(&self) -> ObjectLocation {
        self.destination()
            .join(&self.destination_start_copy_relative_key)
    }

    pub fn end_marker(&self) -> ObjectLocation {
        self.destination()
            .join(&self.destination_end_copy_relative_key)
    }
}
