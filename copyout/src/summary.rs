//! Turning the result files of a copy into a per-object throughput summary.
use crate::objstore::{ObjectLocation, ObjectStorage};
use crate::results::{BatchOutcomeRecord, ResultFile, ResultManifest};
use crate::{CopyOutError, Result};
use byte_unit::Byte;
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, instrument, warn};

const MEBIBYTE: f64 = 1024.0 * 1024.0;

/// The transfer statistics of one copied object
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryEntry {
    /// The final path component of the source key
    pub name: String,

    /// Bytes copied server-side
    pub bytes: u64,

    /// Seconds the transfer took
    pub seconds: f64,

    /// `None` if the transfer took no measurable time
    pub mebibytes_per_second: Option<f64>,
}

impl SummaryEntry {
    pub fn new(name: impl Into<String>, bytes: u64, seconds: f64) -> Self {
        let mebibytes_per_second =
            (seconds > 0.0).then(|| bytes as f64 / seconds / MEBIBYTE);

        Self {
            name: name.into(),
            bytes,
            seconds,
            mebibytes_per_second,
        }
    }
}

/// Per-object statistics for a whole copy, keyed by object name.
///
/// Objects are identified only by the last component of their key, so two sources with the same
/// file name in different directories or buckets share an entry, and the one summarised last
/// wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CopySummary {
    entries: BTreeMap<String, SummaryEntry>,
}

impl CopySummary {
    pub fn insert(&mut self, entry: SummaryEntry) {
        if let Some(previous) = self.entries.insert(entry.name.clone(), entry) {
            warn!(name = %previous.name, "Two copied objects share a name; keeping the later one");
        }
    }

    pub fn get(&self, name: &str) -> Option<&SummaryEntry> {
        self.entries.get(name)
    }

    /// All entries, ordered by name
    pub fn entries(&self) -> impl Iterator<Item = &SummaryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.bytes).sum()
    }

    /// Add every transfer recorded in `records` to the summary
    pub fn add_records(
        &mut self,
        records: &[BatchOutcomeRecord],
    ) -> std::result::Result<(), serde_json::Error> {
        for record in records {
            if let Some(output) = record.copy_output()? {
                for transfer in output.transfers {
                    let name = transfer
                        .source
                        .rsplit('/')
                        .next()
                        .unwrap_or(&transfer.source)
                        .to_string();

                    self.insert(SummaryEntry::new(
                        name,
                        transfer.server_side_copy_bytes,
                        transfer.elapsed_time,
                    ));
                }
            }
        }

        Ok(())
    }

    /// The summary as CSV with a header row, as written to the end-of-copy marker
    pub fn to_csv(&self) -> String {
        let mut csv = String::from("name,bytes,seconds,mebibytesPerSecond\n");

        for entry in self.entries.values() {
            let name = if entry.name.contains(['"', ',', '\n']) {
                format!("\"{}\"", entry.name.replace('"', "\"\""))
            } else {
                entry.name.clone()
            };
            let throughput = entry
                .mebibytes_per_second
                .map(|rate| format!("{rate:.3}"))
                .unwrap_or_default();

            csv.push_str(&format!(
                "{name},{},{:.3},{throughput}\n",
                entry.bytes, entry.seconds
            ));
        }

        csv
    }
}

impl fmt::Display for CopySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries.values() {
            let size = Byte::from_bytes(entry.bytes as u128).get_appropriate_unit(true);

            match entry.mebibytes_per_second {
                Some(rate) => {
                    let rate = Byte::from_bytes((rate * MEBIBYTE) as u128).get_appropriate_unit(true);
                    writeln!(f, "{}: {size} in {:.3}s ({rate}/s)", entry.name, entry.seconds)?;
                }
                None => writeln!(f, "{}: {size} in {:.3}s", entry.name, entry.seconds)?,
            }
        }

        write!(
            f,
            "{} object(s), {} total",
            self.entries.len(),
            Byte::from_bytes(self.total_bytes() as u128).get_appropriate_unit(true)
        )
    }
}

/// Reads a result manifest and its result files to build a [`CopySummary`]
#[derive(Clone, Debug)]
pub struct ResultSummarizer {
    storage: Box<dyn ObjectStorage>,
}

impl ResultSummarizer {
    pub fn new(storage: Box<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Summarise the copy whose result manifest is at `manifest`.
    ///
    /// Fails if the manifest is missing, if any batch failed or never completed, or if no
    /// successful result files are listed.  A summary is only produced for a copy that fully
    /// succeeded.
    #[instrument(skip(self), fields(%manifest))]
    pub async fn summarise(&self, manifest: &ObjectLocation) -> Result<CopySummary> {
        let missing = |reason: &str| {
            crate::error::MissingResultManifestSnafu {
                bucket: &manifest.bucket,
                key: &manifest.key,
                reason,
            }
            .build()
        };

        let data = match self.storage.get_object(manifest).await {
            Ok(data) => data,
            Err(CopyOutError::ObjectNotFound { .. }) => {
                return Err(missing("the result manifest object does not exist"))
            }
            Err(e) => return Err(e),
        };

        let result_manifest: ResultManifest = serde_json::from_slice(&data).with_context(|_| {
            crate::error::MalformedResultFileSnafu {
                bucket: &manifest.bucket,
                key: &manifest.key,
            }
        })?;

        let result_files = result_manifest
            .result_files
            .ok_or_else(|| missing("the result manifest has no ResultFiles"))?;

        let failed = result_files.failed.as_ref().map_or(0, Vec::len);
        let pending = result_files.pending.as_ref().map_or(0, Vec::len);
        ensure!(
            failed == 0 && pending == 0,
            crate::error::CopyNotSucceededSnafu { failed, pending }
        );

        let succeeded = result_files
            .succeeded
            .ok_or_else(|| missing("the result manifest lists no SUCCEEDED result files"))?;

        let bucket = result_manifest
            .destination_bucket
            .unwrap_or_else(|| manifest.bucket.clone());

        let mut summary = CopySummary::default();
        for file in &succeeded {
            let records = self.read_result_file(&bucket, file).await?;
            let location = ObjectLocation::new(&bucket, &file.key);

            summary.add_records(&records).with_context(|_| {
                crate::error::MalformedResultFileSnafu {
                    bucket: &location.bucket,
                    key: &location.key,
                }
            })?;
        }

        debug!(
            files = succeeded.len(),
            objects = summary.len(),
            "Summarised copy results"
        );

        Ok(summary)
    }

    async fn read_result_file(
        &self,
        bucket: &str,
        file: &ResultFile,
    ) -> Result<Vec<BatchOutcomeRecord>> {
        let location = ObjectLocation::new(bucket, &file.key);
        let data = self.storage.get_object(&location).await?;

        serde_json::from_slice(&data).with_context(|_| crate::error::MalformedResultFileSnafu {
            bucket: &location.bucket,
            key: &location.key,
        })
    }
}
