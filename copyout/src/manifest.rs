//! The CSV manifest listing the objects a job copies, and its division into batches.
//!
//! A manifest has no header row.  Each line has exactly two fields, the source bucket and the
//! object key.  The key may be quoted with `"`, in which case an embedded `"` is written `""`;
//! keys that contain a `,` or a `"` must be quoted.  Manifests written by this crate always quote
//! the key:
//!
//! ```text
//! source-bucket,"path/to/object.bin"
//! ```
use crate::objstore::ObjectLocation;
use crate::Result;
use itertools::Itertools;
use snafu::prelude::*;

/// One object to be copied
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManifestRow {
    pub bucket: String,
    pub key: String,
}

impl ManifestRow {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.key)
    }

    /// The copy tool's notation for this row's object, `s3:bucket/key`
    pub fn copy_tool_source(&self) -> String {
        self.location().to_copy_tool_path()
    }
}

/// A contiguous group of manifest rows copied together by one copy task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based position of this batch in the manifest
    pub index: usize,
    pub rows: Vec<ManifestRow>,
}

/// Parse the raw contents of the manifest object stored at `location`, which must be UTF-8.
pub fn parse_bytes(location: &ObjectLocation, data: &[u8]) -> Result<Vec<ManifestRow>> {
    match std::str::from_utf8(data) {
        Ok(contents) => parse(location, contents),
        Err(e) => {
            let line = data[..e.valid_up_to()]
                .iter()
                .filter(|byte| **byte == b'\n')
                .count()
                + 1;

            crate::error::MalformedManifestSnafu {
                bucket: &location.bucket,
                key: &location.key,
                line,
                reason: "not valid UTF-8",
            }
            .fail()
        }
    }
}

/// Parse the contents of the manifest stored at `location`.
///
/// Blank lines are ignored.  Any other line that isn't a valid row fails the whole manifest.
pub fn parse(location: &ObjectLocation, contents: &str) -> Result<Vec<ManifestRow>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            parse_line(line).map_err(|reason| {
                crate::error::MalformedManifestSnafu {
                    bucket: &location.bucket,
                    key: &location.key,
                    line: index + 1,
                    reason,
                }
                .build()
            })
        })
        .collect()
}

fn parse_line(line: &str) -> std::result::Result<ManifestRow, String> {
    let (bucket, rest) = line
        .split_once(',')
        .ok_or_else(|| "expected two fields, bucket and key".to_string())?;

    let bucket = bucket.trim();
    if bucket.is_empty() {
        return Err("the bucket is empty".to_string());
    }

    let key = if let Some(quoted) = rest.strip_prefix('"') {
        unquote(quoted)?
    } else if rest.contains(',') {
        return Err("too many fields; keys containing ',' must be quoted".to_string());
    } else if rest.contains('"') {
        return Err("unquoted key contains '\"'".to_string());
    } else {
        rest.to_string()
    };

    if key.is_empty() {
        return Err("the key is empty".to_string());
    }

    Ok(ManifestRow::new(bucket, key))
}

/// Decode the remainder of a quoted field whose opening quote has been consumed.  The closing
/// quote must end the line.
fn unquote(quoted: &str) -> std::result::Result<String, String> {
    let mut key = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();

    while let Some(c) = chars.next() {
        if c == '"' {
            match chars.next() {
                Some('"') => key.push('"'),
                None => return Ok(key),
                Some(_) => {
                    return Err("unexpected text after the closing quote of the key".to_string())
                }
            }
        } else {
            key.push(c);
        }
    }

    Err("the quoted key is not terminated".to_string())
}

/// Render rows as manifest text, quoting every key.
pub fn render(rows: &[ManifestRow]) -> String {
    rows.iter()
        .map(|row| format!("{},\"{}\"\n", row.bucket, row.key.replace('"', "\"\"")))
        .collect()
}

/// Split rows into batches of at most `max_items_per_batch` rows, preserving manifest order.
///
/// Every row lands in exactly one batch, and only the last batch may be short.
pub fn partition(rows: Vec<ManifestRow>, max_items_per_batch: usize) -> Vec<Batch> {
    rows.into_iter()
        .chunks(max_items_per_batch.max(1))
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            rows: chunk.collect(),
        })
        .collect()
}
