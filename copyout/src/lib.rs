#![doc = include_str!("../README.md")]

mod config;
mod copy;
mod error;
mod fanout;
mod input;
mod manifest;
mod objstore;
mod permission;
mod results;
mod retry;
mod summary;
mod thaw;
mod workflow;

pub use config::{parse_duration, Config};
pub use copy::{BatchCopyExecutor, CopyBatch, CopyTask, RcloneCopyTask, TransferRecord};
pub use error::{CopyOutError, ErrorKind, Result};
pub use fanout::{fan_out, FanOutReport};
pub use input::*;
pub use manifest::{
    parse as parse_manifest, parse_bytes as parse_manifest_bytes, partition,
    render as render_manifest, Batch, ManifestRow,
};
pub use objstore::{ObjectLocation, ObjectStorage, ObjectStorageFactory};
pub use permission::PermissionValidator;
pub use results::*;
pub use retry::RetryPolicy;
pub use summary::{CopySummary, ResultSummarizer, SummaryEntry};
pub use thaw::*;
pub use workflow::*;
