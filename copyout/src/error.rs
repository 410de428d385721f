use snafu::prelude::*;
use std::time::Duration;

pub type Result<T, E = CopyOutError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CopyOutError {
    #[snafu(display(
        "The destination bucket '{bucket}' is not located in the required region '{required_region}'"
    ))]
    WrongRegion {
        bucket: String,
        required_region: String,
    },

    #[snafu(display("Writing to the destination bucket '{bucket}' was denied: {reason}"))]
    AccessDenied { bucket: String, reason: String },

    #[snafu(display(
        "The object '{key}' in bucket '{bucket}' is still being restored from {tier}"
    ))]
    IsThawing {
        bucket: String,
        key: String,
        tier: crate::StorageTier,
    },

    #[snafu(display("Copy task for batch {batch} failed: {message}"))]
    TaskFailed { batch: usize, message: String },

    #[snafu(display("Unable to launch the copy tool '{program}'"))]
    LaunchCopyTool {
        program: String,
        source: std::io::Error,
    },

    #[snafu(display("The manifest '{key}' in bucket '{bucket}' is malformed at line {line}: {reason}"))]
    MalformedManifest {
        bucket: String,
        key: String,
        line: usize,
        reason: String,
    },

    #[snafu(display("The result manifest '{key}' in bucket '{bucket}' is missing: {reason}"))]
    MissingResultManifest {
        bucket: String,
        key: String,
        reason: String,
    },

    #[snafu(display("The result file '{key}' in bucket '{bucket}' could not be parsed"))]
    MalformedResultFile {
        bucket: String,
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display(
        "Copy is meant to succeed, but {failed} result file(s) were FAILED and {pending} were PENDING"
    ))]
    CopyNotSucceeded { failed: usize, pending: usize },

    #[snafu(display(
        "{stage} failed for {failed} of {total} items, exceeding the tolerated {tolerated_percentage}%"
    ))]
    ToleranceExceeded {
        stage: &'static str,
        failed: usize,
        total: usize,
        tolerated_percentage: u8,
    },

    #[snafu(display("The job did not complete within its timeout of {timeout:?}"))]
    JobTimedOut { timeout: Duration },

    #[snafu(display("The job was aborted"))]
    Aborted,

    #[snafu(display("Workflow state {state} ran before the job input was resolved"))]
    InputNotResolved { state: crate::State },

    #[snafu(display("The job input is missing the required field '{field}'"))]
    MissingJobInput { field: &'static str },

    #[snafu(display("The job input field '{field}' is invalid: {reason}"))]
    InvalidJobInput { field: &'static str, reason: String },

    #[snafu(display("The job input document could not be parsed"))]
    ParseJobInput { source: serde_json::Error },

    #[snafu(display("The setting '{setting}' is invalid: {reason}"))]
    InvalidConfig {
        setting: &'static str,
        reason: String,
    },

    #[snafu(display("The working area prefix '{prefix}' must end with '/'"))]
    InvalidWorkingPrefix { prefix: String },

    #[snafu(display("No working bucket is configured; one is required to run a copy job"))]
    MissingWorkingBucket,

    #[snafu(display("The URL '{url}' is not a valid S3 location: {reason}"))]
    InvalidS3Url { url: url::Url, reason: String },

    #[snafu(display("The URL '{url}' does not refer to a supported object storage service"))]
    UnsupportedObjectStorage { url: url::Url },

    #[snafu(display("The object '{key}' in bucket '{bucket}' does not exist"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("Error getting object '{key}' from S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("Error reading the contents of object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Error writing object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("S3 rejected the write to bucket '{bucket}' with {code}: {message}"))]
    WriteRejected {
        bucket: String,
        code: String,
        message: String,
    },

    #[snafu(display("Error checking the owner of S3 bucket '{bucket}'"))]
    HeadBucket {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("Error getting metadata about object '{key}' on S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Error requesting restore of object '{key}' on S3 bucket '{bucket}'"))]
    RestoreObject {
        bucket: String,
        key: String,
        source:
            aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::restore_object::RestoreObjectError>,
    },

    #[snafu(display("Error building the restore request for object '{key}'"))]
    BuildRestoreRequest {
        key: String,
        source: aws_sdk_s3::error::BuildError,
    },

    #[snafu(display("Error determining the AWS account of the current identity"))]
    GetCallerIdentity {
        source: aws_sdk_sts::error::SdkError<
            aws_sdk_sts::operation::get_caller_identity::GetCallerIdentityError,
        >,
    },

    #[snafu(display("The current identity has no AWS account, so bucket ownership can't be checked"))]
    MissingCallerAccount,

    #[snafu(display("Error serializing {what} to JSON"))]
    SerializeJson {
        what: &'static str,
        source: serde_json::Error,
    },
}

/// The coarse classification of a [`CopyOutError`].
///
/// Retry and catch policies attached to workflow states are expressed in terms of these kinds,
/// never in terms of individual error variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ErrorKind {
    WrongRegion,
    AccessDenied,
    IsThawing,
    TaskFailure,
    MalformedManifest,
    MissingResultManifest,
    CopyNotSucceeded,
    ToleranceExceeded,
    Timeout,
    Aborted,
    InvalidInput,
    Storage,
    Internal,
}

impl CopyOutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WrongRegion { .. } => ErrorKind::WrongRegion,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::IsThawing { .. } => ErrorKind::IsThawing,
            Self::TaskFailed { .. } | Self::LaunchCopyTool { .. } => ErrorKind::TaskFailure,
            Self::MalformedManifest { .. } => ErrorKind::MalformedManifest,
            Self::MissingResultManifest { .. } | Self::MalformedResultFile { .. } => {
                ErrorKind::MissingResultManifest
            }
            Self::CopyNotSucceeded { .. } => ErrorKind::CopyNotSucceeded,
            Self::ToleranceExceeded { .. } => ErrorKind::ToleranceExceeded,
            Self::JobTimedOut { .. } => ErrorKind::Timeout,
            Self::Aborted => ErrorKind::Aborted,
            Self::MissingJobInput { .. }
            | Self::InvalidJobInput { .. }
            | Self::ParseJobInput { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidWorkingPrefix { .. }
            | Self::MissingWorkingBucket
            | Self::InvalidS3Url { .. }
            | Self::UnsupportedObjectStorage { .. } => ErrorKind::InvalidInput,
            Self::ObjectNotFound { .. }
            | Self::GetObject { .. }
            | Self::ReadByteStream { .. }
            | Self::PutObject { .. }
            | Self::WriteRejected { .. }
            | Self::HeadBucket { .. }
            | Self::HeadObject { .. }
            | Self::RestoreObject { .. }
            | Self::BuildRestoreRequest { .. }
            | Self::GetCallerIdentity { .. }
            | Self::MissingCallerAccount => ErrorKind::Storage,
            Self::InputNotResolved { .. } | Self::SerializeJson { .. } => ErrorKind::Internal,
        }
    }
}
