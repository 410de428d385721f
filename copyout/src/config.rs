use crate::thaw::ThawSettings;
use crate::Result;
use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// The deployment-level configuration settings that control how copy jobs are orchestrated.
///
/// This is distinct from [`crate::JobInput`], which is supplied by the caller for each individual
/// job.  A `Config` describes the environment the orchestrator runs in: where its working area
/// is, how aggressive its timings are, and how much concurrency to use.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS access key ID to use for S3 and STS.
    ///
    /// If not set, credentials are taken from the AWS environment configuration.
    #[cfg_attr(feature = "clap", clap(long, global = true, requires = "aws_secret_access_key"))]
    pub aws_access_key_id: Option<String>,

    /// The AWS secret access key to use with `aws_access_key_id`.
    #[cfg_attr(feature = "clap", clap(long, global = true, requires = "aws_access_key_id"))]
    pub aws_secret_access_key: Option<String>,

    /// The AWS region the orchestrator is deployed in.
    ///
    /// Jobs that don't specify a `requiredRegion` require the destination bucket to be in this
    /// region.  If not set, the region is taken from the AWS environment configuration.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "REGION"))]
    pub aws_region: Option<String>,

    /// The bucket holding the working area: manifests, merged job inputs and copy results.
    ///
    /// Required to run a whole copy job.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "BUCKET"))]
    pub working_bucket: Option<String>,

    /// A prefix in the working bucket under which all working artifacts are created.
    ///
    /// If not empty, it must end with `/`.
    #[cfg_attr(feature = "clap", clap(long, default_value = "", global = true))]
    pub working_prefix: String,

    /// Use timings suited to development: a 30 second wait between destination write checks,
    /// and a 24 hour job timeout (instead of 10 minutes and 30 days).
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub aggressive_times: bool,

    /// Permit the destination to be a bucket owned by the account the orchestrator runs as.
    ///
    /// By default such destinations are always reported as access denied, since writes within
    /// the same account are implicitly allowed and a misconfigured job could otherwise "succeed"
    /// by writing back into its own infrastructure.  Only for development and testing.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub allow_write_to_installed_account: bool,

    /// Override the wait between destination write checks.
    ///
    /// Accepts a number of seconds or a value with an `s`, `m`, `h` or `d` suffix.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_parser = parse_duration))]
    pub wait_for_writable: Option<Duration>,

    /// Override the overall job timeout.
    ///
    /// Accepts a number of seconds or a value with an `s`, `m`, `h` or `d` suffix.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_parser = parse_duration))]
    pub job_timeout: Option<Duration>,

    /// The fixed interval between checks on an archived object that is being restored.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "60s", global = true, value_parser = parse_duration)
    )]
    pub thaw_retry_interval: Duration,

    /// The number of times an archived object is re-checked after the first check found it still
    /// being restored, before giving up on it and moving on to the copy.
    #[cfg_attr(feature = "clap", clap(long, default_value = "15", global = true))]
    pub thaw_max_retries: u32,

    /// The number of times a failed copy batch is run again before it is counted as failed.
    #[cfg_attr(feature = "clap", clap(long, default_value = "3", global = true))]
    pub copy_max_retries: u32,

    /// The maximum number of manifest rows checked for thawing at the same time.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_thaws: usize,

    /// The maximum number of copy batches running at the same time.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_batches: usize,

    /// The path to the external copy tool (`rclone`).
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "rclone", global = true, value_name = "PATH")
    )]
    pub copy_tool: PathBuf,

    /// How archived objects are restored, per archive tier.
    #[cfg_attr(feature = "clap", clap(skip))]
    pub thaw: ThawSettings,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: duplicated here and in the `clap` attributes, since the lib crate only depends on
        // clap when the `clap` feature is enabled
        Self {
            s3_endpoint: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: None,
            working_bucket: None,
            working_prefix: String::new(),
            aggressive_times: false,
            allow_write_to_installed_account: false,
            wait_for_writable: None,
            job_timeout: None,
            thaw_retry_interval: Duration::from_secs(60),
            thaw_max_retries: 15,
            copy_max_retries: 3,
            max_concurrent_thaws: 10,
            max_concurrent_batches: 10,
            copy_tool: PathBuf::from("rclone"),
            thaw: ThawSettings::default(),
        }
    }
}

impl Config {
    /// How long to sleep after the destination reported access denied, before checking again.
    pub fn wait_for_writable_duration(&self) -> Duration {
        self.wait_for_writable.unwrap_or(if self.aggressive_times {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(10 * 60)
        })
    }

    /// The hard wall-clock limit for an entire job, including all waiting for the destination to
    /// become writable.
    pub fn job_timeout_duration(&self) -> Duration {
        self.job_timeout.unwrap_or(if self.aggressive_times {
            Duration::from_secs(24 * 60 * 60)
        } else {
            Duration::from_secs(30 * 24 * 60 * 60)
        })
    }

    /// Check the working area and timing settings, returning the working bucket.
    pub fn validate(&self) -> Result<&str> {
        // A zero wait would spin between CanWrite and WaitForWritable until the job times out
        ensure!(
            !self.wait_for_writable_duration().is_zero(),
            crate::error::InvalidConfigSnafu {
                setting: "wait_for_writable",
                reason: "must be greater than zero"
            }
        );

        ensure!(
            self.working_prefix.is_empty() || self.working_prefix.ends_with('/'),
            crate::error::InvalidWorkingPrefixSnafu {
                prefix: self.working_prefix.clone()
            }
        );

        self.working_bucket
            .as_deref()
            .filter(|bucket| !bucket.is_empty())
            .context(crate::error::MissingWorkingBucketSnafu)
    }
}

/// Parse a duration as either a bare number of seconds, or a number with one of the suffixes
/// `s`, `m`, `h` or `d`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (number, multiplier) = match s.char_indices().last() {
        Some((idx, 's')) => (&s[..idx], 1),
        Some((idx, 'm')) => (&s[..idx], 60),
        Some((idx, 'h')) => (&s[..idx], 60 * 60),
        Some((idx, 'd')) => (&s[..idx], 24 * 60 * 60),
        Some(_) => (s, 1),
        None => return Err("duration is empty".to_string()),
    };

    let number: u64 = number
        .trim()
        .parse()
        .map_err(|e| format!("'{s}' is not a valid duration: {e}"))?;
    let seconds = number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("'{s}' is too long a duration"))?;

    Ok(Duration::from_secs(seconds))
}
