//! Wrapper around the `minio` server binary to run ephemeral instances of S3-compatible object
//! storage for testing

use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::{Credentials, Region};
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

const ACCESS_KEY: &str = "minioadmin";
const SECRET_KEY: &str = "minioadmin";
const REGION: &str = "us-east-1";

pub struct MinioServer {
    #[allow(dead_code)] // Never used, but needs to stay in scope so the temp dir isn't deleted
    temp_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Share one server between every test in the process that's using it at the time, starting
    /// it if there isn't one.
    ///
    /// Starting MinIO takes a few seconds, so this is preferable to [`Self::start`].
    pub async fn get() -> Result<Arc<Self>> {
        // A tokio mutex, since the lock is held while the server starts
        static INSTANCE: Lazy<Mutex<Option<Weak<MinioServer>>>> = Lazy::new(|| Mutex::new(None));

        let mut instance = INSTANCE.lock().await;

        let server = match instance.as_ref().and_then(Weak::upgrade) {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *instance = Some(Arc::downgrade(&server));

                server
            }
        };

        debug!(endpoint = %server.endpoint, "Using minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server on a random local port.
    ///
    /// The `minio` binary is found through the `MINIO_PATH` env var, or else the `PATH`.
    pub async fn start() -> Result<Self> {
        let path = Self::find_minio()?;
        let endpoint = Self::random_endpoint()?;
        let temp_dir = Self::temp_data_dir()?;

        let handle = duct::cmd!(
            path,
            "server",
            temp_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            temp_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "Waiting for minio service to start");
        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// The S3 API endpoint URL where the server is listening
    pub fn endpoint_url(&self) -> Result<url::Url> {
        Ok(format!("http://{}/", self.endpoint).parse()?)
    }

    /// A copy-out configuration that talks to this server.
    ///
    /// MinIO has no notion of accounts, so the destination ownership check is turned off.
    pub fn config(&self, working_bucket: impl Into<String>) -> Result<copyout::Config> {
        Ok(copyout::Config {
            s3_endpoint: Some(self.endpoint_url()?),
            aws_access_key_id: Some(ACCESS_KEY.to_string()),
            aws_secret_access_key: Some(SECRET_KEY.to_string()),
            aws_region: Some(REGION.to_string()),
            working_bucket: Some(working_bucket.into()),
            allow_write_to_installed_account: true,
            ..Default::default()
        })
    }

    /// Environment variables that point `rclone`'s `s3` remote at this server
    pub fn rclone_env(&self) -> Vec<(String, String)> {
        [
            ("RCLONE_CONFIG_S3_TYPE", "s3".to_string()),
            ("RCLONE_CONFIG_S3_PROVIDER", "Minio".to_string()),
            ("RCLONE_CONFIG_S3_ENDPOINT", format!("http://{}", self.endpoint)),
            ("RCLONE_CONFIG_S3_ACCESS_KEY_ID", ACCESS_KEY.to_string()),
            ("RCLONE_CONFIG_S3_SECRET_ACCESS_KEY", SECRET_KEY.to_string()),
            ("RCLONE_CONFIG_S3_REGION", REGION.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }

    /// Get [`Client`] instance that is configured to use this Minio server instance
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let region_provider = RegionProviderChain::first_try(Region::new(REGION));
        let aws_config = aws_config::from_env()
            .region(region_provider)
            .credentials_provider(Credentials::from_keys(ACCESS_KEY, SECRET_KEY, None))
            .load()
            .await;

        let s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(self.endpoint_url()?.to_string())
            .force_path_style(true);

        Ok(aws_sdk_s3::Client::from_conf(s3_config_builder.build()))
    }

    /// Make a bucket for one test.
    ///
    /// Tests share a server, so the bucket name gets a random prefix, and anything that isn't
    /// valid in a bucket name is replaced.
    pub async fn create_bucket(&self, name: impl AsRef<str>) -> Result<String> {
        static INVALID: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"[^0-9a-z\.\-]+").expect("BUG: invalid bucket name regex")
        });

        let name = INVALID.replace_all(&name.as_ref().to_lowercase(), "-").into_owned();
        // 63 characters at most, including the 9 character prefix
        let name = &name[..name.len().min(63 - 9)];
        let bucket = format!("{:08x}-{name}", rand::thread_rng().next_u32());

        let client = self.aws_client().await?;
        client.create_bucket().bucket(&bucket).send().await?;

        // MinIO sometimes reports a bucket as missing for a moment after creating it
        if let Err(e) = Self::startup_policy()
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
        {
            return Err(eyre!(
                "The bucket {bucket} is not accessible even after it was created: {e}"
            ));
        }

        debug!(%bucket, "Bucket created");

        Ok(bucket)
    }

    fn startup_policy() -> again::RetryPolicy {
        again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1))
    }

    /// Wait until the server answers requests, or give up
    async fn wait_for_service_start(&self) -> Result<()> {
        let client = self.aws_client().await?;

        Self::startup_policy()
            .retry(|| client.list_buckets().send())
            .await
            .map_err(|e| eyre!("The minio server didn't come online in time: {e}"))?;

        Ok(())
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH").map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| eyre!("Unable to find `minio`; set MINIO_PATH or put it in your PATH"))
    }

    /// Find a socket address on localhost that is free for minio to listen on
    fn random_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// MinIO refuses data directories on `tmpfs`, which `/tmp` usually is, so the data lives in
    /// a temporary directory under the home directory instead.
    fn temp_data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio process(es)");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {}", e);
        }
    }
}
