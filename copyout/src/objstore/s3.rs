use super::{ObjectLocation, ObjectStorage};
use crate::thaw::{ObjectStatus, RestoreRequest, RestoreStatus, StorageTier};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{GlacierJobParameters, Tier};
use aws_types::region::Region;
use bytes::Bytes;
use snafu::{prelude::*, IntoError};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    config: Config,
    region: String,
    client: aws_sdk_s3::Client,
    sts: aws_sdk_sts::Client,

    /// The account ID of the identity we're running as, looked up on first use
    account_id: OnceCell<String>,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        let aws_config = load_aws_config(&config, config.aws_region.clone()).await;
        let region = aws_config
            .region()
            .map(|region| region.to_string())
            .unwrap_or_else(|| "us-east-1".to_string());

        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(&config, &aws_config),
                sts: aws_sdk_sts::Client::new(&aws_config),
                region,
                config,
                account_id: OnceCell::new(),
            }),
        }
    }

    async fn account_id(&self) -> Result<&str> {
        let account_id = self
            .inner
            .account_id
            .get_or_try_init(|| async {
                let identity = self
                    .inner
                    .sts
                    .get_caller_identity()
                    .send()
                    .await
                    .context(crate::error::GetCallerIdentitySnafu)?;

                debug!(account = ?identity.account(), arn = ?identity.arn(), "Resolved caller identity");

                let account = identity
                    .account()
                    .filter(|account| !account.is_empty())
                    .context(crate::error::MissingCallerAccountSnafu)?;

                Ok::<_, crate::CopyOutError>(account.to_string())
            })
            .await?;

        Ok(account_id.as_str())
    }

    /// Get a client which makes its requests in `region`.
    ///
    /// If that's the region this instance already uses, no new client is needed.
    async fn client_for_region(&self, region: &str) -> aws_sdk_s3::Client {
        if region == self.inner.region {
            self.inner.client.clone()
        } else {
            let aws_config = load_aws_config(&self.inner.config, region.to_string()).await;
            make_s3_client(&self.inner.config, &aws_config)
        }
    }

    async fn head_bucket_owned_by(
        client: &aws_sdk_s3::Client,
        bucket: &str,
        account_id: &str,
    ) -> std::result::Result<(), HeadBucketSdkError> {
        client
            .head_bucket()
            .bucket(bucket)
            .expected_bucket_owner(account_id)
            .send()
            .await
            .map(|_| ())
    }
}

/// How a refused marker write is reported to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteRefusal {
    WrongRegion,
    AccessDenied,
    Other,
}

fn classify_write_refusal(code: Option<&str>, status: Option<u16>) -> WriteRefusal {
    match (code, status) {
        (Some("PermanentRedirect"), _) | (_, Some(301)) => WriteRefusal::WrongRegion,
        // Only an explicit denial can be cured by the destination's owner.  Other 403s (bad keys,
        // expired tokens, bad signatures) won't go away by waiting.
        (Some("AccessDenied"), _) => WriteRefusal::AccessDenied,
        _ => WriteRefusal::Other,
    }
}

/// Whether a failed `HeadBucket` with an expected owner means the bucket isn't the caller's.
///
/// 403 is the owner mismatch, 404 a bucket that doesn't exist.  Anything else leaves ownership
/// unknown.
fn is_not_owned_status(status: Option<u16>) -> bool {
    matches!(status, Some(403) | Some(404))
}

type HeadBucketSdkError =
    aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>;

/// The region a bucket is really in, when a request made elsewhere was redirected
fn redirected_region(e: &HeadBucketSdkError) -> Option<String> {
    let response = e.raw_response()?;
    if response.status().as_u16() != 301 {
        return None;
    }

    response
        .headers()
        .get("x-amz-bucket-region")
        .map(|region| region.to_string())
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    fn region(&self) -> &str {
        &self.inner.region
    }

    #[instrument(skip(self), fields(%location))]
    async fn get_object(&self, location: &ObjectLocation) -> Result<Bytes> {
        let response = match self
            .inner
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().map(|e| e.is_no_such_key()) == Some(true) {
                    return crate::error::ObjectNotFoundSnafu {
                        bucket: &location.bucket,
                        key: &location.key,
                    }
                    .fail();
                }

                return Err(crate::error::GetObjectSnafu {
                    bucket: &location.bucket,
                    key: &location.key,
                }
                .into_error(e));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .with_context(|_| crate::error::ReadByteStreamSnafu {
                bucket: &location.bucket,
                key: &location.key,
            })?;

        Ok(data.into_bytes())
    }

    #[instrument(skip(self, data), fields(%location, len = data.len()))]
    async fn put_object(&self, location: &ObjectLocation, data: Bytes) -> Result<()> {
        self.inner
            .client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: &location.bucket,
                key: &location.key,
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(%location))]
    async fn object_status(&self, location: &ObjectLocation) -> Result<ObjectStatus> {
        let response = match self
            .inner
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()) == Some(true) {
                    return crate::error::ObjectNotFoundSnafu {
                        bucket: &location.bucket,
                        key: &location.key,
                    }
                    .fail();
                }

                return Err(crate::error::HeadObjectSnafu {
                    bucket: &location.bucket,
                    key: &location.key,
                }
                .into_error(e));
            }
        };

        let status = ObjectStatus {
            tier: StorageTier::from_s3(
                response.storage_class().map(|class| class.as_str()),
                response.archive_status().map(|status| status.as_str()),
            ),
            restore: RestoreStatus::from_restore_header(response.restore()),
        };

        debug!(tier = %status.tier, restore = %status.restore, "Got object status");

        Ok(status)
    }

    #[instrument(skip(self), fields(%location))]
    async fn request_restore(
        &self,
        location: &ObjectLocation,
        request: &RestoreRequest,
    ) -> Result<RestoreStatus> {
        let job_parameters = GlacierJobParameters::builder()
            .tier(Tier::from(request.speed.as_ref()))
            .build()
            .with_context(|_| crate::error::BuildRestoreRequestSnafu {
                key: &location.key,
            })?;

        let mut restore_request =
            aws_sdk_s3::types::RestoreRequest::builder().glacier_job_parameters(job_parameters);
        if let Some(days) = request.days {
            restore_request = restore_request.days(days as i32);
        }

        match self
            .inner
            .client
            .restore_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .restore_request(restore_request.build())
            .send()
            .await
        {
            Ok(_) => Ok(RestoreStatus::InProgress),
            Err(e) => {
                if e.code() == Some("RestoreAlreadyInProgress") {
                    debug!("Restore was already requested");
                    Ok(RestoreStatus::InProgress)
                } else if e
                    .as_service_error()
                    .map(|e| e.is_object_already_in_active_tier_error())
                    == Some(true)
                {
                    debug!("Object is already back in an access tier");
                    Ok(RestoreStatus::Restored)
                } else {
                    Err(crate::error::RestoreObjectSnafu {
                        bucket: &location.bucket,
                        key: &location.key,
                    }
                    .into_error(e))
                }
            }
        }
    }

    #[instrument(skip(self, data), fields(%location))]
    async fn probe_write(
        &self,
        required_region: &str,
        location: &ObjectLocation,
        data: Bytes,
    ) -> Result<()> {
        let client = self.client_for_region(required_region).await;

        let e = match client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(ByteStream::from(data))
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        let status = e.raw_response().map(|response| response.status().as_u16());

        match classify_write_refusal(e.code(), status) {
            WriteRefusal::WrongRegion => {
                // This is AWS's way of telling us we have the right bucket, but it is in another
                // region
                let actual_region = e.raw_response().and_then(|response| {
                    response
                        .headers()
                        .get("x-amz-bucket-region")
                        .map(|region| region.to_string())
                });
                warn!(?actual_region, required_region, "Destination bucket is in the wrong region");

                crate::error::WrongRegionSnafu {
                    bucket: &location.bucket,
                    required_region,
                }
                .fail()
            }
            WriteRefusal::AccessDenied => {
                let reason = e.message().unwrap_or("access denied").to_string();
                debug!(%reason, "Destination bucket is not writable");

                crate::error::AccessDeniedSnafu {
                    bucket: &location.bucket,
                    reason,
                }
                .fail()
            }
            WriteRefusal::Other => match e.code() {
                Some(code) => {
                    warn!(code, ?status, "Destination bucket rejected the write");

                    crate::error::WriteRejectedSnafu {
                        bucket: &location.bucket,
                        code,
                        message: e.message().unwrap_or_default(),
                    }
                    .fail()
                }
                None => Err(crate::error::PutObjectSnafu {
                    bucket: &location.bucket,
                    key: &location.key,
                }
                .into_error(e)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn is_owned_by_caller(&self, bucket: &str) -> Result<bool> {
        let account_id = self.account_id().await?;

        let e = match Self::head_bucket_owned_by(&self.inner.client, bucket, account_id).await {
            Ok(()) => return Ok(true),
            Err(e) => e,
        };

        // A bucket in another region answers with a redirect naming its region; ask there
        let e = match redirected_region(&e) {
            Some(region) => {
                debug!(%region, "Bucket is in another region, checking its owner there");
                let client = self.client_for_region(&region).await;

                match Self::head_bucket_owned_by(&client, bucket, account_id).await {
                    Ok(()) => return Ok(true),
                    Err(e) => e,
                }
            }
            None => e,
        };

        let status = e.raw_response().map(|response| response.status().as_u16());
        if is_not_owned_status(status) {
            debug!(?status, "Bucket is not owned by the caller");
            Ok(false)
        } else {
            Err(crate::error::HeadBucketSnafu { bucket }.into_error(e))
        }
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3")
            .field("region", &self.inner.region)
            .field("s3_endpoint", &self.inner.config.s3_endpoint)
            .field("client", &"<...>")
            .finish()
    }
}

/// Load the AWS SDK configuration, using either an explicit region or the default region deduced
/// from the environment
async fn load_aws_config(
    config: &Config,
    region: impl Into<Option<String>>,
) -> aws_types::SdkConfig {
    let region_provider = if let Some(region) = region.into() {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader = aws_config::from_env().region(region_provider);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "copyout",
        ));
    }

    loader.load().await
}

/// Create a new AWS SDK S3 client from the loaded AWS configuration, pointing it at a custom
/// endpoint if one is configured
fn make_s3_client(config: &Config, aws_config: &aws_types::SdkConfig) -> aws_sdk_s3::Client {
    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't support virtual-host style bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.to_string())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
