use crate::thaw::{ObjectStatus, RestoreRequest, RestoreStatus};
use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use snafu::prelude::*;
use url::Url;

mod s3;

/// The bucket and key of a single object, or of a prefix under which objects are written.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse a URL of the form `s3://bucket/key`.
    ///
    /// The key may be empty, which is how a destination at the root of a bucket is expressed.
    pub fn from_url(url: &Url) -> Result<Self> {
        ensure!(
            url.scheme() == "s3",
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }
        );

        // In URL terms the bucket is the host name
        let bucket = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                crate::error::InvalidS3UrlSnafu {
                    url: url.clone(),
                    reason: "the URL doesn't name a bucket",
                }
                .build()
            })?;

        // URL paths always start with `/`, but that's a delimiter between bucket and key, not part
        // of the key
        let key = url.path().strip_prefix('/').unwrap_or_else(|| url.path());

        Ok(Self::new(bucket, key))
    }

    /// Parse a path in the `s3:bucket/key` form the copy tool uses for remotes.
    pub fn from_copy_tool_path(path: &str) -> Option<Self> {
        let (bucket, key) = path.strip_prefix("s3:")?.split_once('/')?;

        (!bucket.is_empty()).then(|| Self::new(bucket, key))
    }

    /// The location of an object whose key is `relative_key` appended to this location's key.
    ///
    /// The key of this location is used as a literal string prefix; no separator is inserted.
    pub fn join(&self, relative_key: &str) -> Self {
        Self::new(&self.bucket, format!("{}{}", self.key, relative_key))
    }

    /// The final path component of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// This location in the `s3:bucket/key` form the copy tool uses for remotes
    pub fn to_copy_tool_path(&self) -> String {
        format!("s3:{}/{}", self.bucket, self.key)
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// An object storage system like S3.
///
/// All of the orchestrator's interaction with object storage goes through this trait: reading
/// manifests, writing markers and results, inspecting and restoring archived objects, and
/// probing the destination.  Tests substitute an in-memory implementation.
///
/// Use [`ObjectStorageFactory`] to create the S3 implementation.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// The region this storage client is operating in.
    ///
    /// Used as the required region for jobs that don't specify one.
    fn region(&self) -> &str;

    /// Read an entire (small) object into memory.
    ///
    /// Fails with [`crate::CopyOutError::ObjectNotFound`] if the object doesn't exist.
    async fn get_object(&self, location: &ObjectLocation) -> Result<Bytes>;

    /// Write a small object in a single request
    async fn put_object(&self, location: &ObjectLocation, data: Bytes) -> Result<()>;

    /// Report the storage tier of an object and the state of any restore of it
    async fn object_status(&self, location: &ObjectLocation) -> Result<ObjectStatus>;

    /// Ask for an archived object to be restored.
    ///
    /// Returns the restore status after the request: usually [`RestoreStatus::InProgress`].  A
    /// request for an object whose restore is already in progress is not an error.
    async fn request_restore(
        &self,
        location: &ObjectLocation,
        request: &RestoreRequest,
    ) -> Result<RestoreStatus>;

    /// Write `data` to `location` using a client pinned to `required_region`.
    ///
    /// This is the authoritative check that the destination is both writable and in the required
    /// region.  Fails with [`crate::CopyOutError::WrongRegion`] if the bucket is in some other
    /// region, or [`crate::CopyOutError::AccessDenied`] if the write is not permitted.
    async fn probe_write(
        &self,
        required_region: &str,
        location: &ObjectLocation,
        data: Bytes,
    ) -> Result<()>;

    /// Determine if `bucket` belongs to the same account as the identity this client runs as.
    ///
    /// Any failure to confirm ownership, including the bucket not existing, counts as not owned.
    async fn is_owned_by_caller(&self, bucket: &str) -> Result<bool>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// Constructs [`ObjectStorage`] implementations for a given configuration.
#[derive(Clone, Debug)]
pub struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Given the URL to an object, determine which implementation handles that particular object
    /// storage technology and return an instance of it.
    ///
    /// If the URL isn't recognized as being supported, an error is returned
    #[allow(clippy::wrong_self_convention)] // For a factory object I think it's obvious what this means
    pub async fn from_url(&self, url: &Url) -> Result<Box<dyn ObjectStorage>> {
        if url.scheme() == "s3" {
            Ok(self.s3().await)
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }

    /// Return a [`ObjectStorage`] implementation for S3 or an S3-compatible API
    pub async fn s3(&self) -> Box<dyn ObjectStorage> {
        // Every call makes a new client.  AWS SDK clients hold on to resources tied to the tokio
        // runtime they were created in, so a process-wide instance breaks when more than one
        // runtime is in use, as in tests.
        Box::new(s3::S3::new(self.config.clone()).await)
    }
}
