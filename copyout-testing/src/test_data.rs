//! Create manifests, source objects and job settings for tests
use crate::fakes::InMemoryObjectStorage;
use crate::Result;
use aws_sdk_s3::{primitives::ByteStream, Client};
use bytes::Bytes;
use copyout::{Config, JobInput, ManifestRow, ObjectLocation, StorageTier};
use futures::{StreamExt, TryStreamExt};
use rand::prelude::*;
use std::time::Duration;

/// Max concurrent S3 operations when dealing with test data
const MAX_CONCURRENCY: usize = 10;

/// The region in-memory storage operates in, unless a test says otherwise
pub const TEST_REGION: &str = "ap-southeast-2";

pub const WORKING_BUCKET: &str = "working";
pub const SOURCE_BUCKET: &str = "source";
pub const DESTINATION_BUCKET: &str = "destination";

/// Where tests keep their manifest in the working bucket
pub fn manifest_location() -> ObjectLocation {
    ObjectLocation::new(WORKING_BUCKET, "manifests/job.csv")
}

/// `count` rows of distinctly named objects in `bucket`
pub fn manifest_rows(bucket: &str, count: usize) -> Vec<ManifestRow> {
    (0..count)
        .map(|i| ManifestRow::new(bucket, format!("objects/{i:04}.bin")))
        .collect()
}

pub fn random_data(size: usize) -> Bytes {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);

    Bytes::from(data)
}

/// Store a readable object of `size` random bytes for each row
pub fn put_source_objects(storage: &InMemoryObjectStorage, rows: &[ManifestRow], size: usize) {
    for row in rows {
        storage.put(row.location(), random_data(size));
    }
}

/// Store an archived object of `size` random bytes for each row
pub fn put_archived_source_objects(
    storage: &InMemoryObjectStorage,
    rows: &[ManifestRow],
    size: usize,
    tier: StorageTier,
    polls_until_restored: u32,
) {
    for row in rows {
        storage.put_archived(row.location(), random_data(size), tier, polls_until_restored);
    }
}

pub fn put_manifest(
    storage: &InMemoryObjectStorage,
    location: &ObjectLocation,
    rows: &[ManifestRow],
) {
    storage.put(location.clone(), copyout::render_manifest(rows));
}

/// Job input copying the manifest at `manifest` to the root of `destination_bucket`
pub fn job_input(manifest: &ObjectLocation, destination_bucket: &str) -> JobInput {
    JobInput {
        source_files_csv_bucket: Some(manifest.bucket.clone()),
        source_files_csv_key: Some(manifest.key.clone()),
        destination_bucket: Some(destination_bucket.to_string()),
        ..Default::default()
    }
}

/// Configuration with timings short enough that waits and retries don't slow tests down
pub fn fast_config() -> Config {
    Config {
        working_bucket: Some(WORKING_BUCKET.to_string()),
        working_prefix: "copy-out/".to_string(),
        aws_region: Some(TEST_REGION.to_string()),
        wait_for_writable: Some(Duration::from_millis(10)),
        job_timeout: Some(Duration::from_secs(60)),
        thaw_retry_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Create `count` objects of `size` random bytes under `prefix` in a real S3 bucket, returning
/// the manifest rows for them
pub async fn make_s3_objects(
    client: &Client,
    bucket: &str,
    prefix: &str,
    count: usize,
    size: usize,
) -> Result<Vec<ManifestRow>> {
    let rows = (0..count)
        .map(|i| ManifestRow::new(bucket, format!("{prefix}{i:04}.bin")))
        .collect::<Vec<_>>();

    futures::stream::iter(rows.iter().map(|row| async move {
        client
            .put_object()
            .bucket(&row.bucket)
            .key(&row.key)
            .body(ByteStream::from(random_data(size)))
            .send()
            .await?;

        Result::<_>::Ok(())
    }))
    .buffer_unordered(MAX_CONCURRENCY)
    .try_collect::<Vec<_>>()
    .await?;

    Ok(rows)
}

/// Upload a manifest of `rows` to a real S3 bucket
pub async fn upload_manifest(
    client: &Client,
    location: &ObjectLocation,
    rows: &[ManifestRow],
) -> Result<()> {
    client
        .put_object()
        .bucket(&location.bucket)
        .key(&location.key)
        .body(ByteStream::from(Bytes::from(copyout::render_manifest(rows))))
        .send()
        .await?;

    Ok(())
}

/// Read an entire object from a real S3 bucket
pub async fn read_s3_object(client: &Client, location: &ObjectLocation) -> Result<Bytes> {
    let response = client
        .get_object()
        .bucket(&location.bucket)
        .key(&location.key)
        .send()
        .await?;

    Ok(response.body.collect().await?.into_bytes())
}
