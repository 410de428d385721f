//! Tests that exercise interaction with a live object store, performed against a local MinIO
//! S3-compatible object storage server for convenience and lower cost.
use crate::Result;
use assert_matches::assert_matches;
use bytes::Bytes;
use copyout::{
    CopyOutError, CopyOutJobBuilder, ObjectLocation, ObjectStorage, ObjectStorageFactory,
    RcloneCopyTask, RestoreStatus, StorageTier,
};
use copyout_testing::logging::test_with_logging;
use copyout_testing::{minio::MinioServer, test_data};
use url::Url;

async fn storage_for(server: &MinioServer) -> Result<Box<dyn ObjectStorage>> {
    let factory = ObjectStorageFactory::new(server.config("unused")?);

    Ok(factory.from_url(&Url::parse("s3://unused/")?).await?)
}

#[test]
#[ignore = "requires minio"]
fn put_get_and_status() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;
        let bucket = server.create_bucket("put_get_and_status").await?;
        let storage = storage_for(&server).await?;

        let location = ObjectLocation::new(&bucket, "dir/object.txt");
        storage
            .put_object(&location, Bytes::from_static(b"hello"))
            .await?;
        assert_eq!(Bytes::from_static(b"hello"), storage.get_object(&location).await?);

        let status = storage.object_status(&location).await?;
        assert_eq!(StorageTier::Standard, status.tier);
        assert_eq!(RestoreStatus::NotRequested, status.restore);

        let missing = ObjectLocation::new(&bucket, "missing.txt");
        assert_matches!(
            storage.get_object(&missing).await,
            Err(CopyOutError::ObjectNotFound { .. })
        );
        assert_matches!(
            storage.object_status(&missing).await,
            Err(CopyOutError::ObjectNotFound { .. })
        );

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn probe_write_in_required_region() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;
        let bucket = server.create_bucket("probe_write").await?;
        let storage = storage_for(&server).await?;

        let marker = ObjectLocation::new(&bucket, "out/STARTED_COPY.txt");
        storage
            .probe_write("us-east-1", &marker, Bytes::from_static(b"started"))
            .await?;

        let contents = test_data::read_s3_object(&server.aws_client().await?, &marker).await?;
        assert_eq!(Bytes::from_static(b"started"), contents);

        Ok(())
    })
}

#[test]
#[ignore = "requires minio and rclone"]
fn copy_job_end_to_end() -> Result<()> {
    test_with_logging(async move {
        let server = MinioServer::get().await?;
        let client = server.aws_client().await?;
        let working = server.create_bucket("working").await?;
        let source = server.create_bucket("source").await?;
        let destination = server.create_bucket("destination").await?;

        let rows = test_data::make_s3_objects(&client, &source, "data/", 12, 64 * 1024).await?;
        let manifest = ObjectLocation::new(&working, "manifests/job.csv");
        test_data::upload_manifest(&client, &manifest, &rows).await?;

        let copy_task = RcloneCopyTask::new(which::which("rclone")?).with_env(server.rclone_env());
        let input = copyout::JobInput {
            destination_prefix_key: Some("copied/".to_string()),
            ..test_data::job_input(&manifest, &destination)
        };

        let summary = CopyOutJobBuilder::new(server.config(&working)?, input)
            .copy_task(Box::new(copy_task))
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await
            .into_result()?;

        assert_eq!(12, summary.len());
        assert_eq!(12 * 64 * 1024, summary.total_bytes());

        for row in &rows {
            let copied = ObjectLocation::new(
                &destination,
                format!("copied/{}", row.location().file_name()),
            );
            let original = test_data::read_s3_object(&client, &row.location()).await?;
            assert_eq!(original, test_data::read_s3_object(&client, &copied).await?);
        }

        let end_marker = test_data::read_s3_object(
            &client,
            &ObjectLocation::new(&destination, "copied/ENDED_COPY.csv"),
        )
        .await?;
        assert_eq!(13, String::from_utf8(end_marker.to_vec())?.lines().count());

        Ok(())
    })
}
