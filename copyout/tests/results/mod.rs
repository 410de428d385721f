//! Result files written during the copy, and summarising them afterwards
use crate::Result;
use assert_matches::assert_matches;
use copyout::{
    BatchStatus, CopyBatch, CopyOutError, ObjectLocation, ResultManifest, ResultSummarizer,
    ResultWriter, TransferRecord,
};
use copyout_testing::fakes::InMemoryObjectStorage;
use copyout_testing::logging::test_with_logging;
use copyout_testing::test_data::{TEST_REGION, WORKING_BUCKET};

const RUN_ID: &str = "run-1";

fn writer(storage: &InMemoryObjectStorage) -> ResultWriter {
    ResultWriter::new(
        Box::new(storage.clone()),
        ObjectLocation::new(WORKING_BUCKET, "results/run-1/"),
        RUN_ID,
    )
}

fn batch(index: usize, names: &[&str]) -> CopyBatch {
    CopyBatch {
        index,
        sources: names
            .iter()
            .map(|name| format!("s3:source/dir/{name}"))
            .collect(),
        destination: "s3:destination/".to_string(),
        copy_concurrency: 4,
    }
}

fn transfer(name: &str, bytes: u64, seconds: f64) -> TransferRecord {
    TransferRecord {
        source: format!("s3:source/dir/{name}"),
        transfers: 1,
        server_side_copies: 1,
        server_side_copy_bytes: bytes,
        elapsed_time: seconds,
        ..Default::default()
    }
}

#[test]
fn summarises_successful_copy() -> Result<()> {
    test_with_logging(async move {
        let storage = InMemoryObjectStorage::new(TEST_REGION);
        let writer = writer(&storage);

        let first = writer
            .write_batch(
                &batch(0, &["a.bin", "b.bin"]),
                Ok(&[
                    transfer("a.bin", 2 * 1024 * 1024, 2.0),
                    transfer("b.bin", 1024, 0.0),
                ][..]),
            )
            .await?;
        let second = writer
            .write_batch(&batch(1, &["c.bin"]), Ok(&[transfer("c.bin", 10, 1.0)][..]))
            .await?;
        assert_eq!(BatchStatus::Succeeded, first.status);
        assert_eq!("results/run-1/SUCCEEDED_0.json", first.file.key);

        let manifest = writer
            .write_manifest(WORKING_BUCKET, &[second, first])
            .await?;
        assert_eq!(writer.manifest_location(), manifest);

        let parsed: ResultManifest =
            serde_json::from_slice(&storage.object(&manifest).unwrap().data)?;
        assert_eq!(Some(RUN_ID.to_string()), parsed.map_run_id);
        let succeeded = parsed.result_files.unwrap().succeeded.unwrap();
        assert_eq!(
            vec![
                "results/run-1/SUCCEEDED_0.json",
                "results/run-1/SUCCEEDED_1.json"
            ],
            succeeded
                .iter()
                .map(|file| file.key.as_str())
                .collect::<Vec<_>>()
        );

        let summary = ResultSummarizer::new(Box::new(storage.clone()))
            .summarise(&manifest)
            .await?;

        assert_eq!(3, summary.len());
        assert_eq!(Some(1.0), summary.get("a.bin").unwrap().mebibytes_per_second);
        // Zero elapsed time has no meaningful throughput
        assert_eq!(None, summary.get("b.bin").unwrap().mebibytes_per_second);
        assert_eq!(2 * 1024 * 1024 + 1024 + 10, summary.total_bytes());

        let csv = summary.to_csv();
        assert!(csv.contains("a.bin,2097152,2.000,1.000\n"));
        assert!(csv.contains("b.bin,1024,0.000,\n"));

        Ok(())
    })
}

#[test]
fn failed_or_pending_batches_fail_the_summary() -> Result<()> {
    test_with_logging(async move {
        let storage = InMemoryObjectStorage::new(TEST_REGION);
        let writer = writer(&storage);

        let error = CopyOutError::TaskFailed {
            batch: 1,
            message: "rclone crashed".to_string(),
        };
        let results = vec![
            writer
                .write_batch(&batch(0, &["a.bin"]), Ok(&[transfer("a.bin", 1, 1.0)][..]))
                .await?,
            writer.write_batch(&batch(1, &["b.bin"]), Err(&error)).await?,
            writer.write_pending(&batch(2, &["c.bin"])).await?,
        ];
        assert_eq!(
            vec![
                BatchStatus::Succeeded,
                BatchStatus::Failed,
                BatchStatus::Pending
            ],
            results.iter().map(|result| result.status).collect::<Vec<_>>()
        );

        let failed_file = storage
            .object(&ObjectLocation::new(
                WORKING_BUCKET,
                "results/run-1/FAILED_1.json",
            ))
            .unwrap();
        let records: Vec<copyout::BatchOutcomeRecord> = serde_json::from_slice(&failed_file.data)?;
        assert_eq!(1, records.len());
        assert_eq!(Some("TaskFailure".to_string()), records[0].error);
        assert!(records[0].cause.as_ref().unwrap().contains("rclone crashed"));
        assert_eq!(None, records[0].output);

        let manifest = writer.write_manifest(WORKING_BUCKET, &results).await?;

        assert_matches!(
            ResultSummarizer::new(Box::new(storage.clone()))
                .summarise(&manifest)
                .await,
            Err(CopyOutError::CopyNotSucceeded {
                failed: 1,
                pending: 1
            })
        );

        Ok(())
    })
}

#[test]
fn missing_result_manifest() -> Result<()> {
    test_with_logging(async move {
        let storage = InMemoryObjectStorage::new(TEST_REGION);
        let summarizer = ResultSummarizer::new(Box::new(storage.clone()));
        let location = ObjectLocation::new(WORKING_BUCKET, "results/run-1/manifest.json");

        assert_matches!(
            summarizer.summarise(&location).await,
            Err(CopyOutError::MissingResultManifest { .. })
        );

        // A manifest that doesn't list any result files is as good as missing
        storage.put(location.clone(), r#"{"DestinationBucket": "working"}"#);
        assert_matches!(
            summarizer.summarise(&location).await,
            Err(CopyOutError::MissingResultManifest { .. })
        );

        storage.put(location.clone(), r#"{"ResultFiles": {"FAILED": []}}"#);
        assert_matches!(
            summarizer.summarise(&location).await,
            Err(CopyOutError::MissingResultManifest { .. })
        );

        storage.put(location.clone(), "not json");
        assert_matches!(
            summarizer.summarise(&location).await,
            Err(CopyOutError::MalformedResultFile { .. })
        );

        Ok(())
    })
}
