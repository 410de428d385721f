//! Whole copy jobs, run against in-memory object storage and a fake copy task.
//!
//! These cover every path through the workflow: waiting for a destination to become writable,
//! thawing archived objects, retried and failed copy batches, and the job-wide timeout.
use crate::progress::{EventKind, TestJobProgressCallback};
use crate::Result;
use assert_matches::assert_matches;
use copyout::{
    BatchStatus, Config, CopyOutError, CopyOutJob, CopyOutJobBuilder, ErrorKind, JobInput,
    JobOutcome, ManifestRow, ObjectLocation, ResultManifest, State, StorageTier,
};
use copyout_testing::fakes::{FakeCopyTask, InMemoryObjectStorage};
use copyout_testing::logging::test_with_logging;
use copyout_testing::test_data::{self, DESTINATION_BUCKET, SOURCE_BUCKET, TEST_REGION};
use std::time::Duration;

const RUN_ID: &str = "test-run";
const OBJECT_SIZE: usize = 1024;

/// Where results end up, given [`test_data::fast_config`] and [`test_data::manifest_location`]
const RUN_PREFIX: &str = "copy-out/manifests/job.csv/test-run/";

struct Fixture {
    storage: InMemoryObjectStorage,
    copy_task: FakeCopyTask,
    rows: Vec<ManifestRow>,
}

impl Fixture {
    /// A manifest of `rows` readable source objects
    fn new(rows: usize) -> Self {
        let storage = InMemoryObjectStorage::new(TEST_REGION);
        let rows = test_data::manifest_rows(SOURCE_BUCKET, rows);
        test_data::put_source_objects(&storage, &rows, OBJECT_SIZE);
        test_data::put_manifest(&storage, &test_data::manifest_location(), &rows);

        Self {
            copy_task: FakeCopyTask::new(storage.clone()),
            storage,
            rows,
        }
    }

    fn input(&self) -> JobInput {
        test_data::job_input(&test_data::manifest_location(), DESTINATION_BUCKET)
    }

    async fn job(&self, config: Config, input: JobInput) -> Result<CopyOutJob> {
        Ok(CopyOutJobBuilder::new(config, input)
            .storage(Box::new(self.storage.clone()))
            .copy_task(Box::new(self.copy_task.clone()))
            .run_id(RUN_ID)
            .build()
            .await?)
    }

    fn result_manifest(&self) -> Result<ResultManifest> {
        let location =
            ObjectLocation::new(test_data::WORKING_BUCKET, format!("{RUN_PREFIX}manifest.json"));
        let object = self
            .storage
            .object(&location)
            .ok_or_else(|| color_eyre::eyre::eyre!("no result manifest at {location}"))?;

        Ok(serde_json::from_slice(&object.data)?)
    }

    fn destination_keys(&self) -> Vec<String> {
        self.storage.keys(DESTINATION_BUCKET)
    }
}

fn failure(outcome: &JobOutcome) -> (State, ErrorKind) {
    match outcome {
        JobOutcome::Failed(failure) => (failure.state, failure.kind()),
        JobOutcome::Succeeded(summary) => panic!("job unexpectedly succeeded: {summary}"),
    }
}

#[test]
fn copies_every_object_and_summarises() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(20);
        let progress = TestJobProgressCallback::new();

        let job = fixture.job(test_data::fast_config(), fixture.input()).await?;
        assert_eq!(RUN_ID, job.run_id());

        let report = job.run(futures::future::pending(), progress.clone()).await;

        assert_eq!(
            vec![
                State::DefineDefaults,
                State::ApplyDefaults,
                State::CanWrite,
                State::ThawAll,
                State::CopyAll,
                State::Summarise,
                State::Succeed
            ],
            report.history
        );
        assert_eq!(report.history, progress.states());

        // 20 rows at the default of 8 per batch
        progress.sanity_check_success(20, 3);
        let mut invocations = fixture.copy_task.invocations();
        invocations.sort_unstable();
        assert_eq!(vec![0, 1, 2], invocations);

        let summary = report.into_result()?;
        assert_eq!(20, summary.len());
        assert_eq!(20 * OBJECT_SIZE as u64, summary.total_bytes());
        let entry = summary.get("0007.bin").unwrap();
        assert_eq!(OBJECT_SIZE as u64, entry.bytes);
        assert!(entry.mebibytes_per_second.is_some());

        let mut expected_keys = fixture
            .rows
            .iter()
            .map(|row| row.location().file_name().to_string())
            .collect::<Vec<_>>();
        expected_keys.push("ENDED_COPY.csv".to_string());
        expected_keys.push("STARTED_COPY.txt".to_string());
        expected_keys.sort();
        assert_eq!(expected_keys, fixture.destination_keys());

        let end_marker = fixture
            .storage
            .object(&ObjectLocation::new(DESTINATION_BUCKET, "ENDED_COPY.csv"))
            .unwrap();
        let csv = String::from_utf8(end_marker.data.to_vec())?;
        let mut lines = csv.lines();
        assert_eq!(Some("name,bytes,seconds,mebibytesPerSecond"), lines.next());
        assert_eq!(20, lines.count());
        assert_eq!(summary.to_csv(), csv);

        let manifest = fixture.result_manifest()?;
        assert_eq!(Some(RUN_ID.to_string()), manifest.map_run_id);
        let files = manifest.result_files.unwrap();
        assert_eq!(3, files.succeeded.as_ref().map_or(0, Vec::len));
        assert_eq!(Some(0), files.failed.as_ref().map(Vec::len));
        assert_eq!(Some(0), files.pending.as_ref().map(Vec::len));

        // The merged input is kept with the results
        let input = fixture
            .storage
            .object(&ObjectLocation::new(
                test_data::WORKING_BUCKET,
                format!("{RUN_PREFIX}input.json"),
            ))
            .unwrap();
        let input: serde_json::Value = serde_json::from_slice(&input.data)?;
        assert_eq!(TEST_REGION, input["requiredRegion"]);
        assert_eq!(8, input["maxItemsPerBatch"]);

        Ok(())
    })
}

#[test]
fn honors_caller_supplied_input() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(5);
        let input = JobInput {
            destination_prefix_key: Some("from-us/".to_string()),
            max_items_per_batch: Some(2),
            destination_start_copy_relative_key: Some("begin.txt".to_string()),
            destination_end_copy_relative_key: Some("end.csv".to_string()),
            ..fixture.input()
        };

        let report = fixture
            .job(test_data::fast_config(), input)
            .await?
            .run_without_progress(futures::future::pending())
            .await;
        assert!(report.succeeded());

        assert_eq!(3, fixture.copy_task.invocations().len());

        let keys = fixture.destination_keys();
        assert_eq!(7, keys.len());
        assert!(keys.iter().all(|key| key.starts_with("from-us/")));
        assert!(keys.contains(&"from-us/begin.txt".to_string()));
        assert!(keys.contains(&"from-us/end.csv".to_string()));
        assert!(keys.contains(&"from-us/0004.bin".to_string()));

        Ok(())
    })
}

#[test]
fn empty_manifest_succeeds_with_empty_summary() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(0);

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        let summary = report.into_result()?;
        assert!(summary.is_empty());
        assert!(fixture.copy_task.invocations().is_empty());

        let end_marker = fixture
            .storage
            .object(&ObjectLocation::new(DESTINATION_BUCKET, "ENDED_COPY.csv"))
            .unwrap();
        assert_eq!(&b"name,bytes,seconds,mebibytesPerSecond\n"[..], &end_marker.data[..]);

        Ok(())
    })
}

#[test]
fn waits_for_destination_to_become_writable() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture.storage.deny_writes(DESTINATION_BUCKET, 2);
        let progress = TestJobProgressCallback::new();

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run(futures::future::pending(), progress.clone())
            .await;

        assert_eq!(
            vec![
                State::DefineDefaults,
                State::ApplyDefaults,
                State::CanWrite,
                State::WaitForWritable,
                State::CanWrite,
                State::WaitForWritable,
                State::CanWrite,
                State::ThawAll,
                State::CopyAll,
                State::Summarise,
                State::Succeed
            ],
            report.history
        );
        assert_eq!(2, progress.count(EventKind::WaitingForWritable));
        assert_eq!(2, progress.count(EventKind::StateFailed));
        progress.sanity_check_success(3, 1);

        // Three attempts at the start marker, one end marker
        assert_eq!(4, fixture.storage.probe_writes());

        Ok(())
    })
}

#[test]
fn wrong_region_fails_without_copying() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture
            .storage
            .set_bucket_region(DESTINATION_BUCKET, "eu-central-1");

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!((State::CanWrite, ErrorKind::WrongRegion), failure(&report.outcome));
        assert_eq!(Some(&State::Fail), report.history.last());
        assert!(!report.history.contains(&State::WaitForWritable));
        assert!(fixture.copy_task.invocations().is_empty());
        assert!(fixture.destination_keys().is_empty());

        Ok(())
    })
}

#[test]
fn rejected_credentials_fail_without_waiting() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture
            .storage
            .reject_writes(DESTINATION_BUCKET, "InvalidAccessKeyId");

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!((State::CanWrite, ErrorKind::Storage), failure(&report.outcome));
        assert!(!report.history.contains(&State::WaitForWritable));
        assert_eq!(1, fixture.storage.probe_writes());
        assert!(fixture.copy_task.invocations().is_empty());

        assert_matches!(
            report.into_result(),
            Err(CopyOutError::WriteRejected { code, .. }) if code == "InvalidAccessKeyId"
        );

        Ok(())
    })
}

#[test]
fn unknown_destination_owner_fails_without_writing() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture.storage.fail_ownership_checks(DESTINATION_BUCKET);

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!((State::CanWrite, ErrorKind::Storage), failure(&report.outcome));
        assert!(!report.history.contains(&State::WaitForWritable));
        assert_eq!(0, fixture.storage.probe_writes());
        assert!(fixture.destination_keys().is_empty());

        Ok(())
    })
}

#[test]
fn required_region_can_be_overridden() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture
            .storage
            .set_bucket_region(DESTINATION_BUCKET, "eu-central-1");
        let input = JobInput {
            required_region: Some("eu-central-1".to_string()),
            ..fixture.input()
        };

        let report = fixture
            .job(test_data::fast_config(), input)
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert!(report.succeeded());

        Ok(())
    })
}

#[test]
fn own_account_destination_is_never_writable() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture.storage.set_owned_by_caller(DESTINATION_BUCKET);
        let config = Config {
            job_timeout: Some(Duration::from_millis(300)),
            ..test_data::fast_config()
        };

        let report = fixture
            .job(config, fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        let (_, kind) = failure(&report.outcome);
        assert_eq!(ErrorKind::Timeout, kind);
        assert_matches!(
            report.into_result(),
            Err(CopyOutError::JobTimedOut { .. })
        );
        assert_eq!(0, fixture.storage.probe_writes());
        assert!(fixture.destination_keys().is_empty());

        Ok(())
    })
}

#[test]
fn own_account_destination_can_be_allowed() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        fixture.storage.set_owned_by_caller(DESTINATION_BUCKET);
        let config = Config {
            allow_write_to_installed_account: true,
            ..test_data::fast_config()
        };

        let report = fixture
            .job(config, fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert!(report.succeeded());

        Ok(())
    })
}

#[test]
fn thaws_archived_objects_before_copying() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(0);
        let rows = test_data::manifest_rows(SOURCE_BUCKET, 4);
        test_data::put_archived_source_objects(
            &fixture.storage,
            &rows[..2],
            OBJECT_SIZE,
            StorageTier::GlacierFlexibleRetrieval,
            2,
        );
        test_data::put_archived_source_objects(
            &fixture.storage,
            &rows[2..],
            OBJECT_SIZE,
            StorageTier::GlacierDeepArchive,
            0,
        );
        test_data::put_manifest(&fixture.storage, &test_data::manifest_location(), &rows);
        let progress = TestJobProgressCallback::new();

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run(futures::future::pending(), progress.clone())
            .await;

        progress.sanity_check_success(4, 1);
        let summary = report.into_result()?;
        assert_eq!(4 * OBJECT_SIZE as u64, summary.total_bytes());

        // Exactly one restore request per object, even though each was checked several times
        let requests = fixture.storage.restore_requests();
        assert_eq!(4, requests.len());
        assert!(requests
            .iter()
            .all(|(location, _)| location.bucket == SOURCE_BUCKET));
        for (location, request) in &requests {
            let expected = if rows[..2].iter().any(|row| &row.location() == location) {
                copyout::RetrievalSpeed::Expedited
            } else {
                copyout::RetrievalSpeed::Standard
            };
            assert_eq!(expected, request.speed);
        }

        let tiers = progress
            .events()
            .into_iter()
            .filter_map(|event| match event {
                crate::progress::JobProgressEvent::RowThawed { tier, .. } => Some(tier),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(tiers.iter().all(Option::is_some));

        Ok(())
    })
}

#[test]
fn readable_objects_are_never_restored() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(10);

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert!(report.succeeded());
        assert!(fixture.storage.restore_requests().is_empty());
        assert_eq!(10, fixture.storage.status_checks());

        Ok(())
    })
}

#[test]
fn objects_that_never_thaw_are_left_to_the_copy() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(0);
        let rows = test_data::manifest_rows(SOURCE_BUCKET, 2);
        test_data::put_archived_source_objects(
            &fixture.storage,
            &rows,
            OBJECT_SIZE,
            StorageTier::GlacierDeepArchive,
            1000,
        );
        test_data::put_manifest(&fixture.storage, &test_data::manifest_location(), &rows);
        let config = Config {
            thaw_max_retries: 2,
            ..test_data::fast_config()
        };
        let progress = TestJobProgressCallback::new();

        let report = fixture
            .job(config, fixture.input())
            .await?
            .run(futures::future::pending(), progress.clone())
            .await;

        assert_eq!(2, progress.count(EventKind::RowThawFailed));
        // One check to request the restore, then two retries
        assert_eq!(6, fixture.storage.status_checks());

        // Per-object copy errors are recorded in the results, but don't fail the batch
        let failed_transfers: usize = progress
            .events()
            .into_iter()
            .map(|event| match event {
                crate::progress::JobProgressEvent::BatchCopied {
                    failed_transfers, ..
                } => failed_transfers,
                _ => 0,
            })
            .sum();
        assert_eq!(2, failed_transfers);

        let summary = report.into_result()?;
        assert_eq!(0, summary.total_bytes());
        assert!(!fixture
            .destination_keys()
            .contains(&"0000.bin".to_string()));

        Ok(())
    })
}

#[test]
fn failed_batches_are_retried() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(20);
        fixture.copy_task.fail_batch(1, 2);

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert!(report.succeeded());
        let invocations = fixture.copy_task.invocations();
        assert_eq!(3, invocations.iter().filter(|batch| **batch == 1).count());
        assert_eq!(1, invocations.iter().filter(|batch| **batch == 0).count());

        Ok(())
    })
}

#[test]
fn failures_within_tolerance_fail_the_summary() -> Result<()> {
    test_with_logging(async move {
        // 4 batches of 8, one of which never succeeds: 25% failed is tolerated by the copy
        let fixture = Fixture::new(32);
        fixture.copy_task.fail_batch(2, 100);
        let progress = TestJobProgressCallback::new();

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run(futures::future::pending(), progress.clone())
            .await;

        assert_eq!(
            (State::Summarise, ErrorKind::CopyNotSucceeded),
            failure(&report.outcome)
        );
        assert_eq!(1, progress.count(EventKind::BatchFailed));
        assert_eq!(3, progress.count(EventKind::BatchCopied));
        // The first attempt and three retries
        assert_eq!(
            4,
            fixture
                .copy_task
                .invocations()
                .iter()
                .filter(|batch| **batch == 2)
                .count()
        );

        let files = fixture.result_manifest()?.result_files.unwrap();
        assert_eq!(3, files.succeeded.unwrap().len());
        let failed = files.failed.unwrap();
        assert_eq!(1, failed.len());
        assert!(failed[0].key.ends_with("FAILED_2.json"));

        let record = fixture
            .storage
            .object(&ObjectLocation::new(test_data::WORKING_BUCKET, &failed[0].key))
            .unwrap();
        let records: Vec<copyout::BatchOutcomeRecord> = serde_json::from_slice(&record.data)?;
        assert_eq!(BatchStatus::Failed, records[0].status);
        assert_eq!(Some("TaskFailure".to_string()), records[0].error);

        // No end marker for a copy that didn't fully succeed
        assert!(!fixture
            .destination_keys()
            .contains(&"ENDED_COPY.csv".to_string()));

        Ok(())
    })
}

#[test]
fn failures_beyond_tolerance_abandon_the_copy() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(32);
        fixture.copy_task.fail_batch(0, 100);
        fixture.copy_task.fail_batch(1, 100);
        // One batch at a time, so which batches never run is predictable
        let config = Config {
            max_concurrent_batches: 1,
            ..test_data::fast_config()
        };

        let report = fixture
            .job(config, fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!(
            (State::CopyAll, ErrorKind::ToleranceExceeded),
            failure(&report.outcome)
        );
        assert_eq!(
            vec![0, 0, 0, 0, 1, 1, 1, 1],
            fixture.copy_task.invocations()
        );

        let files = fixture.result_manifest()?.result_files.unwrap();
        assert_eq!(Some(0), files.succeeded.map(|files| files.len()));
        assert_eq!(Some(2), files.failed.map(|files| files.len()));
        let pending = files.pending.unwrap();
        assert_eq!(2, pending.len());
        assert!(pending[0].key.ends_with("PENDING_2.json"));
        assert!(pending[1].key.ends_with("PENDING_3.json"));

        Ok(())
    })
}

#[test]
fn malformed_manifest_fails_the_job() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(0);
        fixture.storage.put(
            test_data::manifest_location(),
            "source,\"ok.bin\"\nsource,\"unterminated\n",
        );

        let report = fixture
            .job(test_data::fast_config(), fixture.input())
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!(
            (State::ThawAll, ErrorKind::MalformedManifest),
            failure(&report.outcome)
        );
        assert_matches!(
            report.into_result(),
            Err(CopyOutError::MalformedManifest { line: 2, .. })
        );

        Ok(())
    })
}

#[test]
fn missing_input_fails_before_touching_the_destination() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        let input = JobInput {
            destination_bucket: None,
            ..fixture.input()
        };

        let report = fixture
            .job(test_data::fast_config(), input)
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!(
            (State::ApplyDefaults, ErrorKind::InvalidInput),
            failure(&report.outcome)
        );
        assert_matches!(
            report.into_result(),
            Err(CopyOutError::MissingJobInput {
                field: "destinationBucket"
            })
        );
        assert_eq!(0, fixture.storage.probe_writes());

        Ok(())
    })
}

#[test]
fn slow_copies_hit_the_job_timeout() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        let copy_task = fixture.copy_task.clone().with_delay(Duration::from_secs(60));
        let config = Config {
            job_timeout: Some(Duration::from_millis(500)),
            ..test_data::fast_config()
        };

        let report = CopyOutJobBuilder::new(config, fixture.input())
            .storage(Box::new(fixture.storage.clone()))
            .copy_task(Box::new(copy_task))
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await;

        assert_eq!((State::CopyAll, ErrorKind::Timeout), failure(&report.outcome));
        assert_eq!(Some(&State::Fail), report.history.last());

        Ok(())
    })
}

#[test]
fn abort_stops_the_job() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(3);
        let copy_task = fixture.copy_task.clone().with_delay(Duration::from_secs(60));
        let progress = TestJobProgressCallback::new();

        let report = CopyOutJobBuilder::new(test_data::fast_config(), fixture.input())
            .storage(Box::new(fixture.storage.clone()))
            .copy_task(Box::new(copy_task))
            .build()
            .await?
            .run(tokio::time::sleep(Duration::from_millis(200)), progress.clone())
            .await;

        assert_eq!((State::CopyAll, ErrorKind::Aborted), failure(&report.outcome));
        assert_eq!(Some(State::Fail), progress.states().last().copied());

        Ok(())
    })
}

#[test]
fn build_rejects_bad_configuration() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new(0);

        let config = Config {
            working_bucket: None,
            ..test_data::fast_config()
        };
        assert_matches!(
            fixture.job(config, fixture.input()).await,
            Err(e) if matches!(e.downcast_ref::<CopyOutError>(), Some(CopyOutError::MissingWorkingBucket))
        );

        let config = Config {
            working_prefix: "no-trailing-slash".to_string(),
            ..test_data::fast_config()
        };
        assert_matches!(
            fixture.job(config, fixture.input()).await,
            Err(e) if matches!(e.downcast_ref::<CopyOutError>(), Some(CopyOutError::InvalidWorkingPrefix { .. }))
        );

        let config = Config {
            wait_for_writable: Some(Duration::ZERO),
            ..test_data::fast_config()
        };
        assert_matches!(
            fixture.job(config, fixture.input()).await,
            Err(e) if matches!(e.downcast_ref::<CopyOutError>(), Some(CopyOutError::InvalidConfig { .. }))
        );
        assert!(fixture.storage.keys(DESTINATION_BUCKET).is_empty());

        Ok(())
    })
}
