//! In-memory stand-ins for object storage and the copy tool, so copy jobs can run end to end
//! without S3 or `rclone`.
use bytes::Bytes;
use copyout::{
    CopyBatch, CopyOutError, CopyTask, ObjectLocation, ObjectStatus, ObjectStorage,
    RestoreRequest, RestoreStatus, StorageTier, TransferRecord,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// An object held by [`InMemoryObjectStorage`]
#[derive(Clone, Debug)]
pub struct FakeObject {
    pub data: Bytes,
    pub tier: StorageTier,
    pub restore: RestoreStatus,

    /// How many more status checks report a requested restore as still in progress
    pub polls_until_restored: u32,
}

#[derive(Debug, Default)]
struct StorageState {
    objects: BTreeMap<ObjectLocation, FakeObject>,
    bucket_regions: HashMap<String, String>,
    owned_buckets: HashSet<String>,
    denied_writes: HashMap<String, usize>,
    rejected_writes: HashMap<String, String>,
    unknown_owners: HashSet<String>,
    ownership_checks: usize,
    restore_requests: Vec<(ObjectLocation, RestoreRequest)>,
    status_checks: usize,
    probe_writes: usize,
}

/// Object storage kept entirely in memory.
///
/// Buckets spring into existence when an object is written to them, and are in the storage's own
/// region unless told otherwise.  Clones share the same contents.
#[derive(Clone, Debug)]
pub struct InMemoryObjectStorage {
    region: String,
    state: Arc<Mutex<StorageState>>,
}

impl InMemoryObjectStorage {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        // A test that panicked while holding the lock has already failed
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store a readable object
    pub fn put(&self, location: ObjectLocation, data: impl Into<Bytes>) {
        self.lock().objects.insert(
            location,
            FakeObject {
                data: data.into(),
                tier: StorageTier::Standard,
                restore: RestoreStatus::NotRequested,
                polls_until_restored: 0,
            },
        );
    }

    /// Store an object in an archive tier.
    ///
    /// Once a restore is requested, the next `polls_until_restored` status checks report it in
    /// progress, and the one after that reports it restored.
    pub fn put_archived(
        &self,
        location: ObjectLocation,
        data: impl Into<Bytes>,
        tier: StorageTier,
        polls_until_restored: u32,
    ) {
        self.lock().objects.insert(
            location,
            FakeObject {
                data: data.into(),
                tier,
                restore: RestoreStatus::NotRequested,
                polls_until_restored,
            },
        );
    }

    /// Place `bucket` in some region other than the storage's own
    pub fn set_bucket_region(&self, bucket: impl Into<String>, region: impl Into<String>) {
        self.lock()
            .bucket_regions
            .insert(bucket.into(), region.into());
    }

    /// Make `bucket` belong to the same account as the caller
    pub fn set_owned_by_caller(&self, bucket: impl Into<String>) {
        self.lock().owned_buckets.insert(bucket.into());
    }

    /// Refuse the next `times` marker writes to `bucket`
    pub fn deny_writes(&self, bucket: impl Into<String>, times: usize) {
        self.lock().denied_writes.insert(bucket.into(), times);
    }

    /// Reject every marker write to `bucket` with the S3 error `code`, the way S3 rejects requests
    /// made with bad credentials
    pub fn reject_writes(&self, bucket: impl Into<String>, code: impl Into<String>) {
        self.lock()
            .rejected_writes
            .insert(bucket.into(), code.into());
    }

    /// Make every ownership check of `bucket` fail, as if the caller's account couldn't be
    /// determined
    pub fn fail_ownership_checks(&self, bucket: impl Into<String>) {
        self.lock().unknown_owners.insert(bucket.into());
    }

    /// Look at an object without it counting as a status check
    pub fn object(&self, location: &ObjectLocation) -> Option<FakeObject> {
        self.lock().objects.get(location).cloned()
    }

    /// Every key in `bucket`, in order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|location| location.bucket == bucket)
            .map(|location| location.key.clone())
            .collect()
    }

    pub fn restore_requests(&self) -> Vec<(ObjectLocation, RestoreRequest)> {
        self.lock().restore_requests.clone()
    }

    pub fn status_checks(&self) -> usize {
        self.lock().status_checks
    }

    pub fn probe_writes(&self) -> usize {
        self.lock().probe_writes
    }

    pub fn ownership_checks(&self) -> usize {
        self.lock().ownership_checks
    }

    fn not_found(location: &ObjectLocation) -> CopyOutError {
        CopyOutError::ObjectNotFound {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    fn region(&self) -> &str {
        &self.region
    }

    async fn get_object(&self, location: &ObjectLocation) -> copyout::Result<Bytes> {
        self.lock()
            .objects
            .get(location)
            .map(|object| object.data.clone())
            .ok_or_else(|| Self::not_found(location))
    }

    async fn put_object(&self, location: &ObjectLocation, data: Bytes) -> copyout::Result<()> {
        self.put(location.clone(), data);
        Ok(())
    }

    async fn object_status(&self, location: &ObjectLocation) -> copyout::Result<ObjectStatus> {
        let mut state = self.lock();
        state.status_checks += 1;

        let object = state
            .objects
            .get_mut(location)
            .ok_or_else(|| Self::not_found(location))?;

        if object.restore == RestoreStatus::InProgress {
            if object.polls_until_restored == 0 {
                object.restore = RestoreStatus::Restored;
            } else {
                object.polls_until_restored -= 1;
            }
        }

        Ok(ObjectStatus {
            tier: object.tier,
            restore: object.restore,
        })
    }

    async fn request_restore(
        &self,
        location: &ObjectLocation,
        request: &RestoreRequest,
    ) -> copyout::Result<RestoreStatus> {
        let mut state = self.lock();
        state
            .restore_requests
            .push((location.clone(), request.clone()));

        let object = state
            .objects
            .get_mut(location)
            .ok_or_else(|| Self::not_found(location))?;

        if !object.tier.requires_restore() {
            return Ok(RestoreStatus::Restored);
        }
        if object.restore == RestoreStatus::NotRequested {
            object.restore = RestoreStatus::InProgress;
        }

        Ok(object.restore)
    }

    async fn probe_write(
        &self,
        required_region: &str,
        location: &ObjectLocation,
        data: Bytes,
    ) -> copyout::Result<()> {
        {
            let mut state = self.lock();
            state.probe_writes += 1;

            let bucket_region = state
                .bucket_regions
                .get(&location.bucket)
                .cloned()
                .unwrap_or_else(|| self.region.clone());
            if bucket_region != required_region {
                return Err(CopyOutError::WrongRegion {
                    bucket: location.bucket.clone(),
                    required_region: required_region.to_string(),
                });
            }

            if let Some(code) = state.rejected_writes.get(&location.bucket) {
                return Err(CopyOutError::WriteRejected {
                    bucket: location.bucket.clone(),
                    code: code.clone(),
                    message: "The request was rejected".to_string(),
                });
            }

            if let Some(remaining) = state.denied_writes.get_mut(&location.bucket) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CopyOutError::AccessDenied {
                        bucket: location.bucket.clone(),
                        reason: "Access Denied".to_string(),
                    });
                }
            }
        }

        self.put(location.clone(), data);
        Ok(())
    }

    async fn is_owned_by_caller(&self, bucket: &str) -> copyout::Result<bool> {
        let mut state = self.lock();
        state.ownership_checks += 1;

        if state.unknown_owners.contains(bucket) {
            return Err(CopyOutError::MissingCallerAccount);
        }

        Ok(state.owned_buckets.contains(bucket))
    }
}

#[derive(Debug, Default)]
struct CopyTaskState {
    /// Remaining failures to inject, by batch index
    failing_batches: HashMap<usize, usize>,
    invocations: Vec<usize>,
}

/// Copies objects within an [`InMemoryObjectStorage`] the way `rclone copy` would.
///
/// Each source lands under the destination prefix with its file name.  A source that doesn't
/// exist, or is archived and not restored, is reported as an error in its transfer record.
#[derive(Clone, Debug)]
pub struct FakeCopyTask {
    storage: InMemoryObjectStorage,
    elapsed_time: f64,
    delay: Duration,
    state: Arc<Mutex<CopyTaskState>>,
}

impl FakeCopyTask {
    pub fn new(storage: InMemoryObjectStorage) -> Self {
        Self {
            storage,
            elapsed_time: 0.5,
            delay: Duration::ZERO,
            state: Default::default(),
        }
    }

    /// The elapsed time reported for every transfer, in seconds
    pub fn with_elapsed_time(mut self, seconds: f64) -> Self {
        self.elapsed_time = seconds;
        self
    }

    /// Sleep this long in every run before copying anything
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CopyTaskState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail the next `times` runs of batch `index` as a whole
    pub fn fail_batch(&self, index: usize, times: usize) {
        self.lock().failing_batches.insert(index, times);
    }

    /// The index of the batch of every run so far, in the order the runs started
    pub fn invocations(&self) -> Vec<usize> {
        self.lock().invocations.clone()
    }

    fn copy_one(&self, source: &str, destination: &ObjectLocation) -> TransferRecord {
        let failed = |message: &str| TransferRecord {
            source: source.to_string(),
            errors: 1,
            elapsed_time: self.elapsed_time,
            last_error: Some(message.to_string()),
            ..Default::default()
        };

        let location = match ObjectLocation::from_copy_tool_path(source) {
            Some(location) => location,
            None => return failed("not an s3: path"),
        };
        let object = match self.storage.object(&location) {
            Some(object) => object,
            None => return failed("object not found"),
        };
        if object.tier.requires_restore() && object.restore != RestoreStatus::Restored {
            return failed("Object is of storage class GLACIER. Unable to perform download operations on GLACIER objects.");
        }

        let bytes = object.data.len() as u64;
        self.storage
            .put(destination.join(location.file_name()), object.data);

        TransferRecord {
            source: source.to_string(),
            transfers: 1,
            server_side_copies: 1,
            server_side_copy_bytes: bytes,
            elapsed_time: self.elapsed_time,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl CopyTask for FakeCopyTask {
    async fn run(&self, batch: &CopyBatch) -> copyout::Result<Vec<TransferRecord>> {
        let inject_failure = {
            let mut state = self.lock();
            state.invocations.push(batch.index);

            match state.failing_batches.get_mut(&batch.index) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if inject_failure {
            debug!(batch = batch.index, "Injecting copy task failure");

            return Err(CopyOutError::TaskFailed {
                batch: batch.index,
                message: "injected failure".to_string(),
            });
        }

        let destination = ObjectLocation::from_copy_tool_path(&batch.destination).ok_or_else(
            || CopyOutError::TaskFailed {
                batch: batch.index,
                message: format!("unrecognized destination '{}'", batch.destination),
            },
        )?;

        Ok(batch
            .sources
            .iter()
            .map(|source| self.copy_one(source, &destination))
            .collect())
    }
}
