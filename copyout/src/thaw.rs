//! Restoring ("thawing") archived source objects so that they can be read by the copy.
//!
//! Objects in the Glacier storage classes, or in the archive tiers of Intelligent-Tiering, can't
//! be read directly.  They first have to be restored, which can take anywhere from minutes to
//! days.  [`ThawCoordinator::thaw_row`] performs a single check of one manifest row: it requests a
//! restore if one is needed and none is under way, and fails with
//! [`crate::CopyOutError::IsThawing`] while the restore is in progress.  Polling is the job of the
//! caller, using the retry policy attached to the thaw stage of the workflow.
use crate::manifest::ManifestRow;
use crate::objstore::{ObjectLocation, ObjectStorage};
use crate::Result;
use tracing::{debug, instrument};

/// The storage tier an object is held in, as far as thawing is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum StorageTier {
    /// Any directly readable storage class
    Standard,
    GlacierFlexibleRetrieval,
    GlacierDeepArchive,
    IntelligentTieringArchive,
    IntelligentTieringDeepArchive,
}

impl StorageTier {
    /// Classify an object given the S3 storage class and Intelligent-Tiering archive status
    /// reported for it.
    pub fn from_s3(storage_class: Option<&str>, archive_status: Option<&str>) -> Self {
        match (storage_class, archive_status) {
            (Some("GLACIER"), _) => Self::GlacierFlexibleRetrieval,
            (Some("DEEP_ARCHIVE"), _) => Self::GlacierDeepArchive,
            (Some("INTELLIGENT_TIERING"), Some("ARCHIVE_ACCESS")) => {
                Self::IntelligentTieringArchive
            }
            (Some("INTELLIGENT_TIERING"), Some("DEEP_ARCHIVE_ACCESS")) => {
                Self::IntelligentTieringDeepArchive
            }
            // STANDARD, STANDARD_IA, ONEZONE_IA, GLACIER_IR, REDUCED_REDUNDANCY, and
            // Intelligent-Tiering objects in the frequent and infrequent access tiers.  S3 omits
            // the storage class header entirely for STANDARD.
            _ => Self::Standard,
        }
    }

    pub fn requires_restore(&self) -> bool {
        !matches!(self, Self::Standard)
    }
}

/// Where an archived object is in the restore process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum RestoreStatus {
    NotRequested,
    InProgress,
    /// A temporary copy has been restored and can be read
    Restored,
}

impl RestoreStatus {
    /// Interpret the value of the S3 `x-amz-restore` header.
    ///
    /// The header is absent if no restore was ever requested, and otherwise looks like
    /// `ongoing-request="true"` or `ongoing-request="false", expiry-date="..."`.
    pub fn from_restore_header(header: Option<&str>) -> Self {
        match header {
            None => Self::NotRequested,
            Some(header) if header.contains("ongoing-request=\"true\"") => Self::InProgress,
            Some(header) if header.contains("ongoing-request=\"false\"") => Self::Restored,
            Some(_) => Self::NotRequested,
        }
    }
}

/// The tier and restore status of one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStatus {
    pub tier: StorageTier,
    pub restore: RestoreStatus,
}

/// The speed (and cost) of retrieval from an archive tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
pub enum RetrievalSpeed {
    Expedited,
    Standard,
    Bulk,
}

/// The parameters of a restore request for one archive tier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreRequest {
    /// How many days the restored copy is kept.  Intelligent-Tiering restores move the object
    /// back to an access tier instead, and must not specify this.
    pub days: Option<u32>,
    pub speed: RetrievalSpeed,
}

/// How objects in each archive tier are restored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThawSettings {
    pub glacier_flexible_retrieval: RestoreRequest,
    pub glacier_deep_archive: RestoreRequest,
    pub intelligent_tiering_archive: RestoreRequest,
    pub intelligent_tiering_deep_archive: RestoreRequest,
}

impl Default for ThawSettings {
    fn default() -> Self {
        Self {
            glacier_flexible_retrieval: RestoreRequest {
                days: Some(1),
                speed: RetrievalSpeed::Expedited,
            },
            // Expedited retrieval isn't offered for deep archive
            glacier_deep_archive: RestoreRequest {
                days: Some(1),
                speed: RetrievalSpeed::Standard,
            },
            intelligent_tiering_archive: RestoreRequest {
                days: None,
                speed: RetrievalSpeed::Standard,
            },
            intelligent_tiering_deep_archive: RestoreRequest {
                days: None,
                speed: RetrievalSpeed::Standard,
            },
        }
    }
}

impl ThawSettings {
    /// The restore request to make for an object in `tier`, or `None` if the tier is directly
    /// readable
    pub fn request_for(&self, tier: StorageTier) -> Option<RestoreRequest> {
        match tier {
            StorageTier::Standard => None,
            StorageTier::GlacierFlexibleRetrieval => Some(self.glacier_flexible_retrieval),
            StorageTier::GlacierDeepArchive => Some(self.glacier_deep_archive),
            StorageTier::IntelligentTieringArchive => Some(self.intelligent_tiering_archive),
            StorageTier::IntelligentTieringDeepArchive => {
                Some(self.intelligent_tiering_deep_archive)
            }
        }
    }
}

/// The per-row record of an object that needed restoring.
///
/// Only lives as long as the thaw stage of a single job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThawState {
    pub row: ManifestRow,
    pub tier: StorageTier,
    pub restore_in_progress: bool,
}

/// Checks manifest rows against object storage and requests restores for archived objects
#[derive(Clone, Debug)]
pub struct ThawCoordinator {
    storage: Box<dyn ObjectStorage>,
    settings: ThawSettings,
}

impl ThawCoordinator {
    pub fn new(storage: Box<dyn ObjectStorage>, settings: ThawSettings) -> Self {
        Self { storage, settings }
    }

    /// Check one row, requesting a restore if the object needs one.
    ///
    /// Returns `None` if the object is in a directly readable tier, or the [`ThawState`] of an
    /// archived object whose restored copy is now readable.  Fails with
    /// [`crate::CopyOutError::IsThawing`] if the restore is still in progress.
    #[instrument(skip(self), fields(bucket = %row.bucket, key = %row.key))]
    pub async fn thaw_row(&self, row: &ManifestRow) -> Result<Option<ThawState>> {
        let location = ObjectLocation::new(&row.bucket, &row.key);
        let status = self.storage.object_status(&location).await?;

        let request = match self.settings.request_for(status.tier) {
            None => {
                debug!(tier = %status.tier, "Object is directly readable");
                return Ok(None);
            }
            Some(request) => request,
        };

        let restore = match status.restore {
            RestoreStatus::NotRequested => {
                debug!(tier = %status.tier, speed = %request.speed, days = ?request.days,
                    "Requesting restore of archived object");
                self.storage.request_restore(&location, &request).await?
            }
            other => other,
        };

        let state = ThawState {
            row: row.clone(),
            tier: status.tier,
            restore_in_progress: restore != RestoreStatus::Restored,
        };

        if state.restore_in_progress {
            debug!(tier = %state.tier, "Restore still in progress");

            crate::error::IsThawingSnafu {
                bucket: row.bucket.clone(),
                key: row.key.clone(),
                tier: state.tier,
            }
            .fail()
        } else {
            debug!(tier = %state.tier, "Restored copy is readable");

            Ok(Some(state))
        }
    }
}
