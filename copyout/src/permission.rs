use crate::objstore::{ObjectLocation, ObjectStorage};
use crate::Result;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// Contents of the marker object written to the destination when the copy starts
const START_MARKER_BODY: &[u8] = b"A process for copying objects to this location has started\n";

/// Confirms that a copy destination accepts writes from this orchestrator, in the right region.
///
/// The check is a real write of the start-of-copy marker, so a successful check also records
/// that the copy has started.
#[derive(Clone, Debug)]
pub struct PermissionValidator {
    storage: Box<dyn ObjectStorage>,
    allow_write_to_installed_account: bool,
}

impl PermissionValidator {
    pub fn new(storage: Box<dyn ObjectStorage>, allow_write_to_installed_account: bool) -> Self {
        Self {
            storage,
            allow_write_to_installed_account,
        }
    }

    /// Check that `marker` can be written with a client pinned to `required_region`.
    ///
    /// Fails with [`crate::CopyOutError::WrongRegion`] if the destination bucket is elsewhere, and
    /// with [`crate::CopyOutError::AccessDenied`] if the write is refused or the bucket belongs to
    /// the orchestrator's own account (unless that's explicitly allowed).  Access denied is
    /// usually temporary: it persists until the destination's owner grants access.
    #[instrument(skip(self), fields(%marker))]
    pub async fn can_write(&self, required_region: &str, marker: &ObjectLocation) -> Result<()> {
        if !self.allow_write_to_installed_account
            && self.storage.is_owned_by_caller(&marker.bucket).await?
        {
            debug!("Destination bucket belongs to the orchestrator's own account");

            return crate::error::AccessDeniedSnafu {
                bucket: &marker.bucket,
                reason: "the bucket belongs to the account the copy runs in",
            }
            .fail();
        }

        self.storage
            .probe_write(
                required_region,
                marker,
                Bytes::from_static(START_MARKER_BODY),
            )
            .await?;

        info!("Destination is writable");

        Ok(())
    }
}
