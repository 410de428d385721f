//! Test helper that implements [`copyout::JobProgressCallback`] and keeps a record of every
//! progress update in order, so tests can verify what a job reported as it ran.
use copyout::{
    CopyOutError, CopySummary, ErrorKind, JobProgressCallback, ManifestRow, State, StorageTier,
    TransferRecord,
};
use more_asserts::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not every field is inspected, but every event is captured in full
pub(crate) enum JobProgressEvent {
    StateEntered {
        state: State,
    },
    StateFailed {
        state: State,
        kind: ErrorKind,
    },
    WaitingForWritable {
        bucket: String,
        wait: Duration,
    },
    ThawStarting {
        rows: usize,
    },
    RowThawed {
        row: ManifestRow,
        tier: Option<StorageTier>,
    },
    RowThawFailed {
        row: ManifestRow,
        kind: ErrorKind,
    },
    CopyStarting {
        batches: usize,
        rows: usize,
    },
    BatchCopied {
        batch: usize,
        transfers: usize,
        failed_transfers: usize,
    },
    BatchFailed {
        batch: usize,
        kind: ErrorKind,
    },
    SummaryReady {
        objects: usize,
        total_bytes: u64,
    },
}

pub(crate) type EventKind = JobProgressEventDiscriminants;

#[derive(Clone, Default)]
pub(crate) struct TestJobProgressCallback {
    events: Arc<Mutex<Vec<JobProgressEvent>>>,
}

impl TestJobProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events()
            .iter()
            .filter(|event| EventKind::from(*event) == kind)
            .count()
    }

    /// Every state entered, in order
    pub fn states(&self) -> Vec<State> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                JobProgressEvent::StateEntered { state } => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Review the updates of a job that ran to successful completion, copying `rows` rows in
    /// `batches` batches.
    pub fn sanity_check_success(&self, rows: usize, batches: usize) {
        let events = self.events();

        assert_eq!(Some(State::Succeed), self.states().last().copied());

        assert_eq!(1, self.count(EventKind::ThawStarting));
        assert_eq!(rows, self.count(EventKind::RowThawed));
        assert_eq!(0, self.count(EventKind::RowThawFailed));

        let (copy_batches, copy_rows) = events
            .iter()
            .find_map(|event| match event {
                JobProgressEvent::CopyStarting { batches, rows } => Some((*batches, *rows)),
                _ => None,
            })
            .expect("no CopyStarting event");
        assert_eq!((batches, rows), (copy_batches, copy_rows));

        assert_eq!(batches, self.count(EventKind::BatchCopied));
        assert_eq!(0, self.count(EventKind::BatchFailed));

        let transfers: usize = events
            .iter()
            .map(|event| match event {
                JobProgressEvent::BatchCopied { transfers, .. } => *transfers,
                _ => 0,
            })
            .sum();
        assert_eq!(rows, transfers);

        // Thawing finishes before copying starts, and the summary comes last of all
        let last_thawed = events
            .iter()
            .rposition(|event| matches!(event, JobProgressEvent::RowThawed { .. }));
        let copy_starting = events
            .iter()
            .position(|event| matches!(event, JobProgressEvent::CopyStarting { .. }));
        if let (Some(last_thawed), Some(copy_starting)) = (last_thawed, copy_starting) {
            assert_lt!(last_thawed, copy_starting);
        }

        assert_eq!(1, self.count(EventKind::SummaryReady));
    }
}

impl JobProgressCallback for TestJobProgressCallback {
    fn state_entered(&self, state: State) {
        self.record(JobProgressEvent::StateEntered { state });
    }

    fn state_failed(&self, state: State, error: &CopyOutError) {
        self.record(JobProgressEvent::StateFailed {
            state,
            kind: error.kind(),
        });
    }

    fn waiting_for_writable(&self, bucket: &str, wait: Duration) {
        self.record(JobProgressEvent::WaitingForWritable {
            bucket: bucket.to_string(),
            wait,
        });
    }

    fn thaw_starting(&self, rows: usize) {
        self.record(JobProgressEvent::ThawStarting { rows });
    }

    fn row_thawed(&self, row: &ManifestRow, tier: Option<StorageTier>) {
        self.record(JobProgressEvent::RowThawed {
            row: row.clone(),
            tier,
        });
    }

    fn row_thaw_failed(&self, row: &ManifestRow, error: &CopyOutError) {
        self.record(JobProgressEvent::RowThawFailed {
            row: row.clone(),
            kind: error.kind(),
        });
    }

    fn copy_starting(&self, batches: usize, rows: usize) {
        self.record(JobProgressEvent::CopyStarting { batches, rows });
    }

    fn batch_copied(&self, batch: usize, transfers: &[TransferRecord]) {
        self.record(JobProgressEvent::BatchCopied {
            batch,
            transfers: transfers.len(),
            failed_transfers: transfers.iter().filter(|t| !t.succeeded()).count(),
        });
    }

    fn batch_failed(&self, batch: usize, error: &CopyOutError) {
        self.record(JobProgressEvent::BatchFailed {
            batch,
            kind: error.kind(),
        });
    }

    fn summary_ready(&self, summary: &CopySummary) {
        self.record(JobProgressEvent::SummaryReady {
            objects: summary.len(),
            total_bytes: summary.total_bytes(),
        });
    }
}

impl TestJobProgressCallback {
    fn record(&self, event: JobProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
