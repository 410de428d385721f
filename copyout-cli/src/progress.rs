//! Implementations of progress callbacks that render progress bars
use copyout::{
    CopyOutError, CopyOutJob, CopySummary, ManifestRow, Result, State, StorageTier,
    TransferRecord,
};
use std::{borrow::Cow, future::Future, time::Duration};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(spinner_style());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the copy job with progress bars, abandoning it if the user presses Ctrl-C
pub(crate) async fn run_job(globals: &super::Globals, job: CopyOutJob) -> Result<CopySummary> {
    let progress = JobProgressReport::new(hide_progress(globals));

    let abort = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // Without a signal handler there's nothing to wait for; never abort
            tracing::warn!(err = %e, "Unable to listen for Ctrl-C");
            futures::future::pending::<()>().await;
        }
    };

    let report = job.run(abort, progress).await;

    tracing::debug!(run_id = %report.run_id, history = ?report.history, "Copy job finished");

    report.into_result()
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

fn spinner_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
        .expect("BUG: invalid spinner template")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
}

fn standard_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{spinner:.green} {prefix}: {msg:<55!} [{bar:20.cyan/blue}] {pos}/{len} ({elapsed})",
    )
    .expect("BUG: invalid progress bar template")
    .progress_chars("#>-")
}

/// The template syntax for right alignment seems not to work as expected, and it does not pad
/// the prefix string to the left with spaces.  So we have to do that ourselves
fn pad_prefix(prefix: &'static str) -> String {
    const PREFIX_MAX_LEN: usize = 16;

    assert!(
        prefix.len() <= PREFIX_MAX_LEN,
        "Prefix '{prefix}' is too long"
    );

    format!("{prefix:>16}")
}

/// Progress reporting for a copy job, which receives progress updates from the lib crate and
/// renders progress bars accordingly
struct JobProgressReport {
    /// Aggregate which groups all of the below progress bars together
    multi: indicatif::MultiProgress,

    /// The workflow state the job is in
    state: indicatif::ProgressBar,

    /// Manifest rows whose restore status has been settled
    thawed_rows: indicatif::ProgressBar,

    /// Batches handed to the copy tool that have finished, successfully or not
    copied_batches: indicatif::ProgressBar,
}

impl JobProgressReport {
    fn new(hide_progress: bool) -> Self {
        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let state = multi.add(indicatif::ProgressBar::new_spinner());
        state.set_style(spinner_style());
        state.enable_steady_tick(Duration::from_millis(120));

        let thawed_rows = multi.add(indicatif::ProgressBar::new(0));
        thawed_rows.set_style(standard_style());
        thawed_rows.set_prefix(pad_prefix("Thaw objects"));

        let copied_batches = multi.add(indicatif::ProgressBar::new(0));
        copied_batches.set_style(standard_style());
        copied_batches.set_prefix(pad_prefix("Copy batches"));

        Self {
            multi,
            state,
            thawed_rows,
            copied_batches,
        }
    }

    /// Print a line above the progress bars.  Failing to draw it is not worth failing the job.
    fn println(&self, message: String) {
        let _ = self.multi.println(message);
    }
}

impl copyout::JobProgressCallback for JobProgressReport {
    fn state_entered(&self, state: State) {
        match state {
            State::Succeed => self.state.finish_with_message("Copy job succeeded"),
            State::Fail => self.state.finish_with_message("Copy job failed"),
            state => self.state.set_message(format!("{state}")),
        }
    }

    fn state_failed(&self, state: State, error: &CopyOutError) {
        self.println(format!("{state} failed: {error}"));
    }

    fn waiting_for_writable(&self, bucket: &str, wait: Duration) {
        self.state.set_message(format!(
            "Waiting {} for '{bucket}' to become writable",
            indicatif::HumanDuration(wait)
        ));
    }

    fn thaw_starting(&self, rows: usize) {
        self.thawed_rows.set_length(rows as u64);
        self.thawed_rows.set_message("Checking storage tiers...");
    }

    fn row_thawed(&self, row: &ManifestRow, tier: Option<StorageTier>) {
        self.thawed_rows.inc(1);

        match tier {
            Some(tier) => self
                .thawed_rows
                .set_message(format!("{} (restored from {tier})", row.key)),
            None => self.thawed_rows.set_message(row.key.clone()),
        }
    }

    fn row_thaw_failed(&self, row: &ManifestRow, error: &CopyOutError) {
        self.thawed_rows.inc(1);
        self.println(format!("Unable to thaw '{}': {error}", row.location()));
    }

    fn copy_starting(&self, batches: usize, rows: usize) {
        self.thawed_rows.finish_with_message("Thaw complete");
        self.copied_batches.set_length(batches as u64);
        self.copied_batches.set_message(format!(
            "Copying {} objects",
            indicatif::HumanCount(rows as u64)
        ));
    }

    fn batch_copied(&self, batch: usize, transfers: &[TransferRecord]) {
        let bytes: u64 = transfers
            .iter()
            .map(|transfer| transfer.server_side_copy_bytes + transfer.bytes)
            .sum();
        let errors = transfers.iter().filter(|transfer| !transfer.succeeded()).count();

        self.copied_batches.inc(1);
        self.copied_batches.set_message(format!(
            "Batch {batch} copied {}",
            indicatif::BinaryBytes(bytes)
        ));

        if errors > 0 {
            self.println(format!("Batch {batch} had {errors} object(s) fail to copy"));
        }
    }

    fn batch_failed(&self, batch: usize, error: &CopyOutError) {
        self.copied_batches.inc(1);
        self.println(format!("Batch {batch} failed: {error}"));
    }

    fn summary_ready(&self, summary: &CopySummary) {
        let total_bytes = indicatif::BinaryBytes(summary.total_bytes());
        let total_objects = indicatif::HumanCount(summary.len() as u64);

        self.copied_batches
            .finish_with_message(format!("Copied {total_objects} objects ({total_bytes})"));
    }
}
