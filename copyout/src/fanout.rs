//! Bounded parallel processing of a list of items with a failure tolerance.
//!
//! A feeder pushes the items into a bounded queue; the queue is drained by at most `concurrency`
//! in-flight operations.  As soon as the number of failed items exceeds the tolerated percentage
//! of the total, the fan-out stops: no more items are dispatched and in-flight operations are
//! dropped.  Every item not completed by then is reported as pending.
use crate::CopyOutError;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The outcome of processing every item of a fan-out
#[derive(Debug)]
pub struct FanOutReport<T> {
    /// Index of each successfully processed item, with its result
    pub succeeded: Vec<(usize, T)>,

    /// Index of each failed item, with the error of its final attempt
    pub failed: Vec<(usize, CopyOutError)>,

    /// Indices of items that never completed because the fan-out stopped early.  Sorted.
    pub pending: Vec<usize>,

    pub total: usize,
    pub tolerated_failure_percentage: u8,
}

impl<T> FanOutReport<T> {
    /// Whether failures exceeded the tolerated percentage of all items
    pub fn tolerance_exceeded(&self) -> bool {
        exceeds_tolerance(
            self.failed.len(),
            self.total,
            self.tolerated_failure_percentage,
        )
    }

    /// Convert a report whose failures exceeded the tolerance into the corresponding error.
    pub fn check_tolerance(&self, stage: &'static str) -> crate::Result<()> {
        if self.tolerance_exceeded() {
            crate::error::ToleranceExceededSnafu {
                stage,
                failed: self.failed.len(),
                total: self.total,
                tolerated_percentage: self.tolerated_failure_percentage,
            }
            .fail()
        } else {
            Ok(())
        }
    }
}

fn exceeds_tolerance(failed: usize, total: usize, tolerated_failure_percentage: u8) -> bool {
    failed * 100 > usize::from(tolerated_failure_percentage) * total
}

/// Run `operation` on each of `items`, with at most `concurrency` running at once.
///
/// `operation` receives each item's index along with the item.  Failures are counted against
/// `tolerated_failure_percentage` of the total number of items; 100 means the fan-out never
/// stops early.
pub async fn fan_out<I, T, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    tolerated_failure_percentage: u8,
    mut operation: F,
) -> FanOutReport<T>
where
    F: FnMut(usize, I) -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let total = items.len();
    let concurrency = concurrency.max(1);
    let (sender, receiver) = mpsc::channel(concurrency);

    let feeder = async move {
        for (index, item) in items.into_iter().enumerate() {
            if sender.send((index, item)).await.is_err() {
                debug!(index, "Fan-out stopped; not dispatching remaining items");
                break;
            }
        }
    };

    let mut completed = vec![false; total];
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    let consumer = async {
        let mut results = tokio_stream::wrappers::ReceiverStream::new(receiver)
            .map(|(index, item)| operation(index, item).map(move |result| (index, result)))
            .buffer_unordered(concurrency);

        while let Some((index, result)) = results.next().await {
            completed[index] = true;

            match result {
                Ok(value) => succeeded.push((index, value)),
                Err(e) => {
                    debug!(index, err = %e, "Item failed");
                    failed.push((index, e));

                    if exceeds_tolerance(failed.len(), total, tolerated_failure_percentage) {
                        warn!(
                            failed = failed.len(),
                            total,
                            tolerated_failure_percentage,
                            "Failure tolerance exceeded; abandoning remaining items"
                        );
                        break;
                    }
                }
            }
        }
    };

    futures::join!(feeder, consumer);

    let pending = completed
        .iter()
        .enumerate()
        .filter(|(_, completed)| !**completed)
        .map(|(index, _)| index)
        .collect();

    FanOutReport {
        succeeded,
        failed,
        pending,
        total,
        tolerated_failure_percentage,
    }
}
