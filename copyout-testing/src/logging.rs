//! Per-test log capture.
//!
//! Tests run in parallel, so log events written straight to the console interleave and are
//! useless.  Each test wrapped in [`test_with_logging`] gets its own subscriber and its own
//! runtime, and its log is printed in one piece when it finishes.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Used when `RUST_LOG` isn't set.  The AWS SDK and its HTTP stack are very chatty at `debug`.
const DEFAULT_FILTER: &str = "aws=info,aws_smithy_runtime=info,hyper=info,h2=warn,rustls=info,copyout=trace,debug";

/// Buffer that collects every log line a single test writes
#[derive(Clone, Default)]
struct CapturedLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLog {
    /// Everything logged so far.  Invalid UTF-8 is replaced rather than panicking, since this runs
    /// while a test might already be unwinding.
    fn contents(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for &CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;

        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn capture_dispatch(log: &CapturedLog) -> Result<tracing::Dispatch> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        // Copy jobs fan out across the runtime's worker threads
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(log.clone());

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    Ok(tracing::Dispatch::new(
        tracing_subscriber::registry().with(filter).with(format),
    ))
}

/// Build a multi-threaded runtime whose worker threads all log to `dispatch`
fn runtime_logging_to(dispatch: Arc<tracing::Dispatch>) -> Result<tokio::runtime::Runtime> {
    std::thread_local! {
        static WORKER_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&dispatch);
            WORKER_DISPATCH.with(|cell| cell.replace(Some(guard)));
        })
        .on_thread_stop(|| {
            WORKER_DISPATCH.with(|cell| cell.replace(None));
        })
        .build()?;

    Ok(runtime)
}

/// Run an async test with its log events captured, printing them when the test completes.
///
/// Use this in place of `#[tokio::test]`.  Events from every task the test spawns are captured,
/// but only events from this test.  The log is printed even if the test panics.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let log = CapturedLog::default();
    let dispatch = Arc::new(capture_dispatch(&log)?);

    tracing::dispatcher::with_default(&dispatch, || {
        let runtime = runtime_logging_to(dispatch.clone())?;

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", log.contents());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
