use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use copyout::{
    CopyBatch, CopyOutJobBuilder, CopyTask, JobInput, ObjectLocation, ObjectStorageFactory,
    PermissionValidator, RcloneCopyTask, ResultSummarizer,
};
use std::path::PathBuf;
use tracing::debug;
use url::Url;

mod progress;

/// Copy objects out of S3 to a bucket owned by someone else.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: copyout::Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a whole copy job: check the destination, thaw, copy, and summarise
    Run {
        /// The job input, as a JSON document.  Use `-` to read it from stdin.
        #[clap(short = 'i', long, value_name = "FILE")]
        input: PathBuf,

        /// Identify this run with a specific ID instead of one derived from the current time.
        ///
        /// Results are kept in the working area under the run ID, so re-using an ID overwrites
        /// the results of the earlier run.
        #[clap(long)]
        run_id: Option<String>,
    },

    /// Check that a destination is writable and in the required region, by writing the start
    /// marker to it
    CanWrite {
        /// The destination bucket and prefix, like `s3://bucket/prefix/`
        #[clap(long, value_name = "URL")]
        destination: Url,

        /// The region the destination bucket must be in.  Defaults to the deployment region.
        #[clap(long, value_name = "REGION")]
        region: Option<String>,

        /// The key of the marker, relative to the destination
        #[clap(long, default_value = copyout::DEFAULT_START_COPY_RELATIVE_KEY)]
        marker: String,
    },

    /// Summarise the throughput of a finished copy from its result manifest
    Summarise {
        /// The result manifest, like `s3://working/prefix/manifest.json`
        #[clap(value_name = "URL")]
        manifest: Url,

        /// Print the summary as CSV, as written to the end-of-copy marker
        #[clap(long)]
        csv: bool,
    },

    /// Copy some objects to a destination with the copy tool, as a single batch
    CopyBatch {
        /// The destination bucket and prefix, like `s3://bucket/prefix/`
        #[clap(long, value_name = "URL")]
        destination: Url,

        /// How many objects to copy at the same time
        #[clap(long, default_value_t = copyout::DEFAULT_COPY_CONCURRENCY)]
        concurrency: usize,

        /// The objects to copy, like `s3://bucket/key`
        #[clap(required = true, value_name = "URLS")]
        sources: Vec<Url>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(&args.globals)?;

    debug!(?args, "Parsed command line");

    match args.command {
        Command::Run { input, run_id } => {
            let input = read_job_input(&input)?;

            let mut builder = CopyOutJobBuilder::new(args.config, input);
            if let Some(run_id) = run_id {
                builder = builder.run_id(run_id);
            }
            let job = builder.build().await?;

            let summary = progress::run_job(&args.globals, job).await?;

            if !args.globals.quiet {
                println!("{summary}");
            }
        }
        Command::CanWrite {
            destination,
            region,
            marker,
        } => {
            let destination = ObjectLocation::from_url(&destination)?;
            let storage = ObjectStorageFactory::new(args.config.clone())
                .s3()
                .await;
            let region = region
                .or_else(|| args.config.aws_region.clone())
                .unwrap_or_else(|| storage.region().to_string());
            let marker = destination.join(&marker);

            progress::with_spinner(
                &args.globals,
                format!("Checking {marker} is writable in {region}"),
                PermissionValidator::new(storage, args.config.allow_write_to_installed_account)
                    .can_write(&region, &marker),
            )
            .await?;

            if !args.globals.quiet {
                println!("{marker} is writable");
            }
        }
        Command::Summarise { manifest, csv } => {
            let storage = ObjectStorageFactory::new(args.config)
                .from_url(&manifest)
                .await?;
            let manifest = ObjectLocation::from_url(&manifest)?;

            let summary = progress::with_spinner(
                &args.globals,
                format!("Summarising {manifest}"),
                ResultSummarizer::new(storage).summarise(&manifest),
            )
            .await?;

            if csv {
                print!("{}", summary.to_csv());
            } else {
                println!("{summary}");
            }
        }
        Command::CopyBatch {
            destination,
            concurrency,
            sources,
        } => {
            let batch = CopyBatch {
                index: 0,
                sources: sources
                    .iter()
                    .map(|url| {
                        ObjectLocation::from_url(url).map(|location| location.to_copy_tool_path())
                    })
                    .collect::<copyout::Result<Vec<_>>>()?,
                destination: ObjectLocation::from_url(&destination)?.to_copy_tool_path(),
                copy_concurrency: concurrency,
            };

            let records = progress::with_spinner(
                &args.globals,
                format!("Copying {} object(s) to {destination}", batch.sources.len()),
                RcloneCopyTask::new(args.config.copy_tool.clone()).run(&batch),
            )
            .await?;

            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn read_job_input(path: &PathBuf) -> color_eyre::Result<JobInput> {
    let json = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).wrap_err("Error reading job input from stdin")?
    } else {
        std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Error reading job input from {}", path.display()))?
    };

    Ok(JobInput::from_json(&json)?)
}

fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    // RUST_LOG wins if it's set
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = if globals.verbose {
                "aws=info,hyper=info,copyout=debug,copyout_cli=debug,info"
            } else if globals.quiet {
                "error"
            } else {
                "warn"
            };

            EnvFilter::try_new(directives)?
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(globals.verbose))
        .try_init()?;

    Ok(())
}
