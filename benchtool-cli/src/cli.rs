use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use crate::config::Config;
use crate::{observability, runner};

/// Load generator for Prometheus remote-write backends.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// path to the workload file, overrides the configuration
    #[argh(option)]
    pub workload_file: Option<PathBuf>,

    /// identity of the benchmark run, overrides the configuration
    #[argh(option)]
    pub id: Option<String>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Version(VersionCommand),
}

/// run the benchmark until interrupted
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// print the benchtool version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("benchtool {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(workload_file) = args.workload_file {
        config.workload_file = workload_file;
    }
    if let Some(id) = args.id {
        config.id = id;
    }

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand {}) => runner::run(config).await,
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}
