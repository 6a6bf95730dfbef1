use std::{future::Future, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use tally::{
    clock::SystemClock,
    config::{self, Config},
    dumper::{self, PeriodicDumper},
    probe::{self, Context, Probe},
    registry::Registry,
    sink::FileSink,
};
use tokio::{runtime::Builder, signal, task::JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Tally configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Tally probe returned an error: {0}")]
    Probe(#[from] probe::Error),
    #[error("Tally dumper returned an error: {0}")]
    Dumper(#[from] dumper::Error),
    #[error("Failed to open output {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registration(#[from] tally_signal::RegisterError),
    #[error("Probe task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> String {
    "/etc/tally/tally.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured probes and dump their counters until interrupted
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    Config::from_path(config_path).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

async fn inner_main<S>(config: Config, shutdown: S) -> Result<(), Error>
where
    S: Future<Output = ()>,
{
    let registry = Registry::new();
    let mut context = Context::new(config.format, config.tags(), registry.clone());
    if let Some(path) = &config.output {
        let output = FileSink::append(path).map_err(|source| Error::Output {
            path: path.clone(),
            source,
        })?;
        context = context.with_output(output);
    }

    let (probe_watcher, probe_trigger) = tally_signal::stop();
    let mut probes = JoinSet::new();
    for probe_config in &config.probes {
        let probe = Probe::new(probe_config, SystemClock, &context)?;
        probes.spawn(probe.run(probe_watcher.register()?));
    }
    drop(probe_watcher);

    let dumper = PeriodicDumper::from_registry(SystemClock, context.registry())?.start();
    info!(probes = config.probes.len(), "tally running");

    let mut res = Ok(());
    tokio::select! {
        () = shutdown => {}
        Some(early) = probes.join_next() => {
            // Probes run until stopped, any exit is a failure.
            match early {
                Ok(Ok(())) => warn!("probe exited before shutdown"),
                Ok(Err(err)) => {
                    error!("probe failed: {err}");
                    res = Err(Error::Probe(err));
                }
                Err(err) => res = Err(Error::Join(err)),
            }
        }
    }

    info!("stopping probes");
    probe_trigger.fire_and_wait().await;
    while let Some(finished) = probes.join_next().await {
        if let Err(err) = finished? {
            warn!("probe failed during shutdown: {err}");
        }
    }

    info!("waiting for the final dump");
    dumper.stop().await?;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tally {version}.");

    let cli = Cli::parse();
    let run = match cli.command {
        Commands::Run(run) => run,
        Commands::ConfigCheck(check) => match load_config(&check.config_path) {
            Ok(_) => {
                info!("Configuration file is valid");
                std::process::exit(0)
            }
            Err(_) => std::process::exit(1),
        },
    };

    let config = load_config(&run.config_path)?;
    let max_shutdown_delay = Duration::from_secs(run.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, async {
        if let Err(err) = signal::ctrl_c().await {
            error!("unable to listen for ctrl-c: {err}");
            return;
        }
        info!("received ctrl-c");
    }));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
