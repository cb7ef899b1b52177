use std::{env, io::Read, net::SocketAddr, num::NonZeroU32};

use clap::{Args, Parser, Subcommand};
use hyper::Uri;
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use writeload::{
    config::{Config, Telemetry},
    driver::{Driver, Report},
    sink::{self, Sink},
};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load writeload config: {0}")]
    Config(#[from] writeload::config::Error),
    #[error("Load driver returned an error: {0}")]
    Driver(#[from] writeload::driver::Error),
    #[error("Sink returned an error: {0}")]
    Sink(#[from] writeload::sink::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Run failed: {failed} of {workers} workers reported failure")]
    RunFailed { failed: usize, workers: usize },
    #[error("Run interrupted before all workers terminated")]
    Interrupted,
}

fn default_config_path() -> String {
    "/etc/writeload/writeload.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load driver with specified configuration
    Run(RunCommand),
    /// Run a local write endpoint sink until ctrl-c
    Sink(SinkCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// override the write endpoint URI, e.g. http://localhost:6086/write?db=test
    #[clap(long)]
    target_uri: Option<Uri>,
    /// override the total number of workers
    #[clap(long)]
    worker_count: Option<NonZeroU32>,
    /// override the number of requests each worker issues
    #[clap(long)]
    iterations_per_worker: Option<u64>,
    /// address to bind prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct SinkCommand {
    /// address -- IP plus port -- to bind to
    #[clap(long, default_value = "127.0.0.1:6086")]
    binding_addr: SocketAddr,
    /// the status code to answer write requests with
    #[clap(long, default_value_t = 204)]
    status: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("WRITELOAD_CONFIG") {
        debug!("Using config from env var 'WRITELOAD_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{config_path}': {err}");
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn get_config(args: &RunCommand, contents: &str) -> Result<Config, Error> {
    let mut config: Config = serde_yaml::from_str(contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        writeload::config::Error::SerdeYaml(err)
    })?;

    if let Some(target_uri) = &args.target_uri {
        config.driver.target_uri = target_uri.clone();
    }
    if let Some(worker_count) = args.worker_count {
        config.driver.worker_count = worker_count;
    }
    if let Some(iterations) = args.iterations_per_worker {
        config.driver.iterations_per_worker = iterations;
    }
    if let Some(addr) = args.prometheus_addr {
        let global_labels = match config.telemetry {
            Some(Telemetry::Prometheus { global_labels, .. }) => global_labels,
            None => Default::default(),
        };
        config.telemetry = Some(Telemetry::Prometheus {
            addr,
            global_labels,
        });
    }

    config.validate()?;
    Ok(config)
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    let config = Config::from_yaml(&contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        err
    })?;
    info!("Configuration file is valid");
    Ok(config)
}

async fn inner_main(config: Config) -> Result<Report, Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = config.telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("prometheus exporter listening on {addr}");
    }

    let driver = Driver::new(config.driver)?;
    let run = driver.run();
    tokio::pin!(run);

    let mut interval = time::interval(Duration::from_millis(400));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                metrics::gauge!("writeload.running").set(1.0);
            },
            _ = signal::ctrl_c() => {
                warn!("received ctrl-c, abandoning in-flight workers");
                break Err(Error::Interrupted);
            },
            res = &mut run => {
                break Ok(res?);
            },
        }
    }
}

async fn run_sink(command: &SinkCommand) -> Result<(), Error> {
    let mut config = sink::Config::new(command.binding_addr);
    config.status = command.status;
    let sink = Sink::bind(&config).await?;
    info!(
        "sink listening on {addr}, answering writes with {status}",
        addr = sink.local_addr()?,
        status = command.status
    );
    let stats = sink.stats();
    sink.run(async {
        let _ = signal::ctrl_c().await;
    })
    .await?;
    info!(
        requests = stats.requests(),
        lines = stats.lines(),
        bytes = stats.bytes(),
        "sink shut down"
    );
    Ok(())
}

fn judge(report: &Report) -> Result<(), Error> {
    if report.passed() {
        info!(
            workers = report.outcomes().len(),
            total_requests = report.total_requests(),
            "run passed"
        );
        Ok(())
    } else {
        let failed = report.failed_workers().count();
        error!(
            failed,
            workers = report.outcomes().len(),
            total_requests = report.total_requests(),
            "run failed"
        );
        Err(Error::RunFailed {
            failed,
            workers: report.outcomes().len(),
        })
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting writeload {version}.");

    let cli = Cli::parse();
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;

    let res = match cli.command {
        Commands::ConfigCheck(command) => match validate_config(&command.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        },
        Commands::Sink(command) => runtime.block_on(run_sink(&command)),
        Commands::Run(command) => {
            let contents = load_config_contents(&command.config_path)?;
            let config = get_config(&command, &contents)?;
            let res = runtime
                .block_on(inner_main(config))
                .and_then(|report| judge(&report));
            let max_shutdown_delay = Duration::from_secs(command.max_shutdown_delay.into());
            info!(
                "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
                max_shutdown_delay.as_secs(),
            );
            runtime.shutdown_timeout(max_shutdown_delay);
            res
        }
    };
    info!("Bye. :)");
    res
}
