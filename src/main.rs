//! Pub/Sub to Log Analytics forwarder
//!
//! Loads the YAML configuration, builds the upstream client and the sink,
//! and runs the pipeline until SIGINT/SIGTERM or until the subscription ends.

use anyhow::Result;
use clap::{CommandFactory, FromArgMatches, Parser, ValueEnum};
use pubsub2loganalytics::core::{ForwarderConfig, PipelineSettings, UpstreamEnvironment};
use pubsub2loganalytics::pipeline::Orchestrator;
use pubsub2loganalytics::pubsub::RestSubscription;
use pubsub2loganalytics::sink::{LogAnalyticsSink, LogAnalyticsSinkConfig, LogSink, StdoutSink};
use pubsub2loganalytics::tracing_context::LogContext;
use pubsub2loganalytics::transform::Transformer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

const COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "pubsub2loganalytics",
    about = "Forward Pub/Sub events to Azure Log Analytics"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Number of delivery workers
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Seconds between queue size reports, 0 disables them
    #[arg(long, default_value_t = 30)]
    show_queue: u64,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print transformed events to stdout instead of sending them
    #[arg(short, long)]
    test: bool,

    /// Capacity of the queue between subscriber and workers
    #[arg(long, default_value_t = 1000)]
    queue_capacity: usize,

    /// Seconds a message may wait for a queue slot before it is nacked
    #[arg(long, default_value_t = 30)]
    enqueue_timeout_secs: u64,
}

impl Args {
    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers: self.threads,
            queue_capacity: self.queue_capacity,
            enqueue_timeout: Duration::from_secs(self.enqueue_timeout_secs),
            report_interval: (self.show_queue > 0).then(|| Duration::from_secs(self.show_queue)),
            dry_run: self.test,
        }
    }
}

fn parse_args() -> Result<Args> {
    let version: &'static str = Box::leak(
        format!("{} (commit {})", env!("CARGO_PKG_VERSION"), COMMIT).into_boxed_str(),
    );
    let matches = Args::command().version(version).get_matches();
    Ok(Args::from_arg_matches(&matches)?)
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    init_tracing(&args);

    info!(version = env!("CARGO_PKG_VERSION"), commit = COMMIT, "starting forwarder");

    match run(args).await {
        Ok(()) => {
            info!("Forwarder completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Forwarder failed: {}", e);
            Err(e)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let environment = UpstreamEnvironment::from_env()?;
    let config = Arc::new(ForwarderConfig::from_file(&args.config)?);
    let settings = args.pipeline_settings();
    settings.validate()?;

    let log = LogContext::root("forwarder");
    let subscription = Arc::new(RestSubscription::new(&config.gcp, &environment)?);
    let transformer = Arc::new(Transformer::from_config(&config));
    let sink: Arc<dyn LogSink> = if settings.dry_run {
        info!("test mode, events are written to stdout");
        Arc::new(StdoutSink::new())
    } else {
        Arc::new(LogAnalyticsSink::new(LogAnalyticsSinkConfig::from(
            &config.azure,
        )))
    };
    info!(
        run_id = %log.run_id(),
        workers = settings.workers,
        queue_capacity = settings.queue_capacity,
        sink = sink.sink_type(),
        "pipeline configured"
    );

    Orchestrator::new(settings, subscription, transformer, sink, log)
        .run(wait_for_shutdown())
        .await?;
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
