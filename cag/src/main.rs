use std::path::PathBuf;

use clap::Parser;
use gateway::config::MetricsSettings;
use gateway::{Config, Gateway, StartupError};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::MetricType;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Credential-authority gateway.
#[derive(Parser)]
#[command(name = "cag")]
struct Cli {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] gateway::config::ConfigError),
    #[error("Failed to start gateway: {0}")]
    StartupError(#[from] StartupError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let args = Cli::parse();
    let config = Config::from_file(&args.config_file_path)?;
    init_statsd_recorder("cag", config.metrics.clone());

    // requests are handled in parallel across cores
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(config))?;
    Ok(())
}

async fn run(config: Config) -> Result<(), CliError> {
    let gateway = Gateway::build(config, None, None).await?;

    let (stop, stop_signal) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        tracing::info!("stop signal received");
        let _ = stop.send(true);
    });

    gateway.run(stop_signal).await?;
    Ok(())
}

async fn wait_for_stop_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "could not install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsSettings>) {
    if let Some(MetricsSettings {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder");
        describe_metrics();
    }
}

/// Registers every defined metric with the recorder.
fn describe_metrics() {
    for metric in gateway::metrics_defs::ALL_METRICS {
        match metric.metric_type {
            MetricType::Counter => metrics::describe_counter!(metric.name, metric.description),
            MetricType::Gauge => metrics::describe_gauge!(metric.name, metric.description),
            MetricType::Histogram => metrics::describe_histogram!(metric.name, metric.description),
        }
        tracing::debug!(
            name = metric.name,
            metric_type = metric.metric_type.as_str(),
            "described metric"
        );
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
