//! System Report - an adaptive host metrics sampler.
//!
//! Collects CPU, memory, disk and top-process metrics on a fixed round interval,
//! polls CPU and memory faster while they breach their thresholds, and reports
//! each round to the console or a Prometheus endpoint.

mod config;
mod error;
mod metrics;
mod report;
mod round;
mod sampler;
mod server;
mod snapshot;
mod source;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, ReportMode};
use metrics::MetricFamily;
use report::{ConsoleReporter, Exposition, ExpositionReporter, Reporter, SnapshotLogger};
use round::{CollectionRound, RoundScheduler};
use sampler::ThresholdSampler;
use source::{MetricSource, ProcfsSource};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Adaptive host metrics sampler with console and Prometheus reporting
#[derive(Parser, Debug)]
#[command(name = "sysreport")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Where to report snapshots (overrides report.mode)
    #[arg(short, long, value_enum)]
    mode: Option<ReportMode>,

    /// Address for the /metrics endpoint (overrides report.listen)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Also append every snapshot to this JSON Lines file
    #[arg(long)]
    json_log: Option<PathBuf>,

    /// Run a single collection round, report it, and exit
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.report.mode = mode;
        }
        if let Some(listen) = self.listen {
            config.report.listen = listen;
        }
        if let Some(path) = &self.json_log {
            config.report.json_log = Some(path.clone());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sysreport=debug" } else { "sysreport=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_reporters(
    config: &Config,
    exposition: Option<&Arc<Exposition>>,
) -> Result<Vec<Box<dyn Reporter>>> {
    let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();

    match exposition {
        Some(exposition) => {
            reporters.push(Box::new(ExpositionReporter::new(exposition.clone())))
        }
        None => reporters.push(Box::new(ConsoleReporter::stdout())),
    }

    if let Some(path) = &config.report.json_log {
        reporters.push(Box::new(SnapshotLogger::new(path)?));
        info!(path = %path.display(), "Appending snapshots to JSON log");
    }

    Ok(reporters)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(&args.config)?;
    args.apply(&mut config);
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", args.config.display()))?;

    info!(
        config = %args.config.display(),
        interval_secs = config.log_interval,
        mode = ?config.report.mode,
        "Starting system monitor"
    );

    let source: Arc<dyn MetricSource> = Arc::new(ProcfsSource::new(config.cpu_sample_window()));
    let exposition = match config.report.mode {
        ReportMode::Exposition => Some(Arc::new(
            Exposition::new().context("Failed to register metrics")?,
        )),
        ReportMode::Console => None,
    };

    let reporters = build_reporters(&config, exposition.as_ref())?;
    let round = CollectionRound::new(source.clone(), config.round_settings());
    let mut scheduler = RoundScheduler::new(round, config.round_interval(), reporters);
    let token = CancellationToken::new();

    if args.once {
        let outcome = scheduler.run_once(&token).await?;
        if let Some(failure) = outcome.failure() {
            error!(error = %failure, "Round finished with failures");
        }
        return Ok(());
    }

    let mut tasks: Vec<(&str, JoinHandle<()>)> = Vec::new();

    // Bind before spawning anything so a busy port aborts startup
    if let Some(exposition) = &exposition {
        let listener = tokio::net::TcpListener::bind(config.report.listen)
            .await
            .with_context(|| {
                format!("Failed to bind metrics listener on {}", config.report.listen)
            })?;
        let exposition = exposition.clone();
        let token = token.clone();
        tasks.push((
            "server",
            tokio::spawn(async move {
                if let Err(e) = server::serve(listener, exposition, token).await {
                    error!(error = %format!("{:#}", e), "HTTP server error");
                }
            }),
        ));
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    for family in [MetricFamily::Cpu, MetricFamily::Memory] {
        let settings = config.sampler_settings(family)?;
        if let Some(exposition) = &exposition {
            exposition.set_sampler_interval(family.as_str(), settings.normal_interval);
        }

        let mut sampler = ThresholdSampler::new(family, settings, source.clone())?;
        if exposition.is_some() {
            sampler = sampler.with_events(events_tx.clone());
        }
        tasks.push(("sampler", tokio::spawn(sampler.run(token.clone()))));
    }
    drop(events_tx);

    if let Some(exposition) = &exposition {
        tasks.push((
            "sampler events",
            tokio::spawn(report::exposition::forward_sampler_events(
                events_rx,
                exposition.clone(),
            )),
        ));
    }

    tasks.push(("rounds", tokio::spawn(scheduler.run(token.clone()))));

    shutdown_signal().await;
    info!("Shutting down system monitor...");
    token.cancel();

    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    if let Some(exposition) = exposition {
        exposition.shutdown();
    }

    info!("System monitor terminated.");
    Ok(())
}
