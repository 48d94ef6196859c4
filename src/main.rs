//! dnstap telemetry relay: ingests dnstap FrameStream traffic from files,
//! Unix/TCP listeners, and tailed logs, fans it out to a bounded buffer
//! per configured sink, and relays/flattens it onward.

mod buffer;
mod config;
mod dns_message;
mod flatten;
mod frame_stream;
mod input;
mod metrics;
mod output;
mod pipeline;
mod privacy;
mod proto;
mod types;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "dnstap-relay")]
#[command(about = "A dnstap telemetry relay", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "dnstap-relay.toml")]
    config: String,

    /// debug | info | warn | error | fatal
    #[arg(short = 'd', long = "log-level", default_value = "info")]
    log_level: String,

    /// Address the Prometheus exporter listens on, overriding `metrics_addr` in config.
    #[arg(short = 'e', long = "metrics-addr")]
    metrics_addr: Option<String>,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("dnstap-relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    let args = Args::parse();

    std::fs::create_dir_all("logs").unwrap_or_default();
    let file_appender = RollingFileAppender::new("logs/dnstap-relay.log", RollingConditionBasic::new().daily(), 30)?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level_filter(&args.log_level))))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    info!("starting dnstap telemetry relay version {}", env!("CARGO_PKG_VERSION"));
    info!(workers = cores, "multi-core runtime initialized");

    let config = config::Config::load(std::path::Path::new(&args.config))
        .with_context(|| format!("loading configuration from {}", args.config))?;

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    info!(%hostname, "process identity resolved");

    let counters = Arc::new(metrics::Counters::new()?);

    if let Some(addr) = args.metrics_addr.clone().or_else(|| config.metrics_addr.clone()) {
        let socket_addr: std::net::SocketAddr = addr.parse().with_context(|| format!("invalid metrics address {addr}"))?;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(socket_addr).await {
                tracing::error!(%err, "metrics exporter exited");
            }
        });
    }

    let mut pipeline = pipeline::Pipeline::spawn(&config, counters, hostname).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("shutdown signal received, draining pipeline");
            pipeline.shutdown().await;
        }
        err = pipeline.wait_fatal() => {
            tracing::error!(%err, "fatal input error, shutting down");
            pipeline.shutdown().await;
            return Err(err);
        }
    }
    info!("shutdown complete");

    Ok(())
}

fn log_level_filter(level: &str) -> &'static str {
    match level {
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}
