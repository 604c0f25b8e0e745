use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use evex_exporter::{Config, Exporter};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "evex", version, about = "Export Kubernetes events to configured receivers")]
struct Cli {
    /// Log line format
    #[arg(long = "log-format", value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "EVEX_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat { Text, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch events and deliver them until interrupted
    Run {
        /// Configuration file (YAML)
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
    /// Validate a configuration file and print the resolved document
    Check {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let env = std::env::var("EVEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

#[cfg(unix)]
async fn reload_signal(hup: &mut Option<signal::unix::Signal>) {
    match hup {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(path: &Path) -> Result<()> {
    let cfg = Config::load(path)?;
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let exporter = Exporter::start(client, &cfg, Some(path.to_path_buf()))?;

    #[cfg(unix)]
    let mut hup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable; route reload disabled");
            None
        }
    };

    loop {
        #[cfg(unix)]
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = reload_signal(&mut hup) => match exporter.reload_route() {
                Ok(()) => info!(config = %path.display(), "route reloaded"),
                Err(e) => error!(error = %format!("{e:#}"), "route reload failed; keeping current route"),
            },
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            break;
        }
    }

    info!("interrupt received; shutting down");
    exporter.shutdown().await;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let cfg = Config::load(path)?;
    let route = cfg.validate()?;
    let referenced: Vec<String> = route.receivers().into_iter().collect();
    info!(receivers = cfg.receivers.len(), referenced = ?referenced, "configuration valid");
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    init_metrics(cli.metrics_addr.as_deref());

    let res = match &cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Check { config } => check(config),
    };
    if let Err(e) = &res {
        error!(error = %format!("{e:#}"), "evex failed");
    }
    res
}
