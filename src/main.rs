use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tcp_relay::{Config, LogConfig, Proxy, load_config, validate_endpoint};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "tcp-relay.log";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser)]
#[command(name = "tcp-relay", version, about = "Relay TCP connections through IP policies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Proxy connections from one endpoint to another
    Proxy(ProxyArgs),
}

#[derive(Args)]
struct ProxyArgs {
    /// Endpoint to listen on (ip:port)
    #[arg(long)]
    from: Option<String>,
    /// Endpoint to send connections to (ip:port)
    #[arg(long)]
    to: Option<String>,
    /// Configuration file (JSON, or TOML with a .toml extension)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Merges the config file (if any) with the command-line endpoints, which
/// take precedence.
fn resolve_config(args: ProxyArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(from) = args.from {
        config.from = from;
    }
    if let Some(to) = args.to {
        config.to = to;
    }

    if validate_endpoint("listen", &config.from).is_err() {
        bail!("invalid or missing '--from' flag");
    }
    if validate_endpoint("destination", &config.to).is_err() {
        bail!("invalid or missing '--to' flag");
    }
    Ok(config)
}

fn init_logging(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if log.file {
        let path = log
            .path
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_LOG_FILE));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    } else if log.stderr {
        builder.with_writer(io::stderr).init();
    } else {
        builder.with_writer(io::stdout).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Command::Proxy(args) = Cli::parse().command;
    let config = resolve_config(args)?;
    init_logging(&config.log)?;

    let mut proxy = Proxy::new(config).context("Invalid proxy configuration")?;
    let config = proxy.config();
    info!(
        listen_addr = %config.from,
        destination = %config.to,
        allow_all = config.policies.allow_all,
        deny_all = config.policies.deny_all,
        allow_entries = config.policies.allow.len(),
        deny_entries = config.policies.deny.len(),
        "Configuration loaded"
    );

    proxy.start().await.context("Failed to start proxy")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    proxy.shutdown().await.context("Failed to stop proxy")?;
    Ok(())
}
