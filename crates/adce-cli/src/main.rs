use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use adce_core::{EngineBuilder, load_config};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "adce", version, about = "Autonomous data collection engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine until Ctrl-C or `POST /control/stop`.
    Start {
        /// TOML config file.
        #[arg(long, default_value = "adce.toml")]
        config: PathBuf,

        /// Override `monitor.listen`, e.g. 127.0.0.1:8787
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override `executor.grace_timeout_secs`.
        #[arg(long)]
        grace_seconds: Option<u64>,
    },

    /// Print `GET /status` of a running engine.
    Status {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },

    /// Print `GET /tasks` of a running engine.
    Tasks {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },

    /// Ask a running engine to stop.
    Stop {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_target(false)
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start {
            config,
            listen,
            grace_seconds,
        } => start(config, listen, grace_seconds).await,
        Command::Status { addr } => get_json(&addr, "/status").await,
        Command::Tasks { addr } => get_json(&addr, "/tasks").await,
        Command::Stop { addr } => request_stop(&addr).await,
    }
}

/// `RUST_LOG` when set and valid, INFO otherwise.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

async fn start(path: PathBuf, listen: Option<SocketAddr>, grace_seconds: Option<u64>) -> anyhow::Result<()> {
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    let grace = grace_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.executor.grace_timeout());

    let mut builder = EngineBuilder::new(config).file_collaborators().http_sources()?;
    if let Some(addr) = listen {
        builder = builder.listen(addr);
    }
    let engine = builder.build()?;

    let addr = engine.start().await?;
    info!("status on http://{}/status", addr);

    let stop = engine.shutdown_requested();
    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown requested"),
        _ = stop.cancelled() => info!("shutdown requested over HTTP"),
    }

    let report = engine.stop(grace).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn get_json(addr: &str, path: &str) -> anyhow::Result<()> {
    let body: serde_json::Value = reqwest::get(format!("http://{addr}{path}"))
        .await
        .with_context(|| format!("connecting to {addr}"))?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn request_stop(addr: &str) -> anyhow::Result<()> {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/control/stop"))
        .send()
        .await
        .with_context(|| format!("connecting to {addr}"))?
        .error_for_status()?;
    let body: serde_json::Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn rust_log_overrides_the_default() {
        assert_eq!(
            log_filter(Some("debug".to_string())).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }
}
