// ABOUTME: CLI entry point for corral: run, check, and status subcommands.
// ABOUTME: Layers config file, environment overrides, and flags before handing off to the gateway.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use corral_core::{Config, WorkerSnapshot};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default address of a running gateway
const DEFAULT_URL: &str = "http://127.0.0.1:8000";

#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(about = "Local process orchestrator with an HTTP request gateway")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults to ~/.config/corral/corral.toml)
    #[arg(long, short, global = true, env = "CORRAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start all workers and serve the gateway until interrupted
    Run {
        /// Port to listen on (overrides the config file)
        #[arg(long, short, env = "CORRAL_PORT")]
        port: Option<u16>,

        /// Host to bind (overrides the config file)
        #[arg(long, env = "CORRAL_HOST")]
        host: Option<String>,
    },

    /// Load and validate the configuration, then list workers
    Check,

    /// Query a running gateway's /status
    Status {
        /// Gateway base URL
        #[arg(long, short, default_value = DEFAULT_URL, env = "CORRAL_URL")]
        url: String,

        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    corral_log::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { port, host } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(host) = host {
                config.host = host;
            }
            corral_gateway::run(config).await
        }
        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            print_check(&config);
            Ok(())
        }
        Commands::Status { url, json } => run_status(&url, json).await,
    }
}

/// Resolve the config file, then apply `CORRAL_<WORKER>_*` overrides.
///
/// A missing file is an error only when the path was given explicitly.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = resolve_config(explicit)?;
    config
        .apply_env_overrides(std::env::vars())
        .context("applying environment overrides")?;
    Ok(config)
}

fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => {
            let path = Config::default_path();
            if path.exists() {
                Config::load(&path).with_context(|| format!("loading config {}", path.display()))
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "No config file found, starting with no workers"
                );
                Ok(Config::default())
            }
        }
    }
}

fn print_check(config: &Config) {
    println!("Config OK: gateway on {}", config.listen_addr());
    if config.workers.is_empty() {
        println!("No workers configured.");
        return;
    }
    println!("{} worker(s):", config.workers.len());
    for worker in &config.workers {
        println!(
            "  {:<16} {:>5}  {}  {}",
            worker.name,
            worker.port,
            worker.health_path,
            worker.command.join(" ")
        );
    }
}

async fn run_status(url: &str, raw: bool) -> Result<()> {
    let endpoint = format!("{}/status", url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    let response = client
        .get(&endpoint)
        .send()
        .await
        .with_context(|| format!("requesting {endpoint}"))?;
    if !response.status().is_success() {
        bail!("{endpoint} answered HTTP {}", response.status());
    }
    let report: Value = response.json().await.context("decoding status report")?;

    if raw {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let workers: Vec<WorkerSnapshot> = serde_json::from_value(report["workers"].clone())
        .context("decoding workers from status report")?;
    println!(
        "{} of {} worker(s) running, supervisor up {}s",
        report["running_workers"],
        report["total_workers"],
        report["supervisor_uptime_ms"].as_u64().unwrap_or(0) / 1000
    );
    for line in format_workers(&workers) {
        println!("{line}");
    }
    Ok(())
}

fn format_workers(workers: &[WorkerSnapshot]) -> Vec<String> {
    workers
        .iter()
        .map(|w| {
            let pid = w.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
            let mut line = format!(
                "  {:<16} {:<9} port {:>5}  pid {}",
                w.name,
                w.status.as_str(),
                w.port,
                pid
            );
            if let Some(code) = w.exit_code {
                line.push_str(&format!("  exit {code}"));
            }
            line
        })
        .collect()
}
