//! xref-fetch: drive a list of provider URLs through the request governor.

use anyhow::{Context, Result};
use clap::Parser;
use request_governor::{Governor, GovernorError, RequestSpec};
use reqwest::Url;
use shared::{Config, LogConfig};
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// File with one URL per line; `#` starts a comment
    #[arg(long)]
    urls: Option<PathBuf>,

    /// Print the per-domain scheduler snapshot as JSON when done
    #[arg(long)]
    snapshot: bool,

    /// URLs to fetch
    targets: Vec<String>,
}

/// Outcome counts for one run
#[derive(Debug, Default)]
struct FetchStats {
    succeeded: usize,
    exhausted: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config
        .apply_env_overrides()
        .context("Failed to apply environment overrides")?;

    // Initialize logging
    let mut log_config = LogConfig::from_settings(&config.logging, "xref-fetch", &config.log_dir());
    if args.verbose {
        log_config.default_level = tracing::Level::DEBUG;
    }
    shared::logging::init(log_config)?;

    info!("xref-fetch starting");
    info!(config_file = %args.config.display(), "Loaded configuration");

    let targets = collect_targets(&args)?;
    if targets.is_empty() {
        warn!("No URLs given, nothing to fetch");
        return Ok(());
    }

    let governor = Governor::from_config(&config.governor)
        .context("Failed to create request governor")?;
    info!(
        known_domains = governor.registry().len(),
        min_request_interval_ms = config.governor.min_request_interval_ms,
        targets = targets.len(),
        "Request governor ready"
    );

    let mut tasks = JoinSet::new();
    for url in targets {
        let governor = governor.clone();
        tasks.spawn(async move {
            let result = governor
                .execute(&RequestSpec::get(url.clone()))
                .await
                .map(|response| response.status());
            (url, result)
        });
    }

    let mut stats = FetchStats::default();
    while let Some(joined) = tasks.join_next().await {
        let (url, result) = joined.context("Fetch task panicked")?;
        match result {
            Ok(status) => {
                stats.succeeded += 1;
                info!(url = %url, status = %status, "Fetched");
            }
            Err(e @ GovernorError::Exhausted { .. }) => {
                stats.exhausted += 1;
                error!(url = %url, error = %e, "Giving up after retries");
            }
            Err(e) => {
                stats.rejected += 1;
                error!(url = %url, error = %e, "Request rejected");
            }
        }
    }

    // Display final statistics
    info!("=== Fetch Complete ===");
    info!("Succeeded: {}", stats.succeeded);
    info!("Exhausted: {}", stats.exhausted);
    info!("Rejected: {}", stats.rejected);

    let snapshot = governor.snapshot();
    info!(
        domains = snapshot.domains.len(),
        in_flight = snapshot.total_active(),
        waiting = snapshot.total_waiting(),
        "Scheduler state"
    );

    if args.snapshot {
        let json = serde_json::to_string_pretty(&snapshot)
            .context("Failed to serialize snapshot")?;
        println!("{}", json);
    }

    info!("xref-fetch finished");

    Ok(())
}

/// Gather URLs from the command line and the optional URL file
fn collect_targets(args: &Args) -> Result<Vec<Url>> {
    let mut targets = parse_url_list(&args.targets.join("\n"))?;

    if let Some(path) = &args.urls {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL file: {}", path.display()))?;
        targets.extend(
            parse_url_list(&content)
                .with_context(|| format!("Invalid URL in {}", path.display()))?,
        );
    }

    Ok(targets)
}

fn parse_url_list(content: &str) -> Result<Vec<Url>> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| Url::parse(line).with_context(|| format!("Invalid URL: {}", line)))
        .collect()
}
