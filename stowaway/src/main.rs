//! stowaway - command-line front end for the store-and-forward dispatcher
//!
//! This tool provides commands for:
//! - Sending telemetry payloads to the configured collector
//! - Flushing records left in the offline cache
//! - Checking configuration and offline cache state
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/stowaway/config.toml (~/.config/stowaway/config.toml)
//! - Offline cache: $XDG_CACHE_HOME/stowaway/<host>/ (~/.cache/stowaway/<host>/)
//! - Logs: $XDG_STATE_HOME/stowaway/ (~/.local/state/stowaway/)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stowaway_core::{CacheAge, Config, Dispatcher, EventDiskCache};

#[derive(Parser)]
#[command(name = "stowaway")]
#[command(about = "Store-and-forward telemetry dispatcher")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file to the state directory)
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/stowaway/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Collector endpoint, overriding the config file
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit payloads and deliver them now (undelivered ones are cached)
    Send {
        /// Encoded query strings, e.g. "?idsite=1&rec=1&action_name=Home"
        #[arg(required = true)]
        payloads: Vec<String>,
    },

    /// Deliver records left in the offline cache
    Flush,

    /// Show configuration and offline cache state
    Status,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    if let Some(endpoint) = &args.endpoint {
        config.dispatch.endpoint = Some(endpoint.clone());
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    // Keep the guard alive until exit so buffered log lines are flushed
    let _log_guard = if args.verbose {
        Some(stowaway_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Send { payloads } => cmd_send(config, &payloads).await,
        Command::Flush => cmd_flush(config).await,
        Command::Status => cmd_status(&config),
    }
}

/// Build a dispatcher that only sends when asked
fn manual_dispatcher(mut config: Config) -> Result<Dispatcher> {
    config.dispatch.interval_ms = -1;
    Dispatcher::new(config).context("failed to create dispatcher")
}

fn normalize_payload(payload: &str) -> String {
    if payload.starts_with('?') {
        payload.to_string()
    } else {
        format!("?{}", payload)
    }
}

async fn cmd_send(config: Config, payloads: &[String]) -> Result<()> {
    let dispatcher = manual_dispatcher(config)?;
    tracing::info!(records = payloads.len(), endpoint = dispatcher.endpoint(), "Sending payloads");

    for payload in payloads {
        dispatcher.submit(normalize_payload(payload));
    }

    let delivered = dispatcher.dispatch_pending().await;
    println!("Delivered:       {} record(s)", delivered);
    report_pending(&dispatcher);

    // Dropping the dispatcher moves anything undelivered to the offline cache
    Ok(())
}

async fn cmd_flush(config: Config) -> Result<()> {
    let dispatcher = manual_dispatcher(config)?;

    if dispatcher.cache().is_empty() {
        tracing::debug!("Offline cache is empty");
        println!("Nothing to flush.");
        return Ok(());
    }

    let delivered = dispatcher.dispatch_pending().await;
    println!("Delivered:       {} record(s)", delivered);
    report_pending(&dispatcher);

    Ok(())
}

fn report_pending(dispatcher: &Dispatcher) {
    let cache = dispatcher.cache();
    if cache.is_empty() {
        return;
    }

    let stats = dispatcher.stats().snapshot();
    if stats.packet_failures > 0 {
        println!("Failed packets:  {}", stats.packet_failures);
    }
    if !dispatcher.is_online() {
        println!("Status:          offline (dispatch mode {})", dispatcher.dispatch_mode());
    }
    println!(
        "Pending:         {} record(s) in memory, {} cache container(s) on disk",
        cache.len(),
        cache.disk().container_count()
    );
    println!("Undelivered records are kept for later delivery (run 'flush')");
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Stowaway Configuration");
    println!("======================");
    println!();

    let dispatch = &config.dispatch;
    println!(
        "Endpoint:        {}",
        dispatch.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Auth Token:      {}",
        if dispatch.auth_token.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    if dispatch.interval_ms < 0 {
        println!("Interval:        manual");
    } else {
        println!("Interval:        {}ms", dispatch.interval_ms);
    }
    println!("Timeout:         {}ms", dispatch.timeout_ms);
    println!("Gzip:            {}", dispatch.gzip);
    println!("Mode:            {}", dispatch.mode);

    println!();
    println!("Offline Cache");
    println!("-------------");
    match config.cache.max_age() {
        CacheAge::Disabled => println!("Max Age:         disabled"),
        CacheAge::Unlimited => println!("Max Age:         unlimited"),
        CacheAge::Limit(age) => println!("Max Age:         {}ms", age.as_millis()),
    }
    if config.cache.max_size_bytes == 0 {
        println!("Max Size:        unlimited");
    } else {
        println!("Max Size:        {} bytes", config.cache.max_size_bytes);
    }

    let endpoint = match dispatch.endpoint_url() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            println!();
            println!("Status: Not ready ({})", e);
            println!();
            println!("Set an endpoint in config.toml:");
            println!();
            println!("  [dispatch]");
            println!("  endpoint = \"https://analytics.example.com/matomo.php\"");
            return Ok(());
        }
    };

    let disk = EventDiskCache::for_endpoint(&config.cache, &endpoint);
    println!("Directory:       {}", disk.dir().display());
    println!("Containers:      {}", disk.container_count());
    println!("Size:            {} bytes", disk.size_bytes());

    println!();
    println!("Status: Ready to dispatch");

    Ok(())
}
