//! Swarm Router - Entry Point
//!
//! Modes:
//! - Default: resume persisted runs and keep dispatching until Ctrl-C
//! - --runs / -r: print persisted runs as JSON and exit
//! - --check / -c: validate configuration and exit

use swarm_router::{CapabilityRegistry, Config, SwarmContext};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let runs_mode = args.iter().any(|a| a == "--runs" || a == "-r");
    let check_mode = args.iter().any(|a| a == "--check" || a == "-c");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1));

    if help_mode {
        println!("Swarm Router v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: swarm-router [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --config <path>  Load a TOML config instead of the environment");
        println!("  --runs, -r       Print persisted runs and exit");
        println!("  --check, -c      Validate configuration and exit");
        println!("  --help, -h       Show this help");
        println!();
        println!("Environment variables:");
        println!("  SWARM_DB_PATH        Structured tier database");
        println!("  SWARM_ARCHIVE_DIR    Archival tier directory");
        println!("  SWARM_PROVIDERS      provider:slots[:max_concurrent],...");
        println!("  SWARM_LOG_JSON       1 for JSON logs on stderr");
        return Ok(());
    }

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);
    let json_logs = std::env::var("SWARM_LOG_JSON").map(|v| v == "1").unwrap_or(false);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = match config_path {
        Some(path) => Config::from_toml_file(std::path::Path::new(path))?,
        None => Config::from_env()?,
    };

    if check_mode {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Swarm Router v{}", env!("CARGO_PKG_VERSION"));

    // Handlers are registered by embedding applications; the standalone
    // process only inspects persisted work and keeps storage healthy.
    if !config.roster.is_empty() {
        anyhow::bail!(
            "this binary registers no capability handlers, so it cannot staff an agent roster \
             ({} entries configured); unset SWARM_AGENTS or run the roster from an application \
             that registers handlers",
            config.roster.len()
        );
    }
    let registry = CapabilityRegistry::new();
    let mut ctx = SwarmContext::start(config, registry).await?;

    if runs_mode {
        let runs = ctx.coordinator.list_runs().await;
        println!("{}", serde_json::to_string_pretty(&runs)?);
        ctx.shutdown().await;
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    ctx.shutdown().await;

    let stats = ctx.router.stats();
    for report in &stats.tiers {
        info!(
            "{}: {} reads, {} hits, {} writes ({:?})",
            report.tier, report.stats.reads, report.stats.hits, report.stats.writes, report.circuit
        );
    }

    Ok(())
}
