//! Run a session from a JSON configuration against the synthetic in-memory
//! repository and print the final status document.
//!
//! Intended for demos and smoke checks; production embeddings construct
//! `SessionCoordinator` directly with a real repository.

use anyhow::{Context, Result};
use clap::Parser;
use market_session::scanner::default_registry;
use market_session::{EngineTuning, MemoryRepository, SessionConfig, SessionCoordinator, SessionState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "session-run", about = "Run a market-data session to completion")]
struct Args {
    /// Path to the JSON session configuration.
    #[arg(long)]
    config: PathBuf,

    /// Holidays for the synthetic calendar (YYYY-MM-DD, repeatable).
    #[arg(long = "holiday")]
    holidays: Vec<chrono::NaiveDate>,

    /// Give up if the session has not terminated after this many seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Print the parsed configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,market_session=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: SessionConfig =
        serde_json::from_str(&raw).context("parsing session configuration")?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let repository = Arc::new(MemoryRepository::new().with_holidays(args.holidays.clone()));
    info!(
        symbols = config.session_data.symbols.len(),
        mode = %config.mode,
        "starting session"
    );

    let handle = SessionCoordinator::start(
        config,
        repository,
        default_registry(),
        EngineTuning::from_env(),
    )
    .map_err(|e| anyhow::anyhow!("session start failed: {}", e))?;

    let finished = handle.wait_for_state(
        |state| state == SessionState::Stopped,
        Duration::from_secs(args.timeout_secs),
    );
    if !finished {
        handle.stop();
        handle.join(Duration::from_secs(10));
        anyhow::bail!("session did not terminate within {}s", args.timeout_secs);
    }
    handle.join(Duration::from_secs(10));

    let status = handle.status_document();
    println!("{}", status.to_json()?);

    if let Some(err) = handle.last_error() {
        anyhow::bail!("session ended with error: {}", err);
    }
    Ok(())
}
