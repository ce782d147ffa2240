use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use lottery::lifecycle::cancel_on_shutdown;
use lottery::storage::load_agency_bets;
use lottery::{AgencySession, ClientConfig, SessionOutcome};

#[derive(Parser, Debug)]
#[command(name = "lottery-agency")]
#[command(about = "Submit an agency's bets, declare completion and wait for the draw")]
struct Args {
    /// Agency identifier (1..=N)
    #[arg(long, env = "CLI_ID")]
    id: u8,

    /// Aggregator address (host:port)
    #[arg(long, env = "CLI_SERVER_ADDRESS", default_value = "server:12345")]
    server_address: String,

    /// Bets sent per request before any oversize shrinking
    #[arg(long, env = "CLI_CHUNK_SIZE", default_value_t = 100)]
    chunk_size: usize,

    /// Wait between winners queries while the draw is pending, in milliseconds
    #[arg(long, env = "CLI_POLL_DELAY_MS", default_value_t = 1_000)]
    poll_delay_ms: u64,

    /// Base wait after a failed attempt, in milliseconds
    #[arg(long, env = "CLI_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Per-connect/read/write deadline, in milliseconds
    #[arg(long, env = "CLI_IO_TIMEOUT_MS", default_value_t = 10_000)]
    io_timeout_ms: u64,

    /// Bets file (defaults to /data/agency-<id>.csv)
    #[arg(long, env = "CLI_BETS_FILE")]
    bets_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ClientConfig::new(args.id, args.server_address);
    config.chunk_size = args.chunk_size;
    config.poll_delay = Duration::from_millis(args.poll_delay_ms);
    config.retry_backoff = Duration::from_millis(args.retry_backoff_ms);
    config.io_timeout = Duration::from_millis(args.io_timeout_ms);

    let bets_file = args
        .bets_file
        .unwrap_or_else(|| PathBuf::from(format!("/data/agency-{}.csv", args.id)));
    let bets = load_agency_bets(&bets_file, args.id)
        .with_context(|| format!("read bets from {}", bets_file.display()))?;

    info!(
        "action: config | result: success | client_id: {} | server_address: {} | chunk_size: {} | bets: {}",
        config.agency,
        config.server_address,
        config.chunk_size,
        bets.len()
    );

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let mut session = AgencySession::new(config, cancel).context("invalid client configuration")?;
    match session.run(&bets).await? {
        SessionOutcome::Completed { winners } => {
            info!("action: draw | result: success | client_id: {} | winners: {}", args.id, winners.len());
        }
        SessionOutcome::Cancelled => {
            info!("action: shutdown | result: success | client_id: {}", args.id);
        }
        SessionOutcome::WinnersRejected { reason } => {
            warn!("action: draw | result: fail | client_id: {} | error: {}", args.id, reason);
        }
    }
    Ok(())
}
