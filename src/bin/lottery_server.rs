use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use lottery::bet::WINNING_NUMBER;
use lottery::lifecycle::cancel_on_shutdown;
use lottery::{BetStore, Lottery, Server, ServerConfig, WinningNumber};

#[derive(Parser, Debug)]
#[command(name = "lottery-server")]
#[command(about = "Collect agency bets and reveal winners once every agency has finished")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SERVER_LISTEN", default_value = "0.0.0.0:12345")]
    listen: String,

    /// Number of agencies that must finish before winners are revealed
    #[arg(long, env = "SERVER_AGENCIES", default_value_t = 5)]
    agencies: u8,

    /// Connections handled concurrently; further accepts wait for a free slot
    #[arg(long, env = "SERVER_MAX_WORKERS", default_value_t = 8)]
    max_workers: usize,

    /// Bet store file
    #[arg(long, env = "SERVER_STORE", default_value = "./bets.csv")]
    store: PathBuf,

    /// Per-read/write deadline on client connections, in milliseconds
    #[arg(long, env = "SERVER_IO_TIMEOUT_MS", default_value_t = 10_000)]
    io_timeout_ms: u64,

    /// Number that wins the draw
    #[arg(long, env = "SERVER_WINNING_NUMBER", default_value_t = WINNING_NUMBER)]
    winning_number: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ServerConfig::new(args.listen, args.store, args.agencies);
    config.max_workers = args.max_workers;
    config.io_timeout = Duration::from_millis(args.io_timeout_ms);
    config.validate().context("invalid server configuration")?;

    info!(
        "action: config | result: success | listen: {} | agencies: {} | max_workers: {} | store: {}",
        config.listen_addr,
        config.agencies,
        config.max_workers,
        config.store_path.display()
    );

    let store = BetStore::open(&config.store_path)
        .with_context(|| format!("open bet store {}", config.store_path.display()))?;
    let lottery = Lottery::new(store, config.agencies, WinningNumber(args.winning_number));
    let server = Server::bind(&config, lottery)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;

    cancel_on_shutdown(server.shutdown_token());
    server.run().await?;
    Ok(())
}
