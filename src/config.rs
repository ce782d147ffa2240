use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::{Error, Result};

const DEFAULT_MAX_WORKERS: usize = 8;
const DEFAULT_CHUNK_SIZE: usize = 100;
const DEFAULT_POLL_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Number of agencies that must finish before winners are revealed.
    pub agencies: u8,
    pub max_workers: usize,
    pub store_path: PathBuf,
    pub io_timeout: Duration,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, store_path: impl Into<PathBuf>, agencies: u8) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            agencies,
            max_workers: DEFAULT_MAX_WORKERS,
            store_path: store_path.into(),
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agencies == 0 {
            return Err(Error::InvalidConfig("agency count must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig("worker pool needs at least 1 worker".into()));
        }
        if self.max_workers > Semaphore::MAX_PERMITS {
            return Err(Error::InvalidConfig(format!(
                "worker pool is limited to {} workers",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.io_timeout.is_zero() {
            return Err(Error::InvalidConfig("io timeout must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub agency: u8,
    pub server_address: String,
    pub chunk_size: usize,
    /// Wait between winners queries while the lottery is not done.
    pub poll_delay: Duration,
    /// Base wait after a failed attempt, scaled by the consecutive failures.
    pub retry_backoff: Duration,
    pub io_timeout: Duration,
}

impl ClientConfig {
    pub fn new(agency: u8, server_address: impl Into<String>) -> Self {
        Self {
            agency,
            server_address: server_address.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_delay: Duration::from_millis(DEFAULT_POLL_DELAY_MS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agency == 0 {
            return Err(Error::InvalidConfig("agency id must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be at least 1".into()));
        }
        if self.io_timeout.is_zero() {
            return Err(Error::InvalidConfig("io timeout must be positive".into()));
        }
        Ok(())
    }
}
