use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("payload too large: {declared} bytes")]
    PayloadTooLarge { declared: usize },
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown agency: {0}")]
    UnknownAgency(u8),
    #[error("agency {0} already finished")]
    AgencyFinished(u8),
    #[error("store already locked: {}", .0.display())]
    StoreLocked(PathBuf),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True for failures of the transport itself, where no reply can be
    /// delivered to the peer.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
