//! Multi-agency bet aggregation.
//!
//! Agencies submit bets to a central aggregator over a small length-prefixed
//! TCP protocol, declare when they are done, and poll for their winners. The
//! aggregator reveals winners only after every configured agency has finished.
//!
//! ```text
//! AgencySession ──frame──► Server (permit) ──► handler ──► BetStore
//!       ▲                                          └─────► CompletionBarrier
//!       └──────────────────── reply frame ◄────────┘
//! ```

pub mod bet;
pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod storage;

pub use bet::{Bet, WinningNumber, WinningRule};
pub use client::{AgencySession, SessionError, SessionOutcome};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::{Lottery, Server};
pub use storage::BetStore;
