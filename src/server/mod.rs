//! Aggregator side: shared lottery state and the bounded accept loop.
//!
//! ```text
//! Server (accept, one permit per worker)
//!   └─ handle_connection (one frame in, at most one frame out)
//!        ├─ BetStore           (store lock)
//!        └─ CompletionBarrier  (barrier lock, never nested with the store's)
//! ```

mod barrier;
mod handler;
mod lottery;
mod pool;

pub use barrier::{CompletionBarrier, Draw};
pub use lottery::Lottery;
pub use pool::Server;
