//! Agency side of the protocol.

mod session;

pub use session::{
    AgencySession, SessionError, SessionOutcome, SessionState, Stage, MAX_CONSECUTIVE_FAILURES,
};
