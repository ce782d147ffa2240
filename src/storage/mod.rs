mod bet_store;
mod input;
mod lock;

pub use bet_store::BetStore;
pub use input::load_agency_bets;
