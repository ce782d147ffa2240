use crate::bet::{Bet, WinningRule};
use crate::server::barrier::{CompletionBarrier, Draw};
use crate::storage::BetStore;
use crate::{Error, Result};

/// Process-wide state shared by every connection handler: the bet store and
/// the completion barrier, each behind its own lock.
pub struct Lottery {
    store: BetStore,
    barrier: CompletionBarrier,
    rule: Box<dyn WinningRule>,
}

impl Lottery {
    pub fn new(store: BetStore, agencies: u8, rule: impl WinningRule + 'static) -> Self {
        Self {
            store,
            barrier: CompletionBarrier::new(agencies),
            rule: Box::new(rule),
        }
    }

    pub fn store(&self) -> &BetStore {
        &self.store
    }

    pub fn barrier(&self) -> &CompletionBarrier {
        &self.barrier
    }

    /// Stores `agency`'s bets unless its FINISH has already been processed.
    ///
    /// The finished check and the append take the barrier and store locks
    /// one after the other, never together. A batch that passed the check
    /// while the same agency's FINISH was in flight on another connection
    /// is still stored. An agency that waits for each reply, as
    /// [`crate::AgencySession`] does, never reaches that window.
    pub fn submit(&self, agency: u8, bets: &[Bet]) -> Result<usize> {
        if !self.barrier.knows(agency) {
            return Err(Error::UnknownAgency(agency));
        }
        if self.barrier.has_finished(agency) {
            return Err(Error::AgencyFinished(agency));
        }
        self.store.append(bets)
    }

    pub fn finish(&self, agency: u8) -> Result<bool> {
        self.barrier.mark_finished(agency)
    }

    pub fn winners(&self, agency: u8) -> Result<Draw> {
        if !self.barrier.knows(agency) {
            return Err(Error::UnknownAgency(agency));
        }
        self.barrier
            .winners_for(agency, &self.store, self.rule.as_ref())
    }
}
