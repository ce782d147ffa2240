use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::bet::WinningRule;
use crate::storage::BetStore;
use crate::{Error, Result};

/// Result of asking for an agency's winners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draw {
    /// Some agency has not declared completion yet.
    NotReady,
    /// Documents of the agency's winning bets, in store order.
    Winners(Vec<String>),
}

/// Set of agencies that declared they have no more bets to send.
///
/// Membership only grows. The barrier opens once all `total` agencies are in
/// and stays open for the life of the process.
pub struct CompletionBarrier {
    total: u8,
    finished: Mutex<HashSet<u8>>,
}

impl CompletionBarrier {
    pub fn new(total: u8) -> Self {
        Self {
            total,
            finished: Mutex::new(HashSet::with_capacity(total as usize)),
        }
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    /// Agency ids run from 1 to `total`.
    pub fn knows(&self, agency: u8) -> bool {
        (1..=self.total).contains(&agency)
    }

    /// Records `agency` as finished. Returns `false` when it already was.
    pub fn mark_finished(&self, agency: u8) -> Result<bool> {
        if !self.knows(agency) {
            return Err(Error::UnknownAgency(agency));
        }
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(finished.insert(agency))
    }

    pub fn has_finished(&self, agency: u8) -> bool {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&agency)
    }

    pub fn finished_count(&self) -> usize {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_open(&self) -> bool {
        self.finished_count() == self.total as usize
    }

    /// Winning documents among `agency`'s stored bets, or [`Draw::NotReady`]
    /// while the barrier is closed.
    ///
    /// The barrier lock is released before the store is read; the two locks
    /// are never held together.
    pub fn winners_for(
        &self,
        agency: u8,
        store: &BetStore,
        rule: &dyn WinningRule,
    ) -> Result<Draw> {
        if !self.is_open() {
            return Ok(Draw::NotReady);
        }
        let winners = store
            .load_all()?
            .into_iter()
            .filter(|bet| bet.agency == agency && rule.has_won(bet))
            .map(|bet| bet.document)
            .collect();
        Ok(Draw::Winners(winners))
    }
}
