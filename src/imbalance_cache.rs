//! A transactional overlay of pending imbalance deltas on top of the ledger.
//!
//! Used by the ledger when (dis-)connecting views so a view's considerations
//! see the effects of earlier considerations in the same view, and by the
//! consideration queue when deciding whether to admit a consideration.

use std::collections::HashMap;

use crate::consideration::{Consideration, PublicKey};
use crate::error::LedgerError;
use crate::ledger::Ledger;

/// Maintains a partial unconfirmed view of the ledger's imbalances.
/// Instances are single-use and not shared across tasks.
#[derive(Default)]
pub struct ImbalanceCache {
    cache: HashMap<PublicKey, i64>,
}

impl ImbalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all cached deltas.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Applies the effect of the consideration to the involved parties'
    /// cached imbalances. Returns `false` without error if the sender's
    /// imbalance would go negative.
    pub fn apply(
        &mut self,
        ledger: &dyn Ledger,
        cn: &Consideration,
    ) -> Result<bool, LedgerError> {
        if let Some(by) = &cn.by {
            // check and debit the sender's imbalance
            let mut sender_imbalance = match self.cache.get(by) {
                Some(imbalance) => *imbalance,
                None => ledger.get_public_key_imbalance(by)?,
            };
            if sender_imbalance < 1 {
                return Ok(false);
            }
            sender_imbalance -= 1;
            self.cache.insert(*by, sender_imbalance);
        }

        // credit the recipient's imbalance
        let mut recipient_imbalance = match self.cache.get(&cn.for_) {
            Some(imbalance) => *imbalance,
            None => ledger.get_public_key_imbalance(&cn.for_)?,
        };
        recipient_imbalance += 1;
        self.cache.insert(cn.for_, recipient_imbalance);
        Ok(true)
    }

    /// Undoes the effects of a consideration on the involved parties' cached
    /// imbalances.
    ///
    /// # Panics
    ///
    /// A recipient imbalance going negative here means the ledger is being
    /// rolled back past state it never held, which is an invariant violation.
    pub fn undo(&mut self, ledger: &dyn Ledger, cn: &Consideration) -> Result<(), LedgerError> {
        if let Some(by) = &cn.by {
            // credit the sender's imbalance
            let sender_imbalance = match self.cache.get(by) {
                Some(imbalance) => *imbalance,
                None => ledger.get_public_key_imbalance(by)?,
            };
            self.cache.insert(*by, sender_imbalance + 1);
        }

        // debit the recipient's imbalance
        let recipient_imbalance = match self.cache.get(&cn.for_) {
            Some(imbalance) => *imbalance,
            None => ledger.get_public_key_imbalance(&cn.for_)?,
        };
        if recipient_imbalance < 1 {
            panic!("recipient imbalance went negative");
        }
        self.cache.insert(cn.for_, recipient_imbalance - 1);
        Ok(())
    }

    /// The underlying map of pending deltas, for batch persistence.
    pub fn imbalances(&self) -> &HashMap<PublicKey, i64> {
        &self.cache
    }
}
