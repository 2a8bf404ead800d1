use ddr_core::id::{StateRef, TxId};
use ddr_core::transaction::SignedTransaction;
use std::collections::{BTreeSet, HashMap};

/// An input that a different committed transaction already consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateConflict {
    pub state_ref: StateRef,
    pub consumed_by: TxId,
}

/// Result of checking a transaction's inputs against the consumed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResult {
    NoConflict,
    Conflict(Vec<StateConflict>),
}

/// Trait for double-spend checking
pub trait InputConflictChecker: Send + Sync {
    /// Check the inputs of `transaction` against states already consumed
    ///
    /// # Parameters
    /// * `transaction` - The transaction to check
    /// * `consumed` - Every consumed state with the transaction that consumed it
    ///
    /// # Returns
    /// A ConflictResult listing each input spent by another transaction
    fn check_conflicts(
        &self,
        transaction: &SignedTransaction,
        consumed: &HashMap<StateRef, TxId>,
    ) -> ConflictResult;

    /// Extract the set of input references of a transaction
    fn extract_inputs(&self, transaction: &SignedTransaction) -> BTreeSet<StateRef> {
        transaction.envelope().input_refs().into_iter().collect()
    }
}

/// Basic implementation of the InputConflictChecker trait
#[derive(Debug, Default)]
pub struct BasicConflictChecker;

impl BasicConflictChecker {
    pub fn new() -> Self {
        Self
    }
}

impl InputConflictChecker for BasicConflictChecker {
    fn check_conflicts(
        &self,
        transaction: &SignedTransaction,
        consumed: &HashMap<StateRef, TxId>,
    ) -> ConflictResult {
        let id = transaction.id();
        let conflicts: Vec<StateConflict> = self
            .extract_inputs(transaction)
            .into_iter()
            .filter_map(|state_ref| match consumed.get(&state_ref) {
                // A transaction never conflicts with itself
                Some(by) if *by != id => Some(StateConflict {
                    state_ref,
                    consumed_by: *by,
                }),
                _ => None,
            })
            .collect();

        if conflicts.is_empty() {
            ConflictResult::NoConflict
        } else {
            ConflictResult::Conflict(conflicts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ddr_core::amount::{Amount, Currency};
    use ddr_core::identity::KeyPair;
    use ddr_core::states::{StateAndRef, TokenState};
    use ddr_core::transaction::TransactionEnvelope;

    fn spending(inputs: &[StateRef]) -> SignedTransaction {
        let bank = KeyPair::from_seed(b"BankA").party("BankA");
        let notary = KeyPair::from_seed(b"Notary").party("Notary");
        let mut env = TransactionEnvelope::new(notary);
        for r in inputs {
            let token = TokenState::new(
                bank.clone(),
                bank.clone(),
                Amount::new(10, Currency::MAD),
                Utc::now(),
            );
            env.inputs.push(StateAndRef::new(*r, token.into()));
        }
        SignedTransaction::new(env).unwrap()
    }

    #[test]
    fn test_basic_conflict_checker() {
        let checker = BasicConflictChecker::new();
        let source = TxId::digest(b"issuance");
        let first = StateRef::new(source, 0);
        let second = StateRef::new(source, 1);

        let tx = spending(&[first, second]);
        let mut consumed = HashMap::new();

        // Nothing consumed yet
        assert_eq!(checker.check_conflicts(&tx, &consumed), ConflictResult::NoConflict);

        // Consumed by the transaction itself: a retry, not a conflict
        consumed.insert(first, tx.id());
        assert_eq!(checker.check_conflicts(&tx, &consumed), ConflictResult::NoConflict);

        // Consumed elsewhere
        let other = TxId::digest(b"other");
        consumed.insert(second, other);
        assert_eq!(
            checker.check_conflicts(&tx, &consumed),
            ConflictResult::Conflict(vec![StateConflict {
                state_ref: second,
                consumed_by: other,
            }])
        );
    }
}
