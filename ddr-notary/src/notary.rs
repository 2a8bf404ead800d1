use crate::conflict::{BasicConflictChecker, ConflictResult, InputConflictChecker, StateConflict};
use ddr_core::id::{StateRef, TxId};
use ddr_core::identity::{KeyPair, Party};
use ddr_core::states::LedgerState;
use ddr_core::transaction::{SignedTransaction, TransactionSignature};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotaryError {
    /// The service could not be reached; the same transaction may be retried
    #[error("Notary unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// The notary's answer for a well-formed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotarisationOutcome {
    /// The inputs are now consumed by this transaction; carries the notary's signature
    Committed(TransactionSignature),

    /// At least one input was already consumed by another transaction
    Conflict(Vec<StateConflict>),
}

/// Consensus service guaranteeing that a state is consumed at most once
pub trait NotaryService: fmt::Debug + Send + Sync {
    /// The party whose signature finalises a transaction
    fn identity(&self) -> &Party;

    /// Commit `tx` if none of its inputs has been consumed by another transaction
    ///
    /// Re-notarising a committed transaction returns the original signature.
    fn notarise(&self, tx: &SignedTransaction) -> Result<NotarisationOutcome, NotaryError>;
}

#[derive(Debug, Default)]
struct NotaryLedger {
    consumed: HashMap<StateRef, TxId>,
    committed: HashMap<TxId, TransactionSignature>,
    /// Every output the notary has committed, consumed or not
    outputs: HashMap<StateRef, LedgerState>,
}

/// Single-node notary holding its uniqueness table in memory
pub struct InMemoryNotary {
    keys: KeyPair,
    party: Party,
    checker: Box<dyn InputConflictChecker>,
    ledger: Mutex<NotaryLedger>,
    available: AtomicBool,
}

impl InMemoryNotary {
    pub fn new(name: impl Into<String>, keys: KeyPair) -> Self {
        Self::with_checker(name, keys, Box::new(BasicConflictChecker::new()))
    }

    pub fn with_checker(
        name: impl Into<String>,
        keys: KeyPair,
        checker: Box<dyn InputConflictChecker>,
    ) -> Self {
        let party = keys.party(name);
        Self {
            keys,
            party,
            checker,
            ledger: Mutex::new(NotaryLedger::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; while unavailable every call fails with `Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_committed(&self, id: &TxId) -> bool {
        self.ledger()
            .map(|ledger| ledger.committed.contains_key(id))
            .unwrap_or(false)
    }

    /// The committed transaction that consumed `state_ref`, if any
    pub fn consumed_by(&self, state_ref: &StateRef) -> Option<TxId> {
        self.ledger()
            .ok()
            .and_then(|ledger| ledger.consumed.get(state_ref).copied())
    }

    fn ledger(&self) -> Result<MutexGuard<'_, NotaryLedger>, NotaryError> {
        self.ledger
            .lock()
            .map_err(|_| NotaryError::Unavailable("Notary ledger poisoned".to_string()))
    }

    /// Checks that do not depend on the uniqueness table
    fn validate(&self, tx: &SignedTransaction) -> Result<(), NotaryError> {
        let invalid = |msg: String| NotaryError::InvalidTransaction(msg);

        tx.check_id().map_err(|e| invalid(e.to_string()))?;
        if tx.envelope().notary != self.party {
            return Err(invalid(format!(
                "Transaction names notary {} instead of {}",
                tx.envelope().notary,
                self.party
            )));
        }
        tx.verify_required_signatures(&[self.party.key])
            .map_err(|e| invalid(e.to_string()))?;
        ddr_contracts::verify(tx.envelope()).map_err(|v| invalid(v.to_string()))?;

        let refs = tx.envelope().input_refs();
        let unique: BTreeSet<&StateRef> = refs.iter().collect();
        if unique.len() != refs.len() {
            return Err(invalid("Transaction consumes the same state twice".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for InMemoryNotary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNotary")
            .field("party", &self.party)
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

impl NotaryService for InMemoryNotary {
    fn identity(&self) -> &Party {
        &self.party
    }

    fn notarise(&self, tx: &SignedTransaction) -> Result<NotarisationOutcome, NotaryError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(NotaryError::Unavailable(format!(
                "{} is not accepting transactions",
                self.party
            )));
        }

        let id = tx.id();
        self.validate(tx)?;

        let mut ledger = self.ledger()?;
        if let Some(signature) = ledger.committed.get(&id) {
            log::debug!("Transaction {} already committed", id);
            return Ok(NotarisationOutcome::Committed(signature.clone()));
        }

        for input in &tx.envelope().inputs {
            match ledger.outputs.get(&input.reference) {
                Some(state) if *state == input.state => {}
                Some(_) => {
                    return Err(NotaryError::InvalidTransaction(format!(
                        "Input {} does not match the committed state",
                        input.reference
                    )))
                }
                None => {
                    return Err(NotaryError::InvalidTransaction(format!(
                        "Input {} was never committed",
                        input.reference
                    )))
                }
            }
        }

        if let ConflictResult::Conflict(conflicts) = self.checker.check_conflicts(tx, &ledger.consumed) {
            log::warn!(
                "Rejecting {}: {} input(s) already consumed",
                id,
                conflicts.len()
            );
            return Ok(NotarisationOutcome::Conflict(conflicts));
        }

        for state_ref in tx.envelope().input_refs() {
            ledger.consumed.insert(state_ref, id);
        }
        for output in tx.output_states() {
            ledger.outputs.insert(output.reference, output.state);
        }
        let signature = TransactionSignature::create(&self.keys, &id);
        ledger.committed.insert(id, signature.clone());

        log::info!("Notarised transaction {}", id);
        Ok(NotarisationOutcome::Committed(signature))
    }
}
