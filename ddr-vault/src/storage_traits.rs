use ddr_core::amount::{Amount, Currency};
use ddr_core::error::StorageError;
use ddr_core::id::{LockId, StateRef, TxId};
use ddr_core::identity::PartyKey;
use ddr_core::locks::SoftLockManager;
use ddr_core::states::{ObligationStatus, StateAndRef, StateKind};
use ddr_core::transaction::SignedTransaction;

/// Consumption status filter for vault queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateStatus {
    #[default]
    Unconsumed,
    Consumed,
    All,
}

/// Soft-lock filter for vault queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockFilter {
    /// Ignore reservations
    #[default]
    Any,
    /// Only states without a live reservation
    UnlockedOnly,
    /// Only states reserved by the given lock
    HeldBy(LockId),
}

/// Criteria for selecting states from the vault
///
/// Every field that is set narrows the result; an empty criteria matches
/// all unconsumed states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryCriteria {
    pub kind: Option<StateKind>,
    pub owner: Option<PartyKey>,
    pub currency: Option<Currency>,
    pub external_id: Option<String>,
    pub obligation_status: Option<ObligationStatus>,
    pub state_status: StateStatus,
    pub lock_filter: LockFilter,
}

impl QueryCriteria {
    /// Spendable tokens of `owner` in `currency`
    pub fn unlocked_tokens(owner: PartyKey, currency: Currency) -> Self {
        Self {
            kind: Some(StateKind::Token),
            owner: Some(owner),
            currency: Some(currency),
            lock_filter: LockFilter::UnlockedOnly,
            ..Default::default()
        }
    }

    pub fn of_kind(kind: StateKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: PartyKey) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_obligation_status(mut self, status: ObligationStatus) -> Self {
        self.obligation_status = Some(status);
        self
    }

    pub fn with_state_status(mut self, status: StateStatus) -> Self {
        self.state_status = status;
        self
    }

    pub fn with_lock_filter(mut self, filter: LockFilter) -> Self {
        self.lock_filter = filter;
        self
    }
}

/// One-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpecification {
    pub page_number: u32,
    pub page_size: u32,
}

impl PageSpecification {
    pub fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number: page_number.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for PageSpecification {
    fn default() -> Self {
        Self::new(1, 200)
    }
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub states: Vec<StateAndRef>,

    /// Number of states matching the criteria across all pages
    pub total_states_available: u64,
}

/// Query interface over the states and transactions a node has recorded
pub trait VaultStorage: std::fmt::Debug + Send + Sync {
    /// Record a committed transaction
    ///
    /// Marks the inputs the vault knows about as consumed, drops their
    /// reservations and stores every output as unconsumed.
    ///
    /// # Returns
    /// * `Ok(true)` - The transaction was recorded
    /// * `Ok(false)` - The transaction had already been recorded
    fn record_transaction(&self, tx: &SignedTransaction) -> Result<bool, StorageError>;

    /// Get a recorded transaction by id
    fn get_transaction(&self, id: &TxId) -> Result<Option<SignedTransaction>, StorageError>;

    /// Get a state by reference, consumed or not
    fn get_state(&self, state_ref: &StateRef) -> Result<Option<StateAndRef>, StorageError>;

    /// The transaction that consumed a state, if it has been consumed
    fn consumed_by(&self, state_ref: &StateRef) -> Result<Option<TxId>, StorageError>;

    /// Query states matching `criteria`, ordered by recording order
    fn query(&self, criteria: &QueryCriteria, page: &PageSpecification) -> Result<Page, StorageError>;

    /// Mark states as consumed by a transaction this vault has not recorded
    ///
    /// Used when the notary reports that a state was spent elsewhere.
    ///
    /// # Returns
    /// * `Ok(count)` - Number of known states newly marked as consumed
    fn mark_consumed(&self, refs: &[StateRef], consumed_by: &TxId) -> Result<usize, StorageError>;

    /// Sum of unconsumed tokens of `owner` in `currency`, reserved or not
    fn balance(&self, owner: &PartyKey, currency: Currency) -> Result<Amount, StorageError> {
        let criteria = QueryCriteria::of_kind(StateKind::Token)
            .with_owner(*owner)
            .with_currency(currency);
        let mut total = Amount::zero(currency);
        let mut page_number = 1;
        loop {
            let page = self.query(&criteria, &PageSpecification::new(page_number, 200))?;
            for state in &page.states {
                total = total
                    .checked_add(state.state.amount())
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            }
            if page.states.is_empty() || u64::from(page_number) * 200 >= page.total_states_available {
                break;
            }
            page_number += 1;
        }
        Ok(total)
    }
}

/// A vault that also owns the reservation table for its states
pub trait Vault: VaultStorage + SoftLockManager {}

impl<T: VaultStorage + SoftLockManager + ?Sized> Vault for T {}
