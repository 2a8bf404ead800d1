use crate::storage_traits::{PageSpecification, QueryCriteria, Vault};
use ddr_core::amount::Amount;
use ddr_core::config::SelectorConfig;
use ddr_core::error::StorageError;
use ddr_core::id::{LockId, StateRef};
use ddr_core::identity::PartyKey;
use ddr_core::states::StateAndRef;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Invalid amount to select: {0}")]
    InvalidAmount(String),

    #[error("Insufficient spendable states identified for {requested} (found {available})")]
    InsufficientBalance { requested: Amount, available: Amount },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum Attempt {
    Reserved(Vec<StateAndRef>),
    /// Not enough unreserved states were visible
    Short(Amount),
    /// Enough states were visible but another lock took one of them first
    Contended,
}

/// Picks and soft-locks unconsumed tokens covering a requested amount
///
/// Tokens are taken in vault order until their sum reaches the request.
/// The chosen set is reserved atomically, so two selectors never hand out
/// the same token; a selector that loses a race backs off and tries again.
pub struct TokenSelector<'a, V: Vault + ?Sized> {
    vault: &'a V,
    config: SelectorConfig,
    reservation_ttl_ms: Option<u64>,
}

impl<'a, V: Vault + ?Sized> TokenSelector<'a, V> {
    pub fn new(vault: &'a V, config: SelectorConfig) -> Self {
        Self {
            vault,
            config,
            reservation_ttl_ms: None,
        }
    }

    pub fn with_reservation_ttl(mut self, ttl_ms: Option<u64>) -> Self {
        self.reservation_ttl_ms = ttl_ms;
        self
    }

    /// Select and reserve tokens of `owner` totalling at least `amount`
    ///
    /// # Returns
    /// * `Ok(states)` - Tokens now reserved by `lock_id`, in vault order
    /// * `Err(SelectionError::InsufficientBalance)` - The owner does not hold
    ///   enough, or the retries ran out while other locks held the tokens
    pub fn select_tokens(
        &self,
        owner: &PartyKey,
        amount: &Amount,
        lock_id: &LockId,
    ) -> Result<Vec<StateAndRef>, SelectionError> {
        if amount.is_zero() {
            return Err(SelectionError::InvalidAmount(
                "Amount to select must be positive".to_string(),
            ));
        }

        // One selection plus `max_retries` retries
        let attempts = self.config.max_retries.saturating_add(1);
        let mut available = Amount::zero(amount.currency);
        for attempt in 1..=attempts {
            match self.try_select(owner, amount, lock_id)? {
                Attempt::Reserved(states) => {
                    log::debug!(
                        "Reserved {} tokens for {} under {} on attempt {}",
                        states.len(),
                        amount,
                        lock_id,
                        attempt
                    );
                    return Ok(states);
                }
                Attempt::Short(found) => {
                    available = found;
                    // Waiting cannot help when the owner simply holds too little
                    let balance = self.vault.balance(owner, amount.currency)?;
                    if balance.quantity < amount.quantity {
                        return Err(SelectionError::InsufficientBalance {
                            requested: *amount,
                            available: balance,
                        });
                    }
                }
                Attempt::Contended => {
                    log::debug!("Lost reservation race for {} on attempt {}", amount, attempt);
                }
            }

            if attempt < attempts {
                std::thread::sleep(self.backoff(attempt));
            }
        }

        log::warn!(
            "Giving up selecting {} for {} after {} attempts",
            amount,
            owner,
            attempts
        );
        Err(SelectionError::InsufficientBalance {
            requested: *amount,
            available,
        })
    }

    fn try_select(
        &self,
        owner: &PartyKey,
        amount: &Amount,
        lock_id: &LockId,
    ) -> Result<Attempt, StorageError> {
        let criteria = QueryCriteria::unlocked_tokens(*owner, amount.currency);
        let page_size = self.config.page_size.max(1);

        let mut chosen = Vec::new();
        let mut total: u64 = 0;
        let mut page_number = 1;
        'pages: loop {
            let page = self
                .vault
                .query(&criteria, &PageSpecification::new(page_number, page_size))?;
            for state in &page.states {
                total = total.saturating_add(state.state.amount().quantity);
                chosen.push(state.clone());
                if total >= amount.quantity {
                    break 'pages;
                }
            }
            if page.states.is_empty()
                || u64::from(page_number) * u64::from(page_size) >= page.total_states_available
            {
                break;
            }
            page_number += 1;
        }

        if total < amount.quantity {
            return Ok(Attempt::Short(Amount::new(total, amount.currency)));
        }

        let refs: Vec<StateRef> = chosen.iter().map(|s| s.reference).collect();
        if self.vault.try_reserve(lock_id, &refs, self.reservation_ttl_ms)? {
            Ok(Attempt::Reserved(chosen))
        } else {
            Ok(Attempt::Contended)
        }
    }

    /// Jittered exponential backoff: min(base << attempt, cap) scaled by [1, 2)
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_sleep_ms
            .saturating_mul(1u64 << attempt.min(20));
        let capped = base.min(self.config.retry_cap_ms) as f64;
        let jitter: f64 = rand::thread_rng().gen_range(1.0..2.0);
        Duration::from_millis((capped * jitter) as u64)
    }
}
