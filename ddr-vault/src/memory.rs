use crate::storage_traits::{LockFilter, Page, PageSpecification, QueryCriteria, StateStatus, VaultStorage};
use ddr_core::error::StorageError;
use ddr_core::id::{LockId, StateRef, TxId};
use ddr_core::locks::{current_time_millis, ReservationInfo, SoftLockManager};
use ddr_core::states::StateAndRef;
use ddr_core::transaction::SignedTransaction;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct StoredState {
    state: StateAndRef,
    consumed_by: Option<TxId>,
}

#[derive(Debug, Default)]
struct VaultTables {
    /// States in recording order
    states: Vec<StoredState>,
    index: HashMap<StateRef, usize>,
    transactions: HashMap<TxId, SignedTransaction>,
    reservations: HashMap<StateRef, ReservationInfo>,
}

impl VaultTables {
    fn live_reservation(&self, state_ref: &StateRef, now: u64) -> Option<&ReservationInfo> {
        self.reservations
            .get(state_ref)
            .filter(|info| !info.is_expired(now))
    }

    fn matches(&self, stored: &StoredState, criteria: &QueryCriteria, now: u64) -> bool {
        let state = &stored.state.state;
        let status_ok = match criteria.state_status {
            StateStatus::Unconsumed => stored.consumed_by.is_none(),
            StateStatus::Consumed => stored.consumed_by.is_some(),
            StateStatus::All => true,
        };
        let lock_ok = match criteria.lock_filter {
            LockFilter::Any => true,
            LockFilter::UnlockedOnly => self.live_reservation(&stored.state.reference, now).is_none(),
            LockFilter::HeldBy(lock_id) => self
                .live_reservation(&stored.state.reference, now)
                .map(|info| info.lock_id == lock_id)
                .unwrap_or(false),
        };
        status_ok
            && lock_ok
            && criteria.kind.map_or(true, |k| state.kind() == k)
            && criteria.owner.map_or(true, |o| state.owner().key == o)
            && criteria.currency.map_or(true, |c| state.amount().currency == c)
            && criteria
                .external_id
                .as_deref()
                .map_or(true, |e| state.external_id() == Some(e))
            && criteria
                .obligation_status
                .map_or(true, |s| state.obligation_status() == Some(s))
    }
}

/// Vault kept entirely in memory
///
/// Useful for tests and for nodes that rebuild their view from peers.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    tables: Mutex<VaultTables>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, VaultTables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Other("Vault mutex poisoned".to_string()))
    }
}

impl VaultStorage for InMemoryVault {
    fn record_transaction(&self, tx: &SignedTransaction) -> Result<bool, StorageError> {
        let mut guard = self.tables()?;
        let tables = &mut *guard;
        let id = tx.id();
        if tables.transactions.contains_key(&id) {
            return Ok(false);
        }

        for input in &tx.envelope().inputs {
            if let Some(&pos) = tables.index.get(&input.reference) {
                tables.states[pos].consumed_by = Some(id);
            }
            tables.reservations.remove(&input.reference);
        }
        for output in tx.output_states() {
            if tables.index.contains_key(&output.reference) {
                continue;
            }
            let pos = tables.states.len();
            tables.index.insert(output.reference, pos);
            tables.states.push(StoredState {
                state: output,
                consumed_by: None,
            });
        }
        tables.transactions.insert(id, tx.clone());
        log::debug!("Recorded transaction {} in memory vault", id);
        Ok(true)
    }

    fn get_transaction(&self, id: &TxId) -> Result<Option<SignedTransaction>, StorageError> {
        Ok(self.tables()?.transactions.get(id).cloned())
    }

    fn get_state(&self, state_ref: &StateRef) -> Result<Option<StateAndRef>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .index
            .get(state_ref)
            .map(|&pos| tables.states[pos].state.clone()))
    }

    fn consumed_by(&self, state_ref: &StateRef) -> Result<Option<TxId>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .index
            .get(state_ref)
            .and_then(|&pos| tables.states[pos].consumed_by))
    }

    fn query(&self, criteria: &QueryCriteria, page: &PageSpecification) -> Result<Page, StorageError> {
        let tables = self.tables()?;
        let now = current_time_millis();
        let matching: Vec<&StoredState> = tables
            .states
            .iter()
            .filter(|s| tables.matches(s, criteria, now))
            .collect();
        let states = matching
            .iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .map(|s| s.state.clone())
            .collect();
        Ok(Page {
            states,
            total_states_available: matching.len() as u64,
        })
    }

    fn mark_consumed(&self, refs: &[StateRef], consumed_by: &TxId) -> Result<usize, StorageError> {
        let mut guard = self.tables()?;
        let tables = &mut *guard;
        let mut count = 0;
        for r in refs {
            if let Some(&pos) = tables.index.get(r) {
                if tables.states[pos].consumed_by.is_none() {
                    tables.states[pos].consumed_by = Some(*consumed_by);
                    count += 1;
                }
            }
            tables.reservations.remove(r);
        }
        Ok(count)
    }
}

impl SoftLockManager for InMemoryVault {
    fn try_reserve(
        &self,
        lock_id: &LockId,
        refs: &[StateRef],
        timeout_ms: Option<u64>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables()?;
        let now = current_time_millis();

        for r in refs {
            let spendable = tables
                .index
                .get(r)
                .map(|&pos| tables.states[pos].consumed_by.is_none())
                .unwrap_or(false);
            if !spendable {
                return Ok(false);
            }
            if let Some(info) = tables.live_reservation(r, now) {
                if info.lock_id != *lock_id {
                    return Ok(false);
                }
            }
        }

        for r in refs {
            tables.reservations.insert(
                *r,
                ReservationInfo {
                    state_ref: *r,
                    lock_id: *lock_id,
                    acquired_at: now,
                    timeout_ms,
                },
            );
        }
        Ok(true)
    }

    fn release(&self, lock_id: &LockId, refs: Option<&[StateRef]>) -> Result<usize, StorageError> {
        let mut tables = self.tables()?;
        let before = tables.reservations.len();
        tables.reservations.retain(|r, info| {
            info.lock_id != *lock_id || refs.map(|refs| !refs.contains(r)).unwrap_or(false)
        });
        Ok(before - tables.reservations.len())
    }

    fn reservation_info(&self, state_ref: &StateRef) -> Result<Option<ReservationInfo>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .live_reservation(state_ref, current_time_millis())
            .cloned())
    }

    fn reservations_for(&self, lock_id: &LockId) -> Result<Vec<ReservationInfo>, StorageError> {
        let tables = self.tables()?;
        let now = current_time_millis();
        Ok(tables
            .reservations
            .values()
            .filter(|info| info.lock_id == *lock_id && !info.is_expired(now))
            .cloned()
            .collect())
    }

    fn cleanup_expired_reservations(&self) -> Result<usize, StorageError> {
        let mut tables = self.tables()?;
        let now = current_time_millis();
        let before = tables.reservations.len();
        tables.reservations.retain(|_, info| !info.is_expired(now));
        Ok(before - tables.reservations.len())
    }

    fn release_all(&self) -> Result<usize, StorageError> {
        let mut tables = self.tables()?;
        let count = tables.reservations.len();
        tables.reservations.clear();
        Ok(count)
    }
}
