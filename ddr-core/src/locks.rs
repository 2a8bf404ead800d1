use crate::error::StorageError;
use crate::id::{LockId, StateRef};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Information about a soft-lock reservation held on an unspent state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    /// The state being reserved
    pub state_ref: StateRef,

    /// The lock that holds this reservation
    pub lock_id: LockId,

    /// When the reservation was acquired (Unix timestamp in milliseconds)
    pub acquired_at: u64,

    /// Optional lifetime of the reservation (in milliseconds)
    pub timeout_ms: Option<u64>,
}

impl ReservationInfo {
    /// Whether the reservation has outlived its timeout at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.timeout_ms {
            Some(timeout) => self.acquired_at.saturating_add(timeout) <= now_ms,
            None => false,
        }
    }
}

/// Helper function to get the current timestamp in milliseconds
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Soft-lock reservations over unspent states
///
/// The reservation table is the single serialisation point for concurrent
/// spenders of the same owner's states.
pub trait SoftLockManager: std::fmt::Debug + Send + Sync {
    /// Reserve every state in `refs` for `lock_id`, or none of them
    ///
    /// # Parameters
    /// * `lock_id` - The lock acquiring the reservations
    /// * `refs` - The states to reserve
    /// * `timeout_ms` - Optional lifetime of the reservations (in milliseconds)
    ///
    /// # Returns
    /// * `Ok(true)` - Every state is now reserved by `lock_id`
    /// * `Ok(false)` - At least one state is consumed, unknown or reserved by another
    ///   live lock; nothing was reserved
    /// * `Err` - The backend failed
    fn try_reserve(
        &self,
        lock_id: &LockId,
        refs: &[StateRef],
        timeout_ms: Option<u64>,
    ) -> Result<bool, StorageError>;

    /// Release reservations held by `lock_id`
    ///
    /// # Parameters
    /// * `lock_id` - The lock releasing its reservations
    /// * `refs` - Only release these states, or every state of the lock when `None`
    ///
    /// # Returns
    /// * `Ok(count)` - Number of reservations released
    fn release(&self, lock_id: &LockId, refs: Option<&[StateRef]>) -> Result<usize, StorageError>;

    /// Get the live reservation on a state, if any
    fn reservation_info(&self, state_ref: &StateRef) -> Result<Option<ReservationInfo>, StorageError>;

    /// Get all live reservations held by a lock
    fn reservations_for(&self, lock_id: &LockId) -> Result<Vec<ReservationInfo>, StorageError>;

    /// Remove expired reservations
    ///
    /// # Returns
    /// * `Ok(count)` - Number of expired reservations removed
    fn cleanup_expired_reservations(&self) -> Result<usize, StorageError>;

    /// Remove every reservation, whatever lock holds it
    ///
    /// Only safe when no live flow owns a lock, e.g. when a node starts.
    fn release_all(&self) -> Result<usize, StorageError>;
}

/// Guard over a set of reservations that releases them when dropped
///
/// Call [`ReservationGuard::disarm`] once the reserved states are handed to
/// a committed transaction or to a checkpoint that will release them later.
#[derive(Debug)]
pub struct ReservationGuard<'a, M: SoftLockManager + ?Sized> {
    /// The lock holding the reservations
    lock_id: LockId,

    /// The reserved states
    refs: Vec<StateRef>,

    /// Reference to the lock manager
    manager: &'a M,

    /// Whether the reservations are still owned by this guard
    armed: bool,
}

impl<'a, M: SoftLockManager + ?Sized> ReservationGuard<'a, M> {
    /// Reserve `refs` for `lock_id` and guard them
    ///
    /// Returns `Ok(None)` when the reservation could not be taken.
    pub fn acquire(
        manager: &'a M,
        lock_id: LockId,
        refs: Vec<StateRef>,
        timeout_ms: Option<u64>,
    ) -> Result<Option<Self>, StorageError> {
        if !manager.try_reserve(&lock_id, &refs, timeout_ms)? {
            return Ok(None);
        }
        Ok(Some(Self::adopt(manager, lock_id, refs)))
    }

    /// Guard reservations that are already held by `lock_id`
    pub fn adopt(manager: &'a M, lock_id: LockId, refs: Vec<StateRef>) -> Self {
        Self {
            lock_id,
            refs,
            manager,
            armed: true,
        }
    }

    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    pub fn refs(&self) -> &[StateRef] {
        &self.refs
    }

    /// Stop guarding; the reservations stay held
    pub fn disarm(mut self) -> (LockId, Vec<StateRef>) {
        self.armed = false;
        (self.lock_id, std::mem::take(&mut self.refs))
    }

    /// Explicitly release the reservations
    pub fn release(mut self) -> Result<usize, StorageError> {
        self.armed = false;
        self.manager.release(&self.lock_id, Some(&self.refs))
    }
}

impl<'a, M: SoftLockManager + ?Sized> Drop for ReservationGuard<'a, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.manager.release(&self.lock_id, Some(&self.refs)) {
            log::warn!(
                "Failed to release {} reservations for {}: {}",
                self.refs.len(),
                self.lock_id,
                e
            );
        }
    }
}
