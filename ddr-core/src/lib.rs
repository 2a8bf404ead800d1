pub mod amount;
pub mod config;
pub mod error;
pub mod id;
pub mod identity;
pub mod locks;
pub mod states;
pub mod transaction;

// Re-export the main types for convenience
pub use amount::{Amount, AmountError, Currency};
pub use config::{ConfigError, LedgerConfig, SelectorConfig};
pub use error::{SignatureError, StorageError};
pub use id::{generate_reference, LineageId, LockId, StateRef, TxId};
pub use identity::{KeyPair, Party, PartyKey};
pub use locks::{current_time_millis, ReservationGuard, ReservationInfo, SoftLockManager};
pub use states::{
    bank_code, LedgerState, ObligationState, ObligationStatus, ObligationType, StateAndRef,
    StateKind, TokenState, TransferRecord,
};
pub use transaction::{
    Command, CommandKind, SignedTransaction, TransactionEnvelope, TransactionSignature,
};
