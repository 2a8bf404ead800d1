use crate::network::NetworkError;
use ddr_contracts::Violation;
use ddr_core::amount::{Amount, AmountError};
use ddr_core::error::{SignatureError, StorageError};
use ddr_core::id::TxId;
use ddr_notary::StateConflict;
use ddr_vault::SelectionError;
use thiserror::Error;

/// Failures surfaced by ledger operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// The transaction broke a contract rule; never retried
    #[error(transparent)]
    VerificationViolation(#[from] Violation),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Amount, available: Amount },

    #[error("{party} refused to sign: {reason}")]
    CounterpartyRefusal { party: String, reason: String },

    /// Another transaction consumed some of the inputs first
    #[error("Lost a double-spend race on {} input(s)", .conflicts.len())]
    ConsensusConflict { conflicts: Vec<StateConflict> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External id {0} is already in use")]
    DuplicateExternalId(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The flow is checkpointed when `tx_id` is set
    #[error("Counterparty {party} is unreachable")]
    CounterpartyUnreachable { party: String, tx_id: Option<TxId> },

    #[error("Notarisation of {tx_id} is pending: {reason}")]
    NotarisationPending { tx_id: TxId, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FlowError {
    /// True when the flow was checkpointed and can be resumed
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            FlowError::NotarisationPending { .. }
                | FlowError::CounterpartyUnreachable { tx_id: Some(_), .. }
        )
    }

    /// Id of the checkpointed transaction, if any
    pub fn pending_tx(&self) -> Option<TxId> {
        match self {
            FlowError::NotarisationPending { tx_id, .. } => Some(*tx_id),
            FlowError::CounterpartyUnreachable { tx_id, .. } => *tx_id,
            _ => None,
        }
    }
}

impl From<SelectionError> for FlowError {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::InsufficientBalance { requested, available } => {
                FlowError::InsufficientBalance { requested, available }
            }
            SelectionError::InvalidAmount(message) => FlowError::InvalidArgument(message),
            SelectionError::Storage(e) => FlowError::Storage(e),
        }
    }
}

impl From<AmountError> for FlowError {
    fn from(e: AmountError) -> Self {
        FlowError::InvalidArgument(e.to_string())
    }
}

impl From<SignatureError> for FlowError {
    fn from(e: SignatureError) -> Self {
        FlowError::Protocol(e.to_string())
    }
}

impl From<NetworkError> for FlowError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Unreachable(party) => FlowError::CounterpartyUnreachable {
                party,
                tx_id: None,
            },
            other => FlowError::Protocol(other.to_string()),
        }
    }
}
