//! Obligation lifecycle
//!
//! `Request -> {Approved, Rejected, Canceled}`. Denied and canceled
//! obligations leave no successor state, so their terminal status is derived
//! from the command of the transaction that consumed them.

use crate::error::FlowError;
use ddr_core::states::{ObligationState, ObligationStatus};
use ddr_core::transaction::CommandKind;

/// Who starts a lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Issuer,
    Requester,
}

/// Status an obligation holds after `kind` has been applied to it
pub fn status_after(kind: CommandKind) -> Option<ObligationStatus> {
    match kind {
        CommandKind::RequestPledge | CommandKind::RequestRedeem => Some(ObligationStatus::Request),
        CommandKind::ApprovePledge | CommandKind::ApproveRedeem => {
            Some(ObligationStatus::Approved)
        }
        CommandKind::DenyPledge | CommandKind::DenyRedeem => Some(ObligationStatus::Rejected),
        CommandKind::CancelPledge | CommandKind::CancelRedeem => Some(ObligationStatus::Canceled),
        CommandKind::BankTransfer | CommandKind::RecordTransfer => None,
    }
}

/// The party expected to start `kind`
pub fn initiator_of(kind: CommandKind) -> Option<Initiator> {
    if kind.is_approve() || kind.is_deny() {
        Some(Initiator::Issuer)
    } else if kind.is_request() || kind.is_cancel() {
        Some(Initiator::Requester)
    } else {
        None
    }
}

/// Check that `obligation` may move through `kind`
///
/// Mirrors the contract rules so callers can fail before building anything.
pub fn check_transition(
    obligation: &ObligationState,
    kind: CommandKind,
) -> Result<ObligationStatus, FlowError> {
    let Some(next) = status_after(kind) else {
        return Err(FlowError::InvalidArgument(format!(
            "{} is not an obligation command",
            kind
        )));
    };
    if kind.obligation_type() != Some(obligation.obligation_type) {
        return Err(FlowError::InvalidArgument(format!(
            "{} cannot apply to a {} obligation",
            kind, obligation.obligation_type
        )));
    }
    if !obligation.status.can_transition_to(next) {
        return Err(FlowError::InvalidArgument(format!(
            "Obligation {} cannot move from {} to {}",
            obligation.external_id, obligation.status, next
        )));
    }
    Ok(next)
}

/// Status of the last known version of a lineage
///
/// `consumed_by` is the primary command of the transaction that consumed it.
pub fn derive_status(
    latest: &ObligationState,
    consumed_by: Option<CommandKind>,
) -> ObligationStatus {
    match consumed_by.and_then(status_after) {
        Some(status)
            if status != ObligationStatus::Approved && latest.status.can_transition_to(status) =>
        {
            status
        }
        _ => latest.status,
    }
}
