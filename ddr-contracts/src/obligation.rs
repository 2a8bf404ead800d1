//! Rules for the obligation lifecycle commands.

use crate::violation::{require, Rule, Violation};
use ddr_core::states::{ObligationState, ObligationStatus, ObligationType, TokenState};
use ddr_core::transaction::{Command, TransactionEnvelope};

fn total<'a>(tokens: impl Iterator<Item = &'a TokenState>) -> u128 {
    tokens.map(|t| u128::from(t.amount.quantity)).sum()
}

fn label(obligation_type: ObligationType) -> &'static str {
    match obligation_type {
        ObligationType::Pledge => "pledge",
        ObligationType::Redeem => "redeem",
    }
}

fn single_input_obligation<'a>(
    tx: &'a TransactionEnvelope,
    message: &str,
) -> Result<&'a ObligationState, Violation> {
    let mut obligations = tx.input_obligations();
    match (obligations.next(), obligations.next()) {
        (Some(input), None) => Ok(input),
        _ => Err(Violation::new(Rule::InputCount, message)),
    }
}

fn single_output_obligation<'a>(
    tx: &'a TransactionEnvelope,
    message: &str,
) -> Result<&'a ObligationState, Violation> {
    let mut obligations = tx.output_obligations();
    match (obligations.next(), obligations.next()) {
        (Some(output), None) => Ok(output),
        _ => Err(Violation::new(Rule::OutputCount, message)),
    }
}

fn require_input_request(
    input: &ObligationState,
    expected: ObligationType,
) -> Result<(), Violation> {
    require(
        input.obligation_type == expected,
        Rule::ObligationType,
        &format!("Input obligation should have type {}", expected),
    )?;
    require(
        input.status == ObligationStatus::Request,
        Rule::ObligationStatus,
        "Input obligation should have status REQUEST",
    )
}

fn require_signers(command: &Command, parties: &[&ddr_core::Party], message: &str) -> Result<(), Violation> {
    require(
        parties.iter().all(|p| command.requires(&p.key)),
        Rule::MissingSigner,
        message,
    )
}

/// Checks that `output` is the approved next version of `input`
fn require_approved_copy(input: &ObligationState, output: &ObligationState) -> Result<(), Violation> {
    require(
        input.status.can_transition_to(output.status) && output.status == ObligationStatus::Approved,
        Rule::ObligationStatus,
        "Output obligation should have status APPROVED",
    )?;
    require(
        input.external_id == output.external_id,
        Rule::ObligationMismatch,
        "Input and output obligation should have same external id",
    )?;
    require(
        input.same_except_status(output),
        Rule::ObligationMismatch,
        "Input and output obligation should have same attributes except status",
    )
}

/// RequestPledge / RequestRedeem
pub(crate) fn verify_request(tx: &TransactionEnvelope, command: &Command) -> Result<(), Violation> {
    let Some(expected) = command.kind.obligation_type() else {
        return Ok(());
    };
    let what = label(expected);

    require(
        tx.inputs.is_empty(),
        Rule::InputCount,
        &format!("No inputs should be consumed when requesting a {}", what),
    )?;
    require(
        tx.outputs.len() == 1,
        Rule::OutputCount,
        &format!("Only 1 output obligation should be created when requesting a {}", what),
    )?;
    let output = single_output_obligation(
        tx,
        &format!("Only 1 output obligation should be created when requesting a {}", what),
    )?;
    require(
        output.obligation_type == expected,
        Rule::ObligationType,
        &format!("Output obligation should have type {} when requesting a {}", expected, what),
    )?;
    require(
        output.status == ObligationStatus::Request,
        Rule::ObligationStatus,
        &format!("Output obligation should have status REQUEST when requesting a {}", what),
    )?;
    require_signers(
        command,
        &[&output.requester, &output.issuer],
        "Requester and issuer should sign an obligation request",
    )
}

/// ApprovePledge: approve the obligation and mint its amount in tokens
pub(crate) fn verify_approve_pledge(
    tx: &TransactionEnvelope,
    command: &Command,
) -> Result<(), Violation> {
    let output = single_output_obligation(
        tx,
        "1 output obligation must be created when approving a pledge",
    )?;
    require(
        tx.inputs.len() == 1,
        Rule::InputCount,
        "1 input obligation should be consumed when approving a pledge",
    )?;
    let input = single_input_obligation(
        tx,
        "1 input obligation should be consumed when approving a pledge",
    )?;
    require_input_request(input, ObligationType::Pledge)?;
    require_approved_copy(input, output)?;

    let minted: Vec<&TokenState> = tx.output_tokens().collect();
    require(
        tx.outputs.len() == 1 + minted.len(),
        Rule::OutputCount,
        "Only the approved obligation and minted tokens may be created when approving a pledge",
    )?;
    require(
        !minted.is_empty(),
        Rule::MintedAmount,
        "Tokens should be minted when approving a pledge",
    )?;
    require(
        minted.iter().all(|t| {
            t.issuer == input.issuer
                && t.owner == input.owner
                && t.amount.currency == input.amount.currency
        }),
        Rule::MintedTokenAttributes,
        "Minted tokens should be issued by the obligation issuer to its owner in its currency",
    )?;
    require(
        total(minted.into_iter()) == u128::from(input.amount.quantity),
        Rule::MintedAmount,
        "Pledged amount should be equal to total amount of minted tokens",
    )?;
    require_signers(
        command,
        &[&input.issuer, &input.owner],
        "Issuer and owner should sign a pledge approval",
    )
}

/// ApproveRedeem: approve the obligation and burn its amount of the owner's tokens
pub(crate) fn verify_approve_redeem(
    tx: &TransactionEnvelope,
    command: &Command,
) -> Result<(), Violation> {
    let output = single_output_obligation(
        tx,
        "1 output obligation must be created when approving a redeem",
    )?;
    let input = single_input_obligation(
        tx,
        "1 input obligation should be consumed when approving a redeem",
    )?;
    require_input_request(input, ObligationType::Redeem)?;
    require_approved_copy(input, output)?;

    let consumed: Vec<&TokenState> = tx.input_tokens().collect();
    require(
        tx.inputs.len() == 1 + consumed.len(),
        Rule::InputCount,
        "Only the obligation and redeemed tokens may be consumed when approving a redeem",
    )?;
    require(
        consumed.iter().all(|t| {
            t.owner == input.owner
                && t.issuer == input.issuer
                && t.amount.currency == input.amount.currency
        }),
        Rule::RedeemedTokenAttributes,
        "Redeemed tokens should be owned by the obligation owner and issued by its issuer",
    )?;

    let change: Vec<&TokenState> = tx.output_tokens().collect();
    require(
        tx.outputs.len() == 1 + change.len(),
        Rule::OutputCount,
        "Only the approved obligation and change may be created when approving a redeem",
    )?;
    require(
        change.len() <= 1
            && change.iter().all(|t| {
                t.owner == input.owner
                    && t.issuer == input.issuer
                    && t.amount.currency == input.amount.currency
            }),
        Rule::ChangeOutput,
        "At most one change token owned by the redeeming bank may be created",
    )?;

    let consumed_total = total(consumed.into_iter());
    let change_total = total(change.into_iter());
    require(
        consumed_total >= change_total
            && consumed_total - change_total == u128::from(input.amount.quantity),
        Rule::RedeemedAmount,
        "Redeemed amount should be equal to total amount of consumed tokens minus change",
    )?;
    require_signers(
        command,
        &[&input.issuer, &input.owner],
        "Issuer and owner should sign a redeem approval",
    )
}

/// Deny* / Cancel*: consume a requested obligation without replacing it
pub(crate) fn verify_terminate(tx: &TransactionEnvelope, command: &Command) -> Result<(), Violation> {
    let Some(expected) = command.kind.obligation_type() else {
        return Ok(());
    };
    let what = label(expected);

    require(
        tx.outputs.is_empty(),
        Rule::OutputCount,
        &format!("No outputs must be created when denying or canceling a {}", what),
    )?;
    require(
        tx.inputs.len() == 1,
        Rule::InputCount,
        &format!(
            "Only 1 input obligation should be consumed when denying or canceling a {}",
            what
        ),
    )?;
    let input = single_input_obligation(
        tx,
        &format!(
            "Only 1 input obligation should be consumed when denying or canceling a {}",
            what
        ),
    )?;
    require_input_request(input, expected)?;
    require_signers(
        command,
        &[&input.requester, &input.issuer],
        "Requester and issuer should sign when denying or canceling an obligation",
    )
}
