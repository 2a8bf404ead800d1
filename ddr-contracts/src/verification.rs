//! Transaction-level checks and per-command dispatch

use crate::obligation;
use crate::transfer;
use crate::violation::{require, Rule, Violation};
use ddr_core::states::LedgerState;
use ddr_core::transaction::{Command, CommandKind, TransactionEnvelope};

/// Verify a transaction against every contract rule
///
/// Stops at the first violated rule.
pub fn verify(tx: &TransactionEnvelope) -> Result<(), Violation> {
    verify_envelope(tx)?;
    for command in &tx.commands {
        verify_command(tx, command)?;
    }
    Ok(())
}

/// Verify every command independently and report one violation per failing check
///
/// The first entry, if any, comes from the transaction-level rules.
pub fn verify_all(tx: &TransactionEnvelope) -> Vec<Violation> {
    let mut violations = Vec::new();
    if let Err(violation) = verify_envelope(tx) {
        violations.push(violation);
    }
    for command in &tx.commands {
        if let Err(violation) = verify_command(tx, command) {
            violations.push(violation);
        }
    }
    violations
}

fn kind_label(state: &LedgerState) -> &'static str {
    state.kind().as_str()
}

/// Rules that hold for every transaction regardless of its commands
fn verify_envelope(tx: &TransactionEnvelope) -> Result<(), Violation> {
    require(
        !tx.commands.is_empty(),
        Rule::NoCommands,
        "A transaction should carry at least one command",
    )?;

    let states = tx
        .inputs
        .iter()
        .map(|i| &i.state)
        .chain(tx.outputs.iter());
    for state in states {
        require(
            state.amount().quantity > 0,
            Rule::NonPositiveAmount,
            &format!("Amount of {} state must be positive", kind_label(state)),
        )?;
    }

    let signers = tx.required_signers();
    for input in &tx.inputs {
        if matches!(input.state, LedgerState::Transfer(_)) {
            continue;
        }
        let owner = input.state.owner();
        require(
            signers.contains(&owner.key),
            Rule::MissingOwnerSignature,
            &format!(
                "Owner {} of consumed {} state {} should be a required signer",
                owner,
                kind_label(&input.state),
                input.reference
            ),
        )?;
    }
    Ok(())
}

fn verify_command(tx: &TransactionEnvelope, command: &Command) -> Result<(), Violation> {
    log::debug!("Verifying {} command", command.kind);
    match command.kind {
        CommandKind::RequestPledge | CommandKind::RequestRedeem => {
            obligation::verify_request(tx, command)
        }
        CommandKind::ApprovePledge => obligation::verify_approve_pledge(tx, command),
        CommandKind::ApproveRedeem => obligation::verify_approve_redeem(tx, command),
        CommandKind::DenyPledge
        | CommandKind::CancelPledge
        | CommandKind::DenyRedeem
        | CommandKind::CancelRedeem => obligation::verify_terminate(tx, command),
        CommandKind::BankTransfer => transfer::verify_bank_transfer(tx, command),
        CommandKind::RecordTransfer => transfer::verify_record_transfer(tx, command),
    }
}
