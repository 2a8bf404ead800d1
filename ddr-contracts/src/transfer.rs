//! Rules for inter-bank exchanges and intra-bank transfer records.

use crate::violation::{require, Rule, Violation};
use ddr_core::states::{TokenState, TransferRecord};
use ddr_core::transaction::{Command, TransactionEnvelope};
use ddr_core::Party;

fn total_owned_by<'a>(tokens: impl Iterator<Item = &'a TokenState>, owner: &Party) -> u128 {
    tokens
        .filter(|t| t.owner == *owner)
        .map(|t| u128::from(t.amount.quantity))
        .sum()
}

fn single_output_transfer<'a>(
    tx: &'a TransactionEnvelope,
    message: &str,
) -> Result<&'a TransferRecord, Violation> {
    let mut records = tx.output_transfers();
    match (records.next(), records.next()) {
        (Some(record), None) => Ok(record),
        _ => Err(Violation::new(Rule::OutputCount, message)),
    }
}

/// BankTransfer: atomic exchange of tokens between two banks
pub(crate) fn verify_bank_transfer(
    tx: &TransactionEnvelope,
    command: &Command,
) -> Result<(), Violation> {
    require(
        tx.input_transfers().next().is_none(),
        Rule::InputCount,
        "No transfer record should be consumed in a transfer",
    )?;
    let record = single_output_transfer(
        tx,
        "Exactly 1 transfer record should be created in a transfer",
    )?;
    let Some(receiver_bank) = record.receiver_bank.as_ref() else {
        return Err(Violation::new(
            Rule::TransferBanks,
            "An interbank transfer should name a receiver bank",
        ));
    };

    let consumed: Vec<&TokenState> = tx.input_tokens().collect();
    let produced: Vec<&TokenState> = tx.output_tokens().collect();
    require(
        !consumed.is_empty(),
        Rule::InputCount,
        "Tokens should be consumed in an atomic exchange",
    )?;
    require(
        !produced.is_empty(),
        Rule::OutputCount,
        "Tokens should be created in an atomic exchange",
    )?;
    require(
        tx.inputs.len() == consumed.len(),
        Rule::InputCount,
        "Only tokens may be consumed in an atomic exchange",
    )?;
    require(
        tx.outputs.len() == produced.len() + 1,
        Rule::OutputCount,
        "Only tokens and the transfer record may be created in an atomic exchange",
    )?;
    require(
        *receiver_bank != record.sender_bank,
        Rule::TransferBanks,
        "Sender and receiver banks should be different in an interbank transfer",
    )?;
    require(
        record.ribs_differ(),
        Rule::TransferRibs,
        "Sender and receiver accounts should be different in an interbank transfer",
    )?;
    require(
        consumed.iter().all(|t| t.owner == record.sender_bank),
        Rule::TokenOwnership,
        "All consumed tokens should be owned by the sender bank",
    )?;
    require(
        produced
            .iter()
            .all(|t| t.owner == record.sender_bank || t.owner == *receiver_bank),
        Rule::TokenOwnership,
        "Created tokens should be owned by the sender or the receiver bank",
    )?;
    require(
        produced
            .iter()
            .all(|t| consumed.iter().any(|c| c.issuer == t.issuer)),
        Rule::TokenOwnership,
        "Created tokens should keep the issuer of the consumed tokens",
    )?;
    require(
        consumed
            .iter()
            .chain(produced.iter())
            .all(|t| t.amount.currency == record.amount.currency),
        Rule::TokenCurrency,
        "All tokens should be in the currency of the transfer",
    )?;

    let amount = u128::from(record.amount.quantity);
    let sent = total_owned_by(consumed.iter().copied(), &record.sender_bank);
    require(
        sent >= amount,
        Rule::InsufficientConsumed,
        "Sender bank should consume sufficient tokens in an interbank transfer",
    )?;
    require(
        total_owned_by(produced.iter().copied(), receiver_bank) == amount,
        Rule::ReceiverAmount,
        "Receiver bank should own created tokens equal to the transfer amount in an interbank transfer",
    )?;
    require(
        total_owned_by(produced.iter().copied(), &record.sender_bank) == sent - amount,
        Rule::SenderChange,
        "Sender bank should own created tokens equal to the rest in an interbank transfer",
    )?;

    require(
        command.requires(&record.sender_bank.key) && command.requires(&receiver_bank.key),
        Rule::MissingSigner,
        "Sender and receiver banks should sign an interbank transfer",
    )?;
    require(
        consumed.iter().all(|t| command.requires(&t.issuer.key)),
        Rule::MissingSigner,
        "Token issuer should sign an interbank transfer",
    )
}

/// RecordTransfer: register an intra-bank transfer
pub(crate) fn verify_record_transfer(
    tx: &TransactionEnvelope,
    command: &Command,
) -> Result<(), Violation> {
    require(
        tx.inputs.is_empty(),
        Rule::InputCount,
        "Recording an intra-bank transfer should not consume any inputs",
    )?;
    require(
        tx.outputs.len() == 1,
        Rule::OutputCount,
        "Recording an intra-bank transfer should have one output that is a transfer record",
    )?;
    let record = single_output_transfer(
        tx,
        "Recording an intra-bank transfer should have one output that is a transfer record",
    )?;
    require(
        record.receiver_bank.is_none(),
        Rule::TransferBanks,
        "An intra-bank transfer should not name a receiver bank",
    )?;
    require(
        record.ribs_differ(),
        Rule::TransferRibs,
        "Intra-bank transfer should have different sender and receiver",
    )?;
    require(
        command.requires(&record.sender_bank.key),
        Rule::MissingSigner,
        "Concerned bank should be signer of the intra-bank transfer",
    )
}

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use crate::violation::Rule;
    use crate::verify;
    use ddr_core::transaction::{Command, CommandKind, TransactionEnvelope};

    /// Sender BankA spends `consumed`, BankB receives `received`, BankA keeps `change`
    fn exchange(a: &Actors, amount: u64, consumed: &[u64], received: &[u64], change: &[u64]) -> TransactionEnvelope {
        let mut tx = envelope(a);
        for (i, q) in consumed.iter().enumerate() {
            tx.inputs.push(input(token(a, &a.bank_a, *q), i as u32));
        }
        tx.outputs.push(inter_bank_record(a, amount).into());
        for q in received {
            tx.outputs.push(token(a, &a.bank_b, *q).into());
        }
        for q in change {
            tx.outputs.push(token(a, &a.bank_a, *q).into());
        }
        tx.commands.push(Command::new(
            CommandKind::BankTransfer,
            [&a.bank_a, &a.bank_b, &a.central_bank],
        ));
        tx
    }

    #[test]
    fn test_exchange_with_change_verifies() {
        let a = actors();
        assert!(verify(&exchange(&a, 1000, &[700, 500], &[1000], &[200])).is_ok());
        assert!(verify(&exchange(&a, 1200, &[700, 500], &[700, 500], &[])).is_ok());
    }

    #[test]
    fn test_conservation_rules() {
        let a = actors();

        let violation = verify(&exchange(&a, 1300, &[700, 500], &[1200], &[])).unwrap_err();
        assert_eq!(violation.rule, Rule::InsufficientConsumed);

        let violation = verify(&exchange(&a, 1000, &[700, 500], &[900], &[300])).unwrap_err();
        assert_eq!(violation.rule, Rule::ReceiverAmount);

        // Sender keeps too little change: value destroyed
        let violation = verify(&exchange(&a, 1000, &[700, 500], &[1000], &[100])).unwrap_err();
        assert_eq!(violation.rule, Rule::SenderChange);

        // Sender keeps too much change: value created
        let violation = verify(&exchange(&a, 1000, &[700, 500], &[1000], &[300])).unwrap_err();
        assert_eq!(violation.rule, Rule::SenderChange);
    }

    #[test]
    fn test_structural_rules() {
        let a = actors();

        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        tx.inputs.clear();
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::InputCount);

        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        tx.outputs.push(inter_bank_record(&a, 1000).into());
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::OutputCount);

        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        tx.outputs[0] = intra_bank_record(&a, 1000).into();
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::TransferBanks);
    }

    #[test]
    fn test_banks_and_ribs_must_differ() {
        let a = actors();

        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        let mut record = inter_bank_record(&a, 1000);
        record.receiver_rib = record.sender_rib.to_lowercase();
        tx.outputs[0] = record.into();
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::TransferRibs);

        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        let mut record = inter_bank_record(&a, 1000);
        record.receiver_bank = Some(a.bank_a.clone());
        tx.outputs[0] = record.into();
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::TransferBanks);
    }

    #[test]
    fn test_consumed_tokens_belong_to_sender() {
        let a = actors();
        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        tx.inputs.push(input(token(&a, &a.bank_b, 50), 9));
        tx.outputs.push(token(&a, &a.bank_b, 50).into());

        assert_eq!(verify(&tx).unwrap_err().rule, Rule::TokenOwnership);
    }

    #[test]
    fn test_issuer_must_sign() {
        let a = actors();
        let mut tx = exchange(&a, 1000, &[1000], &[1000], &[]);
        tx.commands[0] = Command::new(CommandKind::BankTransfer, [&a.bank_a, &a.bank_b]);

        let violation = verify(&tx).unwrap_err();
        assert_eq!(violation.rule, Rule::MissingSigner);
    }

    #[test]
    fn test_record_transfer() {
        let a = actors();
        let mut tx = envelope(&a);
        tx.outputs.push(intra_bank_record(&a, 5000).into());
        tx.commands.push(Command::new(
            CommandKind::RecordTransfer,
            [&a.bank_a, &a.central_bank],
        ));
        assert!(verify(&tx).is_ok());

        // The owning bank must sign
        tx.commands[0] = Command::new(CommandKind::RecordTransfer, [&a.central_bank]);
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::MissingSigner);

        // Same account on both sides
        let mut tx = envelope(&a);
        let mut record = intra_bank_record(&a, 5000);
        record.receiver_rib = record.sender_rib.clone();
        tx.outputs.push(record.into());
        tx.commands.push(Command::new(CommandKind::RecordTransfer, [&a.bank_a]));
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::TransferRibs);

        // Inputs are refused
        let mut tx = envelope(&a);
        tx.inputs.push(input(token(&a, &a.bank_a, 10), 0));
        tx.outputs.push(intra_bank_record(&a, 5000).into());
        tx.commands.push(Command::new(CommandKind::RecordTransfer, [&a.bank_a]));
        assert_eq!(verify(&tx).unwrap_err().rule, Rule::InputCount);
    }
}
