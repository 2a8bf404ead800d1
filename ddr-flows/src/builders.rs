//! Transaction builders, one per ledger operation
//!
//! Builders only assemble envelopes. Token selection and reservation happen
//! before a builder is called; verification happens when the signing session
//! starts, or explicitly through [`TransactionBuilder::verify`].

use crate::error::FlowError;
use chrono::{DateTime, Utc};
use ddr_contracts::Violation;
use ddr_core::amount::Amount;
use ddr_core::id::{LineageId, LockId};
use ddr_core::identity::Party;
use ddr_core::states::{
    LedgerState, ObligationState, ObligationStatus, ObligationType, StateAndRef, TokenState,
    TransferRecord,
};
use ddr_core::transaction::{Command, CommandKind, TransactionEnvelope};

/// An envelope under construction together with the lock of its reserved inputs
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    envelope: TransactionEnvelope,
    lock_id: LockId,
}

impl TransactionBuilder {
    pub fn new(notary: Party) -> Self {
        Self {
            envelope: TransactionEnvelope::new(notary),
            lock_id: LockId::new(),
        }
    }

    pub fn with_lock_id(mut self, lock_id: LockId) -> Self {
        self.lock_id = lock_id;
        self
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    pub fn add_input(&mut self, state: StateAndRef) -> &mut Self {
        self.envelope.inputs.push(state);
        self
    }

    pub fn add_output(&mut self, state: impl Into<LedgerState>) -> &mut Self {
        self.envelope.outputs.push(state.into());
        self
    }

    pub fn add_command(&mut self, kind: CommandKind, signers: &[&Party]) -> &mut Self {
        self.envelope
            .commands
            .push(Command::new(kind, signers.iter().copied()));
        self
    }

    pub fn envelope(&self) -> &TransactionEnvelope {
        &self.envelope
    }

    /// Run every contract rule over the envelope built so far
    pub fn verify(&self) -> Result<(), Violation> {
        ddr_contracts::verify(&self.envelope)
    }

    pub fn into_envelope(self) -> TransactionEnvelope {
        self.envelope
    }
}

/// What a bank asks the issuer for
#[derive(Debug, Clone)]
pub struct ObligationRequest {
    pub issuer: Party,
    pub requester: Party,
    pub amount: Amount,
    pub obligation_type: ObligationType,
    pub external_id: String,
    pub request_date: DateTime<Utc>,
}

fn obligation_of(state: &StateAndRef) -> Result<&ObligationState, FlowError> {
    state.state.as_obligation().ok_or_else(|| {
        FlowError::InvalidArgument(format!("{} is not an obligation", state.reference))
    })
}

fn tokens_of(states: &[StateAndRef]) -> Result<Vec<&TokenState>, FlowError> {
    states
        .iter()
        .map(|s| {
            s.state.as_token().ok_or_else(|| {
                FlowError::InvalidArgument(format!("{} is not a token", s.reference))
            })
        })
        .collect()
}

fn total_quantity(tokens: &[&TokenState]) -> u64 {
    tokens
        .iter()
        .fold(0u64, |acc, t| acc.saturating_add(t.amount.quantity))
}

/// Split `amount` into `ceil(amount / denomination)` tokens of near-equal size
pub fn mint_denominations(amount: &Amount, denomination: u64) -> Vec<Amount> {
    let denomination = denomination.max(1);
    let count = amount.quantity.div_ceil(denomination);
    amount.split_evenly(count)
}

/// RequestPledge / RequestRedeem: a new obligation in `Request` status
pub fn request_obligation(
    notary: &Party,
    request: &ObligationRequest,
) -> Result<TransactionBuilder, FlowError> {
    if request.amount.is_zero() {
        return Err(FlowError::InvalidArgument(
            "Requested amount must be positive".to_string(),
        ));
    }
    let kind = match request.obligation_type {
        ObligationType::Pledge => CommandKind::RequestPledge,
        ObligationType::Redeem => CommandKind::RequestRedeem,
    };

    let mut builder = TransactionBuilder::new(notary.clone());
    builder
        .add_output(ObligationState {
            issuer: request.issuer.clone(),
            requester: request.requester.clone(),
            owner: request.requester.clone(),
            request_date: request.request_date,
            amount: request.amount,
            obligation_type: request.obligation_type,
            status: ObligationStatus::Request,
            external_id: request.external_id.clone(),
            lineage_id: LineageId::new(),
        })
        .add_command(kind, &[&request.requester, &request.issuer]);
    Ok(builder)
}

/// ApprovePledge: approve the obligation and mint its amount to the owner
pub fn approve_pledge(
    notary: &Party,
    obligation: &StateAndRef,
    denomination: u64,
    issue_date: DateTime<Utc>,
) -> Result<TransactionBuilder, FlowError> {
    let requested = obligation_of(obligation)?;

    let mut builder = TransactionBuilder::new(notary.clone());
    builder
        .add_input(obligation.clone())
        .add_output(requested.with_status(ObligationStatus::Approved));
    for amount in mint_denominations(&requested.amount, denomination) {
        builder.add_output(TokenState::new(
            requested.issuer.clone(),
            requested.owner.clone(),
            amount,
            issue_date,
        ));
    }
    builder.add_command(
        CommandKind::ApprovePledge,
        &[&requested.issuer, &requested.owner],
    );
    Ok(builder)
}

/// ApproveRedeem: approve the obligation and burn the owner's `tokens`
///
/// Anything above the redeemed amount comes back to the owner as one change token.
pub fn approve_redeem(
    notary: &Party,
    obligation: &StateAndRef,
    tokens: Vec<StateAndRef>,
    lock_id: LockId,
    issue_date: DateTime<Utc>,
) -> Result<TransactionBuilder, FlowError> {
    let requested = obligation_of(obligation)?;
    let consumed = total_quantity(&tokens_of(&tokens)?);
    if consumed < requested.amount.quantity {
        return Err(FlowError::InsufficientBalance {
            requested: requested.amount,
            available: Amount::new(consumed, requested.amount.currency),
        });
    }

    let mut builder = TransactionBuilder::new(notary.clone()).with_lock_id(lock_id);
    builder.add_input(obligation.clone());
    for token in tokens {
        builder.add_input(token);
    }
    builder.add_output(requested.with_status(ObligationStatus::Approved));

    let change = consumed - requested.amount.quantity;
    if change > 0 {
        builder.add_output(TokenState::new(
            requested.issuer.clone(),
            requested.owner.clone(),
            Amount::new(change, requested.amount.currency),
            issue_date,
        ));
    }
    builder.add_command(
        CommandKind::ApproveRedeem,
        &[&requested.issuer, &requested.owner],
    );
    Ok(builder)
}

/// Deny* / Cancel*: consume the obligation without a successor
pub fn terminate_obligation(
    notary: &Party,
    obligation: &StateAndRef,
    kind: CommandKind,
) -> Result<TransactionBuilder, FlowError> {
    if !(kind.is_deny() || kind.is_cancel()) {
        return Err(FlowError::InvalidArgument(format!(
            "{} does not terminate an obligation",
            kind
        )));
    }
    let requested = obligation_of(obligation)?;

    let mut builder = TransactionBuilder::new(notary.clone());
    builder
        .add_input(obligation.clone())
        .add_command(kind, &[&requested.requester, &requested.issuer]);
    Ok(builder)
}

/// The business side of an inter-bank transfer
#[derive(Debug, Clone)]
pub struct ExchangeTerms {
    pub sender_rib: String,
    pub receiver_rib: String,
    pub sender_bank: Party,
    pub receiver_bank: Party,
    pub amount: Amount,
    pub execution_date: DateTime<Utc>,
    pub external_id: String,
}

/// BankTransfer: move `amount` of the sender's `tokens` to the receiver
///
/// The receiver gets one token for the full amount, the sender one change token.
pub fn atomic_exchange(
    notary: &Party,
    terms: &ExchangeTerms,
    tokens: Vec<StateAndRef>,
    lock_id: LockId,
    issue_date: DateTime<Utc>,
) -> Result<TransactionBuilder, FlowError> {
    let consumed_tokens = tokens_of(&tokens)?;
    let issuer = consumed_tokens
        .first()
        .map(|t| t.issuer.clone())
        .ok_or_else(|| FlowError::InvalidArgument("No tokens to exchange".to_string()))?;
    let consumed = total_quantity(&consumed_tokens);
    if consumed < terms.amount.quantity {
        return Err(FlowError::InsufficientBalance {
            requested: terms.amount,
            available: Amount::new(consumed, terms.amount.currency),
        });
    }
    let change = consumed - terms.amount.quantity;

    let mut builder = TransactionBuilder::new(notary.clone()).with_lock_id(lock_id);
    for token in tokens {
        builder.add_input(token);
    }
    builder
        .add_output(TransferRecord {
            sender_rib: terms.sender_rib.clone(),
            receiver_rib: terms.receiver_rib.clone(),
            sender_bank: terms.sender_bank.clone(),
            receiver_bank: Some(terms.receiver_bank.clone()),
            amount: terms.amount,
            execution_date: terms.execution_date,
            external_id: terms.external_id.clone(),
            lineage_id: LineageId::new(),
        })
        .add_output(TokenState::new(
            issuer.clone(),
            terms.receiver_bank.clone(),
            terms.amount,
            issue_date,
        ));
    if change > 0 {
        builder.add_output(TokenState::new(
            issuer.clone(),
            terms.sender_bank.clone(),
            Amount::new(change, terms.amount.currency),
            issue_date,
        ));
    }
    builder.add_command(
        CommandKind::BankTransfer,
        &[&terms.sender_bank, &terms.receiver_bank, &issuer],
    );
    Ok(builder)
}

/// RecordTransfer: register a transfer between two accounts of `bank`
#[allow(clippy::too_many_arguments)]
pub fn record_intra_bank_transfer(
    notary: &Party,
    bank: &Party,
    issuer: &Party,
    sender_rib: &str,
    receiver_rib: &str,
    amount: Amount,
    execution_date: DateTime<Utc>,
    external_id: String,
) -> Result<TransactionBuilder, FlowError> {
    let mut builder = TransactionBuilder::new(notary.clone());
    builder
        .add_output(TransferRecord {
            sender_rib: sender_rib.to_string(),
            receiver_rib: receiver_rib.to_string(),
            sender_bank: bank.clone(),
            receiver_bank: None,
            amount,
            execution_date,
            external_id,
            lineage_id: LineageId::new(),
        })
        .add_command(CommandKind::RecordTransfer, &[bank, issuer]);
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddr_core::amount::Currency;
    use ddr_core::id::{StateRef, TxId};
    use ddr_core::identity::KeyPair;
    use ddr_contracts::Rule;

    struct Actors {
        central_bank: Party,
        bank_a: Party,
        bank_b: Party,
        notary: Party,
    }

    fn actors() -> Actors {
        let party = |name: &str| KeyPair::from_seed(name.as_bytes()).party(name);
        Actors {
            central_bank: party("CentralBank"),
            bank_a: party("BankA"),
            bank_b: party("BankB"),
            notary: party("Notary"),
        }
    }

    fn mad(quantity: u64) -> Amount {
        Amount::new(quantity, Currency::MAD)
    }

    fn request(a: &Actors, obligation_type: ObligationType, quantity: u64) -> StateAndRef {
        let builder = request_obligation(
            &a.notary,
            &ObligationRequest {
                issuer: a.central_bank.clone(),
                requester: a.bank_a.clone(),
                amount: mad(quantity),
                obligation_type,
                external_id: "EXT-1".to_string(),
                request_date: Utc::now(),
            },
        )
        .unwrap();
        builder.verify().unwrap();
        let state = builder.into_envelope().outputs.remove(0);
        StateAndRef::new(StateRef::new(TxId::digest(b"request"), 0), state)
    }

    fn bank_a_tokens(a: &Actors, quantities: &[u64]) -> Vec<StateAndRef> {
        let source = TxId::digest(b"issuance");
        quantities
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let token = TokenState::new(a.central_bank.clone(), a.bank_a.clone(), mad(*q), Utc::now());
                StateAndRef::new(StateRef::new(source, i as u32), token.into())
            })
            .collect()
    }

    #[test]
    fn test_mint_denominations() {
        let quantities = |q: u64, d: u64| -> Vec<u64> {
            mint_denominations(&mad(q), d).iter().map(|a| a.quantity).collect()
        };
        assert_eq!(quantities(2500, 1000), vec![834, 833, 833]);
        assert_eq!(quantities(3000, 1000), vec![1000, 1000, 1000]);
        assert_eq!(quantities(1, 1000), vec![1]);
        assert_eq!(quantities(999, 0), vec![1; 999]);
    }

    #[test]
    fn test_approve_pledge_mints_exact_amount() {
        let a = actors();
        let obligation = request(&a, ObligationType::Pledge, 2500);
        let builder = approve_pledge(&a.notary, &obligation, 1000, Utc::now()).unwrap();
        builder.verify().unwrap();

        let env = builder.envelope();
        let minted: u64 = env.output_tokens().map(|t| t.amount.quantity).sum();
        assert_eq!(minted, 2500);
        assert_eq!(env.output_tokens().count(), 3);
        assert_eq!(
            env.output_obligations().next().map(|o| o.status),
            Some(ObligationStatus::Approved)
        );
    }

    #[test]
    fn test_approve_redeem_returns_change() {
        let a = actors();
        let obligation = request(&a, ObligationType::Redeem, 1000);
        let tokens = bank_a_tokens(&a, &[700, 500]);
        let builder =
            approve_redeem(&a.notary, &obligation, tokens, LockId::new(), Utc::now()).unwrap();
        builder.verify().unwrap();

        let change: Vec<u64> = builder.envelope().output_tokens().map(|t| t.amount.quantity).collect();
        assert_eq!(change, vec![200]);

        // Exact cover: no change output
        let tokens = bank_a_tokens(&a, &[600, 400]);
        let builder =
            approve_redeem(&a.notary, &obligation, tokens, LockId::new(), Utc::now()).unwrap();
        builder.verify().unwrap();
        assert_eq!(builder.envelope().output_tokens().count(), 0);

        // Not enough tokens
        let tokens = bank_a_tokens(&a, &[300]);
        assert!(matches!(
            approve_redeem(&a.notary, &obligation, tokens, LockId::new(), Utc::now()),
            Err(FlowError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_terminate_obligation() {
        let a = actors();
        let obligation = request(&a, ObligationType::Pledge, 500);
        for kind in [CommandKind::DenyPledge, CommandKind::CancelPledge] {
            let builder = terminate_obligation(&a.notary, &obligation, kind).unwrap();
            builder.verify().unwrap();
            assert!(builder.envelope().outputs.is_empty());
        }

        assert!(matches!(
            terminate_obligation(&a.notary, &obligation, CommandKind::ApprovePledge),
            Err(FlowError::InvalidArgument(_))
        ));

        // An approved obligation cannot be canceled
        let approved = StateAndRef::new(
            obligation.reference,
            obligation
                .state
                .as_obligation()
                .unwrap()
                .with_status(ObligationStatus::Approved)
                .into(),
        );
        let builder = terminate_obligation(&a.notary, &approved, CommandKind::CancelPledge).unwrap();
        let violation = builder.verify().unwrap_err();
        assert_eq!(violation.rule, Rule::ObligationStatus);
        assert!(violation.message.contains("REQUEST"));
    }

    #[test]
    fn test_atomic_exchange_with_change() {
        let a = actors();
        let terms = ExchangeTerms {
            sender_rib: "007780000123456789012345".to_string(),
            receiver_rib: "011780000987654321098765".to_string(),
            sender_bank: a.bank_a.clone(),
            receiver_bank: a.bank_b.clone(),
            amount: mad(1000),
            execution_date: Utc::now(),
            external_id: "INTER-1".to_string(),
        };
        let builder = atomic_exchange(
            &a.notary,
            &terms,
            bank_a_tokens(&a, &[700, 500]),
            LockId::new(),
            Utc::now(),
        )
        .unwrap();
        builder.verify().unwrap();

        let env = builder.envelope();
        let owned = |party: &Party| -> u64 {
            env.output_tokens()
                .filter(|t| t.owner == *party)
                .map(|t| t.amount.quantity)
                .sum()
        };
        assert_eq!(owned(&a.bank_b), 1000);
        assert_eq!(owned(&a.bank_a), 200);
        assert_eq!(env.required_signers().len(), 3);
        assert!(env.required_signers().contains(&a.central_bank.key));
    }

    #[test]
    fn test_record_intra_bank_transfer() {
        let a = actors();
        let builder = record_intra_bank_transfer(
            &a.notary,
            &a.bank_a,
            &a.central_bank,
            "007780000123456789012345",
            "007780000555555555555555",
            mad(4200),
            Utc::now(),
            "INTRA-1".to_string(),
        )
        .unwrap();
        builder.verify().unwrap();

        // Identical RIBs never verify
        let builder = record_intra_bank_transfer(
            &a.notary,
            &a.bank_a,
            &a.central_bank,
            "007780000123456789012345",
            "007780000123456789012345",
            mad(4200),
            Utc::now(),
            "INTRA-2".to_string(),
        )
        .unwrap();
        assert_eq!(builder.verify().unwrap_err().rule, Rule::TransferRibs);
    }
}
