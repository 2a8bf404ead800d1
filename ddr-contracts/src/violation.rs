use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The contract rule a transaction broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rule {
    NoCommands,
    NonPositiveAmount,
    MissingOwnerSignature,
    MissingSigner,
    InputCount,
    OutputCount,
    ObligationStatus,
    ObligationType,
    ObligationMismatch,
    MintedAmount,
    MintedTokenAttributes,
    RedeemedAmount,
    RedeemedTokenAttributes,
    ChangeOutput,
    TransferBanks,
    TransferRibs,
    TokenOwnership,
    TokenCurrency,
    InsufficientConsumed,
    ReceiverAmount,
    SenderChange,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::NoCommands => "no-commands",
            Rule::NonPositiveAmount => "non-positive-amount",
            Rule::MissingOwnerSignature => "missing-owner-signature",
            Rule::MissingSigner => "missing-signer",
            Rule::InputCount => "input-count",
            Rule::OutputCount => "output-count",
            Rule::ObligationStatus => "obligation-status",
            Rule::ObligationType => "obligation-type",
            Rule::ObligationMismatch => "obligation-mismatch",
            Rule::MintedAmount => "minted-amount",
            Rule::MintedTokenAttributes => "minted-token-attributes",
            Rule::RedeemedAmount => "redeemed-amount",
            Rule::RedeemedTokenAttributes => "redeemed-token-attributes",
            Rule::ChangeOutput => "change-output",
            Rule::TransferBanks => "transfer-banks",
            Rule::TransferRibs => "transfer-ribs",
            Rule::TokenOwnership => "token-ownership",
            Rule::TokenCurrency => "token-currency",
            Rule::InsufficientConsumed => "insufficient-consumed",
            Rule::ReceiverAmount => "receiver-amount",
            Rule::SenderChange => "sender-change",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed contract rule with a human readable explanation
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Contract violation [{rule}]: {message}")]
pub struct Violation {
    pub rule: Rule,
    pub message: String,
}

impl Violation {
    pub fn new(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

/// Fail with `rule` unless `condition` holds
pub(crate) fn require(condition: bool, rule: Rule, message: &str) -> Result<(), Violation> {
    if condition {
        Ok(())
    } else {
        Err(Violation::new(rule, message))
    }
}
