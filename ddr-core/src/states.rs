use crate::amount::Amount;
use crate::id::{LineageId, StateRef};
use crate::identity::Party;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether an obligation mints (pledge) or burns (redeem) tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObligationType {
    Pledge,
    Redeem,
}

impl ObligationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationType::Pledge => "PLEDGE",
            ObligationType::Redeem => "REDEEM",
        }
    }
}

impl fmt::Display for ObligationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an obligation
///
/// `Request` is the only non-terminal status. It can move to any of the
/// three terminal statuses and nothing leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObligationStatus {
    Request,
    Approved,
    Rejected,
    Canceled,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Request => "REQUEST",
            ObligationStatus::Approved => "APPROVED",
            ObligationStatus::Rejected => "REJECTED",
            ObligationStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObligationStatus::Request)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ObligationStatus) -> bool {
        matches!(
            (self, next),
            (ObligationStatus::Request, ObligationStatus::Approved)
                | (ObligationStatus::Request, ObligationStatus::Rejected)
                | (ObligationStatus::Request, ObligationStatus::Canceled)
        )
    }
}

impl fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObligationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST" => Ok(ObligationStatus::Request),
            "APPROVED" => Ok(ObligationStatus::Approved),
            "REJECTED" => Ok(ObligationStatus::Rejected),
            "CANCELED" => Ok(ObligationStatus::Canceled),
            other => Err(format!("Unknown obligation status: {}", other)),
        }
    }
}

/// A bank's request to the issuer to mint (pledge) or burn (redeem) tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationState {
    pub issuer: Party,
    pub requester: Party,
    pub owner: Party,
    pub request_date: DateTime<Utc>,
    pub amount: Amount,
    pub obligation_type: ObligationType,
    pub status: ObligationStatus,
    pub external_id: String,
    pub lineage_id: LineageId,
}

impl ObligationState {
    /// Next version of this obligation with a different status
    pub fn with_status(&self, status: ObligationStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn participants(&self) -> Vec<&Party> {
        let mut parties = vec![&self.requester];
        if self.owner != self.requester {
            parties.push(&self.owner);
        }
        parties.push(&self.issuer);
        parties
    }

    /// True when `other` differs from `self` in nothing but its status
    pub fn same_except_status(&self, other: &ObligationState) -> bool {
        self.with_status(other.status) == *other
    }
}

/// A fungible DDR token owned by a bank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub issuer: Party,
    pub owner: Party,
    pub issue_date: DateTime<Utc>,
    pub amount: Amount,
}

impl TokenState {
    pub fn new(issuer: Party, owner: Party, amount: Amount, issue_date: DateTime<Utc>) -> Self {
        Self {
            issuer,
            owner,
            issue_date,
            amount,
        }
    }

    pub fn participants(&self) -> Vec<&Party> {
        vec![&self.issuer, &self.owner]
    }
}

/// A settled transfer between two accounts
///
/// `receiver_bank` is absent for intra-bank transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub sender_rib: String,
    pub receiver_rib: String,
    pub sender_bank: Party,
    pub receiver_bank: Option<Party>,
    pub amount: Amount,
    pub execution_date: DateTime<Utc>,
    pub external_id: String,
    pub lineage_id: LineageId,
}

impl TransferRecord {
    pub fn is_inter_bank(&self) -> bool {
        self.receiver_bank.is_some()
    }

    /// RIBs are compared case-insensitively
    pub fn ribs_differ(&self) -> bool {
        !self.sender_rib.eq_ignore_ascii_case(&self.receiver_rib)
    }

    pub fn participants(&self) -> Vec<&Party> {
        let mut parties = vec![&self.sender_bank];
        if let Some(receiver) = &self.receiver_bank {
            parties.push(receiver);
        }
        parties
    }
}

/// The bank code carried in the first three characters of a RIB
pub fn bank_code(rib: &str) -> Option<&str> {
    let code = rib.get(0..3)?;
    code.chars().all(|c| c.is_ascii_digit()).then_some(code)
}

/// Tag of a [`LedgerState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Obligation,
    Token,
    Transfer,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Obligation => "obligation",
            StateKind::Token => "token",
            StateKind::Transfer => "transfer",
        }
    }
}

impl FromStr for StateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "obligation" => Ok(StateKind::Obligation),
            "token" => Ok(StateKind::Token),
            "transfer" => Ok(StateKind::Transfer),
            other => Err(format!("Unknown state kind: {}", other)),
        }
    }
}

/// Any state that can appear as a transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerState {
    Obligation(ObligationState),
    Token(TokenState),
    Transfer(TransferRecord),
}

impl LedgerState {
    pub fn kind(&self) -> StateKind {
        match self {
            LedgerState::Obligation(_) => StateKind::Obligation,
            LedgerState::Token(_) => StateKind::Token,
            LedgerState::Transfer(_) => StateKind::Transfer,
        }
    }

    pub fn participants(&self) -> Vec<&Party> {
        match self {
            LedgerState::Obligation(o) => o.participants(),
            LedgerState::Token(t) => t.participants(),
            LedgerState::Transfer(t) => t.participants(),
        }
    }

    /// The party whose signature authorises consuming this state
    ///
    /// For transfer records this is the sender bank.
    pub fn owner(&self) -> &Party {
        match self {
            LedgerState::Obligation(o) => &o.owner,
            LedgerState::Token(t) => &t.owner,
            LedgerState::Transfer(t) => &t.sender_bank,
        }
    }

    pub fn amount(&self) -> &Amount {
        match self {
            LedgerState::Obligation(o) => &o.amount,
            LedgerState::Token(t) => &t.amount,
            LedgerState::Transfer(t) => &t.amount,
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            LedgerState::Obligation(o) => Some(&o.external_id),
            LedgerState::Token(_) => None,
            LedgerState::Transfer(t) => Some(&t.external_id),
        }
    }

    pub fn lineage_id(&self) -> Option<&LineageId> {
        match self {
            LedgerState::Obligation(o) => Some(&o.lineage_id),
            LedgerState::Token(_) => None,
            LedgerState::Transfer(t) => Some(&t.lineage_id),
        }
    }

    pub fn obligation_status(&self) -> Option<ObligationStatus> {
        match self {
            LedgerState::Obligation(o) => Some(o.status),
            _ => None,
        }
    }

    pub fn as_obligation(&self) -> Option<&ObligationState> {
        match self {
            LedgerState::Obligation(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&TokenState> {
        match self {
            LedgerState::Token(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_transfer(&self) -> Option<&TransferRecord> {
        match self {
            LedgerState::Transfer(t) => Some(t),
            _ => None,
        }
    }
}

impl From<ObligationState> for LedgerState {
    fn from(state: ObligationState) -> Self {
        LedgerState::Obligation(state)
    }
}

impl From<TokenState> for LedgerState {
    fn from(state: TokenState) -> Self {
        LedgerState::Token(state)
    }
}

impl From<TransferRecord> for LedgerState {
    fn from(state: TransferRecord) -> Self {
        LedgerState::Transfer(state)
    }
}

/// A state together with the reference of the output that created it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    pub reference: StateRef,
    pub state: LedgerState,
}

impl StateAndRef {
    pub fn new(reference: StateRef, state: LedgerState) -> Self {
        Self { reference, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Currency;
    use crate::identity::KeyPair;

    fn party(name: &str) -> Party {
        KeyPair::from_seed(name.as_bytes()).party(name)
    }

    fn pledge_request() -> ObligationState {
        let bank = party("BankA");
        ObligationState {
            issuer: party("CentralBank"),
            requester: bank.clone(),
            owner: bank,
            request_date: Utc::now(),
            amount: Amount::new(2500, Currency::MAD),
            obligation_type: ObligationType::Pledge,
            status: ObligationStatus::Request,
            external_id: "PLEDGE-1".to_string(),
            lineage_id: LineageId::new(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use ObligationStatus::*;

        assert!(Request.can_transition_to(Approved));
        assert!(Request.can_transition_to(Rejected));
        assert!(Request.can_transition_to(Canceled));

        for terminal in [Approved, Rejected, Canceled] {
            assert!(terminal.is_terminal());
            for next in [Request, Approved, Rejected, Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Request.can_transition_to(Request));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ObligationStatus::Request,
            ObligationStatus::Approved,
            ObligationStatus::Rejected,
            ObligationStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<ObligationStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<ObligationStatus>().is_err());
    }

    #[test]
    fn test_with_status_keeps_identity() {
        let request = pledge_request();
        let approved = request.with_status(ObligationStatus::Approved);

        assert_eq!(approved.lineage_id, request.lineage_id);
        assert_eq!(approved.external_id, request.external_id);
        assert!(request.same_except_status(&approved));

        let mut tampered = approved.clone();
        tampered.amount = Amount::new(1, Currency::MAD);
        assert!(!request.same_except_status(&tampered));
    }

    #[test]
    fn test_participants() {
        let request = pledge_request();
        let names: Vec<&str> = request
            .participants()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["BankA", "CentralBank"]);

        let state = LedgerState::from(request);
        assert_eq!(state.kind(), StateKind::Obligation);
        assert_eq!(state.owner().name, "BankA");
        assert_eq!(state.external_id(), Some("PLEDGE-1"));
    }

    #[test]
    fn test_bank_code_and_ribs() {
        assert_eq!(bank_code("007780000123"), Some("007"));
        assert_eq!(bank_code("AB"), None);
        assert_eq!(bank_code("X07123"), None);

        let record = TransferRecord {
            sender_rib: "007ABC".to_string(),
            receiver_rib: "007abc".to_string(),
            sender_bank: party("BankA"),
            receiver_bank: None,
            amount: Amount::new(100, Currency::MAD),
            execution_date: Utc::now(),
            external_id: "INTRA-1".to_string(),
            lineage_id: LineageId::new(),
        };
        assert!(!record.ribs_differ());
        assert!(!record.is_inter_bank());
        assert_eq!(record.participants().len(), 1);
    }
}
