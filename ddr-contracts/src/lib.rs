//! Contract verification engine
//!
//! Pure functions deciding whether a [`ddr_core::TransactionEnvelope`] is
//! valid. Verification dispatches on each command and never touches storage:
//! everything a rule needs is carried by the envelope itself.

mod obligation;
mod transfer;
pub mod verification;
pub mod violation;

pub use verification::{verify, verify_all};
pub use violation::{Rule, Violation};

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{TimeZone, Utc};
    use ddr_core::amount::{Amount, Currency};
    use ddr_core::id::{LineageId, StateRef, TxId};
    use ddr_core::identity::{KeyPair, Party};
    use ddr_core::states::{
        LedgerState, ObligationState, ObligationStatus, ObligationType, StateAndRef, TokenState,
        TransferRecord,
    };
    use ddr_core::transaction::TransactionEnvelope;

    pub struct Actors {
        pub central_bank: Party,
        pub bank_a: Party,
        pub bank_b: Party,
        pub notary: Party,
    }

    pub fn actors() -> Actors {
        let party = |name: &str| KeyPair::from_seed(name.as_bytes()).party(name);
        Actors {
            central_bank: party("CentralBank"),
            bank_a: party("BankA"),
            bank_b: party("BankB"),
            notary: party("Notary"),
        }
    }

    pub fn envelope(a: &Actors) -> TransactionEnvelope {
        TransactionEnvelope::new(a.notary.clone())
    }

    pub fn obligation(
        a: &Actors,
        obligation_type: ObligationType,
        status: ObligationStatus,
        quantity: u64,
    ) -> ObligationState {
        ObligationState {
            issuer: a.central_bank.clone(),
            requester: a.bank_a.clone(),
            owner: a.bank_a.clone(),
            request_date: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            amount: Amount::new(quantity, Currency::MAD),
            obligation_type,
            status,
            external_id: "EXT-1".to_string(),
            lineage_id: LineageId::new(),
        }
    }

    pub fn token(a: &Actors, owner: &Party, quantity: u64) -> TokenState {
        TokenState::new(
            a.central_bank.clone(),
            owner.clone(),
            Amount::new(quantity, Currency::MAD),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        )
    }

    pub fn inter_bank_record(a: &Actors, quantity: u64) -> TransferRecord {
        TransferRecord {
            sender_rib: "007780000123".to_string(),
            receiver_rib: "011780000456".to_string(),
            sender_bank: a.bank_a.clone(),
            receiver_bank: Some(a.bank_b.clone()),
            amount: Amount::new(quantity, Currency::MAD),
            execution_date: Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap(),
            external_id: "INTER-1".to_string(),
            lineage_id: LineageId::new(),
        }
    }

    pub fn intra_bank_record(a: &Actors, quantity: u64) -> TransferRecord {
        TransferRecord {
            sender_rib: "007780000123".to_string(),
            receiver_rib: "007780000999".to_string(),
            receiver_bank: None,
            ..inter_bank_record(a, quantity)
        }
    }

    pub fn input(state: impl Into<LedgerState>, index: u32) -> StateAndRef {
        StateAndRef::new(StateRef::new(TxId::digest(b"fixture"), index), state.into())
    }
}
