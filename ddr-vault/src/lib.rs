pub mod memory;
pub mod selector;
pub mod storage_traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the main types for convenience
pub use memory::InMemoryVault;
pub use selector::{SelectionError, TokenSelector};
pub use storage_traits::{
    LockFilter, Page, PageSpecification, QueryCriteria, StateStatus, Vault, VaultStorage,
};

// Re-export the storage implementations
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteVault;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use ddr_core::amount::{Amount, Currency};
    use ddr_core::identity::{KeyPair, Party};
    use ddr_core::states::{StateAndRef, TokenState};
    use ddr_core::transaction::{Command, CommandKind, SignedTransaction, TransactionEnvelope};

    pub struct Actors {
        pub central_bank: Party,
        pub bank_a: Party,
        pub bank_b: Party,
        pub notary: Party,
        pub currency: Currency,
    }

    impl Actors {
        pub fn amount(&self, quantity: u64) -> Amount {
            Amount::new(quantity, self.currency)
        }
    }

    pub fn actors() -> Actors {
        let party = |name: &str| KeyPair::from_seed(name.as_bytes()).party(name);
        Actors {
            central_bank: party("CentralBank"),
            bank_a: party("BankA"),
            bank_b: party("BankB"),
            notary: party("Notary"),
            currency: Currency::MAD,
        }
    }

    /// Tokens minted to BankA, one output per quantity
    pub fn issue_tokens(a: &Actors, quantities: &[u64]) -> SignedTransaction {
        let mut env = TransactionEnvelope::new(a.notary.clone());
        for q in quantities {
            env.outputs.push(
                TokenState::new(a.central_bank.clone(), a.bank_a.clone(), a.amount(*q), Utc::now()).into(),
            );
        }
        env.commands.push(Command::new(
            CommandKind::ApprovePledge,
            [&a.central_bank, &a.bank_a],
        ));
        SignedTransaction::new(env).unwrap()
    }

    /// Moves `inputs` to a single BankB token of `quantity`
    pub fn spend_tokens(a: &Actors, inputs: &[StateAndRef], quantity: u64) -> SignedTransaction {
        let mut env = TransactionEnvelope::new(a.notary.clone());
        env.inputs.extend(inputs.iter().cloned());
        env.outputs.push(
            TokenState::new(a.central_bank.clone(), a.bank_b.clone(), a.amount(quantity), Utc::now()).into(),
        );
        env.commands.push(Command::new(
            CommandKind::BankTransfer,
            [&a.central_bank, &a.bank_a, &a.bank_b],
        ));
        SignedTransaction::new(env).unwrap()
    }
}
