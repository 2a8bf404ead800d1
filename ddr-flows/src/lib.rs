pub mod builders;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod node;
pub mod oracle;
pub mod protocol;
pub mod settlement;

// Re-export the main types for convenience
pub use builders::{ExchangeTerms, ObligationRequest, TransactionBuilder};
pub use directory::NetworkDirectory;
pub use error::FlowError;
pub use network::{InMemoryNetwork, MessageHandler, NetworkError, Transport};
pub use node::{LedgerNode, NodeServices, TransferRequest};
pub use oracle::{AccountOracle, AccountRegistryOracle, OracleError};
pub use protocol::{
    InitiatorSession, InitiatorState, Payload, ResponderSession, ResponderState, SessionId,
    SessionMessage,
};
pub use settlement::{
    InMemorySettlementBus, SettlementBus, SettlementError, SettlementEvent, SettlementProcessor,
    SettlementStatus, TransferInstruction, TransferKind,
};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::directory::NetworkDirectory;
    use crate::network::InMemoryNetwork;
    use crate::node::{LedgerNode, NodeServices};
    use crate::oracle::AccountRegistryOracle;
    use ddr_core::amount::{Amount, Currency};
    use ddr_core::config::{LedgerConfig, SelectorConfig};
    use ddr_core::id::generate_reference;
    use ddr_core::identity::KeyPair;
    use ddr_notary::{InMemoryNotary, NotaryService};
    use ddr_vault::InMemoryVault;
    use std::sync::Arc;

    pub const BANK_A_RIB: &str = "007780000123456789012345";
    pub const BANK_A_OTHER_RIB: &str = "007780000555555555555555";
    pub const BANK_B_RIB: &str = "011780000987654321098765";

    pub fn keys(name: &str) -> KeyPair {
        KeyPair::from_seed(name.as_bytes())
    }

    pub fn mad(quantity: u64) -> Amount {
        Amount::new(quantity, Currency::MAD)
    }

    pub fn fast_config() -> LedgerConfig {
        LedgerConfig {
            selector: SelectorConfig {
                max_retries: 3,
                retry_sleep_ms: 1,
                retry_cap_ms: 5,
                page_size: 200,
            },
            ..LedgerConfig::default()
        }
    }

    /// A central bank, two commercial banks and a notary on one in-memory network
    pub struct TestNetwork {
        pub network: Arc<InMemoryNetwork>,
        pub notary: Arc<InMemoryNotary>,
        pub oracle: Arc<AccountRegistryOracle>,
        pub issuer: Arc<LedgerNode>,
        pub bank_a: Arc<LedgerNode>,
        pub bank_b: Arc<LedgerNode>,
    }

    impl TestNetwork {
        pub fn new() -> Self {
            let notary = Arc::new(InMemoryNotary::new("Notary", keys("Notary")));
            let directory = Arc::new(
                NetworkDirectory::new(
                    keys("CentralBank").party("CentralBank"),
                    notary.identity().clone(),
                )
                .with_bank(keys("BankA").party("BankA"), "007")
                .with_bank(keys("BankB").party("BankB"), "011"),
            );
            let network = Arc::new(InMemoryNetwork::new());
            let oracle = Arc::new(AccountRegistryOracle::new());
            oracle.open_account(BANK_A_RIB);
            oracle.open_account(BANK_B_RIB);

            let start = |name: &str| -> Arc<LedgerNode> {
                let services = NodeServices {
                    vault: Arc::new(InMemoryVault::new()),
                    directory: directory.clone(),
                    notary: notary.clone(),
                    transport: network.clone(),
                    oracle: Some(oracle.clone()),
                };
                let node = Arc::new(LedgerNode::new(keys(name), fast_config(), services).unwrap());
                network.register(node.party().key, &node);
                node
            };
            let issuer = start("CentralBank");
            let bank_a = start("BankA");
            let bank_b = start("BankB");

            Self {
                network,
                notary,
                oracle,
                issuer,
                bank_a,
                bank_b,
            }
        }

        /// Pledge and approve `quantity` for `bank`; returns the external id
        pub fn fund(&self, bank: &LedgerNode, quantity: u64) -> String {
            let external_id = generate_reference("PLEDGE");
            bank.request_pledge(mad(quantity), Some(external_id.clone()))
                .unwrap();
            self.issuer.approve_pledge(&external_id).unwrap();
            external_id
        }
    }
}
