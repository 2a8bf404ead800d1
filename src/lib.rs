//! DDR ledger
//!
//! Re-exports the components of the ledger: the shared data model, the
//! contract rules, the vault, the notary and the node flows.

pub use ddr_contracts as contracts;
pub use ddr_flows as flows;
pub use ddr_notary as notary;
pub use ddr_vault as vault;

pub use ddr_core::*;
pub use ddr_flows::{
    FlowError, InMemoryNetwork, LedgerNode, NetworkDirectory, NodeServices, SettlementProcessor,
    TransferRequest,
};
pub use ddr_notary::{InMemoryNotary, NotaryService};
pub use ddr_vault::{InMemoryVault, Vault};

use std::sync::Arc;

/// Open the vault a node's configuration asks for
///
/// A configured `database_path` selects the SQLite vault; without one the
/// node keeps its states in memory.
pub fn open_vault(config: &LedgerConfig) -> Result<Arc<dyn Vault>, StorageError> {
    match &config.database_path {
        #[cfg(feature = "sqlite")]
        Some(path) => Ok(Arc::new(ddr_vault::SqliteVault::new(path)?)),
        #[cfg(not(feature = "sqlite"))]
        Some(path) => Err(StorageError::Other(format!(
            "{} requires the sqlite feature",
            path.display()
        ))),
        None => Ok(Arc::new(InMemoryVault::new())),
    }
}
