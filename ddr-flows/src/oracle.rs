use ddr_core::amount::Amount;
use ddr_core::identity::Party;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Account {0} is unknown to the oracle")]
    UnknownAccount(String),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
}

/// External authority on whether an account may receive a transfer
pub trait AccountOracle: fmt::Debug + Send + Sync {
    /// Ask whether `receiver_rib` may be credited with `amount`
    ///
    /// # Parameters
    /// * `receiver_rib` - The account to be credited
    /// * `amount` - The transfer amount
    /// * `verifying_bank` - The bank asking, as a counterparty of the transfer
    fn account_eligible_for_transfer(
        &self,
        receiver_rib: &str,
        amount: &Amount,
        verifying_bank: &Party,
    ) -> Result<bool, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountRecord {
    active: bool,
    /// Largest single credit the account accepts
    limit: Option<Amount>,
}

/// In-memory account registry answering eligibility questions
#[derive(Debug, Default)]
pub struct AccountRegistryOracle {
    accounts: RwLock<HashMap<String, AccountRecord>>,
    offline: RwLock<bool>,
}

impl AccountRegistryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_account(&self, rib: impl Into<String>) {
        if let Ok(mut accounts) = self.accounts.write() {
            accounts.insert(
                rib.into(),
                AccountRecord {
                    active: true,
                    limit: None,
                },
            );
        }
    }

    pub fn close_account(&self, rib: &str) {
        if let Ok(mut accounts) = self.accounts.write() {
            if let Some(record) = accounts.get_mut(rib) {
                record.active = false;
            }
        }
    }

    pub fn set_transfer_limit(&self, rib: &str, limit: Option<Amount>) {
        if let Ok(mut accounts) = self.accounts.write() {
            if let Some(record) = accounts.get_mut(rib) {
                record.limit = limit;
            }
        }
    }

    /// Simulate the oracle going offline
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.write() {
            *flag = offline;
        }
    }
}

impl AccountOracle for AccountRegistryOracle {
    fn account_eligible_for_transfer(
        &self,
        receiver_rib: &str,
        amount: &Amount,
        verifying_bank: &Party,
    ) -> Result<bool, OracleError> {
        let offline = self
            .offline
            .read()
            .map_err(|_| OracleError::Unavailable("registry lock poisoned".to_string()))?;
        if *offline {
            return Err(OracleError::Unavailable("registry offline".to_string()));
        }

        let accounts = self
            .accounts
            .read()
            .map_err(|_| OracleError::Unavailable("registry lock poisoned".to_string()))?;
        let record = accounts
            .get(receiver_rib)
            .ok_or_else(|| OracleError::UnknownAccount(receiver_rib.to_string()))?;

        let within_limit = match &record.limit {
            Some(limit) => limit.currency == amount.currency && amount.quantity <= limit.quantity,
            None => true,
        };
        let eligible = record.active && within_limit;
        log::debug!(
            "Oracle answered {} for {} to {} (asked by {})",
            eligible,
            amount,
            receiver_rib,
            verifying_bank
        );
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddr_core::amount::Currency;
    use ddr_core::identity::KeyPair;

    #[test]
    fn test_registry_eligibility() {
        let oracle = AccountRegistryOracle::new();
        let bank = KeyPair::from_seed(b"BankB").party("BankB");
        let rib = "011780000123456789012345";
        let amount = Amount::new(100_000, Currency::MAD);

        // Unknown accounts are an error, not a silent refusal
        assert_eq!(
            oracle.account_eligible_for_transfer(rib, &amount, &bank),
            Err(OracleError::UnknownAccount(rib.to_string()))
        );

        oracle.open_account(rib);
        assert_eq!(oracle.account_eligible_for_transfer(rib, &amount, &bank), Ok(true));

        // Above the limit
        oracle.set_transfer_limit(rib, Some(Amount::new(50_000, Currency::MAD)));
        assert_eq!(oracle.account_eligible_for_transfer(rib, &amount, &bank), Ok(false));
        oracle.set_transfer_limit(rib, None);

        oracle.close_account(rib);
        assert_eq!(oracle.account_eligible_for_transfer(rib, &amount, &bank), Ok(false));

        oracle.set_offline(true);
        assert!(matches!(
            oracle.account_eligible_for_transfer(rib, &amount, &bank),
            Err(OracleError::Unavailable(_))
        ));
    }
}
