use ddr_core::identity::{Party, PartyKey};
use ddr_core::states::bank_code;
use std::collections::{BTreeMap, HashMap};

/// Static view of the network: who is who, and which bank owns which RIBs
///
/// Built once at start-up and shared by every node.
#[derive(Debug, Clone)]
pub struct NetworkDirectory {
    issuer: Party,
    notary: Party,
    parties: BTreeMap<String, Party>,
    by_key: HashMap<PartyKey, String>,
    /// Bank code (first three RIB characters) to party name
    bank_codes: HashMap<String, String>,
}

impl NetworkDirectory {
    pub fn new(issuer: Party, notary: Party) -> Self {
        let mut directory = Self {
            issuer: issuer.clone(),
            notary: notary.clone(),
            parties: BTreeMap::new(),
            by_key: HashMap::new(),
            bank_codes: HashMap::new(),
        };
        directory.insert(issuer);
        directory.insert(notary);
        directory
    }

    fn insert(&mut self, party: Party) {
        self.by_key.insert(party.key, party.name.clone());
        self.parties.insert(party.name.clone(), party);
    }

    /// Register a commercial bank under its three character bank code
    pub fn add_bank(&mut self, bank: Party, code: impl Into<String>) {
        self.bank_codes.insert(code.into(), bank.name.clone());
        self.insert(bank);
    }

    pub fn with_bank(mut self, bank: Party, code: impl Into<String>) -> Self {
        self.add_bank(bank, code);
        self
    }

    pub fn issuer(&self) -> &Party {
        &self.issuer
    }

    pub fn notary(&self) -> &Party {
        &self.notary
    }

    pub fn party(&self, name: &str) -> Option<&Party> {
        self.parties.get(name)
    }

    pub fn party_by_key(&self, key: &PartyKey) -> Option<&Party> {
        self.by_key.get(key).and_then(|name| self.parties.get(name))
    }

    pub fn parties(&self) -> impl Iterator<Item = &Party> {
        self.parties.values()
    }

    /// The bank holding the account `rib`, resolved through its bank code
    pub fn bank_for_rib(&self, rib: &str) -> Option<&Party> {
        let code = bank_code(rib)?;
        self.bank_codes.get(code).and_then(|name| self.parties.get(name))
    }

    pub fn code_of(&self, bank: &Party) -> Option<&str> {
        self.bank_codes
            .iter()
            .find(|(_, name)| **name == bank.name)
            .map(|(code, _)| code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddr_core::identity::KeyPair;

    fn party(name: &str) -> Party {
        KeyPair::from_seed(name.as_bytes()).party(name)
    }

    #[test]
    fn test_directory_lookups() {
        let bank_a = party("BankA");
        let directory = NetworkDirectory::new(party("CentralBank"), party("Notary"))
            .with_bank(bank_a.clone(), "007")
            .with_bank(party("BankB"), "011");

        assert_eq!(directory.issuer().name, "CentralBank");
        assert_eq!(directory.party("BankA"), Some(&bank_a));
        assert_eq!(directory.party_by_key(&bank_a.key), Some(&bank_a));
        assert_eq!(directory.code_of(&bank_a), Some("007"));
        assert_eq!(directory.parties().count(), 4);

        // RIBs resolve through their first three digits
        assert_eq!(directory.bank_for_rib("007780000123456789012345"), Some(&bank_a));
        assert_eq!(
            directory.bank_for_rib("011780000123456789012345").map(|p| p.name.as_str()),
            Some("BankB")
        );
        assert!(directory.bank_for_rib("999780000123456789012345").is_none());
        assert!(directory.bank_for_rib("AB").is_none());
    }
}
