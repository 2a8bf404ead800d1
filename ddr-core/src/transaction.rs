use crate::error::{SignatureError, StorageError};
use crate::id::{StateRef, TxId};
use crate::identity::{KeyPair, Party, PartyKey};
use crate::states::{
    LedgerState, ObligationState, ObligationType, StateAndRef, TokenState, TransferRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The business intent of a transaction, used to dispatch verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    RequestPledge,
    ApprovePledge,
    DenyPledge,
    CancelPledge,
    RequestRedeem,
    ApproveRedeem,
    DenyRedeem,
    CancelRedeem,
    BankTransfer,
    RecordTransfer,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::RequestPledge => "RequestPledge",
            CommandKind::ApprovePledge => "ApprovePledge",
            CommandKind::DenyPledge => "DenyPledge",
            CommandKind::CancelPledge => "CancelPledge",
            CommandKind::RequestRedeem => "RequestRedeem",
            CommandKind::ApproveRedeem => "ApproveRedeem",
            CommandKind::DenyRedeem => "DenyRedeem",
            CommandKind::CancelRedeem => "CancelRedeem",
            CommandKind::BankTransfer => "BankTransfer",
            CommandKind::RecordTransfer => "RecordTransfer",
        }
    }

    /// The obligation type an obligation command operates on
    pub fn obligation_type(&self) -> Option<ObligationType> {
        match self {
            CommandKind::RequestPledge
            | CommandKind::ApprovePledge
            | CommandKind::DenyPledge
            | CommandKind::CancelPledge => Some(ObligationType::Pledge),
            CommandKind::RequestRedeem
            | CommandKind::ApproveRedeem
            | CommandKind::DenyRedeem
            | CommandKind::CancelRedeem => Some(ObligationType::Redeem),
            CommandKind::BankTransfer | CommandKind::RecordTransfer => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, CommandKind::RequestPledge | CommandKind::RequestRedeem)
    }

    pub fn is_approve(&self) -> bool {
        matches!(self, CommandKind::ApprovePledge | CommandKind::ApproveRedeem)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, CommandKind::DenyPledge | CommandKind::DenyRedeem)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, CommandKind::CancelPledge | CommandKind::CancelRedeem)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command together with the keys that must sign for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub signers: Vec<PartyKey>,
}

impl Command {
    /// Create a command; duplicate signers are collapsed
    pub fn new<'a, I>(kind: CommandKind, signers: I) -> Self
    where
        I: IntoIterator<Item = &'a Party>,
    {
        let signers: BTreeSet<PartyKey> = signers.into_iter().map(|p| p.key).collect();
        Self {
            kind,
            signers: signers.into_iter().collect(),
        }
    }

    pub fn requires(&self, key: &PartyKey) -> bool {
        self.signers.contains(key)
    }
}

/// The unit submitted for verification, signing and notarisation
///
/// Inputs carry the data of the consumed states so that every party can
/// verify the transaction without sharing storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    pub inputs: Vec<StateAndRef>,
    pub outputs: Vec<LedgerState>,
    pub commands: Vec<Command>,
    pub notary: Party,
    pub created_at: DateTime<Utc>,
}

impl TransactionEnvelope {
    pub fn new(notary: Party) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            commands: Vec::new(),
            notary,
            created_at: Utc::now(),
        }
    }

    /// BLAKE3 digest of the bincode encoding of the envelope
    pub fn id(&self) -> Result<TxId, StorageError> {
        let bytes = bincode::serialize(self)?;
        Ok(TxId::digest(&bytes))
    }

    /// Union of the signers of every command
    pub fn required_signers(&self) -> BTreeSet<PartyKey> {
        self.commands
            .iter()
            .flat_map(|c| c.signers.iter().copied())
            .collect()
    }

    pub fn input_refs(&self) -> Vec<StateRef> {
        self.inputs.iter().map(|i| i.reference).collect()
    }

    pub fn input_obligations(&self) -> impl Iterator<Item = &ObligationState> {
        self.inputs.iter().filter_map(|i| i.state.as_obligation())
    }

    pub fn input_tokens(&self) -> impl Iterator<Item = &TokenState> {
        self.inputs.iter().filter_map(|i| i.state.as_token())
    }

    pub fn input_transfers(&self) -> impl Iterator<Item = &TransferRecord> {
        self.inputs.iter().filter_map(|i| i.state.as_transfer())
    }

    pub fn output_obligations(&self) -> impl Iterator<Item = &ObligationState> {
        self.outputs.iter().filter_map(|o| o.as_obligation())
    }

    pub fn output_tokens(&self) -> impl Iterator<Item = &TokenState> {
        self.outputs.iter().filter_map(|o| o.as_token())
    }

    pub fn output_transfers(&self) -> impl Iterator<Item = &TransferRecord> {
        self.outputs.iter().filter_map(|o| o.as_transfer())
    }

    /// The kind of the first command, which drives the protocol checks
    pub fn primary_command(&self) -> Option<CommandKind> {
        self.commands.first().map(|c| c.kind)
    }
}

/// A signature by `by` over a transaction id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub by: PartyKey,
    pub bytes: Vec<u8>,
}

impl TransactionSignature {
    pub fn create(keys: &KeyPair, tx_id: &TxId) -> Self {
        Self {
            by: keys.public_key(),
            bytes: keys.sign(tx_id.as_ref()),
        }
    }

    pub fn is_valid_for(&self, tx_id: &TxId) -> bool {
        self.by.verify(tx_id.as_ref(), &self.bytes)
    }
}

/// An envelope with the signatures collected so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    id: TxId,
    envelope: TransactionEnvelope,
    signatures: Vec<TransactionSignature>,
}

impl SignedTransaction {
    pub fn new(envelope: TransactionEnvelope) -> Result<Self, StorageError> {
        let id = envelope.id()?;
        Ok(Self {
            id,
            envelope,
            signatures: Vec::new(),
        })
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn envelope(&self) -> &TransactionEnvelope {
        &self.envelope
    }

    pub fn signatures(&self) -> &[TransactionSignature] {
        &self.signatures
    }

    /// Recompute the id of a transaction received from another party
    pub fn check_id(&self) -> Result<(), SignatureError> {
        let actual = self
            .envelope
            .id()
            .map_err(|e| SignatureError::Encoding(e.to_string()))?;
        if actual != self.id {
            return Err(SignatureError::IdMismatch {
                claimed: self.id,
                actual,
            });
        }
        Ok(())
    }

    /// Sign with `keys`, replacing any earlier signature by the same key
    pub fn sign(&mut self, keys: &KeyPair) -> TransactionSignature {
        let signature = TransactionSignature::create(keys, &self.id);
        self.signatures.retain(|s| s.by != signature.by);
        self.signatures.push(signature.clone());
        signature
    }

    /// Attach a signature received from a counterparty after checking it
    pub fn add_signature(&mut self, signature: TransactionSignature) -> Result<(), SignatureError> {
        if !signature.is_valid_for(&self.id) {
            return Err(SignatureError::Invalid(signature.by));
        }
        self.signatures.retain(|s| s.by != signature.by);
        self.signatures.push(signature);
        Ok(())
    }

    pub fn signature_of(&self, key: &PartyKey) -> Option<&TransactionSignature> {
        self.signatures.iter().find(|s| s.by == *key)
    }

    pub fn is_signed_by(&self, key: &PartyKey) -> bool {
        self.signature_of(key).is_some()
    }

    /// The notary's signature, present once the transaction is committed
    pub fn notary_signature(&self) -> Option<&TransactionSignature> {
        self.signature_of(&self.envelope.notary.key)
    }

    pub fn missing_signers(&self) -> Vec<PartyKey> {
        self.envelope
            .required_signers()
            .into_iter()
            .filter(|k| !self.is_signed_by(k))
            .collect()
    }

    /// Check that every attached signature is valid for this transaction
    pub fn verify_signatures(&self) -> Result<(), SignatureError> {
        for signature in &self.signatures {
            if !signature.is_valid_for(&self.id) {
                return Err(SignatureError::Invalid(signature.by));
            }
        }
        Ok(())
    }

    /// Check all attached signatures and that only `allowed_missing` signers are absent
    pub fn verify_required_signatures(
        &self,
        allowed_missing: &[PartyKey],
    ) -> Result<(), SignatureError> {
        self.verify_signatures()?;
        let missing: Vec<PartyKey> = self
            .missing_signers()
            .into_iter()
            .filter(|k| !allowed_missing.contains(k))
            .collect();
        if !missing.is_empty() {
            return Err(SignatureError::Missing(missing));
        }
        Ok(())
    }

    /// The output states of this transaction with their references
    pub fn output_states(&self) -> Vec<StateAndRef> {
        self.envelope
            .outputs
            .iter()
            .enumerate()
            .map(|(index, state)| StateAndRef::new(StateRef::new(self.id, index as u32), state.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{Amount, Currency};

    fn party(keys: &KeyPair, name: &str) -> Party {
        keys.party(name)
    }

    fn envelope(issuer: &Party, owner: &Party, notary: &Party) -> TransactionEnvelope {
        let mut env = TransactionEnvelope::new(notary.clone());
        env.outputs.push(LedgerState::Token(TokenState::new(
            issuer.clone(),
            owner.clone(),
            Amount::new(700, Currency::MAD),
            env.created_at,
        )));
        env.commands
            .push(Command::new(CommandKind::ApprovePledge, [issuer, owner, owner]));
        env
    }

    #[test]
    fn test_command_signers_are_deduplicated() {
        let a = KeyPair::from_seed(b"A").party("A");
        let b = KeyPair::from_seed(b"B").party("B");
        let command = Command::new(CommandKind::BankTransfer, [&a, &b, &a]);

        assert_eq!(command.signers.len(), 2);
        assert!(command.requires(&a.key));
        assert!(command.requires(&b.key));
    }

    #[test]
    fn test_id_is_stable_and_content_addressed() {
        let issuer_keys = KeyPair::from_seed(b"CentralBank");
        let owner_keys = KeyPair::from_seed(b"BankA");
        let notary_keys = KeyPair::from_seed(b"Notary");
        let env = envelope(
            &party(&issuer_keys, "CentralBank"),
            &party(&owner_keys, "BankA"),
            &party(&notary_keys, "Notary"),
        );

        let id = env.id().unwrap();
        assert_eq!(env.clone().id().unwrap(), id);

        let mut changed = env.clone();
        changed.outputs.clear();
        assert_ne!(changed.id().unwrap(), id);
    }

    #[test]
    fn test_signature_collection() {
        let issuer_keys = KeyPair::from_seed(b"CentralBank");
        let owner_keys = KeyPair::from_seed(b"BankA");
        let notary_keys = KeyPair::from_seed(b"Notary");
        let issuer = party(&issuer_keys, "CentralBank");
        let owner = party(&owner_keys, "BankA");
        let env = envelope(&issuer, &owner, &party(&notary_keys, "Notary"));

        let mut tx = SignedTransaction::new(env).unwrap();
        tx.sign(&issuer_keys);
        assert_eq!(tx.missing_signers(), vec![owner.key]);
        assert!(tx.verify_required_signatures(&[]).is_err());
        assert!(tx.verify_required_signatures(&[owner.key]).is_ok());

        // The owner signs on its own copy, the signature travels back
        let mut remote = tx.clone();
        let signature = remote.sign(&owner_keys);
        tx.add_signature(signature).unwrap();

        assert!(tx.missing_signers().is_empty());
        assert!(tx.verify_required_signatures(&[]).is_ok());
        assert!(tx.notary_signature().is_none());
    }

    #[test]
    fn test_forged_signature_is_rejected() {
        let issuer_keys = KeyPair::from_seed(b"CentralBank");
        let owner_keys = KeyPair::from_seed(b"BankA");
        let notary_keys = KeyPair::from_seed(b"Notary");
        let issuer = party(&issuer_keys, "CentralBank");
        let owner = party(&owner_keys, "BankA");
        let mut tx =
            SignedTransaction::new(envelope(&issuer, &owner, &party(&notary_keys, "Notary")))
                .unwrap();

        // Signed by the issuer but claimed to be from the owner
        let mut forged = TransactionSignature::create(&issuer_keys, &tx.id());
        forged.by = owner.key;

        assert!(matches!(
            tx.add_signature(forged),
            Err(SignatureError::Invalid(key)) if key == owner.key
        ));
    }

    #[test]
    fn test_check_id_detects_tampering() {
        let issuer_keys = KeyPair::from_seed(b"CentralBank");
        let owner_keys = KeyPair::from_seed(b"BankA");
        let notary_keys = KeyPair::from_seed(b"Notary");
        let env = envelope(
            &party(&issuer_keys, "CentralBank"),
            &party(&owner_keys, "BankA"),
            &party(&notary_keys, "Notary"),
        );
        let tx = SignedTransaction::new(env).unwrap();
        assert!(tx.check_id().is_ok());

        // Round trip through the wire encoding keeps the id valid
        let bytes = bincode::serialize(&tx).unwrap();
        let mut decoded: SignedTransaction = bincode::deserialize(&bytes).unwrap();
        assert!(decoded.check_id().is_ok());

        decoded.envelope.outputs.clear();
        assert!(matches!(
            decoded.check_id(),
            Err(SignatureError::IdMismatch { .. })
        ));
    }

    #[test]
    fn test_output_states_carry_references() {
        let issuer_keys = KeyPair::from_seed(b"CentralBank");
        let owner_keys = KeyPair::from_seed(b"BankA");
        let notary_keys = KeyPair::from_seed(b"Notary");
        let env = envelope(
            &party(&issuer_keys, "CentralBank"),
            &party(&owner_keys, "BankA"),
            &party(&notary_keys, "Notary"),
        );
        let tx = SignedTransaction::new(env).unwrap();
        let outputs = tx.output_states();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].reference, StateRef::new(tx.id(), 0));
    }
}
