//! Multi-party signing protocol
//!
//! The initiator of a transaction opens one session per required
//! counterparty, collects their signatures, has the notary commit the
//! transaction and then broadcasts finality. Both sides are explicit state
//! machines fed with [`SessionMessage`]s; the node drives them.

use crate::directory::NetworkDirectory;
use crate::error::FlowError;
use ddr_core::id::LockId;
use ddr_core::identity::{KeyPair, Party};
use ddr_core::locks::current_time_millis;
use ddr_core::transaction::{SignedTransaction, TransactionEnvelope, TransactionSignature};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier shared by the two ends of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Initiator to responder: verify and sign this transaction
    SignRequest(SignedTransaction),
    Signature(TransactionSignature),
    Refusal(String),
    /// Initiator to responder: the notarised transaction
    Finalised(SignedTransaction),
    Aborted(String),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::SignRequest(_) => "SignRequest",
            Payload::Signature(_) => "Signature",
            Payload::Refusal(_) => "Refusal",
            Payload::Finalised(_) => "Finalised",
            Payload::Aborted(_) => "Aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub from: Party,
    pub to: Party,
    pub payload: Payload,
}

impl SessionMessage {
    pub fn new(session_id: SessionId, from: Party, to: Party, payload: Payload) -> Self {
        Self {
            session_id,
            from,
            to,
            payload,
        }
    }

    /// Wire encoding
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Check that a transaction received as final names `notary`, satisfies the
/// contract rules and carries the notary's and every required party's valid
/// signature
pub fn check_finality(tx: &SignedTransaction, notary: &Party) -> Result<(), FlowError> {
    tx.check_id()?;
    let id = tx.id();
    if tx.envelope().notary.key != notary.key {
        return Err(FlowError::Protocol(format!(
            "Transaction {} names {} instead of {} as notary",
            id,
            tx.envelope().notary,
            notary
        )));
    }
    ddr_contracts::verify(tx.envelope())?;
    match tx.notary_signature() {
        Some(signature) if signature.is_valid_for(&id) => {}
        _ => {
            return Err(FlowError::Protocol(format!(
                "Transaction {} is not signed by its notary",
                id
            )))
        }
    }
    tx.verify_required_signatures(&[])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Collecting,
    Notarising,
    Finalised,
    Aborted,
}

/// Initiator side of a transaction's signing sessions
#[derive(Debug, Clone)]
pub struct InitiatorSession {
    session_id: SessionId,
    me: Party,
    notary: Party,
    counterparties: Vec<Party>,
    transaction: SignedTransaction,
    state: InitiatorState,
}

impl InitiatorSession {
    /// Verify `envelope`, sign it and work out who else has to sign
    ///
    /// Nothing has been sent when this fails.
    pub fn start(
        me: Party,
        keys: &KeyPair,
        envelope: TransactionEnvelope,
        directory: &NetworkDirectory,
    ) -> Result<Self, FlowError> {
        ddr_contracts::verify(&envelope)?;

        let required = envelope.required_signers();
        if !required.contains(&me.key) {
            return Err(FlowError::InvalidArgument(format!(
                "{} is not a required signer of the transaction it initiates",
                me
            )));
        }
        let mut counterparties = Vec::new();
        for key in required.iter().filter(|k| **k != me.key) {
            let party = directory.party_by_key(key).ok_or_else(|| {
                FlowError::InvalidArgument(format!("Required signer {} is not on the network", key))
            })?;
            counterparties.push(party.clone());
        }

        let notary = envelope.notary.clone();
        let mut transaction = SignedTransaction::new(envelope)?;
        transaction.sign(keys);

        let state = if counterparties.is_empty() {
            InitiatorState::Notarising
        } else {
            InitiatorState::Collecting
        };
        log::info!(
            "{} built {} ({:?}); {} counterpart(ies) to sign",
            me,
            transaction.id(),
            transaction.envelope().primary_command(),
            counterparties.len()
        );

        Ok(Self {
            session_id: SessionId::new(),
            me,
            notary,
            counterparties,
            transaction,
            state,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn transaction(&self) -> &SignedTransaction {
        &self.transaction
    }

    pub fn counterparties(&self) -> &[Party] {
        &self.counterparties
    }

    /// Counterparties whose signature is still missing
    pub fn missing_counterparties(&self) -> Vec<&Party> {
        self.counterparties
            .iter()
            .filter(|p| !self.transaction.is_signed_by(&p.key))
            .collect()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.missing_counterparties().is_empty()
    }

    fn message(&self, to: &Party, payload: Payload) -> SessionMessage {
        SessionMessage::new(self.session_id, self.me.clone(), to.clone(), payload)
    }

    /// Sign requests for every counterparty that has not signed yet
    pub fn sign_requests(&self) -> Vec<SessionMessage> {
        if self.state != InitiatorState::Collecting {
            return Vec::new();
        }
        self.missing_counterparties()
            .into_iter()
            .map(|p| self.message(p, Payload::SignRequest(self.transaction.clone())))
            .collect()
    }

    /// Consume a counterparty's reply
    ///
    /// A refusal aborts the session and is returned as
    /// [`FlowError::CounterpartyRefusal`].
    pub fn on_message(&mut self, message: SessionMessage) -> Result<(), FlowError> {
        if message.session_id != self.session_id {
            return Err(FlowError::Protocol(format!(
                "Message for {} delivered to {}",
                message.session_id, self.session_id
            )));
        }
        let from = self
            .counterparties
            .iter()
            .find(|p| p.key == message.from.key)
            .map(|p| p.name.clone())
            .ok_or_else(|| {
                FlowError::Protocol(format!("Unexpected message from {}", message.from))
            })?;

        match (self.state, message.payload) {
            (InitiatorState::Collecting, Payload::Signature(signature)) => {
                if signature.by != message.from.key {
                    return Err(FlowError::Protocol(format!(
                        "{} sent a signature made by {}",
                        from, signature.by
                    )));
                }
                self.transaction.add_signature(signature)?;
                log::debug!("Signature from {} for {}", from, self.transaction.id());
                if self.is_fully_signed() {
                    log::info!("Collected all signatures for {}", self.transaction.id());
                    self.state = InitiatorState::Notarising;
                }
                Ok(())
            }
            (InitiatorState::Collecting, Payload::Refusal(reason)) => {
                log::warn!("{} refused {}: {}", from, self.transaction.id(), reason);
                self.state = InitiatorState::Aborted;
                Err(FlowError::CounterpartyRefusal {
                    party: from,
                    reason,
                })
            }
            (state, payload) => Err(FlowError::Protocol(format!(
                "Unexpected {} from {} while {:?}",
                payload.name(),
                from,
                state
            ))),
        }
    }

    /// Attach the notary's signature and produce the finality broadcast
    pub fn finalise(
        &mut self,
        notary_signature: TransactionSignature,
    ) -> Result<Vec<SessionMessage>, FlowError> {
        if self.state != InitiatorState::Notarising {
            return Err(FlowError::Protocol(format!(
                "Cannot finalise {} while {:?}",
                self.transaction.id(),
                self.state
            )));
        }
        if notary_signature.by != self.notary.key {
            return Err(FlowError::Protocol(format!(
                "Commit receipt for {} is not signed by {}",
                self.transaction.id(),
                self.notary
            )));
        }
        self.transaction.add_signature(notary_signature)?;
        self.state = InitiatorState::Finalised;

        Ok(self
            .counterparties
            .iter()
            .map(|p| self.message(p, Payload::Finalised(self.transaction.clone())))
            .collect())
    }

    /// Abort the session and tell every counterparty
    pub fn abort(&mut self, reason: &str) -> Vec<SessionMessage> {
        self.state = InitiatorState::Aborted;
        self.counterparties
            .iter()
            .map(|p| self.message(p, Payload::Aborted(reason.to_string())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    AwaitingProposal,
    AwaitingFinality,
    Done,
}

/// Responder side of one signing session
#[derive(Debug, Clone)]
pub struct ResponderSession {
    session_id: SessionId,
    me: Party,
    initiator: Party,
    /// The network notary every proposal must name
    notary: Party,
    state: ResponderState,
    transaction: Option<SignedTransaction>,
    /// Inputs this party reserved while the proposal is outstanding
    reservation: Option<LockId>,
    opened_at: u64,
}

impl ResponderSession {
    pub fn new(session_id: SessionId, me: Party, initiator: Party, notary: Party) -> Self {
        Self {
            session_id,
            me,
            initiator,
            notary,
            state: ResponderState::AwaitingProposal,
            transaction: None,
            reservation: None,
            opened_at: current_time_millis(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn initiator(&self) -> &Party {
        &self.initiator
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn reservation(&self) -> Option<LockId> {
        self.reservation
    }

    /// Unix time in milliseconds when the session was opened
    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    fn reply(&self, payload: Payload) -> SessionMessage {
        SessionMessage::new(self.session_id, self.me.clone(), self.initiator.clone(), payload)
    }

    /// Review a proposal and answer with a signature or a refusal
    ///
    /// `checks` runs the flow-specific checks after the generic ones and may
    /// hand back the lock of inputs it reserved.
    pub fn on_proposal<F>(
        &mut self,
        transaction: SignedTransaction,
        keys: &KeyPair,
        checks: F,
    ) -> SessionMessage
    where
        F: FnOnce(&SignedTransaction) -> Result<Option<LockId>, String>,
    {
        if self.state != ResponderState::AwaitingProposal {
            return self.reply(Payload::Refusal(format!(
                "Session {} already received a proposal",
                self.session_id
            )));
        }

        match self.review(&transaction, checks) {
            Ok(reservation) => {
                let signature = TransactionSignature::create(keys, &transaction.id());
                log::debug!("{} signed {} for {}", self.me, transaction.id(), self.initiator);
                self.reservation = reservation;
                self.transaction = Some(transaction);
                self.state = ResponderState::AwaitingFinality;
                self.reply(Payload::Signature(signature))
            }
            Err(reason) => {
                log::warn!(
                    "{} refused {} from {}: {}",
                    self.me,
                    transaction.id(),
                    self.initiator,
                    reason
                );
                self.state = ResponderState::Done;
                self.reply(Payload::Refusal(reason))
            }
        }
    }

    fn review<F>(&self, tx: &SignedTransaction, checks: F) -> Result<Option<LockId>, String>
    where
        F: FnOnce(&SignedTransaction) -> Result<Option<LockId>, String>,
    {
        tx.check_id().map_err(|e| e.to_string())?;
        if tx.envelope().notary.key != self.notary.key {
            return Err(format!(
                "Transaction names {} instead of {} as notary",
                tx.envelope().notary,
                self.notary
            ));
        }
        ddr_contracts::verify(tx.envelope()).map_err(|v| v.to_string())?;
        match tx.signature_of(&self.initiator.key) {
            Some(signature) if signature.is_valid_for(&tx.id()) => {}
            _ => return Err(format!("Transaction is not signed by {}", self.initiator)),
        }
        tx.verify_signatures().map_err(|e| e.to_string())?;
        if !tx.envelope().required_signers().contains(&self.me.key) {
            return Err(format!("{} is not a required signer", self.me));
        }
        checks(tx)
    }

    /// Accept the notarised transaction for recording
    pub fn on_finalised(
        &mut self,
        transaction: SignedTransaction,
    ) -> Result<SignedTransaction, FlowError> {
        if self.state != ResponderState::AwaitingFinality {
            return Err(FlowError::Protocol(format!(
                "Unexpected finality in {} while {:?}",
                self.session_id, self.state
            )));
        }
        let expected = self.transaction.as_ref().map(|tx| tx.id());
        if expected != Some(transaction.id()) {
            return Err(FlowError::Protocol(format!(
                "Finalised {} does not match the proposal in {}",
                transaction.id(),
                self.session_id
            )));
        }
        check_finality(&transaction, &self.notary)?;
        self.state = ResponderState::Done;
        Ok(transaction)
    }

    /// The initiator gave up; hands back the reservation to release
    pub fn on_aborted(&mut self) -> Option<LockId> {
        self.state = ResponderState::Done;
        self.reservation.take()
    }
}
