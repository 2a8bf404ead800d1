//! A ledger participant: runs operations as initiator and answers sessions
//! opened by other parties.

use crate::builders::{self, ExchangeTerms, ObligationRequest, TransactionBuilder};
use crate::directory::NetworkDirectory;
use crate::error::FlowError;
use crate::lifecycle::{self, Initiator};
use crate::network::{MessageHandler, Transport};
use crate::oracle::AccountOracle;
use crate::protocol::{InitiatorSession, Payload, ResponderSession, SessionId, SessionMessage};
use chrono::{DateTime, Utc};
use ddr_core::amount::{Amount, Currency};
use ddr_core::config::LedgerConfig;
use ddr_core::id::{generate_reference, LineageId, LockId, StateRef, TxId};
use ddr_core::identity::{KeyPair, Party};
use ddr_core::locks::{current_time_millis, ReservationGuard};
use ddr_core::states::{ObligationState, ObligationStatus, ObligationType, StateAndRef, StateKind, TransferRecord};
use ddr_core::transaction::{CommandKind, SignedTransaction, TransactionSignature};
use ddr_notary::{NotarisationOutcome, NotaryError, NotaryService};
use ddr_vault::{PageSpecification, QueryCriteria, StateStatus, TokenSelector, Vault};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

const QUERY_PAGE_SIZE: u32 = 200;

/// Collaborators a node runs with
pub struct NodeServices {
    pub vault: Arc<dyn Vault>,
    pub directory: Arc<NetworkDirectory>,
    pub notary: Arc<dyn NotaryService>,
    pub transport: Arc<dyn Transport>,
    /// Consulted before countersigning inter-bank transfers
    pub oracle: Option<Arc<dyn AccountOracle>>,
}

/// An inter-bank transfer to settle
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub sender_rib: String,
    pub receiver_rib: String,
    /// Resolved from the receiver RIB's bank code when absent
    pub receiver_bank: Option<String>,
    pub amount: Amount,
    pub execution_date: DateTime<Utc>,
    /// Generated as `INTER-...` when absent
    pub external_id: Option<String>,
}

/// A flow interrupted by an unreachable counterparty or notary
struct PendingFlow {
    session: InitiatorSession,
    lock_id: Option<LockId>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, FlowError> {
    mutex
        .lock()
        .map_err(|_| FlowError::Protocol(format!("{} lock poisoned", what)))
}

pub struct LedgerNode {
    party: Party,
    keys: KeyPair,
    config: LedgerConfig,
    services: NodeServices,
    responders: Mutex<HashMap<SessionId, ResponderSession>>,
    pending: Mutex<HashMap<TxId, PendingFlow>>,
    /// External ids of requests this node has signed but not yet seen final
    claims: Mutex<HashMap<String, SessionId>>,
}

impl LedgerNode {
    pub fn new(keys: KeyPair, config: LedgerConfig, services: NodeServices) -> Result<Self, FlowError> {
        let party = services
            .directory
            .party_by_key(&keys.public_key())
            .cloned()
            .ok_or_else(|| {
                FlowError::InvalidArgument(format!(
                    "{} is not registered in the network directory",
                    keys.public_key()
                ))
            })?;
        log::info!("Starting ledger node {}", party);
        // Flows and responder sessions live in memory, so no reservation
        // left in the vault by a previous run has an owner any more
        let orphaned = services.vault.release_all()?;
        if orphaned > 0 {
            log::warn!("{} released {} orphaned reservation(s)", party, orphaned);
        }
        Ok(Self {
            party,
            keys,
            config,
            services,
            responders: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
        })
    }

    pub fn party(&self) -> &Party {
        &self.party
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn vault(&self) -> &(dyn Vault + 'static) {
        self.services.vault.as_ref()
    }

    fn directory(&self) -> &NetworkDirectory {
        &self.services.directory
    }

    fn notary_party(&self) -> &Party {
        self.services.notary.identity()
    }

    pub fn is_issuer(&self) -> bool {
        self.directory().issuer().key == self.party.key
    }

    fn require_issuer(&self, action: &str) -> Result<(), FlowError> {
        if self.is_issuer() {
            Ok(())
        } else {
            Err(FlowError::InvalidArgument(format!(
                "Only the issuer can {}",
                action
            )))
        }
    }

    fn selector(&self) -> TokenSelector<'_, dyn Vault> {
        TokenSelector::new(self.vault(), self.config.selector.clone())
            .with_reservation_ttl(self.config.reservation_ttl_ms)
    }

    // ----- Obligation operations -----

    pub fn request_pledge(
        &self,
        amount: Amount,
        external_id: Option<String>,
    ) -> Result<TxId, FlowError> {
        self.request_obligation(ObligationType::Pledge, amount, external_id)
    }

    pub fn request_redeem(
        &self,
        amount: Amount,
        external_id: Option<String>,
    ) -> Result<TxId, FlowError> {
        self.request_obligation(ObligationType::Redeem, amount, external_id)
    }

    fn request_obligation(
        &self,
        obligation_type: ObligationType,
        amount: Amount,
        external_id: Option<String>,
    ) -> Result<TxId, FlowError> {
        if amount.is_zero() {
            return Err(FlowError::InvalidArgument(
                "Requested amount must be positive".to_string(),
            ));
        }
        if self.is_issuer() {
            return Err(FlowError::InvalidArgument(
                "The issuer cannot request an obligation from itself".to_string(),
            ));
        }
        let external_id = external_id
            .unwrap_or_else(|| generate_reference(obligation_type.as_str()));
        if self.find_obligation(&external_id)?.is_some() {
            return Err(FlowError::DuplicateExternalId(external_id));
        }
        if obligation_type == ObligationType::Redeem {
            let balance = self.balance(amount.currency)?;
            if balance.quantity < amount.quantity {
                return Err(FlowError::InsufficientBalance {
                    requested: amount,
                    available: balance,
                });
            }
        }

        let builder = builders::request_obligation(
            self.notary_party(),
            &ObligationRequest {
                issuer: self.directory().issuer().clone(),
                requester: self.party.clone(),
                amount,
                obligation_type,
                external_id,
                request_date: Utc::now(),
            },
        )?;
        self.run_flow(builder, None)
    }

    pub fn approve_pledge(&self, external_id: &str) -> Result<TxId, FlowError> {
        self.require_issuer("approve a pledge")?;
        let obligation = self.live_obligation(external_id, ObligationType::Pledge)?;
        let builder = builders::approve_pledge(
            self.notary_party(),
            &obligation,
            self.config.mint_denomination,
            Utc::now(),
        )?;
        self.run_flow(builder, None)
    }

    pub fn deny_pledge(&self, external_id: &str) -> Result<TxId, FlowError> {
        self.terminate(external_id, CommandKind::DenyPledge)
    }

    pub fn cancel_pledge(&self, external_id: &str) -> Result<TxId, FlowError> {
        self.terminate(external_id, CommandKind::CancelPledge)
    }

    /// Burn the owner's tokens for an approved redeem
    ///
    /// The issuer selects the owner's tokens from its own view of the ledger;
    /// the owner reserves them again on its side before countersigning.
    pub fn approve_redeem(&self, external_id: &str) -> Result<TxId, FlowError> {
        self.require_issuer("approve a redeem")?;
        self.with_conflict_retry(|| {
            let obligation = self.live_obligation(external_id, ObligationType::Redeem)?;
            let requested = obligation
                .state
                .as_obligation()
                .cloned()
                .ok_or_else(|| FlowError::NotFound(external_id.to_string()))?;

            let lock_id = LockId::new();
            let tokens = self
                .selector()
                .select_tokens(&requested.owner.key, &requested.amount, &lock_id)?;
            let guard = ReservationGuard::adopt(
                self.vault(),
                lock_id,
                tokens.iter().map(|t| t.reference).collect(),
            );
            let builder = builders::approve_redeem(
                self.notary_party(),
                &obligation,
                tokens,
                lock_id,
                Utc::now(),
            )?;
            self.run_flow(builder, Some(guard))
        })
    }

    pub fn deny_redeem(&self, external_id: &str) -> Result<TxId, FlowError> {
        self.terminate(external_id, CommandKind::DenyRedeem)
    }

    pub fn cancel_redeem(&self, external_id: &str) -> Result<TxId, FlowError> {
        self.terminate(external_id, CommandKind::CancelRedeem)
    }

    fn terminate(&self, external_id: &str, kind: CommandKind) -> Result<TxId, FlowError> {
        let obligation_type = kind.obligation_type().ok_or_else(|| {
            FlowError::InvalidArgument(format!("{} does not terminate an obligation", kind))
        })?;
        let obligation = self.live_obligation(external_id, obligation_type)?;
        let requested = obligation
            .state
            .as_obligation()
            .ok_or_else(|| FlowError::NotFound(external_id.to_string()))?;
        match lifecycle::initiator_of(kind) {
            Some(Initiator::Issuer) => self.require_issuer(&format!("{} an obligation", kind))?,
            Some(Initiator::Requester) if requested.requester.key != self.party.key => {
                return Err(FlowError::InvalidArgument(format!(
                    "Only {} can {} obligation {}",
                    requested.requester, kind, external_id
                )));
            }
            _ => {}
        }

        let builder = builders::terminate_obligation(self.notary_party(), &obligation, kind)?;
        self.run_flow(builder, None)
    }

    // ----- Transfers -----

    /// Settle an inter-bank transfer by exchanging tokens with the receiver bank
    pub fn atomic_exchange(&self, request: TransferRequest) -> Result<TxId, FlowError> {
        if request.amount.is_zero() {
            return Err(FlowError::InvalidArgument(
                "Transfer amount must be positive".to_string(),
            ));
        }
        if request.sender_rib.eq_ignore_ascii_case(&request.receiver_rib) {
            return Err(FlowError::InvalidArgument(
                "Sender and receiver accounts should be different".to_string(),
            ));
        }
        let receiver_bank = match &request.receiver_bank {
            Some(name) => self.directory().party(name),
            None => self.directory().bank_for_rib(&request.receiver_rib),
        }
        .cloned()
        .ok_or_else(|| {
            FlowError::InvalidArgument(format!(
                "No bank found for account {}",
                request.receiver_rib
            ))
        })?;
        if receiver_bank.key == self.party.key {
            return Err(FlowError::InvalidArgument(
                "Transfers within one bank are recorded, not exchanged".to_string(),
            ));
        }

        let external_id = match request.external_id {
            Some(external_id) => {
                self.require_new_transfer(&external_id)?;
                external_id
            }
            None => generate_reference("INTER"),
        };
        let terms = ExchangeTerms {
            sender_rib: request.sender_rib,
            receiver_rib: request.receiver_rib,
            sender_bank: self.party.clone(),
            receiver_bank,
            amount: request.amount,
            execution_date: request.execution_date,
            external_id,
        };

        self.with_conflict_retry(|| {
            let lock_id = LockId::new();
            let tokens = self
                .selector()
                .select_tokens(&self.party.key, &terms.amount, &lock_id)?;
            let guard = ReservationGuard::adopt(
                self.vault(),
                lock_id,
                tokens.iter().map(|t| t.reference).collect(),
            );
            let builder =
                builders::atomic_exchange(self.notary_party(), &terms, tokens, lock_id, Utc::now())?;
            self.run_flow(builder, Some(guard))
        })
    }

    /// Register a transfer between two accounts held at this bank
    pub fn record_intra_bank_transfer(
        &self,
        amount: Amount,
        sender_rib: &str,
        receiver_rib: &str,
        execution_date: DateTime<Utc>,
        external_id: Option<String>,
    ) -> Result<TxId, FlowError> {
        if amount.is_zero() {
            return Err(FlowError::InvalidArgument(
                "Transfer amount must be positive".to_string(),
            ));
        }
        if sender_rib.eq_ignore_ascii_case(receiver_rib) {
            return Err(FlowError::InvalidArgument(
                "Intra-bank transfer should have different sender and receiver".to_string(),
            ));
        }
        if let Some(code) = self.directory().code_of(&self.party) {
            if !sender_rib.starts_with(code) {
                return Err(FlowError::InvalidArgument(format!(
                    "Account {} is not held at {}",
                    sender_rib, self.party
                )));
            }
        }

        let external_id = match external_id {
            Some(external_id) => {
                self.require_new_transfer(&external_id)?;
                external_id
            }
            None => generate_reference("INTRA"),
        };
        let builder = builders::record_intra_bank_transfer(
            self.notary_party(),
            &self.party,
            self.directory().issuer(),
            sender_rib,
            receiver_rib,
            amount,
            execution_date,
            external_id,
        )?;
        self.run_flow(builder, None)
    }

    // ----- Queries -----

    /// Quantity of unconsumed tokens owned by this node, reserved ones included
    pub fn balance(&self, currency: Currency) -> Result<Amount, FlowError> {
        Ok(self.vault().balance(&self.party.key, currency)?)
    }

    pub fn token_count(&self, currency: Currency) -> Result<u64, FlowError> {
        let criteria = QueryCriteria::of_kind(StateKind::Token)
            .with_owner(self.party.key)
            .with_currency(currency);
        let page = self.vault().query(&criteria, &PageSpecification::new(1, 1))?;
        Ok(page.total_states_available)
    }

    fn query_all(&self, criteria: &QueryCriteria) -> Result<Vec<StateAndRef>, FlowError> {
        let mut states = Vec::new();
        let mut page_number = 1;
        loop {
            let page = self
                .vault()
                .query(criteria, &PageSpecification::new(page_number, QUERY_PAGE_SIZE))?;
            let done = page.states.is_empty()
                || u64::from(page_number) * u64::from(QUERY_PAGE_SIZE) >= page.total_states_available;
            states.extend(page.states);
            if done {
                return Ok(states);
            }
            page_number += 1;
        }
    }

    /// The live (unconsumed) obligation carrying `external_id`
    pub fn find_obligation(&self, external_id: &str) -> Result<Option<StateAndRef>, FlowError> {
        let criteria =
            QueryCriteria::of_kind(StateKind::Obligation).with_external_id(external_id);
        let page = self.vault().query(&criteria, &PageSpecification::new(1, 1))?;
        Ok(page.states.into_iter().next())
    }

    /// The transfer record carrying `external_id`, if this node recorded one
    pub fn find_transfer(&self, external_id: &str) -> Result<Option<StateAndRef>, FlowError> {
        let criteria = QueryCriteria::of_kind(StateKind::Transfer)
            .with_external_id(external_id)
            .with_state_status(StateStatus::All);
        let page = self.vault().query(&criteria, &PageSpecification::new(1, 1))?;
        Ok(page.states.into_iter().next())
    }

    /// Id of the checkpointed flow recording a transfer with `external_id`
    pub fn pending_transfer(&self, external_id: &str) -> Result<Option<TxId>, FlowError> {
        Ok(lock(&self.pending, "pending")?
            .iter()
            .find(|(_, flow)| {
                flow.session
                    .transaction()
                    .envelope()
                    .output_transfers()
                    .any(|t| t.external_id == external_id)
            })
            .map(|(tx_id, _)| *tx_id))
    }

    fn require_new_transfer(&self, external_id: &str) -> Result<(), FlowError> {
        if self.find_transfer(external_id)?.is_some() || self.pending_transfer(external_id)?.is_some() {
            return Err(FlowError::DuplicateExternalId(external_id.to_string()));
        }
        Ok(())
    }

    fn live_obligation(
        &self,
        external_id: &str,
        obligation_type: ObligationType,
    ) -> Result<StateAndRef, FlowError> {
        self.find_obligation(external_id)?
            .filter(|s| {
                s.state
                    .as_obligation()
                    .is_some_and(|o| o.obligation_type == obligation_type)
            })
            .ok_or_else(|| {
                FlowError::NotFound(format!(
                    "No live {} obligation with external id {}",
                    obligation_type, external_id
                ))
            })
    }

    /// Last version of every obligation lineage with its current status
    fn lineages(&self, external_id: Option<&str>) -> Result<Vec<ObligationState>, FlowError> {
        let mut criteria =
            QueryCriteria::of_kind(StateKind::Obligation).with_state_status(StateStatus::All);
        if let Some(external_id) = external_id {
            criteria = criteria.with_external_id(external_id);
        }

        // Later versions are recorded after the ones they replace
        let mut latest: Vec<StateAndRef> = Vec::new();
        let mut positions: HashMap<LineageId, usize> = HashMap::new();
        for state in self.query_all(&criteria)? {
            let Some(lineage) = state.state.lineage_id().copied() else {
                continue;
            };
            match positions.get(&lineage) {
                Some(&pos) => latest[pos] = state,
                None => {
                    positions.insert(lineage, latest.len());
                    latest.push(state);
                }
            }
        }

        let mut obligations = Vec::with_capacity(latest.len());
        for state in latest {
            let Some(obligation) = state.state.as_obligation() else {
                continue;
            };
            let consumer = match self.vault().consumed_by(&state.reference)? {
                Some(tx_id) => self
                    .vault()
                    .get_transaction(&tx_id)?
                    .and_then(|tx| tx.envelope().primary_command()),
                None => None,
            };
            let status = lifecycle::derive_status(obligation, consumer);
            obligations.push(obligation.with_status(status));
        }
        Ok(obligations)
    }

    /// Current status of the most recent obligation carrying `external_id`
    pub fn obligation_status(&self, external_id: &str) -> Result<ObligationStatus, FlowError> {
        self.lineages(Some(external_id))?
            .last()
            .map(|o| o.status)
            .ok_or_else(|| FlowError::NotFound(format!("No obligation with external id {}", external_id)))
    }

    /// Every obligation this node takes part in, optionally narrowed to one status
    pub fn obligations(
        &self,
        status: Option<ObligationStatus>,
    ) -> Result<Vec<ObligationState>, FlowError> {
        Ok(self
            .lineages(None)?
            .into_iter()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .collect())
    }

    fn transfers<P>(&self, keep: P) -> Result<Vec<TransferRecord>, FlowError>
    where
        P: Fn(&TransferRecord) -> bool,
    {
        let criteria = QueryCriteria::of_kind(StateKind::Transfer);
        Ok(self
            .query_all(&criteria)?
            .into_iter()
            .filter_map(|s| s.state.as_transfer().cloned())
            .filter(|t| keep(t))
            .collect())
    }

    /// Inter-bank transfers credited to this bank
    pub fn incoming_transfers(&self) -> Result<Vec<TransferRecord>, FlowError> {
        self.transfers(|t| {
            t.receiver_bank
                .as_ref()
                .is_some_and(|r| r.key == self.party.key)
        })
    }

    /// Transfers sent by this bank, intra-bank records included
    pub fn outgoing_transfers(&self) -> Result<Vec<TransferRecord>, FlowError> {
        self.transfers(|t| t.sender_bank.key == self.party.key)
    }

    /// Close stale responder sessions and drop expired soft locks from the vault
    pub fn sweep_expired_reservations(&self) -> Result<usize, FlowError> {
        self.expire_responder_sessions(self.config.session_timeout_ms)?;
        Ok(self.vault().cleanup_expired_reservations()?)
    }

    /// Number of sessions this node signed in and still awaits finality for
    pub fn open_sessions(&self) -> Result<usize, FlowError> {
        Ok(lock(&self.responders, "responders")?.len())
    }

    /// Close responder sessions opened at least `max_age_ms` ago
    ///
    /// Their initiator never sent finality or an abort. Reservations and
    /// external id claims held for them are released.
    pub fn expire_responder_sessions(&self, max_age_ms: u64) -> Result<usize, FlowError> {
        let now = current_time_millis();
        let stale: Vec<ResponderSession> = {
            let mut responders = lock(&self.responders, "responders")?;
            let ids: Vec<SessionId> = responders
                .iter()
                .filter(|(_, s)| now.saturating_sub(s.opened_at()) >= max_age_ms)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| responders.remove(id)).collect()
        };

        let count = stale.len();
        for mut session in stale {
            log::warn!(
                "{} closing {} left open by {}",
                self.party,
                session.session_id(),
                session.initiator()
            );
            let reservation = session.on_aborted();
            self.end_responder_session(session.session_id(), reservation);
        }
        Ok(count)
    }

    // ----- Checkpointed flows -----

    pub fn pending_transactions(&self) -> Result<Vec<TxId>, FlowError> {
        Ok(lock(&self.pending, "pending")?.keys().copied().collect())
    }

    /// Continue a checkpointed flow with the same signed transaction
    pub fn resume_pending(&self, tx_id: &TxId) -> Result<TxId, FlowError> {
        let flow = lock(&self.pending, "pending")?
            .remove(tx_id)
            .ok_or_else(|| FlowError::NotFound(format!("No pending flow for {}", tx_id)))?;
        log::info!("{} resuming {}", self.party, tx_id);
        self.drive(flow.session, flow.lock_id)
    }

    /// Give up a checkpointed flow and release what it reserved
    pub fn abandon_pending(&self, tx_id: &TxId) -> Result<(), FlowError> {
        let flow = lock(&self.pending, "pending")?
            .remove(tx_id)
            .ok_or_else(|| FlowError::NotFound(format!("No pending flow for {}", tx_id)))?;
        let mut session = flow.session;
        log::warn!("{} abandoning {}", self.party, tx_id);
        self.abort(&mut session, flow.lock_id, "Abandoned by the initiator");
        Ok(())
    }

    // ----- Initiator driver -----

    fn with_conflict_retry<F>(&self, mut attempt: F) -> Result<TxId, FlowError>
    where
        F: FnMut() -> Result<TxId, FlowError>,
    {
        let limit = self.config.conflict_retry_limit;
        let mut rebuilds = 0;
        loop {
            match attempt() {
                Err(FlowError::ConsensusConflict { conflicts }) if rebuilds < limit => {
                    rebuilds += 1;
                    log::warn!(
                        "{} lost {} input(s) to another transaction; rebuilding ({}/{})",
                        self.party,
                        conflicts.len(),
                        rebuilds,
                        limit
                    );
                }
                other => return other,
            }
        }
    }

    fn run_flow(
        &self,
        builder: TransactionBuilder,
        reservation: Option<ReservationGuard<'_, dyn Vault>>,
    ) -> Result<TxId, FlowError> {
        // The guard releases the inputs if the session cannot start
        let session = InitiatorSession::start(
            self.party.clone(),
            &self.keys,
            builder.into_envelope(),
            self.directory(),
        )?;
        let lock_id = reservation.map(|guard| guard.disarm().0);
        self.drive(session, lock_id)
    }

    fn drive(&self, mut session: InitiatorSession, lock_id: Option<LockId>) -> Result<TxId, FlowError> {
        let tx_id = session.transaction().id();
        if !session.is_fully_signed() {
            match self.collect_signatures(&mut session) {
                Ok(()) => {}
                Err(FlowError::CounterpartyUnreachable { party, .. }) => {
                    log::warn!("{} unreachable; checkpointing {}", party, tx_id);
                    self.checkpoint(session, lock_id)?;
                    return Err(FlowError::CounterpartyUnreachable {
                        party,
                        tx_id: Some(tx_id),
                    });
                }
                Err(e) => {
                    self.abort(&mut session, lock_id, &e.to_string());
                    return Err(e);
                }
            }
        }
        self.notarise(session, lock_id)
    }

    /// Send every outstanding sign request at once and consume the replies
    fn collect_signatures(&self, session: &mut InitiatorSession) -> Result<(), FlowError> {
        let requests = session.sign_requests();
        let transport = &self.services.transport;
        let results: Vec<Result<(), FlowError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = requests
                .into_iter()
                .map(|message| {
                    let to = message.to.name.clone();
                    (to, scope.spawn(move || transport.send(message)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(to, handle)| match handle.join() {
                    Ok(sent) => sent.map_err(FlowError::from),
                    Err(_) => Err(FlowError::Protocol(format!("Sending to {} panicked", to))),
                })
                .collect()
        });

        // Every reply is consumed; the first failure is reported
        let mut failure = None;
        for reply in transport.receive(&self.party.key, &session.session_id()) {
            if let Err(e) = session.on_message(reply) {
                match failure {
                    None => failure = Some(e),
                    Some(_) => log::debug!("Ignoring reply to {}: {}", session.session_id(), e),
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        for result in results {
            result?;
        }
        if !session.is_fully_signed() {
            let missing: Vec<String> = session
                .missing_counterparties()
                .iter()
                .map(|p| p.name.clone())
                .collect();
            return Err(FlowError::Protocol(format!(
                "No answer from {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn notarise(&self, mut session: InitiatorSession, lock_id: Option<LockId>) -> Result<TxId, FlowError> {
        let tx_id = session.transaction().id();
        let attempts = self.config.notary_retry_limit.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.services.notary.notarise(session.transaction()) {
                Ok(NotarisationOutcome::Committed(signature)) => {
                    return self.finalise(session, lock_id, signature);
                }
                Ok(NotarisationOutcome::Conflict(conflicts)) => {
                    log::warn!(
                        "Notary rejected {}: {} input(s) already consumed",
                        tx_id,
                        conflicts.len()
                    );
                    for conflict in &conflicts {
                        self.vault()
                            .mark_consumed(&[conflict.state_ref], &conflict.consumed_by)?;
                    }
                    self.abort(&mut session, lock_id, "Inputs consumed by another transaction");
                    return Err(FlowError::ConsensusConflict { conflicts });
                }
                Err(NotaryError::Unavailable(message)) => {
                    log::warn!(
                        "Notary unavailable for {} (attempt {}/{}): {}",
                        tx_id,
                        attempt,
                        attempts,
                        message
                    );
                    reason = message;
                }
                Err(NotaryError::InvalidTransaction(message)) => {
                    self.abort(&mut session, lock_id, &message);
                    return Err(FlowError::Protocol(format!(
                        "Notary rejected {}: {}",
                        tx_id, message
                    )));
                }
            }
        }

        self.checkpoint(session, lock_id)?;
        Err(FlowError::NotarisationPending { tx_id, reason })
    }

    fn finalise(
        &self,
        mut session: InitiatorSession,
        lock_id: Option<LockId>,
        notary_signature: TransactionSignature,
    ) -> Result<TxId, FlowError> {
        let tx_id = session.transaction().id();
        let broadcast = session.finalise(notary_signature)?;
        self.vault().record_transaction(session.transaction())?;
        if let Some(lock_id) = lock_id {
            self.vault().release(&lock_id, None)?;
        }
        for message in broadcast {
            let to = message.to.clone();
            if let Err(e) = self.services.transport.send(message) {
                log::warn!("Could not deliver {} to {}: {}", tx_id, to, e);
            }
        }
        log::info!("{} committed {}", self.party, tx_id);
        Ok(tx_id)
    }

    fn abort(&self, session: &mut InitiatorSession, lock_id: Option<LockId>, reason: &str) {
        let tx_id = session.transaction().id();
        for message in session.abort(reason) {
            let to = message.to.clone();
            if let Err(e) = self.services.transport.send(message) {
                log::warn!("Could not tell {} that {} was aborted: {}", to, tx_id, e);
            }
        }
        if let Some(lock_id) = lock_id {
            if let Err(e) = self.vault().release(&lock_id, None) {
                log::error!("Failed to release reservations of {}: {}", tx_id, e);
            }
        }
    }

    fn checkpoint(&self, session: InitiatorSession, lock_id: Option<LockId>) -> Result<(), FlowError> {
        let tx_id = session.transaction().id();
        lock(&self.pending, "pending")?.insert(tx_id, PendingFlow { session, lock_id });
        Ok(())
    }

    // ----- Responder side -----

    fn review_proposal(
        &self,
        tx: &SignedTransaction,
        initiator: &Party,
        session_id: SessionId,
    ) -> Result<Option<LockId>, String> {
        let env = tx.envelope();
        let Some(kind) = env.primary_command() else {
            return Err("Transaction carries no command".to_string());
        };

        match kind {
            CommandKind::RequestPledge | CommandKind::RequestRedeem => {
                let obligation = env
                    .output_obligations()
                    .next()
                    .ok_or_else(|| "Request creates no obligation".to_string())?;
                self.check_initiator(obligation, kind, initiator)?;
                if obligation.issuer.key != self.party.key || !self.is_issuer() {
                    return Err(format!("{} is not the issuer named in the request", self.party));
                }
                if kind == CommandKind::RequestRedeem {
                    let balance = self
                        .vault()
                        .balance(&obligation.owner.key, obligation.amount.currency)
                        .map_err(|e| e.to_string())?;
                    if balance.quantity < obligation.amount.quantity {
                        return Err(format!(
                            "{} holds {} and cannot redeem {}",
                            obligation.owner, balance, obligation.amount
                        ));
                    }
                }
                self.claim_external_id(&obligation.external_id, session_id)?;
                Ok(None)
            }
            CommandKind::ApprovePledge
            | CommandKind::ApproveRedeem
            | CommandKind::DenyPledge
            | CommandKind::DenyRedeem
            | CommandKind::CancelPledge
            | CommandKind::CancelRedeem => {
                let obligation = env
                    .input_obligations()
                    .next()
                    .ok_or_else(|| "No obligation is consumed".to_string())?;
                self.check_initiator(obligation, kind, initiator)?;
                for input in env.inputs.iter().filter(|i| i.state.as_obligation().is_some()) {
                    self.require_live(input)?;
                }
                if kind == CommandKind::ApproveRedeem {
                    return self.reserve_own_inputs(tx).map(Some);
                }
                Ok(None)
            }
            CommandKind::BankTransfer => {
                let record = env
                    .output_transfers()
                    .next()
                    .ok_or_else(|| "Transfer creates no record".to_string())?;
                if let Some(oracle) = &self.services.oracle {
                    match oracle.account_eligible_for_transfer(
                        &record.receiver_rib,
                        &record.amount,
                        &self.party,
                    ) {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(format!(
                                "Account {} is not eligible for the transfer",
                                record.receiver_rib
                            ))
                        }
                        Err(e) => return Err(e.to_string()),
                    }
                }
                Ok(None)
            }
            CommandKind::RecordTransfer => Ok(None),
        }
    }

    fn check_initiator(
        &self,
        obligation: &ObligationState,
        kind: CommandKind,
        initiator: &Party,
    ) -> Result<(), String> {
        let expected = match lifecycle::initiator_of(kind) {
            Some(Initiator::Issuer) => &obligation.issuer,
            Some(Initiator::Requester) => &obligation.requester,
            None => return Ok(()),
        };
        if expected.key != initiator.key {
            return Err(format!("{} must be started by {}, not {}", kind, expected, initiator));
        }
        Ok(())
    }

    /// The consumed state must be known here and still unconsumed
    fn require_live(&self, input: &StateAndRef) -> Result<(), String> {
        let known = self
            .vault()
            .get_state(&input.reference)
            .map_err(|e| e.to_string())?;
        let consumed = self
            .vault()
            .consumed_by(&input.reference)
            .map_err(|e| e.to_string())?;
        match (known, consumed) {
            (Some(state), None) if state == *input => Ok(()),
            (Some(_), Some(by)) => Err(format!("{} was already consumed by {}", input.reference, by)),
            _ => Err(format!("{} is unknown to {}", input.reference, self.party)),
        }
    }

    /// Reserve the inputs this node owns while the proposal is outstanding
    fn reserve_own_inputs(&self, tx: &SignedTransaction) -> Result<LockId, String> {
        let refs: Vec<StateRef> = tx
            .envelope()
            .inputs
            .iter()
            .filter(|i| i.state.as_token().is_some_and(|t| t.owner.key == self.party.key))
            .map(|i| i.reference)
            .collect();
        let lock_id = LockId::new();
        let reserved = self
            .vault()
            .try_reserve(&lock_id, &refs, self.config.reservation_ttl_ms)
            .map_err(|e| e.to_string())?;
        if !reserved {
            return Err("Tokens are consumed or reserved by another flow".to_string());
        }
        Ok(lock_id)
    }

    fn claim_external_id(&self, external_id: &str, session_id: SessionId) -> Result<(), String> {
        let mut claims = self.claims.lock().map_err(|_| "claims lock poisoned".to_string())?;
        if claims.get(external_id).is_some_and(|s| *s != session_id) {
            return Err(format!("External id {} is already being requested", external_id));
        }
        if self
            .find_obligation(external_id)
            .map_err(|e| e.to_string())?
            .is_some()
        {
            return Err(format!("External id {} is already in use", external_id));
        }
        claims.insert(external_id.to_string(), session_id);
        Ok(())
    }

    fn end_responder_session(&self, session_id: SessionId, reservation: Option<LockId>) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.retain(|_, s| *s != session_id);
        }
        if let Some(lock_id) = reservation {
            if let Err(e) = self.vault().release(&lock_id, None) {
                log::error!("Failed to release reservations of {}: {}", session_id, e);
            }
        }
    }

    fn on_sign_request(
        &self,
        session_id: SessionId,
        initiator: Party,
        tx: SignedTransaction,
    ) -> SessionMessage {
        let mut session = ResponderSession::new(
            session_id,
            self.party.clone(),
            initiator.clone(),
            self.directory().notary().clone(),
        );
        let reply = session.on_proposal(tx, &self.keys, |tx| {
            self.review_proposal(tx, &initiator, session_id)
        });

        if matches!(reply.payload, Payload::Signature(_)) {
            match self.responders.lock() {
                Ok(mut responders) => {
                    responders.insert(session_id, session);
                }
                Err(_) => {
                    self.end_responder_session(session_id, session.reservation());
                    return SessionMessage::new(
                        session_id,
                        self.party.clone(),
                        initiator,
                        Payload::Refusal("responder sessions lock poisoned".to_string()),
                    );
                }
            }
        } else {
            self.end_responder_session(session_id, None);
        }
        reply
    }

    fn on_finalised(&self, session_id: SessionId, tx: SignedTransaction) -> Result<(), FlowError> {
        // Only transactions this node reviewed and signed are recorded
        let mut session = lock(&self.responders, "responders")?
            .remove(&session_id)
            .ok_or_else(|| {
                FlowError::Protocol(format!("No open session {} for {}", session_id, tx.id()))
            })?;
        let reservation = session.reservation();
        let result = session.on_finalised(tx).and_then(|tx| {
            self.vault().record_transaction(&tx)?;
            log::info!("{} recorded {}", self.party, tx.id());
            Ok(())
        });
        self.end_responder_session(session_id, reservation);
        result
    }

    fn on_aborted(&self, session_id: SessionId, reason: &str) {
        let session = self
            .responders
            .lock()
            .ok()
            .and_then(|mut r| r.remove(&session_id));
        let reservation = session.and_then(|mut s| s.on_aborted());
        log::info!("{} closing {}: {}", self.party, session_id, reason);
        self.end_responder_session(session_id, reservation);
    }
}

impl MessageHandler for LedgerNode {
    fn handle(&self, message: SessionMessage) -> Vec<SessionMessage> {
        let SessionMessage {
            session_id,
            from,
            payload,
            ..
        } = message;
        match payload {
            Payload::SignRequest(tx) => vec![self.on_sign_request(session_id, from, tx)],
            Payload::Finalised(tx) => {
                if let Err(e) = self.on_finalised(session_id, tx) {
                    log::error!("{} could not record finality in {}: {}", self.party, session_id, e);
                }
                Vec::new()
            }
            Payload::Aborted(reason) => {
                self.on_aborted(session_id, &reason);
                Vec::new()
            }
            other => {
                log::warn!(
                    "{} ignoring unsolicited {} from {}",
                    self.party,
                    other.name(),
                    from
                );
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for LedgerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerNode")
            .field("party", &self.party)
            .field("vault", &self.services.vault)
            .finish()
    }
}
