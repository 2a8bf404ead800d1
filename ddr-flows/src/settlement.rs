//! Settlement bus glue
//!
//! Transfer instructions arrive as JSON on a durable queue. Each one is
//! settled as an intra-bank record or an inter-bank exchange, acknowledged,
//! and answered with a status event on the outbound topic.

use crate::error::FlowError;
use crate::node::{LedgerNode, TransferRequest};
use chrono::{DateTime, Utc};
use ddr_core::amount::{Amount, Currency};
use ddr_core::states::bank_code;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Settlement bus error: {0}")]
    Bus(String),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// A transfer order received from the banking system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInstruction {
    pub reference: String,
    #[serde(rename = "senderRIB")]
    pub sender_rib: String,
    #[serde(rename = "receiverRIB")]
    pub receiver_rib: String,
    /// Amount in major units, e.g. `"1250.50"`
    pub amount: Decimal,
    /// The node's default currency when absent
    #[serde(default)]
    pub currency: Option<Currency>,
    pub execution_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    IntraBank,
    InterBank,
}

impl TransferInstruction {
    /// Same bank code on both accounts means the transfer stays within one bank
    pub fn kind(&self) -> TransferKind {
        match (bank_code(&self.sender_rib), bank_code(&self.receiver_rib)) {
            (Some(sender), Some(receiver)) if sender == receiver => TransferKind::IntraBank,
            _ => TransferKind::InterBank,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Committed {
        #[serde(rename = "txId")]
        tx_id: String,
    },
    /// Checkpointed; settles once the flow is resumed
    Pending {
        #[serde(rename = "txId")]
        tx_id: String,
        reason: String,
    },
    Failed {
        reason: String,
    },
    Received {
        #[serde(rename = "senderRIB")]
        sender_rib: String,
        #[serde(rename = "receiverRIB")]
        receiver_rib: String,
        amount: Decimal,
    },
}

/// Status update published for a transfer reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub reference: String,
    #[serde(flatten)]
    pub status: SettlementStatus,
}

impl SettlementEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One message taken from the inbound queue, to be acknowledged by `tag`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: String,
}

/// Message queue between the banking system and a node
pub trait SettlementBus: Send + Sync {
    /// Take the next inbound instruction, if any
    ///
    /// It stays unacknowledged until [`SettlementBus::acknowledge`].
    fn next_delivery(&self) -> Result<Option<Delivery>, SettlementError>;

    fn acknowledge(&self, tag: u64) -> Result<(), SettlementError>;

    fn publish(&self, event: &SettlementEvent) -> Result<(), SettlementError>;
}

#[derive(Debug, Default)]
struct BusQueues {
    next_tag: u64,
    inbound: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    published: Vec<String>,
}

/// In-process bus keeping its queues in memory
#[derive(Debug, Default)]
pub struct InMemorySettlementBus {
    queues: Mutex<BusQueues>,
}

impl InMemorySettlementBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> Result<std::sync::MutexGuard<'_, BusQueues>, SettlementError> {
        self.queues
            .lock()
            .map_err(|_| SettlementError::Bus("queue lock poisoned".to_string()))
    }

    /// Enqueue an instruction as its JSON body
    pub fn submit(&self, instruction: &TransferInstruction) -> Result<(), SettlementError> {
        let body = serde_json::to_string(instruction)?;
        self.submit_raw(body)
    }

    pub fn submit_raw(&self, body: impl Into<String>) -> Result<(), SettlementError> {
        let mut queues = self.queues()?;
        queues.next_tag += 1;
        let tag = queues.next_tag;
        queues.inbound.push_back(Delivery {
            tag,
            body: body.into(),
        });
        Ok(())
    }

    /// Put every unacknowledged delivery back on the queue
    pub fn redeliver_unacknowledged(&self) -> Result<usize, SettlementError> {
        let mut queues = self.queues()?;
        let mut unacked: Vec<Delivery> = queues.unacked.drain().map(|(_, d)| d).collect();
        unacked.sort_by_key(|d| d.tag);
        let count = unacked.len();
        for delivery in unacked.into_iter().rev() {
            queues.inbound.push_front(delivery);
        }
        Ok(count)
    }

    pub fn pending_count(&self) -> Result<usize, SettlementError> {
        let queues = self.queues()?;
        Ok(queues.inbound.len() + queues.unacked.len())
    }

    pub fn published_events(&self) -> Result<Vec<SettlementEvent>, SettlementError> {
        let queues = self.queues()?;
        queues
            .published
            .iter()
            .map(|json| Ok(SettlementEvent::from_json(json)?))
            .collect()
    }
}

impl SettlementBus for InMemorySettlementBus {
    fn next_delivery(&self) -> Result<Option<Delivery>, SettlementError> {
        let mut queues = self.queues()?;
        let Some(delivery) = queues.inbound.pop_front() else {
            return Ok(None);
        };
        queues.unacked.insert(delivery.tag, delivery.clone());
        Ok(Some(delivery))
    }

    fn acknowledge(&self, tag: u64) -> Result<(), SettlementError> {
        let mut queues = self.queues()?;
        queues
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| SettlementError::Bus(format!("Unknown delivery tag {}", tag)))
    }

    fn publish(&self, event: &SettlementEvent) -> Result<(), SettlementError> {
        let json = event.to_json()?;
        self.queues()?.published.push(json);
        Ok(())
    }
}

/// Drains a bus into a node's transfer operations
pub struct SettlementProcessor<'a> {
    node: &'a LedgerNode,
    bus: &'a dyn SettlementBus,
    announced: Mutex<HashSet<String>>,
}

impl<'a> SettlementProcessor<'a> {
    pub fn new(node: &'a LedgerNode, bus: &'a dyn SettlementBus) -> Self {
        Self {
            node,
            bus,
            announced: Mutex::new(HashSet::new()),
        }
    }

    /// Settle the next instruction on the bus
    ///
    /// # Returns
    /// * `Ok(Some(event))` - The status published for the instruction
    /// * `Ok(None)` - The queue was empty
    pub fn process_next(&self) -> Result<Option<SettlementEvent>, SettlementError> {
        let Some(delivery) = self.bus.next_delivery()? else {
            return Ok(None);
        };

        let event = match serde_json::from_str::<TransferInstruction>(&delivery.body) {
            Ok(instruction) => self.settle(&instruction),
            Err(e) => {
                // A malformed message is acknowledged so it cannot block the queue
                log::error!("Discarding malformed instruction {}: {}", delivery.tag, e);
                SettlementEvent {
                    reference: reference_of(&delivery.body),
                    status: SettlementStatus::Failed {
                        reason: format!("Malformed instruction: {}", e),
                    },
                }
            }
        };

        self.bus.acknowledge(delivery.tag)?;
        self.bus.publish(&event)?;
        Ok(Some(event))
    }

    /// Settle instructions until the queue is empty
    pub fn process_all(&self) -> Result<usize, SettlementError> {
        let mut processed = 0;
        while self.process_next()?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    fn settle(&self, instruction: &TransferInstruction) -> SettlementEvent {
        let status = match self.previous_outcome(&instruction.reference) {
            Ok(Some(status)) => status,
            Ok(None) => match self.execute(instruction) {
                Ok(tx_id) => SettlementStatus::Committed {
                    tx_id: tx_id.to_hex(),
                },
                Err(e) => match e.pending_tx() {
                    Some(tx_id) => SettlementStatus::Pending {
                        tx_id: tx_id.to_hex(),
                        reason: e.to_string(),
                    },
                    None => {
                        log::warn!("Transfer {} failed: {}", instruction.reference, e);
                        SettlementStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                },
            },
            Err(e) => SettlementStatus::Failed {
                reason: e.to_string(),
            },
        };
        SettlementEvent {
            reference: instruction.reference.clone(),
            status,
        }
    }

    /// Status of an instruction whose reference was already settled or is
    /// checkpointed; redelivered instructions get it republished
    fn previous_outcome(&self, reference: &str) -> Result<Option<SettlementStatus>, FlowError> {
        if let Some(existing) = self.node.find_transfer(reference)? {
            log::info!(
                "Transfer {} was already settled by {}",
                reference,
                existing.reference.tx_id
            );
            return Ok(Some(SettlementStatus::Committed {
                tx_id: existing.reference.tx_id.to_hex(),
            }));
        }
        Ok(self
            .node
            .pending_transfer(reference)?
            .map(|tx_id| SettlementStatus::Pending {
                tx_id: tx_id.to_hex(),
                reason: format!("Settlement of {} is already in progress", reference),
            }))
    }

    fn execute(&self, instruction: &TransferInstruction) -> Result<ddr_core::id::TxId, FlowError> {
        let currency = instruction
            .currency
            .unwrap_or(self.node.config().default_currency);
        let amount = Amount::from_major(instruction.amount, currency)?;

        match instruction.kind() {
            TransferKind::IntraBank => {
                log::info!("Recording intra-bank transfer {}", instruction.reference);
                self.node.record_intra_bank_transfer(
                    amount,
                    &instruction.sender_rib,
                    &instruction.receiver_rib,
                    instruction.execution_date,
                    Some(instruction.reference.clone()),
                )
            }
            TransferKind::InterBank => {
                log::info!("Settling inter-bank transfer {}", instruction.reference);
                self.node.atomic_exchange(TransferRequest {
                    sender_rib: instruction.sender_rib.clone(),
                    receiver_rib: instruction.receiver_rib.clone(),
                    receiver_bank: None,
                    amount,
                    execution_date: instruction.execution_date,
                    external_id: Some(instruction.reference.clone()),
                })
            }
        }
    }

    /// Publish a `Received` event for every inter-bank transfer credited to
    /// this node that has not been announced yet
    pub fn announce_received(&self) -> Result<usize, SettlementError> {
        let transfers = self.node.incoming_transfers()?;
        let mut announced = self
            .announced
            .lock()
            .map_err(|_| SettlementError::Bus("announced set poisoned".to_string()))?;

        let mut count = 0;
        for transfer in transfers {
            if announced.contains(&transfer.external_id) {
                continue;
            }
            self.bus.publish(&SettlementEvent {
                reference: transfer.external_id.clone(),
                status: SettlementStatus::Received {
                    sender_rib: transfer.sender_rib.clone(),
                    receiver_rib: transfer.receiver_rib.clone(),
                    amount: transfer.amount.to_major(),
                },
            })?;
            announced.insert(transfer.external_id);
            count += 1;
        }
        Ok(count)
    }
}

/// Best-effort reference of a message that failed to parse
fn reference_of(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("reference").and_then(|r| r.as_str()).map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn instruction(sender: &str, receiver: &str) -> TransferInstruction {
        TransferInstruction {
            reference: "VIR-001".to_string(),
            sender_rib: sender.to_string(),
            receiver_rib: receiver.to_string(),
            amount: Decimal::from_str("1250.50").unwrap(),
            currency: None,
            execution_date: Utc::now(),
        }
    }

    #[test]
    fn test_classification() {
        let intra = instruction("007780000123456789012345", "007780000555555555555555");
        assert_eq!(intra.kind(), TransferKind::IntraBank);

        let inter = instruction("007780000123456789012345", "011780000555555555555555");
        assert_eq!(inter.kind(), TransferKind::InterBank);
    }

    #[test]
    fn test_instruction_json_shape() {
        let json = serde_json::to_value(instruction("007", "011")).unwrap();
        assert_eq!(json["senderRIB"], "007");
        assert_eq!(json["receiverRIB"], "011");
        assert_eq!(json["amount"], "1250.50");
        assert!(json.get("executionDate").is_some());
    }

    #[test]
    fn test_event_json() {
        let event = SettlementEvent {
            reference: "VIR-001".to_string(),
            status: SettlementStatus::Failed {
                reason: "Insufficient balance".to_string(),
            },
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"status\":\"FAILED\""));
        assert!(json.contains("\"reference\":\"VIR-001\""));
        assert_eq!(SettlementEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_bus_acknowledgement_and_redelivery() {
        let bus = InMemorySettlementBus::new();
        bus.submit(&instruction("007", "011")).unwrap();
        bus.submit_raw("{}").unwrap();

        let first = bus.next_delivery().unwrap().unwrap();
        let second = bus.next_delivery().unwrap().unwrap();
        assert!(bus.next_delivery().unwrap().is_none());

        // Only the acknowledged delivery is gone for good
        bus.acknowledge(second.tag).unwrap();
        assert!(bus.acknowledge(second.tag).is_err());
        assert_eq!(bus.redeliver_unacknowledged().unwrap(), 1);
        assert_eq!(bus.next_delivery().unwrap().unwrap().tag, first.tag);
    }

    #[test]
    fn test_processor_settles_the_queue() {
        use crate::test_support::*;

        // Fund BankA with 50.00 MAD
        let tn = TestNetwork::new();
        tn.fund(&tn.bank_a, 5000);

        let bus = InMemorySettlementBus::new();
        let transfer = |reference: &str, receiver: &str, amount: Decimal| TransferInstruction {
            reference: reference.to_string(),
            sender_rib: BANK_A_RIB.to_string(),
            receiver_rib: receiver.to_string(),
            amount,
            currency: None,
            execution_date: Utc::now(),
        };
        bus.submit(&transfer("VIR-INTRA", BANK_A_OTHER_RIB, Decimal::new(100, 0)))
            .unwrap();
        bus.submit(&transfer("VIR-INTER", BANK_B_RIB, Decimal::new(1250, 2)))
            .unwrap();
        bus.submit(&transfer("VIR-BIG", BANK_B_RIB, Decimal::new(1000, 0)))
            .unwrap();
        bus.submit_raw(r#"{"reference":"VIR-BAD"}"#).unwrap();

        let processor = SettlementProcessor::new(&tn.bank_a, &bus);
        assert_eq!(processor.process_all().unwrap(), 4);
        assert_eq!(bus.pending_count().unwrap(), 0);

        let events = bus.published_events().unwrap();
        let references: Vec<&str> = events.iter().map(|e| e.reference.as_str()).collect();
        assert_eq!(references, vec!["VIR-INTRA", "VIR-INTER", "VIR-BIG", "VIR-BAD"]);
        assert!(matches!(events[0].status, SettlementStatus::Committed { .. }));
        assert!(matches!(events[1].status, SettlementStatus::Committed { .. }));
        match &events[2].status {
            SettlementStatus::Failed { reason } => assert!(reason.contains("Insufficient")),
            other => panic!("unexpected status: {other:?}"),
        }
        match &events[3].status {
            SettlementStatus::Failed { reason } => assert!(reason.starts_with("Malformed")),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(tn.bank_a.balance(Currency::MAD).unwrap(), mad(3750));
        assert_eq!(tn.bank_b.balance(Currency::MAD).unwrap(), mad(1250));

        // The receiving bank announces the credit once
        let inbound = InMemorySettlementBus::new();
        let receiver = SettlementProcessor::new(&tn.bank_b, &inbound);
        assert_eq!(receiver.announce_received().unwrap(), 1);
        assert_eq!(receiver.announce_received().unwrap(), 0);
        let announced = inbound.published_events().unwrap();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].reference, "VIR-INTER");
        assert_eq!(
            announced[0].status,
            SettlementStatus::Received {
                sender_rib: BANK_A_RIB.to_string(),
                receiver_rib: BANK_B_RIB.to_string(),
                amount: Decimal::new(1250, 2),
            }
        );
    }

    #[test]
    fn test_redelivered_instruction_settles_once() {
        use crate::test_support::*;

        let tn = TestNetwork::new();
        tn.fund(&tn.bank_a, 5000);
        let bus = InMemorySettlementBus::new();
        let dup = TransferInstruction {
            reference: "VIR-DUP".to_string(),
            sender_rib: BANK_A_RIB.to_string(),
            receiver_rib: BANK_B_RIB.to_string(),
            amount: Decimal::new(10, 0),
            currency: None,
            execution_date: Utc::now(),
        };
        bus.submit(&dup).unwrap();
        bus.submit(&dup).unwrap();

        let processor = SettlementProcessor::new(&tn.bank_a, &bus);
        assert_eq!(processor.process_all().unwrap(), 2);
        let events = bus.published_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].status, SettlementStatus::Committed { .. }));
        assert_eq!(events[0], events[1]);
        assert_eq!(tn.bank_a.balance(Currency::MAD).unwrap(), mad(4000));
        assert_eq!(tn.bank_b.balance(Currency::MAD).unwrap(), mad(1000));
    }

    #[test]
    fn test_checkpointed_instruction_is_not_restarted() {
        use crate::test_support::*;

        let tn = TestNetwork::new();
        tn.fund(&tn.bank_a, 5000);
        let bus = InMemorySettlementBus::new();
        let order = TransferInstruction {
            reference: "VIR-WAIT".to_string(),
            sender_rib: BANK_A_RIB.to_string(),
            receiver_rib: BANK_B_RIB.to_string(),
            amount: Decimal::new(10, 0),
            currency: None,
            execution_date: Utc::now(),
        };
        let processor = SettlementProcessor::new(&tn.bank_a, &bus);

        tn.notary.set_available(false);
        bus.submit(&order).unwrap();
        bus.submit(&order).unwrap();
        assert_eq!(processor.process_all().unwrap(), 2);
        let events = bus.published_events().unwrap();
        let tx_id = match &events[0].status {
            SettlementStatus::Pending { tx_id, .. } => tx_id.clone(),
            other => panic!("unexpected status: {other:?}"),
        };
        match &events[1].status {
            SettlementStatus::Pending { tx_id: again, reason } => {
                assert_eq!(again, &tx_id);
                assert!(reason.contains("already in progress"));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(tn.bank_a.pending_transactions().unwrap().len(), 1);

        // Once resumed, a late redelivery reports the committed transaction
        tn.notary.set_available(true);
        let pending = tn.bank_a.pending_transactions().unwrap()[0];
        tn.bank_a.resume_pending(&pending).unwrap();
        bus.submit(&order).unwrap();
        let event = processor.process_next().unwrap().unwrap();
        assert_eq!(event.status, SettlementStatus::Committed { tx_id });
        assert_eq!(tn.bank_b.balance(Currency::MAD).unwrap(), mad(1000));
    }
}
