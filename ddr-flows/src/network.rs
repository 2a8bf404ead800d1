use crate::protocol::{SessionId, SessionMessage};
use ddr_core::identity::PartyKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Party {0} is unreachable")]
    Unreachable(String),

    #[error("Message codec error: {0}")]
    Codec(String),
}

/// Receiver side of a node: turns one inbound message into zero or more replies
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: SessionMessage) -> Vec<SessionMessage>;
}

/// Point-to-point message channel between parties
pub trait Transport: Send + Sync {
    /// Deliver `message` to its recipient
    ///
    /// Replies produced by the recipient become available through
    /// [`Transport::receive`] on the sender's side.
    fn send(&self, message: SessionMessage) -> Result<(), NetworkError>;

    /// Drain the messages waiting for `recipient` in `session_id`
    fn receive(&self, recipient: &PartyKey, session_id: &SessionId) -> Vec<SessionMessage>;
}

type Mailbox = VecDeque<Vec<u8>>;

/// In-process network delivering messages synchronously between nodes
///
/// Every message crosses the wire encoding. Handlers are held weakly so the
/// network never keeps a node alive.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: RwLock<HashMap<PartyKey, Weak<dyn MessageHandler>>>,
    mailboxes: Mutex<HashMap<(PartyKey, SessionId), Mailbox>>,
    disconnected: RwLock<HashSet<PartyKey>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: MessageHandler + 'static>(&self, key: PartyKey, handler: &Arc<H>) {
        let handler: Weak<dyn MessageHandler> = Arc::downgrade(handler) as Weak<dyn MessageHandler>;
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(key, handler);
        }
    }

    /// Make `key` unreachable until [`InMemoryNetwork::reconnect`]
    pub fn disconnect(&self, key: &PartyKey) {
        if let Ok(mut disconnected) = self.disconnected.write() {
            disconnected.insert(*key);
        }
    }

    pub fn reconnect(&self, key: &PartyKey) {
        if let Ok(mut disconnected) = self.disconnected.write() {
            disconnected.remove(key);
        }
    }

    fn is_disconnected(&self, key: &PartyKey) -> bool {
        self.disconnected
            .read()
            .map(|d| d.contains(key))
            .unwrap_or(true)
    }

    fn handler_for(&self, key: &PartyKey) -> Option<Arc<dyn MessageHandler>> {
        let handlers = self.handlers.read().ok()?;
        handlers.get(key).and_then(Weak::upgrade)
    }

    fn post(&self, message: &SessionMessage) -> Result<(), NetworkError> {
        let bytes = message
            .encode()
            .map_err(|e| NetworkError::Codec(e.to_string()))?;
        let mut mailboxes = self
            .mailboxes
            .lock()
            .map_err(|_| NetworkError::Unreachable(message.to.name.clone()))?;
        mailboxes
            .entry((message.to.key, message.session_id))
            .or_default()
            .push_back(bytes);
        Ok(())
    }
}

impl Transport for InMemoryNetwork {
    fn send(&self, message: SessionMessage) -> Result<(), NetworkError> {
        let recipient = message.to.clone();
        if self.is_disconnected(&recipient.key) {
            return Err(NetworkError::Unreachable(recipient.name));
        }
        let handler = self
            .handler_for(&recipient.key)
            .ok_or_else(|| NetworkError::Unreachable(recipient.name.clone()))?;

        let bytes = message
            .encode()
            .map_err(|e| NetworkError::Codec(e.to_string()))?;
        log::debug!(
            "{} -> {} [{}]: {} ({} bytes)",
            message.from,
            recipient,
            message.session_id,
            message.payload.name(),
            bytes.len()
        );
        let delivered =
            SessionMessage::decode(&bytes).map_err(|e| NetworkError::Codec(e.to_string()))?;

        // No network lock is held while the recipient runs
        for reply in handler.handle(delivered) {
            self.post(&reply)?;
        }
        Ok(())
    }

    fn receive(&self, recipient: &PartyKey, session_id: &SessionId) -> Vec<SessionMessage> {
        let queued = match self.mailboxes.lock() {
            Ok(mut mailboxes) => mailboxes.remove(&(*recipient, *session_id)),
            Err(_) => None,
        };
        queued
            .unwrap_or_default()
            .into_iter()
            .filter_map(|bytes| match SessionMessage::decode(&bytes) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::error!("Dropping undecodable message in {}: {}", session_id, e);
                    None
                }
            })
            .collect()
    }
}

impl fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("InMemoryNetwork")
            .field("handlers", &handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use ddr_core::identity::{KeyPair, Party};

    /// Answers every message with an Aborted echo
    struct Echo {
        me: Party,
    }

    impl MessageHandler for Echo {
        fn handle(&self, message: SessionMessage) -> Vec<SessionMessage> {
            vec![SessionMessage::new(
                message.session_id,
                self.me.clone(),
                message.from,
                Payload::Aborted("echo".to_string()),
            )]
        }
    }

    #[test]
    fn test_delivery_and_replies() {
        let network = InMemoryNetwork::new();
        let alice = KeyPair::from_seed(b"alice").party("alice");
        let bob = KeyPair::from_seed(b"bob").party("bob");
        let echo = Arc::new(Echo { me: bob.clone() });
        network.register(bob.key, &echo);

        let session = SessionId::new();
        let message = SessionMessage::new(
            session,
            alice.clone(),
            bob.clone(),
            Payload::Refusal("ping".to_string()),
        );
        network.send(message.clone()).unwrap();

        let replies = network.receive(&alice.key, &session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].from, bob);
        assert_eq!(replies[0].payload, Payload::Aborted("echo".to_string()));

        // Mailboxes are drained by receive
        assert!(network.receive(&alice.key, &session).is_empty());

        // Disconnected and unregistered parties are unreachable
        network.disconnect(&bob.key);
        assert_eq!(
            network.send(message.clone()),
            Err(NetworkError::Unreachable("bob".to_string()))
        );
        network.reconnect(&bob.key);
        assert!(network.send(message.clone()).is_ok());

        drop(echo);
        assert!(matches!(network.send(message), Err(NetworkError::Unreachable(_))));
    }
}
