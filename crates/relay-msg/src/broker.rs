//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Broker boundary and in-memory broker."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_common::BrokerConfig;
use tokio::sync::mpsc;

use crate::{MessagingError, Result};

/// Identifier of a client session attached to a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Session status reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerStatus {
    /// The listed topics are now delivered to the client.
    Subscribed(Vec<String>),
    /// The listed topics are no longer delivered to the client.
    Unsubscribed(Vec<String>),
    /// The broker dropped the session.
    Disconnected(String),
}

/// Item pushed by the broker onto a client's event queue.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Payload published on a topic the client subscribed to.
    Message {
        /// Topic the payload was published on.
        topic: String,
        /// Encoded envelope.
        payload: Bytes,
    },
    /// Session status change.
    Status(BrokerStatus),
}

/// A client session: its identifier and the ordered queue of broker events.
#[derive(Debug)]
pub struct BrokerLink {
    /// Session identifier used for subscribe/unsubscribe/detach.
    pub client: ClientId,
    /// Events for this session, in broker delivery order.
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

/// Topic-addressed broker reached by subscription channels.
///
/// Subscription changes are acknowledged asynchronously through
/// [`BrokerEvent::Status`] on the session's event queue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new client session.
    async fn attach(&self) -> Result<BrokerLink>;
    /// Close a session and drop its event queue.
    async fn detach(&self, client: ClientId);
    /// Request delivery of `topics` to `client`.
    async fn subscribe(&self, client: ClientId, topics: &[String]) -> Result<()>;
    /// Stop delivery of `topics` to `client`.
    async fn unsubscribe(&self, client: ClientId, topics: &[String]) -> Result<()>;
    /// Publish an encoded envelope on a topic. No delivery confirmation.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
    /// Up to `count` most recent payloads of a topic, newest first.
    async fn history(&self, topic: &str, count: usize) -> Result<Vec<Bytes>>;
    /// Human-readable broker name for logging.
    fn name(&self) -> &'static str;
}

/// Failure modes the in-memory broker can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerFault {
    /// Normal operation.
    #[default]
    None,
    /// Every operation fails with a connection error.
    Unreachable,
    /// Subscriptions are accepted but never confirmed.
    SilentSubscribe,
}

struct ClientEntry {
    sender: mpsc::UnboundedSender<BrokerEvent>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    next_client: u64,
    clients: HashMap<ClientId, ClientEntry>,
    history: HashMap<String, VecDeque<Bytes>>,
    fault: BrokerFault,
}

/// In-process broker with per-topic history retention.
#[derive(Clone)]
pub struct InMemoryBroker {
    history_depth: usize,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create a broker using the supplied retention settings.
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            history_depth: config.history_depth.max(1),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Switch the simulated failure mode.
    pub fn set_fault(&self, fault: BrokerFault) {
        self.state.lock().fault = fault;
    }

    /// Drop every attached session, as if the broker restarted.
    pub fn disconnect_all(&self, reason: &str) {
        let clients: Vec<ClientEntry> = self.state.lock().clients.drain().map(|(_, c)| c).collect();
        for client in clients {
            let _ = client
                .sender
                .send(BrokerEvent::Status(BrokerStatus::Disconnected(reason.to_owned())));
        }
    }

    /// Number of sessions currently attached.
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Number of sessions subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .clients
            .values()
            .filter(|c| c.topics.contains(topic))
            .count()
    }

    fn check_reachable(state: &BrokerState) -> Result<()> {
        if state.fault == BrokerFault::Unreachable {
            return Err(MessagingError::Connection("in-memory broker unreachable".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn attach(&self) -> Result<BrokerLink> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        state.next_client += 1;
        let client = ClientId(state.next_client);
        let (sender, events) = mpsc::unbounded_channel();
        state.clients.insert(
            client,
            ClientEntry {
                sender,
                topics: HashSet::new(),
            },
        );
        tracing::debug!(%client, "client attached");
        Ok(BrokerLink { client, events })
    }

    async fn detach(&self, client: ClientId) {
        if self.state.lock().clients.remove(&client).is_some() {
            tracing::debug!(%client, "client detached");
        }
    }

    async fn subscribe(&self, client: ClientId, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        let silent = state.fault == BrokerFault::SilentSubscribe;
        let entry = state
            .clients
            .get_mut(&client)
            .ok_or_else(|| MessagingError::Connection(format!("{client} is not attached")))?;
        entry.topics.extend(topics.iter().cloned());
        if !silent {
            let _ = entry
                .sender
                .send(BrokerEvent::Status(BrokerStatus::Subscribed(topics.to_vec())));
        }
        Ok(())
    }

    async fn unsubscribe(&self, client: ClientId, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .clients
            .get_mut(&client)
            .ok_or_else(|| MessagingError::Connection(format!("{client} is not attached")))?;
        for topic in topics {
            entry.topics.remove(topic);
        }
        let _ = entry
            .sender
            .send(BrokerEvent::Status(BrokerStatus::Unsubscribed(topics.to_vec())));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        let retained = state.history.entry(topic.to_owned()).or_default();
        if retained.len() == self.history_depth {
            retained.pop_front();
        }
        retained.push_back(payload.clone());
        // Fan out under the lock so every client observes one global publish order.
        for entry in state.clients.values().filter(|c| c.topics.contains(topic)) {
            let _ = entry.sender.send(BrokerEvent::Message {
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn history(&self, topic: &str, count: usize) -> Result<Vec<Bytes>> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        Ok(state
            .history
            .get(topic)
            .map(|retained| retained.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
