//! # In-Memory Broker
//!
//! A loopback [`Connector`] with retained messages and MQTT topic matching.
//! Every client it hands out lives in the same process; tests drive
//! connection loss through [`InMemoryBroker::interrupt`],
//! [`InMemoryBroker::restore`] and [`InMemoryBroker::sever`].

use crate::filter::TopicFilter;
use crate::transport::{Connection, ConnectOptions, Connector, PublishOptions, QoS, Transport, TransportEvent};
use crate::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Default address an [`InMemoryBroker`] answers on.
pub const MEMORY_BROKER_ADDRESS: &str = "memory://broker";

struct Client {
    events: mpsc::UnboundedSender<TransportEvent>,
    filters: Vec<TopicFilter>,
    online: bool,
}

impl Client {
    fn send(&self, event: TransportEvent) {
        // The receiver is gone once the manager discarded this client.
        let _ = self.events.send(event);
    }

    fn wants(&self, topic: &str) -> bool {
        self.online && self.filters.iter().any(|filter| filter.matches(topic))
    }
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, String>,
    clients: HashMap<u64, Client>,
    next_client: u64,
    subscribes: HashMap<String, usize>,
    unsubscribes: HashMap<String, usize>,
    published: Vec<(String, String)>,
    connects: Vec<String>,
}

/// Loopback broker shared by all clients connected to it.
#[derive(Clone)]
pub struct InMemoryBroker {
    address: String,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create new broker answering on [`MEMORY_BROKER_ADDRESS`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_address(MEMORY_BROKER_ADDRESS)
    }

    /// Create new broker answering on `address`; any other address is refused.
    #[must_use]
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::default(),
        }
    }

    /// Address this broker accepts.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Drop every connection as if the network failed. Clients stay
    /// registered and come back with [`InMemoryBroker::restore`].
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        for client in state.clients.values_mut().filter(|c| c.online) {
            client.online = false;
            client.filters.clear();
            client.send(TransportEvent::Closed);
        }
        debug!("memory broker interrupted");
    }

    /// Let interrupted clients reconnect on their own.
    pub fn restore(&self) {
        let mut state = self.state.lock();
        for client in state.clients.values_mut().filter(|c| !c.online) {
            client.online = true;
            client.send(TransportEvent::Connected);
        }
        debug!("memory broker restored");
    }

    /// Close every client's event stream for good.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        for (_, client) in state.clients.drain() {
            if client.online {
                client.send(TransportEvent::Closed);
            }
        }
        debug!("memory broker severed");
    }

    /// Retained message of `topic`.
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Publish as an outside party would.
    pub fn inject(&self, topic: &str, payload: &str, retain: bool) {
        let mut state = self.state.lock();
        Self::route(&mut state, topic, payload, retain);
    }

    /// Every publish seen so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().published.clone()
    }

    /// Publishes seen on `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Subscribe requests received for `topic`.
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state.lock().subscribes.get(topic).copied().unwrap_or(0)
    }

    /// Unsubscribe requests received for `topic`.
    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.state.lock().unsubscribes.get(topic).copied().unwrap_or(0)
    }

    /// Addresses clients asked to connect to, including refused ones.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    /// Clients currently registered.
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    fn route(state: &mut BrokerState, topic: &str, payload: &str, retain: bool) {
        state.published.push((topic.to_string(), payload.to_string()));

        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.to_string());
            }
        }

        for client in state.clients.values().filter(|c| c.wants(topic)) {
            client.send(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, address: &str, options: &ConnectOptions) -> Result<Connection, TransportError> {
        let mut state = self.state.lock();
        state.connects.push(address.to_string());

        if address != self.address {
            return Err(TransportError::ConnectionRefused(address.to_string()));
        }

        let id = state.next_client;
        state.next_client += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client {
            events: tx,
            filters: Vec::new(),
            online: true,
        };
        client.send(TransportEvent::Connected);
        state.clients.insert(id, client);
        debug!(client = id, client_id = %options.client_id, "memory client connected");

        Ok(Connection {
            transport: Arc::new(MemoryTransport {
                id,
                state: Arc::clone(&self.state),
            }),
            events: rx,
        })
    }
}

struct MemoryTransport {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryTransport {
    fn online(state: &BrokerState, id: u64) -> Result<(), TransportError> {
        match state.clients.get(&id) {
            Some(client) if client.online => Ok(()),
            Some(_) => Err(TransportError::NotConnected),
            None => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::online(&state, self.id)?;
        InMemoryBroker::route(&mut state, topic, payload, options.retain);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let filter = TopicFilter::new(topic).map_err(|e| TransportError::SubscribeFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::online(state, self.id)?;
        *state.subscribes.entry(topic.to_string()).or_insert(0) += 1;

        let Some(client) = state.clients.get_mut(&self.id) else {
            return Err(TransportError::Closed);
        };
        for (retained_topic, payload) in state.retained.iter().filter(|(t, _)| filter.matches(t)) {
            client.send(TransportEvent::Message {
                topic: retained_topic.clone(),
                payload: payload.clone(),
            });
        }
        if !client.filters.contains(&filter) {
            client.filters.push(filter);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::online(state, self.id)?;
        *state.unsubscribes.entry(topic.to_string()).or_insert(0) += 1;

        if let Some(client) = state.clients.get_mut(&self.id) {
            client.filters.retain(|filter| filter.as_str() != topic);
        }
        Ok(())
    }

    async fn end(&self) {
        if let Some(client) = self.state.lock().clients.remove(&self.id) {
            client.send(TransportEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(broker: &InMemoryBroker) -> Connection {
        broker
            .connect(broker.address(), &ConnectOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let broker = InMemoryBroker::new();
        let mut conn = connect(&broker).await;
        assert_eq!(conn.events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_wrong_address_refused() {
        let broker = InMemoryBroker::new();
        let result = broker.connect("mqtts://elsewhere", &ConnectOptions::default()).await;
        assert!(matches!(result, Err(TransportError::ConnectionRefused(_))));
        assert_eq!(broker.connect_attempts(), vec!["mqtts://elsewhere".to_string()]);
    }

    #[tokio::test]
    async fn test_retained_delivery_on_subscribe() {
        let broker = InMemoryBroker::new();
        broker.inject("definition/a", "A", true);
        broker.inject("definition/b", "B", true);
        broker.inject("definition/b", "", true);

        let mut conn = connect(&broker).await;
        conn.events.recv().await;
        conn.transport.subscribe("definition/#", QoS::AtLeastOnce).await.unwrap();

        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::Message {
                topic: "definition/a".into(),
                payload: "A".into()
            })
        );
        assert!(conn.events.try_recv().is_err());
        assert_eq!(broker.retained("definition/b"), None);
    }

    #[tokio::test]
    async fn test_live_delivery_and_counters() {
        let broker = InMemoryBroker::new();
        let mut conn = connect(&broker).await;
        conn.events.recv().await;

        conn.transport.subscribe("hormone/+", QoS::AtLeastOnce).await.unwrap();
        conn.transport
            .publish("hormone/x", "1", PublishOptions::RETAINED)
            .await
            .unwrap();
        assert!(matches!(
            conn.events.recv().await,
            Some(TransportEvent::Message { .. })
        ));

        conn.transport.unsubscribe("hormone/+").await.unwrap();
        broker.inject("hormone/x", "2", false);
        assert!(conn.events.try_recv().is_err());

        assert_eq!(broker.subscribe_count("hormone/+"), 1);
        assert_eq!(broker.unsubscribe_count("hormone/+"), 1);
        assert_eq!(broker.retained("hormone/x"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_interrupt_and_restore() {
        let broker = InMemoryBroker::new();
        let mut conn = connect(&broker).await;
        conn.events.recv().await;
        conn.transport.subscribe("a", QoS::AtLeastOnce).await.unwrap();

        broker.interrupt();
        assert_eq!(conn.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(
            conn.transport.publish("a", "x", PublishOptions::RETAINED).await,
            Err(TransportError::NotConnected)
        );

        broker.restore();
        assert_eq!(conn.events.recv().await, Some(TransportEvent::Connected));

        // Clean session: the subscription did not survive.
        broker.inject("a", "y", false);
        assert!(conn.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_and_sever() {
        let broker = InMemoryBroker::new();
        let mut first = connect(&broker).await;
        let mut second = connect(&broker).await;
        first.events.recv().await;
        second.events.recv().await;

        first.transport.end().await;
        assert_eq!(first.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(first.events.recv().await, None);

        broker.sever();
        assert_eq!(second.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(second.events.recv().await, None);
        assert_eq!(broker.client_count(), 0);
    }
}
