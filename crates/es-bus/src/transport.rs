//! # Transport Port
//!
//! The broker client is an external collaborator. The connection manager
//! talks to it through [`Connector`] (create a client for an address) and
//! [`Transport`] (operate on that client). Connection state changes and
//! inbound messages arrive as [`TransportEvent`]s on the channel returned
//! with the [`Connection`].
//!
//! A transport is expected to reconnect on its own after a drop and report
//! it with another [`TransportEvent::Connected`]; the manager only discards
//! a transport when its own reconnect timer fires.

use crate::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible
    #[default]
    AtLeastOnce,
    /// Exactly once
    ExactlyOnce,
}

/// Options of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery guarantee
    pub qos: QoS,
    /// Keep as the topic's retained message
    pub retain: bool,
}

impl PublishOptions {
    /// At-least-once and retained; used for everything the system publishes.
    pub const RETAINED: Self = Self {
        qos: QoS::AtLeastOnce,
        retain: true,
    };
}

/// Client certificate material for mutually authenticated transports.
#[derive(Clone)]
pub struct TlsMaterial {
    /// PEM client certificate
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// PEM trust root
    pub ca: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial").finish_non_exhaustive()
    }
}

/// Options handed to every [`Connector::connect`] call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier
    pub client_id: String,
    /// Start without broker-side session state
    pub clean_session: bool,
    /// Reject brokers whose certificate does not chain to the CA
    pub reject_unauthorized: bool,
    /// Client identity for TLS transports
    pub tls: Option<TlsMaterial>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: format!("es-{}", uuid::Uuid::new_v4().simple()),
            clean_session: true,
            reject_unauthorized: true,
            tls: None,
        }
    }
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connected (initially or after an automatic reconnect).
    Connected,
    /// Connection lost or ended.
    Closed,
    /// Inbound message.
    Message {
        /// Concrete topic
        topic: String,
        /// UTF-8 payload
        payload: String,
    },
    /// Non-fatal error.
    Error(TransportError),
}

/// A freshly created client and its event stream.
pub struct Connection {
    /// Operations handle
    pub transport: Arc<dyn Transport>,
    /// Events, in the order the broker produced them
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Operations on a connected broker client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish; completes once the client has queued the message.
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), TransportError>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Remove a topic filter.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Close the client for good. Emits a final [`TransportEvent::Closed`].
    async fn end(&self);
}

/// Creates broker clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Create a client for `address`. The connection itself is reported
    /// asynchronously through [`TransportEvent::Connected`].
    async fn connect(&self, address: &str, options: &ConnectOptions) -> Result<Connection, TransportError>;
}
