//! # ES Bus - Broker Connection for Endocrine
//!
//! Owns the one broker connection every gland and receptor of a system
//! shares.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ConnectionManager  (driver task, readiness)  │
//! ├───────────────┬──────────────┬───────────────┤
//! │ Discovery     │ Subscription │ Bootstrap     │
//! │ (cursor)      │ Table        │ (identity,    │
//! │               │ (refcounts)  │  drift)       │
//! ├───────────────┴──────────────┴───────────────┤
//! │ Transport / Connector ports                  │
//! │   InMemoryBroker (loopback adapter)          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - One broker subscription per distinct topic, however many logical
//!   subscriptions share it.
//! - Every live topic is resubscribed before `Online` is surfaced.
//! - Inbound messages are dispatched in arrival order.
//! - Bootstrap failures are final; discovery and reconnect retry forever.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
#![warn(missing_docs)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bootstrap;
pub mod discovery;
pub mod error;
pub mod events;
pub mod filter;
pub mod manager;
pub mod memory;
pub mod subscription;
pub mod time;
pub mod transport;

// Re-export main types
pub use bootstrap::{bootstrap, IdentityMaterial, MAX_DRIFT_MS};
pub use discovery::{BrokerResolver, Discovery, DiscoveryMethod};
pub use error::{BusError, ConfigurationError, DiscoveryError, TimeError, TransportError};
pub use events::{ConnectionState, SystemEvent};
pub use filter::TopicFilter;
pub use manager::{Collaborators, ConnectionManager, ManagerConfig, DEFAULT_DISCOVERY_RETRY, DEFAULT_RECONNECT_DELAY};
pub use memory::{InMemoryBroker, MEMORY_BROKER_ADDRESS};
pub use subscription::{MessageHandler, SubscriptionHandle, SubscriptionTable};
pub use time::{SntpTimeSource, SystemTimeSource, TimeSource};
pub use transport::{
    ConnectOptions, Connection, Connector, PublishOptions, QoS, TlsMaterial, Transport, TransportEvent,
};

#[cfg(any(test, feature = "test-utils"))]
pub use time::ManualTimeSource;
