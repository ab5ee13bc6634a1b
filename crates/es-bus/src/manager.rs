//! # Connection Manager
//!
//! Owns the single broker connection. One driver task walks the
//! [`ConnectionState`] machine; everything else talks to it through shared
//! state:
//!
//! - a readiness watch the public operations wait on,
//! - the [`SubscriptionTable`] the driver dispatches inbound messages into,
//! - a broadcast channel of [`SystemEvent`]s.
//!
//! ## Driver
//!
//! ```text
//! bootstrap ──fail──> Error + Disconnected (final)
//!     │
//!     ▼
//! Discovering ──address──> Connecting ──Connected──> resubscribe ──> Connected/Online
//!     ▲                       │                                        │
//!     │                  connect failed                              Closed
//!     │                       ▼                                        ▼
//!     └──────────── retry pause / reconnect timer <──────────── Reconnecting/Offline
//! ```
//!
//! A transport that reconnects on its own before the reconnect timer fires
//! cancels the timer and goes straight back to `Connected`.

use crate::bootstrap::{bootstrap, IdentityMaterial};
use crate::discovery::{Discovery, DiscoveryMethod};
use crate::events::{ConnectionState, SystemEvent};
use crate::filter::TopicFilter;
use crate::subscription::{MessageHandler, SubscriptionHandle, SubscriptionTable};
use crate::time::TimeSource;
use crate::transport::{Connection, ConnectOptions, Connector, PublishOptions, QoS, Transport, TransportEvent};
use crate::{BusError, ConfigurationError};
use es_crypto::CertificateValidator;
use parking_lot::Mutex;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Sleep};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the system event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default pause before an unexpectedly closed connection is rediscovered.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Default pause after a fully failed discovery round.
pub const DEFAULT_DISCOVERY_RETRY: Duration = Duration::from_secs(1);

/// How long shutdown waits for the transport to confirm the close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Broker discovery methods, tried in order
    pub discovery: Vec<DiscoveryMethod>,
    /// Options for every transport created
    pub connect_options: ConnectOptions,
    /// Reconnect timer; `None` relies on transport-level reconnects alone
    pub reconnect_delay: Option<Duration>,
    /// Pause after a fully failed discovery round or a refused connection
    pub discovery_retry: Duration,
    /// Skip the clock drift check at bootstrap
    pub ignore_timedrift: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery: Vec::new(),
            connect_options: ConnectOptions::default(),
            reconnect_delay: Some(DEFAULT_RECONNECT_DELAY),
            discovery_retry: DEFAULT_DISCOVERY_RETRY,
            ignore_timedrift: false,
        }
    }
}

/// External collaborators of the manager.
#[derive(Clone)]
pub struct Collaborators {
    /// Creates transports
    pub connector: Arc<dyn Connector>,
    /// Checks the identity at bootstrap
    pub validator: CertificateValidator,
    /// Clock and drift reference
    pub time: Arc<dyn TimeSource>,
}

#[derive(Clone)]
enum Readiness {
    Pending,
    Ready(Arc<dyn Transport>),
    Failed(ConfigurationError),
    Closed,
}

struct Inner {
    table: Mutex<SubscriptionTable>,
    /// Held across a table change and its transport call, so broker
    /// subscribes and unsubscribes go out in table order.
    subscriptions: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    readiness: watch::Sender<Readiness>,
    events: broadcast::Sender<SystemEvent>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    fn emit(&self, event: SystemEvent) {
        // No listener is fine.
        self.events.send(event).ok();
    }
}

/// Handle to the broker connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Start the driver: bootstrap, discover, connect.
    ///
    /// Must be called within a tokio runtime. The returned receiver is
    /// subscribed before the driver starts, so it sees every event.
    pub fn start(
        config: ManagerConfig,
        collaborators: Collaborators,
        material: IdentityMaterial,
    ) -> (Self, broadcast::Receiver<SystemEvent>) {
        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            table: Mutex::new(SubscriptionTable::new()),
            subscriptions: tokio::sync::Mutex::new(()),
            state: watch::Sender::new(ConnectionState::Disconnected),
            readiness: watch::Sender::new(Readiness::Pending),
            events,
            shutdown,
            driver: Mutex::new(None),
        });

        let driver = Driver {
            inner: Arc::clone(&inner),
            config,
            connector: collaborators.connector,
        };
        let handle = tokio::spawn(driver.run(
            shutdown_rx,
            collaborators.validator,
            collaborators.time,
            material,
        ));
        *inner.driver.lock() = Some(handle);

        (Self { inner }, receiver)
    }

    /// Wait until connected. Fails once bootstrap failed or after shutdown.
    pub async fn ready(&self) -> Result<(), BusError> {
        self.transport().await.map(|_| ())
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>, BusError> {
        let mut readiness = self.inner.readiness.subscribe();
        loop {
            let current = readiness.borrow_and_update().clone();
            match current {
                Readiness::Ready(transport) => return Ok(transport),
                Readiness::Failed(e) => return Err(e.into()),
                Readiness::Closed => return Err(BusError::ShutDown),
                Readiness::Pending => {}
            }
            if readiness.changed().await.is_err() {
                return Err(BusError::ShutDown);
            }
        }
    }

    /// Publish a retained message at least once. Waits while offline.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let transport = self.transport().await?;
        transport.publish(topic, payload, PublishOptions::RETAINED).await?;
        trace!(topic, bytes = payload.len(), "published");
        Ok(())
    }

    /// Add a logical subscription. The broker is asked only for the first
    /// subscription of a topic; later ones get the last message seen on each
    /// matching topic replayed to them alone.
    ///
    /// Subscribes and unsubscribes are serialized: a joiner waits until the
    /// broker answered the first subscriber, and a broker unsubscribe always
    /// lands before the next broker subscribe of the same topic.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let filter = TopicFilter::new(topic)?;
        let transport = self.transport().await?;
        let _ordered = self.inner.subscriptions.lock().await;

        let inserted = {
            let mut table = self.inner.table.lock();
            let inserted = table.insert(filter, handler);
            if !inserted.first {
                let replayed = table.replay(inserted.handle);
                trace!(topic, replayed, "joined live topic");
            }
            inserted
        };

        if inserted.first {
            if let Err(e) = transport.subscribe(topic, QoS::AtLeastOnce).await {
                warn!(topic, error = %e, "subscribe failed");
                self.inner.table.lock().remove(inserted.handle).ok();
                return Err(e.into());
            }
            debug!(topic, "subscribed");
        }

        Ok(inserted.handle)
    }

    /// Remove a logical subscription; the last one of a topic unsubscribes
    /// at the broker when online.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let _ordered = self.inner.subscriptions.lock().await;
        let removed = self.inner.table.lock().remove(handle)?;
        if !removed.last {
            return Ok(());
        }

        let current = self.inner.readiness.borrow().clone();
        match current {
            Readiness::Ready(transport) => {
                transport.unsubscribe(&removed.topic).await?;
                debug!(topic = %removed.topic, "unsubscribed");
            }
            _ => debug!(topic = %removed.topic, "offline, dropped subscription locally"),
        }
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether messages can currently flow.
    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// New receiver of system events.
    pub fn events(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.events.subscribe()
    }

    /// Close the connection and stop the driver.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!(error = %e, "connection driver failed");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("subscriptions", &*self.inner.table.lock())
            .finish()
    }
}

/// Outcome of one transport's lifetime.
enum SessionEnd {
    Rediscover,
    Shutdown,
}

struct Driver {
    inner: Arc<Inner>,
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
}

/// Resolves once shutdown was requested.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a request.
    shutdown.wait_for(|stop| *stop).await.ok();
}

/// Resolves when the armed timer fires; never when none is armed.
async fn timer_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(delay) => delay.as_mut().await,
        None => pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        validator: CertificateValidator,
        time: Arc<dyn TimeSource>,
        material: IdentityMaterial,
    ) {
        let bootstrapped = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return self.closed(),
            result = bootstrap(&material, &validator, time.as_ref(), self.config.ignore_timedrift) => result,
        };

        let discovery = bootstrapped.and_then(|fingerprint| {
            Discovery::new(
                std::mem::take(&mut self.config.discovery),
                fingerprint,
                self.config.discovery_retry,
            )
        });
        let mut discovery = match discovery {
            Ok(discovery) => discovery,
            Err(e) => return self.failed(e),
        };

        loop {
            self.inner.set_state(ConnectionState::Discovering);
            let address = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                address = discovery.next_address() => address,
            };

            self.inner.set_state(ConnectionState::Connecting);
            self.inner.emit(SystemEvent::Connecting {
                address: address.clone(),
            });
            info!(address = %address, "connecting to broker");

            let connected = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.connector.connect(&address, &self.config.connect_options) => result,
            };

            match connected {
                Ok(connection) => match self.session(connection, &mut shutdown).await {
                    SessionEnd::Rediscover => continue,
                    SessionEnd::Shutdown => return,
                },
                Err(e) => {
                    warn!(address = %address, error = %e, "connection failed");
                    self.inner.emit(SystemEvent::Error(e.into()));
                    self.inner.set_state(ConnectionState::Reconnecting);
                    discovery.advance();
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = sleep(discovery.retry_delay()) => {}
                    }
                }
            }
        }

        self.closed();
    }

    /// Drive one transport until it is discarded or shutdown is requested.
    async fn session(&self, connection: Connection, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let Connection { transport, mut events } = connection;
        let mut open = true;
        let mut connected = false;
        let mut timer: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    self.disconnect(&transport, &mut events, open, connected).await;
                    return SessionEnd::Shutdown;
                }
                _ = timer_elapsed(&mut timer) => {
                    info!("reconnect timer elapsed, rediscovering broker");
                    transport.end().await;
                    return SessionEnd::Rediscover;
                }
                event = events.recv(), if open => match event {
                    Some(TransportEvent::Connected) => {
                        if timer.take().is_some() {
                            debug!("transport reconnected, reconnect timer cancelled");
                        }
                        self.resubscribe(&transport).await;
                        connected = true;
                    }
                    Some(TransportEvent::Closed) => {
                        self.lost(&mut connected);
                        if timer.is_none() {
                            timer = self.config.reconnect_delay.map(|delay| Box::pin(sleep(delay)));
                        }
                    }
                    Some(TransportEvent::Message { topic, payload }) => {
                        let delivered = self.inner.table.lock().dispatch(&topic, &payload);
                        trace!(topic = %topic, delivered, "dispatched");
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!(error = %e, "transport error");
                        self.inner.emit(SystemEvent::Error(e.into()));
                    }
                    None => {
                        // No automatic reconnect can follow; always retry.
                        open = false;
                        self.lost(&mut connected);
                        if timer.is_none() {
                            let delay = self.config.reconnect_delay.unwrap_or(self.config.discovery_retry);
                            timer = Some(Box::pin(sleep(delay)));
                        }
                    }
                },
            }
        }
    }

    /// Resubscribe every live topic, then surface `Online`.
    async fn resubscribe(&self, transport: &Arc<dyn Transport>) {
        let topics = self.inner.table.lock().live_topics();
        for topic in &topics {
            if let Err(e) = transport.subscribe(topic, QoS::AtLeastOnce).await {
                warn!(topic = %topic, error = %e, "resubscribe failed");
                self.inner.emit(SystemEvent::Error(e.into()));
            }
        }

        self.inner.set_state(ConnectionState::Connected);
        self.inner.readiness.send_replace(Readiness::Ready(Arc::clone(transport)));
        info!(topics = topics.len(), "broker online");
        self.inner.emit(SystemEvent::Online);
    }

    fn lost(&self, connected: &mut bool) {
        self.inner.set_state(ConnectionState::Reconnecting);
        self.inner.readiness.send_replace(Readiness::Pending);
        if std::mem::take(connected) {
            warn!("broker connection lost");
            self.inner.emit(SystemEvent::Offline);
        }
    }

    async fn disconnect(
        &self,
        transport: &Arc<dyn Transport>,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        open: bool,
        connected: bool,
    ) {
        self.inner.set_state(ConnectionState::Disconnecting);
        transport.end().await;

        if open {
            let closed = async {
                while let Some(event) = events.recv().await {
                    if event == TransportEvent::Closed {
                        break;
                    }
                }
            };
            if timeout(CLOSE_TIMEOUT, closed).await.is_err() {
                warn!("transport did not confirm close");
            }
        }

        if connected {
            self.inner.emit(SystemEvent::Offline);
        }
        self.closed();
    }

    fn closed(&self) {
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.readiness.send_replace(Readiness::Closed);
        info!("connection manager stopped");
    }

    fn failed(&self, e: ConfigurationError) {
        error!(error = %e, "bootstrap failed");
        self.inner.readiness.send_replace(Readiness::Failed(e.clone()));
        self.inner.emit(SystemEvent::Error(e.into()));
        self.inner.set_state(ConnectionState::Disconnected);
    }
}
