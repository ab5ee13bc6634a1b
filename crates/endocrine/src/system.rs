//! # Endocrine System
//!
//! The facade every gland and receptor hangs off. It owns the identity, the
//! connection manager and weak references to the glands and receptors it
//! created, so shutting the system down shuts them down first.

use crate::config::SystemConfig;
use crate::events::{GlandEvent, ReceptorEvent};
use crate::gland::{Gland, GlandInner, GlandSpec};
use crate::receptor::{CertCheck, Receptor, ReceptorInner};
use crate::{EsError, GlandError, ReceptionError};
use es_bus::{
    BrokerResolver, BusError, Collaborators, ConnectOptions, ConnectionManager, ConnectionState, Connector,
    DiscoveryMethod, ManagerConfig, SystemEvent, SystemTimeSource, TimeSource, TlsMaterial,
};
use es_crypto::{CertificateValidator, Pki, SigningIdentity, X509Pki};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{info, warn};

/// Upper bound for shutting down one gland or receptor.
const MEMBER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What glands and receptors need from their system.
pub(crate) struct Shared {
    pub(crate) manager: ConnectionManager,
    pub(crate) identity: SigningIdentity,
    pub(crate) cert: String,
    pub(crate) ca: String,
    pub(crate) prefix: String,
    pub(crate) definition_resend_interval: Duration,
    pub(crate) validator: CertificateValidator,
    pub(crate) time: Arc<dyn TimeSource>,
}

/// Assembles an [`EndocrineSystem`] from configuration and collaborators.
pub struct SystemBuilder {
    config: SystemConfig,
    connector: Arc<dyn Connector>,
    pki: Arc<dyn Pki>,
    time: Arc<dyn TimeSource>,
    resolvers: Vec<DiscoveryMethod>,
    discovery: Option<Vec<DiscoveryMethod>>,
}

impl SystemBuilder {
    /// Create new builder with the X.509 PKI and the system clock.
    pub fn new(config: SystemConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            pki: Arc::new(X509Pki::new()),
            time: Arc::new(SystemTimeSource),
            resolvers: Vec::new(),
            discovery: None,
        }
    }

    /// Replace the PKI collaborator.
    #[must_use]
    pub fn pki(mut self, pki: Arc<dyn Pki>) -> Self {
        self.pki = pki;
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn time(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Append a discovery resolver; tried after the configured broker.
    #[must_use]
    pub fn resolver(mut self, resolver: impl BrokerResolver + 'static) -> Self {
        self.resolvers.push(DiscoveryMethod::resolver(resolver));
        self
    }

    /// Use `methods` as the whole discovery list, in order, instead of the
    /// configured broker followed by the appended resolvers.
    #[must_use]
    pub fn discovery(mut self, methods: Vec<DiscoveryMethod>) -> Self {
        self.discovery = Some(methods);
        self
    }

    /// Start connecting. Must be called within a tokio runtime.
    ///
    /// Bootstrap validation runs in the background; its failure surfaces
    /// through [`EndocrineSystem::ready`] and a [`SystemEvent::Error`].
    pub fn start(self) -> Result<(EndocrineSystem, broadcast::Receiver<SystemEvent>), EsError> {
        let SystemConfig {
            identity: material,
            broker,
            prefix,
            ignore_timedrift,
            reject_unauthorized,
            definition_resend_interval,
            reconnect_delay,
            discovery_retry,
        } = self.config;

        let identity = SigningIdentity::from_pem(&material.key).map_err(EsError::Identity)?;

        let discovery = match self.discovery {
            Some(methods) => methods,
            None => broker
                .into_iter()
                .map(DiscoveryMethod::Address)
                .chain(self.resolvers)
                .collect(),
        };

        let config = ManagerConfig {
            discovery,
            connect_options: ConnectOptions {
                reject_unauthorized,
                tls: Some(TlsMaterial {
                    cert: material.cert.clone(),
                    key: material.key.clone(),
                    ca: material.ca.clone(),
                }),
                ..ConnectOptions::default()
            },
            reconnect_delay,
            discovery_retry,
            ignore_timedrift,
        };

        let validator = CertificateValidator::new(self.pki);
        let collaborators = Collaborators {
            connector: self.connector,
            validator: validator.clone(),
            time: Arc::clone(&self.time),
        };

        let cert = material.cert.clone();
        let ca = material.ca.clone();
        let (manager, events) = ConnectionManager::start(config, collaborators, material);
        info!(prefix = %prefix, "endocrine system started");

        let shared = Arc::new(Shared {
            manager,
            identity,
            cert,
            ca,
            prefix,
            definition_resend_interval,
            validator,
            time: self.time,
        });

        let system = EndocrineSystem {
            inner: Arc::new(SystemInner {
                shared,
                glands: Mutex::new(Vec::new()),
                receptors: Mutex::new(Vec::new()),
            }),
        };
        Ok((system, events))
    }
}

struct SystemInner {
    shared: Arc<Shared>,
    glands: Mutex<Vec<Weak<GlandInner>>>,
    receptors: Mutex<Vec<Weak<ReceptorInner>>>,
}

/// A running system. Cheap to clone.
#[derive(Clone)]
pub struct EndocrineSystem {
    inner: Arc<SystemInner>,
}

impl EndocrineSystem {
    /// Shorthand for [`SystemBuilder::new`] followed by
    /// [`SystemBuilder::start`].
    pub fn start(
        config: SystemConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, broadcast::Receiver<SystemEvent>), EsError> {
        SystemBuilder::new(config, connector).start()
    }

    /// Wait until the broker connection is up.
    ///
    /// # Errors
    ///
    /// Fails for good once bootstrap validation failed or after shutdown.
    pub async fn ready(&self) -> Result<(), EsError> {
        self.inner.shared.manager.ready().await.map_err(|e| match e {
            BusError::Configuration(e) => EsError::Configuration(e),
            other => EsError::Bus(other),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.manager.state()
    }

    /// Whether messages can currently flow.
    pub fn is_online(&self) -> bool {
        self.inner.shared.manager.is_online()
    }

    /// New receiver of connection events.
    pub fn events(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.shared.manager.events()
    }

    /// Prefix prepended to gland names.
    pub fn prefix(&self) -> &str {
        &self.inner.shared.prefix
    }

    /// Create a gland and publish its definition.
    pub async fn new_gland(
        &self,
        name: &str,
        spec: GlandSpec,
    ) -> Result<(Gland, broadcast::Receiver<GlandEvent>), GlandError> {
        let (gland, events) = Gland::create(Arc::clone(&self.inner.shared), name, spec).await?;
        let mut glands = self.inner.glands.lock();
        glands.retain(|gland| gland.strong_count() > 0);
        glands.push(gland.downgrade());
        Ok((gland, events))
    }

    /// Create a receptor for every stream under `filter`.
    ///
    /// `check` may veto a definition's origin after the CA checks passed.
    pub async fn new_receptor(
        &self,
        filter: &str,
        check: Option<Arc<dyn CertCheck>>,
    ) -> Result<(Receptor, broadcast::Receiver<ReceptorEvent>), ReceptionError> {
        let (receptor, events) = Receptor::create(Arc::clone(&self.inner.shared), filter, check).await?;
        let mut receptors = self.inner.receptors.lock();
        receptors.retain(|receptor| receptor.strong_count() > 0);
        receptors.push(receptor.downgrade());
        Ok((receptor, events))
    }

    /// Shut down every live gland and receptor, then close the connection.
    pub async fn shutdown(&self) {
        let glands: Vec<_> = self.inner.glands.lock().drain(..).filter_map(|g| g.upgrade()).collect();
        for gland in glands {
            match timeout(MEMBER_SHUTDOWN_TIMEOUT, gland.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(stream = %gland.name(), error = %e, "gland shutdown failed"),
                Err(_) => warn!(stream = %gland.name(), "gland shutdown timed out"),
            }
        }

        let receptors: Vec<_> = self.inner.receptors.lock().drain(..).filter_map(|r| r.upgrade()).collect();
        for receptor in receptors {
            match timeout(MEMBER_SHUTDOWN_TIMEOUT, receptor.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(filter = %receptor.filter(), error = %e, "receptor shutdown failed"),
                Err(_) => warn!(filter = %receptor.filter(), "receptor shutdown timed out"),
            }
        }

        self.inner.shared.manager.shutdown().await;
        info!("endocrine system shut down");
    }
}

impl std::fmt::Debug for EndocrineSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndocrineSystem")
            .field("prefix", &self.inner.shared.prefix)
            .field("manager", &self.inner.shared.manager)
            .finish_non_exhaustive()
    }
}
