//! # Receptor
//!
//! Discovers every stream under a topic filter, accepts definitions whose
//! certificate chains to the CA, and tracks freshness and error state of
//! each accepted stream's hormones.
//!
//! ## Definition handling
//!
//! ```text
//! empty payload ──> withdraw (Undefined)
//! payload ──decode──> chain + validity ──> CertCheck ──> same as stored? ──yes──> Refreshed
//!                                                              │
//!                                                              no
//!                                                              ▼
//!                                              withdraw old, subscribe hormone/<name>, Defined
//! ```
//!
//! Any rejection is reported as [`ReceptorEvent::ReceptionError`] and leaves
//! existing state untouched.
//!
//! ## Hormone handling
//!
//! Duplicates of the stored payload are dropped. Otherwise transitions
//! (`HormoneRefresh`/`HormoneExpiration`, then `HormoneRecovery`/
//! `HormoneError`) are emitted on change, followed by `Hormone`. A fresh
//! hormone arms an expiration timer for the rest of its window, replacing
//! the previous one.

mod state;
mod worker;

pub use state::HormoneView;

use crate::events::{ReceptorEvent, EVENT_CHANNEL_CAPACITY};
use crate::system::Shared;
use crate::ReceptionError;
use async_trait::async_trait;
use es_bus::SubscriptionHandle;
use es_crypto::CertInfo;
use es_protocol::topic::{definition_topic, receptor_filter};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker::{Inbound, Streams, Worker};

/// Caller-supplied veto on a definition's origin, consulted after the CA
/// checks passed.
#[async_trait]
pub trait CertCheck: Send + Sync {
    /// Accept the stream `name` produced by `origin`, or reject it with a reason.
    async fn check(&self, name: &str, origin: &CertInfo) -> Result<(), String>;
}

#[async_trait]
impl<F, Fut> CertCheck for F
where
    F: Fn(String, CertInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    async fn check(&self, name: &str, origin: &CertInfo) -> Result<(), String> {
        self(name.to_string(), origin.clone()).await
    }
}

pub(crate) struct ReceptorInner {
    filter: String,
    shared: Arc<Shared>,
    streams: Streams,
    events: broadcast::Sender<ReceptorEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
    definitions: Mutex<Option<SubscriptionHandle>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ReceptorInner {
    pub(crate) fn filter(&self) -> &str {
        &self.filter
    }

    pub(crate) async fn shutdown(&self) -> Result<(), ReceptionError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let handle = self.definitions.lock().take();
        let unsubscribed = match handle {
            Some(handle) => self.shared.manager.unsubscribe(handle).await,
            None => Ok(()),
        };

        let (done, finished) = oneshot::channel();
        if self.inbound.send(Inbound::Shutdown(done)).is_ok() {
            finished.await.ok();
        }
        self.worker.lock().take();

        info!(filter = %self.filter, "receptor removed");
        self.events
            .send(ReceptorEvent::RemovedReceptor {
                filter: self.filter.clone(),
            })
            .ok();
        unsubscribed.map_err(ReceptionError::from)
    }
}

impl Drop for ReceptorInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            debug!(filter = %self.filter, "receptor dropped without shutdown");
            worker.abort();
        }
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }

        // Best effort: release the shared subscriptions outside of shutdown.
        let mut handles: Vec<SubscriptionHandle> = self
            .streams
            .lock()
            .drain()
            .map(|(_, stream)| stream.subscription)
            .collect();
        handles.extend(self.definitions.lock().take());
        if handles.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(filter = %self.filter, subscriptions = handles.len(), "no runtime, subscriptions leaked");
            return;
        };
        let manager = self.shared.manager.clone();
        let filter = self.filter.clone();
        runtime.spawn(async move {
            for handle in handles {
                if let Err(e) = manager.unsubscribe(handle).await {
                    debug!(filter = %filter, error = %e, "unsubscribe after drop failed");
                }
            }
        });
    }
}

/// Consumer of every stream under a filter. Cheap to clone.
#[derive(Clone)]
pub struct Receptor {
    inner: Arc<ReceptorInner>,
}

impl Receptor {
    pub(crate) async fn create(
        shared: Arc<Shared>,
        filter: &str,
        cert_check: Option<Arc<dyn CertCheck>>,
    ) -> Result<(Self, broadcast::Receiver<ReceptorEvent>), ReceptionError> {
        let filter = receptor_filter(filter)?;
        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();

        // Retained definitions queue up in the channel until the worker runs.
        let forward = inbound.clone();
        let handler = move |topic: &str, payload: &str| {
            forward
                .send(Inbound::Definition {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
                .ok();
        };
        let definitions = shared
            .manager
            .subscribe(&definition_topic(&filter), Arc::new(handler))
            .await?;

        events
            .send(ReceptorEvent::NewReceptor {
                filter: filter.clone(),
            })
            .ok();
        info!(filter = %filter, "receptor listening");

        let streams: Streams = Arc::default();
        let worker = Worker {
            filter: filter.clone(),
            shared: Arc::clone(&shared),
            streams: Arc::clone(&streams),
            events: events.clone(),
            inbound: inbound.clone(),
            cert_check,
            next_generation: 0,
        };
        let worker = tokio::spawn(worker.run(inbound_rx));

        let inner = Arc::new(ReceptorInner {
            filter,
            shared,
            streams,
            events,
            inbound,
            definitions: Mutex::new(Some(definitions)),
            worker: Mutex::new(Some(worker)),
            shut_down: AtomicBool::new(false),
        });
        Ok((Self { inner }, receiver))
    }

    pub(crate) fn downgrade(&self) -> Weak<ReceptorInner> {
        Arc::downgrade(&self.inner)
    }

    /// Normalized filter below `definition/`.
    pub fn filter(&self) -> &str {
        &self.inner.filter
    }

    /// New receiver of this receptor's events.
    pub fn events(&self) -> broadcast::Receiver<ReceptorEvent> {
        self.inner.events.subscribe()
    }

    /// Names of the accepted streams, sorted.
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn views(&self, keep: impl Fn(&HormoneView) -> bool) -> Vec<HormoneView> {
        let mut views: Vec<HormoneView> = self
            .inner
            .streams
            .lock()
            .iter()
            .filter_map(|(name, stream)| stream.latest.as_ref().map(|latest| HormoneView::new(name, latest)))
            .filter(|view| keep(view))
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    /// Latest hormone of every stream that has sent one.
    pub fn hormones(&self) -> Vec<HormoneView> {
        self.views(|_| true)
    }

    /// Streams whose latest hormone went stale.
    pub fn expired_hormones(&self) -> Vec<HormoneView> {
        self.views(|view| !view.is_fresh)
    }

    /// Streams whose latest hormone reports an error.
    pub fn erroneous_hormones(&self) -> Vec<HormoneView> {
        self.views(|view| view.error != 0)
    }

    /// Streams whose latest hormone is fresh and error-free.
    pub fn good_hormones(&self) -> Vec<HormoneView> {
        self.views(HormoneView::is_good)
    }

    /// Stop listening: drop the definition subscription, withdraw every
    /// stream, then emit `RemovedReceptor`. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), ReceptionError> {
        self.inner.shutdown().await
    }

    /// Whether [`Receptor::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Receptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receptor")
            .field("filter", &self.inner.filter)
            .field("streams", &self.streams())
            .finish_non_exhaustive()
    }
}
