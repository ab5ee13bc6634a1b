//! The task owning a receptor's streams.
//!
//! Broker handlers and expiration timers only forward [`Inbound`] messages;
//! every state change happens here, one message at a time, so a stream's
//! transitions are evaluated in arrival order.

use super::state::{Received, Stream};
use super::CertCheck;
use crate::events::{DefinitionEnv, HormoneEnv, ReceptorEvent};
use crate::system::Shared;
use crate::ReceptionError;
use es_crypto::TrustError;
use es_protocol::topic::{definition_name, hormone_name, hormone_topic};
use es_protocol::{Definition, Hormone};
use es_telemetry::{log_event, log_stream_event};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

pub(crate) type Streams = Arc<Mutex<HashMap<String, Stream>>>;

pub(crate) enum Inbound {
    Definition { topic: String, payload: String },
    Hormone { topic: String, payload: String },
    Expired { name: String, generation: u64 },
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct Worker {
    pub(crate) filter: String,
    pub(crate) shared: Arc<Shared>,
    pub(crate) streams: Streams,
    pub(crate) events: broadcast::Sender<ReceptorEvent>,
    pub(crate) inbound: mpsc::UnboundedSender<Inbound>,
    pub(crate) cert_check: Option<Arc<dyn CertCheck>>,
    pub(crate) next_generation: u64,
}

impl Worker {
    pub(crate) async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(message) = inbound.recv().await {
            match message {
                Inbound::Definition { topic, payload } => self.on_definition(&topic, &payload).await,
                Inbound::Hormone { topic, payload } => self.on_hormone(&topic, &payload),
                Inbound::Expired { name, generation } => self.on_expired(&name, generation),
                Inbound::Shutdown(done) => {
                    self.withdraw_all().await;
                    done.send(()).ok();
                    return;
                }
            }
        }
    }

    fn emit(&self, event: ReceptorEvent) {
        self.events.send(event).ok();
    }

    fn reception_error(&self, topic: &str, name: Option<String>, error: ReceptionError) {
        log_event!(warn, "receptor", "message dropped", topic, stream = ?name, error = %error);
        self.emit(ReceptorEvent::ReceptionError {
            topic: topic.to_string(),
            name,
            error,
        });
    }

    async fn on_definition(&mut self, topic: &str, payload: &str) {
        let name = match definition_name(topic) {
            Ok(name) => name.to_string(),
            Err(e) => return self.reception_error(topic, None, e.into()),
        };

        if payload.is_empty() {
            if !self.withdraw(&name).await {
                debug!(stream = %name, "withdrawal of unknown stream ignored");
            }
            return;
        }

        if let Err(e) = self.accept(&name, payload).await {
            self.reception_error(topic, Some(name), e);
        }
    }

    async fn accept(&mut self, name: &str, payload: &str) -> Result<(), ReceptionError> {
        let definition = Definition::decode(payload)?;
        let now = self.shared.time.now();
        let origin = self
            .shared
            .validator
            .validate_origin(definition.cert(), &self.shared.ca, now)
            .await?;
        if let Some(check) = &self.cert_check {
            check.check(name, &origin).await.map_err(TrustError::Rejected)?;
        }

        let unchanged = self
            .streams
            .lock()
            .get(name)
            .is_some_and(|stream| *stream.definition == definition);
        if unchanged {
            log_stream_event!(trace, "receptor", "definition refreshed", name);
            self.emit(ReceptorEvent::Refreshed(DefinitionEnv::new(name, &definition, &origin)));
            return Ok(());
        }

        self.withdraw(name).await;

        let forward = self.inbound.clone();
        let handler = move |topic: &str, payload: &str| {
            forward
                .send(Inbound::Hormone {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
                .ok();
        };
        let subscription = self
            .shared
            .manager
            .subscribe(&hormone_topic(name), Arc::new(handler))
            .await?;

        let env = DefinitionEnv::new(name, &definition, &origin);
        self.streams.lock().insert(
            name.to_string(),
            Stream {
                definition: Arc::new(definition),
                origin,
                subscription,
                latest: None,
            },
        );
        log_stream_event!(debug, "receptor", "stream defined", name, subject = %env.origin.subject);
        self.emit(ReceptorEvent::Defined(env));
        Ok(())
    }

    /// Forget a stream. Returns whether it was known.
    async fn withdraw(&mut self, name: &str) -> bool {
        let removed = self.streams.lock().remove(name);
        let Some(stream) = removed else {
            return false;
        };

        if let Err(e) = self.shared.manager.unsubscribe(stream.subscription).await {
            warn!(stream = %name, error = %e, "hormone unsubscribe failed");
            self.emit(ReceptorEvent::Error {
                filter: self.filter.clone(),
                error: e.into(),
            });
        }

        log_stream_event!(debug, "receptor", "stream undefined", name);
        self.emit(ReceptorEvent::Undefined(DefinitionEnv::new(
            name,
            &stream.definition,
            &stream.origin,
        )));
        true
    }

    async fn withdraw_all(&mut self) {
        let mut names: Vec<String> = self.streams.lock().keys().cloned().collect();
        names.sort();
        for name in names {
            self.withdraw(&name).await;
        }
    }

    fn on_hormone(&mut self, topic: &str, payload: &str) {
        if payload.is_empty() {
            return;
        }
        let name = match hormone_name(topic) {
            Ok(name) => name,
            Err(e) => return self.reception_error(topic, None, e.into()),
        };

        match self.receive(name, payload) {
            Ok(events) => events.into_iter().for_each(|event| self.emit(event)),
            Err(e) => self.reception_error(topic, Some(name.to_string()), e),
        }
    }

    /// Update a stream with a new hormone; returns the events to emit, the
    /// unconditional `Hormone` last.
    fn receive(&mut self, name: &str, payload: &str) -> Result<Vec<ReceptorEvent>, ReceptionError> {
        let now = self.shared.time.now();
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(name)
            .ok_or_else(|| ReceptionError::UnknownHormone(name.to_string()))?;

        if stream
            .latest
            .as_ref()
            .is_some_and(|latest| latest.hormone.payload() == payload)
        {
            trace!(stream = %name, "duplicate hormone ignored");
            return Ok(Vec::new());
        }

        let hormone = Hormone::decode(Arc::clone(&stream.definition), payload)?;
        let is_fresh = hormone.is_fresh(now);
        let error = hormone.error();
        let (was_fresh, was_error, changed_at) = stream
            .latest
            .as_ref()
            .map_or((true, 0, now), |latest| (latest.is_fresh, latest.error, latest.state_changed_at));

        let env = HormoneEnv::new(name, &hormone, is_fresh, now, &stream.origin);
        let mut events = Vec::new();
        if is_fresh && !was_fresh {
            events.push(ReceptorEvent::HormoneRefresh(env.clone()));
        } else if !is_fresh && was_fresh {
            events.push(ReceptorEvent::HormoneExpiration(env.clone()));
        }
        if error == 0 && was_error != 0 {
            events.push(ReceptorEvent::HormoneRecovery(env.clone()));
        } else if error != 0 && error != was_error {
            events.push(ReceptorEvent::HormoneError(env.clone()));
        }
        let state_changed_at = if events.is_empty() { changed_at } else { now };

        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = match hormone.freshness(now) {
            Some(left) if is_fresh => Some(expiration_timer(
                self.inbound.clone(),
                name.to_string(),
                generation,
                left,
            )),
            _ => None,
        };

        // Replacing the previous hormone aborts its timer.
        stream.latest = Some(Received {
            hormone,
            received_at: now,
            state_changed_at,
            is_fresh,
            error,
            generation,
            timer,
        });

        log_stream_event!(debug, "receptor", "hormone received", name, fresh = is_fresh, error);
        events.push(ReceptorEvent::Hormone(env));
        Ok(events)
    }

    fn on_expired(&mut self, name: &str, generation: u64) {
        let now = self.shared.time.now();
        let env = {
            let mut streams = self.streams.lock();
            let Some(stream) = streams.get_mut(name) else {
                return;
            };
            let Some(latest) = stream
                .latest
                .as_mut()
                .filter(|latest| latest.generation == generation)
            else {
                trace!(stream = %name, generation, "stale expiration ignored");
                return;
            };

            latest.is_fresh = false;
            latest.state_changed_at = now;
            latest.timer = None;
            HormoneEnv::new(name, &latest.hormone, false, now, &stream.origin)
        };

        log_stream_event!(info, "receptor", "hormone expired", name);
        self.emit(ReceptorEvent::HormoneExpiration(env));
    }
}

fn expiration_timer(
    inbound: mpsc::UnboundedSender<Inbound>,
    name: String,
    generation: u64,
    seconds_left: i64,
) -> JoinHandle<()> {
    let delay = Duration::from_secs(u64::try_from(seconds_left).unwrap_or(0));
    tokio::spawn(async move {
        sleep(delay).await;
        inbound.send(Inbound::Expired { name, generation }).ok();
    })
}
