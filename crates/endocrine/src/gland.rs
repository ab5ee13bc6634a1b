//! # Gland
//!
//! Publishes one named stream: a signed definition once at construction
//! and on a long period after that, and a signed hormone per `send`.
//!
//! ## Timers
//!
//! | Timer | Period | Effect |
//! |-------|--------|--------|
//! | republish | `definition_resend_interval`, zero disables | definition published again unchanged |
//! | refresh | `freshness / 2`, re-armed by every `send` | last sample re-signed and sent |
//!
//! Both are tasks owned by the gland and aborted on shutdown or drop.

use crate::events::{DefinitionEnv, GlandEvent, HormoneEnv, EVENT_CHANNEL_CAPACITY};
use crate::system::Shared;
use crate::GlandError;
use es_protocol::topic::{definition_topic, hormone_topic, validate_name};
use es_protocol::{Definition, DefinitionData, Field, Hormone, Sample};
use es_telemetry::log_stream_event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Freshness applied when a spec does not say otherwise (2 h).
pub const DEFAULT_FRESHNESS: u64 = 7200;

/// What a gland publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlandSpec {
    /// Stream description
    pub description: Option<String>,
    /// Check expression deriving the error code
    pub check: Option<String>,
    /// Seconds a hormone stays fresh; `None` never expires
    pub freshness: Option<u64>,
    /// Ordered fields
    pub data_format: Vec<Field>,
    /// Resend the last sample at half the freshness window
    pub auto_refresh: bool,
}

impl Default for GlandSpec {
    fn default() -> Self {
        Self {
            description: None,
            check: None,
            freshness: Some(DEFAULT_FRESHNESS),
            data_format: Vec::new(),
            auto_refresh: true,
        }
    }
}

impl GlandSpec {
    /// Create new spec with the default freshness and auto-refresh on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the check expression.
    #[must_use]
    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    /// Set the freshness window in seconds.
    #[must_use]
    pub fn with_freshness(mut self, seconds: u64) -> Self {
        self.freshness = Some(seconds);
        self
    }

    /// Hormones never go stale.
    #[must_use]
    pub fn never_expires(mut self) -> Self {
        self.freshness = None;
        self
    }

    /// Append a field.
    #[must_use]
    pub fn with_field(mut self, field: Field) -> Self {
        self.data_format.push(field);
        self
    }

    /// Enable or disable the refresh timer.
    #[must_use]
    pub fn auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }
}

pub(crate) struct GlandInner {
    shared: Arc<Shared>,
    name: String,
    definition: Arc<Definition>,
    env: DefinitionEnv,
    events: broadcast::Sender<GlandEvent>,
    last: Mutex<Option<Sample>>,
    reset: watch::Sender<()>,
    shut_down: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl GlandInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn emit(&self, event: GlandEvent) {
        self.events.send(event).ok();
    }

    async fn publish(&self, sample: &Sample) -> Result<Hormone, GlandError> {
        let now = self.shared.time.now();
        let hormone = Hormone::sign(Arc::clone(&self.definition), &self.shared.identity, sample, now)?;
        self.shared
            .manager
            .publish(&hormone_topic(&self.name), hormone.payload())
            .await?;
        log_stream_event!(debug, "gland", "hormone sent", self.name, timestamp = hormone.timestamp());
        Ok(hormone)
    }

    fn sent(&self, hormone: &Hormone) {
        let now = self.shared.time.now();
        let env = HormoneEnv::new(&self.name, hormone, hormone.is_fresh(now), now, &self.env.origin);
        self.emit(GlandEvent::Sent(env));
    }

    async fn send(&self, sample: Option<Sample>) -> Result<(), GlandError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GlandError::ShutDown);
        }
        let sample = match sample {
            Some(sample) => sample,
            None if self.definition.data_format().is_empty() => Sample::new(),
            None => return Err(GlandError::MissingSample),
        };

        let hormone = self.publish(&sample).await?;
        *self.last.lock() = Some(sample);
        self.reset.send_replace(());
        self.sent(&hormone);
        Ok(())
    }

    async fn refresh(&self) {
        let last = self.last.lock().clone();
        let sample = match last {
            Some(sample) => sample,
            None if self.definition.data_format().is_empty() => Sample::new(),
            None => {
                log_stream_event!(debug, "gland", "nothing sent yet, refresh skipped", self.name);
                return;
            }
        };

        match self.publish(&sample).await {
            Ok(hormone) => self.sent(&hormone),
            Err(error) => {
                log_stream_event!(warn, "gland", "refresh failed", self.name, error = %error);
                self.emit(GlandEvent::Error {
                    env: self.env.clone(),
                    error,
                });
            }
        }
    }

    async fn republish(&self) {
        let topic = definition_topic(&self.name);
        match self.shared.manager.publish(&topic, self.definition.payload()).await {
            Ok(()) => debug!(stream = %self.name, "definition republished"),
            Err(e) => {
                warn!(stream = %self.name, error = %e, "definition republish failed");
                self.emit(GlandEvent::Error {
                    env: self.env.clone(),
                    error: e.into(),
                });
            }
        }
    }

    fn stop_timers(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }

    pub(crate) async fn shutdown(&self) -> Result<(), GlandError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_timers();

        let definition = definition_topic(&self.name);
        let hormone = hormone_topic(&self.name);
        tokio::try_join!(
            self.shared.manager.publish(&definition, ""),
            self.shared.manager.publish(&hormone, ""),
        )?;

        info!(stream = %self.name, "gland removed");
        self.emit(GlandEvent::RemovedGland(self.env.clone()));
        Ok(())
    }
}

impl Drop for GlandInner {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

async fn republish_loop(gland: Weak<GlandInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(gland) = gland.upgrade() else { return };
        gland.republish().await;
    }
}

async fn refresh_loop(gland: Weak<GlandInner>, mut reset: watch::Receiver<()>, period: Duration) {
    loop {
        tokio::select! {
            changed = reset.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = sleep(period) => {
                let Some(gland) = gland.upgrade() else { return };
                gland.refresh().await;
            }
        }
    }
}

/// Producer of one stream. Cheap to clone.
#[derive(Clone)]
pub struct Gland {
    inner: Arc<GlandInner>,
}

impl Gland {
    pub(crate) async fn create(
        shared: Arc<Shared>,
        name: &str,
        spec: GlandSpec,
    ) -> Result<(Self, broadcast::Receiver<GlandEvent>), GlandError> {
        let name = format!("{}{name}", shared.prefix);
        validate_name(&name)?;

        let auto_refresh = spec.auto_refresh;
        let data = DefinitionData {
            cert: shared.cert.clone(),
            description: spec.description,
            check: spec.check,
            freshness: spec.freshness,
            data_format: spec.data_format,
        };
        let definition = Arc::new(Definition::sign(data, &shared.identity)?);
        let origin = shared.validator.pki().cert_info(&shared.cert).await?;
        let env = DefinitionEnv::new(&name, &definition, &origin);

        // Stale retained state of a previous incarnation goes first.
        let definition_topic = definition_topic(&name);
        let hormone_topic = hormone_topic(&name);
        tokio::try_join!(
            shared.manager.publish(&hormone_topic, ""),
            shared.manager.publish(&definition_topic, ""),
        )?;
        shared.manager.publish(&definition_topic, definition.payload()).await?;

        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (reset, reset_rx) = watch::channel(());
        let resend_interval = shared.definition_resend_interval;

        let inner = Arc::new(GlandInner {
            shared,
            name,
            definition,
            env,
            events,
            last: Mutex::new(None),
            reset,
            shut_down: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
        });
        inner.emit(GlandEvent::NewGland(inner.env.clone()));
        info!(stream = %inner.name, freshness = ?inner.definition.freshness(), "gland defined");

        let mut timers = Vec::new();
        if !resend_interval.is_zero() {
            timers.push(tokio::spawn(republish_loop(Arc::downgrade(&inner), resend_interval)));
        }
        if let (Some(freshness), true) = (inner.definition.freshness(), auto_refresh) {
            let period = Duration::from_millis(freshness.saturating_mul(500));
            timers.push(tokio::spawn(refresh_loop(Arc::downgrade(&inner), reset_rx, period)));
        }
        *inner.timers.lock() = timers;

        Ok((Self { inner }, receiver))
    }

    pub(crate) fn downgrade(&self) -> Weak<GlandInner> {
        Arc::downgrade(&self.inner)
    }

    /// Full stream name, prefix included.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Environment of this gland's definition events.
    pub fn env(&self) -> &DefinitionEnv {
        &self.inner.env
    }

    /// The published definition.
    pub fn definition(&self) -> &Definition {
        &self.inner.definition
    }

    /// New receiver of this gland's events.
    pub fn events(&self) -> broadcast::Receiver<GlandEvent> {
        self.inner.events.subscribe()
    }

    /// Sign and publish a sample.
    ///
    /// `None` is accepted only when the definition has no fields.
    pub async fn send(&self, sample: Option<Sample>) -> Result<(), GlandError> {
        self.inner.send(sample).await
    }

    /// Stop both timers and clear the retained definition and hormone.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), GlandError> {
        self.inner.shutdown().await
    }

    /// Whether [`Gland::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Gland {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gland")
            .field("name", &self.inner.name)
            .field("definition", &self.inner.definition)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config, start, start_with_clock};
    use es_bus::{InMemoryBroker, ManualTimeSource};
    use es_crypto::testing::FIXTURE_NOW;
    use es_protocol::{FieldType, FieldValue, ProtocolError};

    fn temperature() -> GlandSpec {
        GlandSpec::new()
            .with_description("roof temperature")
            .with_freshness(10)
            .with_check("err = temp > 40 ? 1 : 0")
            .with_field(Field::new("temp", FieldType::Number).with_unit("°C"))
    }

    fn sample(temp: f64) -> Sample {
        Sample::from([("temp".to_string(), FieldValue::from(temp))])
    }

    fn expect_sent(event: GlandEvent) -> HormoneEnv {
        match event {
            GlandEvent::Sent(env) => env,
            other => panic!("expected Sent, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_clears_then_defines() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());

        let (gland, mut events) = system.new_gland("roof/temp", temperature()).await.unwrap();

        let published = broker.published();
        let mut cleared = published[..2].to_vec();
        cleared.sort();
        assert_eq!(
            cleared,
            vec![
                ("definition/roof/temp".to_string(), String::new()),
                ("hormone/roof/temp".to_string(), String::new()),
            ]
        );
        assert_eq!(
            published[2],
            ("definition/roof/temp".to_string(), gland.definition().payload().to_string())
        );

        let retained = broker.retained("definition/roof/temp").unwrap();
        assert_eq!(Definition::decode(&retained).unwrap(), *gland.definition());

        match events.recv().await.unwrap() {
            GlandEvent::NewGland(env) => {
                assert_eq!(env.name, "roof/temp");
                assert_eq!(env.freshness, Some(10));
                assert_eq!(env.description.as_deref(), Some("roof temperature"));
            }
            other => panic!("unexpected {other:?}"),
        }
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_publishes_signed_hormone() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (gland, mut events) = system.new_gland("roof/temp", temperature()).await.unwrap();
        events.recv().await.unwrap();

        gland.send(Some(sample(42.5))).await.unwrap();

        let definition = Arc::new(gland.definition().clone());
        let payload = broker.retained("hormone/roof/temp").unwrap();
        let hormone = Hormone::decode(definition, &payload).unwrap();
        assert_eq!(hormone.timestamp(), FIXTURE_NOW);
        assert_eq!(hormone.values(), &[FieldValue::Number(42.5)]);
        assert_eq!(hormone.error(), 1);

        let env = expect_sent(events.recv().await.unwrap());
        assert_eq!(env.sent_at, FIXTURE_NOW);
        assert_eq!(env.error, 1);
        assert!(env.is_fresh);
        assert_eq!(env.freshness, Some(10));
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_validates_sample() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (gland, _events) = system.new_gland("roof/temp", temperature()).await.unwrap();

        assert_eq!(gland.send(None).await, Err(GlandError::MissingSample));
        assert_eq!(
            gland.send(Some(Sample::new())).await,
            Err(GlandError::Protocol(ProtocolError::MissingValue("temp".to_string())))
        );
        assert_eq!(broker.retained("hormone/roof/temp"), None);
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_format_sends_bare_timestamp() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (gland, _events) = system.new_gland("heartbeat", GlandSpec::new()).await.unwrap();

        gland.send(None).await.unwrap();
        let payload = broker.retained("hormone/heartbeat").unwrap();
        let (timestamp, _signature) = payload.split_once('\n').unwrap();
        assert_eq!(timestamp, FIXTURE_NOW.to_string());
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_resends_last_sample() {
        let broker = InMemoryBroker::new();
        let clock = ManualTimeSource::new(FIXTURE_NOW);
        let (system, _) = start_with_clock(&broker, config(), clock.clone());
        let (gland, mut events) = system.new_gland("roof/temp", temperature()).await.unwrap();
        events.recv().await.unwrap();

        let started = Instant::now();
        gland.send(Some(sample(20.0))).await.unwrap();
        expect_sent(events.recv().await.unwrap());
        clock.advance(5);

        let refreshed = expect_sent(events.recv().await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(refreshed.sent_at, FIXTURE_NOW + 5);
        assert_eq!(refreshed.values, sample(20.0));
        assert_eq!(broker.published_to("hormone/roof/temp").len(), 3);
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rearms_refresh() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (gland, mut events) = system.new_gland("roof/temp", temperature()).await.unwrap();
        events.recv().await.unwrap();

        let started = Instant::now();
        gland.send(Some(sample(20.0))).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        gland.send(Some(sample(21.0))).await.unwrap();
        expect_sent(events.recv().await.unwrap());
        expect_sent(events.recv().await.unwrap());

        let refreshed = expect_sent(events.recv().await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert_eq!(refreshed.values, sample(21.0));
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_skipped_before_first_send() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (_gland, mut events) = system.new_gland("roof/temp", temperature()).await.unwrap();
        events.recv().await.unwrap();

        sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert!(broker.published_to("hormone/roof/temp").iter().all(String::is_empty));
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_format_refreshes_without_send() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (_gland, mut events) = system
            .new_gland("heartbeat", GlandSpec::new().with_freshness(4))
            .await
            .unwrap();
        events.recv().await.unwrap();

        let started = Instant::now();
        let env = expect_sent(events.recv().await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(env.values.is_empty());
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_refresh_without_freshness_or_when_disabled() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (a, mut a_events) = system
            .new_gland("a", GlandSpec::new().never_expires())
            .await
            .unwrap();
        let (b, mut b_events) = system
            .new_gland("b", GlandSpec::new().with_freshness(2).auto_refresh(false))
            .await
            .unwrap();
        a.send(None).await.unwrap();
        b.send(None).await.unwrap();
        while a_events.try_recv().is_ok() {}
        while b_events.try_recv().is_ok() {}

        sleep(Duration::from_secs(3600)).await;
        assert!(a_events.try_recv().is_err());
        assert!(b_events.try_recv().is_err());
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_definition_republished_periodically() {
        let broker = InMemoryBroker::new();
        let config = config().with_definition_resend_interval(Duration::from_secs(60));
        let (system, _) = start(&broker, config);
        let (gland, _events) = system
            .new_gland("a", GlandSpec::new().never_expires())
            .await
            .unwrap();

        sleep(Duration::from_secs(59)).await;
        assert_eq!(broker.published_to("definition/a").len(), 2);
        sleep(Duration::from_secs(62)).await;

        let payload = gland.definition().payload().to_string();
        assert_eq!(
            broker.published_to("definition/a"),
            vec![String::new(), payload.clone(), payload.clone(), payload]
        );
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_resend_interval_disables_republish() {
        let broker = InMemoryBroker::new();
        let config = config().with_definition_resend_interval(Duration::ZERO);
        let (system, _) = start(&broker, config);
        let (gland, _events) = system
            .new_gland("a", GlandSpec::new().never_expires())
            .await
            .unwrap();

        sleep(Duration::from_secs(3600)).await;
        assert_eq!(
            broker.published_to("definition/a"),
            vec![String::new(), gland.definition().payload().to_string()]
        );
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_retained_state() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());
        let (gland, mut events) = system.new_gland("a", GlandSpec::new()).await.unwrap();
        gland.send(None).await.unwrap();

        gland.shutdown().await.unwrap();
        assert!(gland.is_shut_down());
        assert_eq!(broker.retained("definition/a"), None);
        assert_eq!(broker.retained("hormone/a"), None);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(GlandEvent::RemovedGland(env)) if env.name == "a"));

        assert_eq!(gland.send(None).await, Err(GlandError::ShutDown));
        let published = broker.published().len();
        gland.shutdown().await.unwrap();
        assert_eq!(broker.published().len(), published);
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_names_are_prefixed_and_validated() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config().with_prefix("site/"));

        let (gland, _events) = system.new_gland("temp", GlandSpec::new()).await.unwrap();
        assert_eq!(gland.name(), "site/temp");
        assert!(broker.retained("definition/site/temp").is_some());

        for bad in ["temp/", "te#mp", "te+mp"] {
            assert!(matches!(
                system.new_gland(bad, GlandSpec::new()).await,
                Err(GlandError::Protocol(ProtocolError::InvalidName(_)))
            ));
        }
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_definition_rejected() {
        let broker = InMemoryBroker::new();
        let (system, _) = start(&broker, config());

        let spec = GlandSpec::new()
            .with_field(Field::new("a", FieldType::Number))
            .with_field(Field::new("a", FieldType::String));
        assert_eq!(
            system.new_gland("dup", spec).await.unwrap_err(),
            GlandError::Protocol(ProtocolError::DuplicateField("a".to_string()))
        );
        assert_eq!(
            system.new_gland("zero", GlandSpec::new().with_freshness(0)).await.unwrap_err(),
            GlandError::Protocol(ProtocolError::InvalidFreshness)
        );
        assert!(broker.published_to("definition/dup").is_empty());
        system.shutdown().await;
    }
}
