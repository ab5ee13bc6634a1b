//! Shared fixtures for the integration tests.

use endocrine::{
    EndocrineSystem, Field, FieldType, FieldValue, GlandSpec, HormoneEnv, ReceptorEvent, Sample, SystemBuilder,
    SystemConfig, SystemEvent,
};
use es_bus::{InMemoryBroker, ManualTimeSource, MEMORY_BROKER_ADDRESS};
use es_crypto::testing::{CA_CERT, FIXTURE_NOW, GLAND_CERT, GLAND_KEY};
use std::sync::Arc;
use tokio::sync::broadcast;

pub(crate) type Events = broadcast::Receiver<ReceptorEvent>;

pub(crate) fn config() -> SystemConfig {
    SystemConfig::new(GLAND_KEY, GLAND_CERT, CA_CERT).with_broker(MEMORY_BROKER_ADDRESS)
}

pub(crate) fn clock() -> ManualTimeSource {
    ManualTimeSource::new(FIXTURE_NOW)
}

pub(crate) fn builder(broker: &InMemoryBroker, config: SystemConfig, clock: &ManualTimeSource) -> SystemBuilder {
    es_telemetry::try_init_from_env();
    SystemBuilder::new(config, Arc::new(broker.clone())).time(Arc::new(clock.clone()))
}

pub(crate) async fn online(
    broker: &InMemoryBroker,
    config: SystemConfig,
    clock: &ManualTimeSource,
) -> (EndocrineSystem, broadcast::Receiver<SystemEvent>) {
    let (system, events) = builder(broker, config, clock).start().unwrap();
    system.ready().await.unwrap();
    (system, events)
}

/// Temperature stream raising error 1 above 40 degrees.
pub(crate) fn thermometer() -> GlandSpec {
    GlandSpec::new()
        .with_description("Roof temperature")
        .with_freshness(60)
        .auto_refresh(false)
        .with_check("err = temp > 40 ? 1 : 0")
        .with_field(Field::new("temp", FieldType::Number).with_unit("°C"))
}

pub(crate) fn temperature(temp: f64) -> Sample {
    Sample::from([("temp".to_string(), FieldValue::from(temp))])
}

pub(crate) async fn next(events: &mut Events) -> ReceptorEvent {
    events.recv().await.unwrap()
}

/// Skip events until `pick` matches one.
pub(crate) async fn until<T>(events: &mut Events, pick: impl Fn(ReceptorEvent) -> Option<T>) -> T {
    loop {
        if let Some(found) = pick(next(events).await) {
            return found;
        }
    }
}

pub(crate) fn hormone(event: ReceptorEvent) -> HormoneEnv {
    match event {
        ReceptorEvent::Hormone(env) => env,
        other => panic!("expected Hormone, got {other:?}"),
    }
}
