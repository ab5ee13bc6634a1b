//! # Integration Test Flows
//!
//! Glands and receptors of one system working through the shared broker
//! connection:
//!
//! 1. **Subscription sharing**: receptors on the same streams cost one
//!    broker subscription per topic.
//! 2. **Definition lifecycle**: withdrawal, redefinition and periodic
//!    re-announcement.
//! 3. **Delivery**: duplicates are dropped, state survives broker outages.

#[cfg(test)]
mod tests {
    use crate::integration::support::{
        clock, config, hormone, next, online, temperature, thermometer, until, Events,
    };
    use endocrine::{DefinitionEnv, GlandEvent, HormoneEnv, ReceptorEvent, SystemEvent};
    use es_bus::InMemoryBroker;
    use es_crypto::testing::FIXTURE_NOW;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    async fn defined(events: &mut Events) -> DefinitionEnv {
        until(events, |event| match event {
            ReceptorEvent::Defined(env) => Some(env),
            _ => None,
        })
        .await
    }

    async fn received(events: &mut Events) -> HormoneEnv {
        until(events, |event| match event {
            ReceptorEvent::Hormone(env) => Some(env),
            _ => None,
        })
        .await
    }

    async fn system_event(events: &mut broadcast::Receiver<SystemEvent>, expected: SystemEvent) {
        loop {
            if events.recv().await.unwrap() == expected {
                return;
            }
        }
    }

    // =============================================================================
    // SUBSCRIPTION SHARING
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_receptors_share_broker_subscriptions() {
        let broker = InMemoryBroker::new();
        let (system, _) = online(&broker, config(), &clock()).await;
        let (gland, _) = system.new_gland("roof/temp", thermometer()).await.unwrap();
        let (first, mut first_events) = system.new_receptor("roof/", None).await.unwrap();
        let (second, mut second_events) = system.new_receptor("roof/", None).await.unwrap();

        // The second receptor sees the retained definition through the shared subscription.
        assert_eq!(defined(&mut first_events).await.name, "roof/temp");
        assert_eq!(defined(&mut second_events).await.name, "roof/temp");
        assert_eq!(broker.subscribe_count("definition/roof/#"), 1);
        assert_eq!(broker.subscribe_count("hormone/roof/temp"), 1);

        gland.send(Some(temperature(20.0))).await.unwrap();
        assert_eq!(received(&mut first_events).await.values, temperature(20.0));
        assert_eq!(received(&mut second_events).await.values, temperature(20.0));

        first.shutdown().await.unwrap();
        assert_eq!(broker.unsubscribe_count("hormone/roof/temp"), 0);
        assert_eq!(broker.unsubscribe_count("definition/roof/#"), 0);

        gland.send(Some(temperature(21.0))).await.unwrap();
        assert_eq!(received(&mut second_events).await.values, temperature(21.0));

        second.shutdown().await.unwrap();
        assert_eq!(broker.unsubscribe_count("hormone/roof/temp"), 1);
        assert_eq!(broker.unsubscribe_count("definition/roof/#"), 1);
        system.shutdown().await;
    }

    // =============================================================================
    // DEFINITION LIFECYCLE
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_gland_restart_redefines_stream() {
        let broker = InMemoryBroker::new();
        let (system, _) = online(&broker, config(), &clock()).await;
        let (receptor, mut events) = system.new_receptor("roof/", None).await.unwrap();
        let (gland, _) = system.new_gland("roof/temp", thermometer()).await.unwrap();
        assert_eq!(defined(&mut events).await.freshness, Some(60));

        gland.send(Some(temperature(20.0))).await.unwrap();
        received(&mut events).await;

        gland.shutdown().await.unwrap();
        let undefined = until(&mut events, |event| match event {
            ReceptorEvent::Undefined(env) => Some(env),
            _ => None,
        })
        .await;
        assert_eq!(undefined.name, "roof/temp");
        assert!(receptor.streams().is_empty());
        assert_eq!(broker.retained("definition/roof/temp"), None);

        let (_gland, _) = system
            .new_gland("roof/temp", thermometer().with_freshness(120))
            .await
            .unwrap();
        assert_eq!(defined(&mut events).await.freshness, Some(120));
        assert_eq!(receptor.streams(), vec!["roof/temp".to_string()]);
        assert!(receptor.hormones().is_empty());
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_definition_refreshes_without_churn() {
        let broker = InMemoryBroker::new();
        let config = config().with_definition_resend_interval(Duration::from_secs(60));
        let (system, _) = online(&broker, config, &clock()).await;
        let (_gland, _) = system.new_gland("roof/temp", thermometer()).await.unwrap();
        let (receptor, mut events) = system.new_receptor("roof/", None).await.unwrap();
        defined(&mut events).await;

        let start = Instant::now();
        let refreshed = match next(&mut events).await {
            ReceptorEvent::Refreshed(env) => env,
            other => panic!("expected Refreshed, got {other:?}"),
        };
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(refreshed.name, "roof/temp");
        assert_eq!(receptor.streams(), vec!["roof/temp".to_string()]);
        assert_eq!(broker.subscribe_count("hormone/roof/temp"), 1);
        assert_eq!(broker.unsubscribe_count("hormone/roof/temp"), 0);
        system.shutdown().await;
    }

    // =============================================================================
    // DELIVERY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_hormone_dropped() {
        let broker = InMemoryBroker::new();
        let clock = clock();
        let (system, _) = online(&broker, config(), &clock).await;
        let (receptor, mut events) = system.new_receptor("roof/", None).await.unwrap();
        let (gland, _) = system.new_gland("roof/temp", thermometer()).await.unwrap();
        defined(&mut events).await;

        gland.send(Some(temperature(20.0))).await.unwrap();
        hormone(next(&mut events).await);
        let payload = broker.retained("hormone/roof/temp").unwrap();
        broker.inject("hormone/roof/temp", &payload, false);

        clock.advance(1);
        gland.send(Some(temperature(30.0))).await.unwrap();
        let latest = hormone(next(&mut events).await);
        assert_eq!(latest.values, temperature(30.0));
        assert_eq!(latest.sent_at, FIXTURE_NOW + 1);
        assert_eq!(receptor.hormones()[0].received_at, FIXTURE_NOW + 1);
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receptor_survives_broker_interruption() {
        let broker = InMemoryBroker::new();
        let clock = clock();
        let (system, mut system_events) = online(&broker, config(), &clock).await;
        let (receptor, mut events) = system.new_receptor("roof/", None).await.unwrap();
        let (gland, _) = system.new_gland("roof/temp", thermometer()).await.unwrap();
        defined(&mut events).await;
        gland.send(Some(temperature(45.0))).await.unwrap();
        assert!(matches!(next(&mut events).await, ReceptorEvent::HormoneError(_)));
        hormone(next(&mut events).await);

        broker.interrupt();
        system_event(&mut system_events, SystemEvent::Offline).await;
        broker.restore();
        system_event(&mut system_events, SystemEvent::Online).await;
        assert_eq!(broker.subscribe_count("definition/roof/#"), 2);
        assert_eq!(broker.subscribe_count("hormone/roof/temp"), 2);

        // Retained definition and hormone come back; only the definition is news.
        assert!(matches!(next(&mut events).await, ReceptorEvent::Refreshed(_)));

        clock.advance(5);
        gland.send(Some(temperature(25.0))).await.unwrap();
        let recovery = match next(&mut events).await {
            ReceptorEvent::HormoneRecovery(env) => env,
            other => panic!("expected HormoneRecovery, got {other:?}"),
        };
        assert_eq!(recovery.error, 0);
        assert_eq!(hormone(next(&mut events).await).values, temperature(25.0));

        let view = &receptor.good_hormones()[0];
        assert_eq!(view.state_changed_at, FIXTURE_NOW + 5);
        assert_eq!(
            serde_json::to_value(view).unwrap()["stateChangedAt"],
            FIXTURE_NOW + 5
        );
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_shutdown_clears_retained_state() {
        let broker = InMemoryBroker::new();
        let (system, _) = online(&broker, config(), &clock()).await;
        let (gland, mut gland_events) = system.new_gland("roof/temp", thermometer()).await.unwrap();
        let (receptor, _) = system.new_receptor("roof/", None).await.unwrap();
        gland.send(Some(temperature(20.0))).await.unwrap();

        system.shutdown().await;
        assert!(gland.is_shut_down());
        assert!(receptor.is_shut_down());
        assert_eq!(broker.retained("definition/roof/temp"), None);
        assert_eq!(broker.retained("hormone/roof/temp"), None);
        assert_eq!(broker.client_count(), 0);

        let removed = loop {
            if let GlandEvent::RemovedGland(env) = gland_events.recv().await.unwrap() {
                break env;
            }
        };
        assert_eq!(removed.name, "roof/temp");
    }
}
