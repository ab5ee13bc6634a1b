//! # Acceptance Scenarios
//!
//! 1. **Bare heartbeat**: a gland without fields publishes timestamp-only,
//!    correctly signed hormones.
//! 2. **Vetoing receptor**: a certificate check that rejects everything keeps
//!    every stream out.
//! 3. **Expiry**: a one-second stream expires one second after its last
//!    hormone.
//! 4. **Discovery fallback**: a failing resolver ahead of a literal address
//!    costs exactly one attempt and no error.

#[cfg(test)]
mod tests {
    use crate::integration::support::{builder, clock, config, hormone, next, online, until, Events};
    use endocrine::{
        CertCheck, DiscoveryMethod, Field, FieldType, FieldValue, GlandSpec, ReceptionError, ReceptorEvent, Sample,
        SystemEvent,
    };
    use es_bus::{DiscoveryError, InMemoryBroker, MEMORY_BROKER_ADDRESS};
    use es_crypto::testing::FIXTURE_NOW;
    use es_crypto::{CertInfo, TrustError};
    use es_protocol::{Definition, Hormone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn rejected_name(event: ReceptorEvent) -> Option<String> {
        match event {
            ReceptorEvent::ReceptionError {
                name,
                error: ReceptionError::Trust(TrustError::Rejected(_)),
                ..
            } => name,
            _ => None,
        }
    }

    async fn expect_defined(events: &mut Events) -> endocrine::DefinitionEnv {
        until(events, |event| match event {
            ReceptorEvent::Defined(env) => Some(env),
            _ => None,
        })
        .await
    }

    // =============================================================================
    // SCENARIO 1: BARE HEARTBEAT
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_empty_format_gland_sends_bare_timestamp() {
        let broker = InMemoryBroker::new();
        let (system, _) = online(&broker, config(), &clock()).await;
        let (_receptor, mut events) = system.new_receptor("door/", None).await.unwrap();
        let (gland, _) = system.new_gland("door/bell", GlandSpec::new()).await.unwrap();

        let defined = expect_defined(&mut events).await;
        assert!(defined.data_format.is_empty());
        let retained = broker.retained("definition/door/bell").unwrap();
        assert_eq!(retained, gland.definition().payload());

        gland.send(Some(Sample::new())).await.unwrap();
        let payload = broker.retained("hormone/door/bell").unwrap();
        assert_eq!(payload.lines().count(), 2);

        let definition = Arc::new(Definition::decode(&retained).unwrap());
        let decoded = Hormone::decode(Arc::clone(&definition), &payload).unwrap();
        assert_eq!(decoded.timestamp(), FIXTURE_NOW);
        assert!(decoded.values().is_empty());
        assert_eq!(decoded.error(), 0);

        let forged = payload.replacen(&FIXTURE_NOW.to_string(), &(FIXTURE_NOW + 1).to_string(), 1);
        assert!(Hormone::decode(definition, &forged).is_err());

        let received = hormone(next(&mut events).await);
        assert_eq!(received.name, "door/bell");
        assert_eq!(received.sent_at, FIXTURE_NOW);
        assert!(received.values.is_empty());
        assert!(received.is_fresh);
        system.shutdown().await;
    }

    // =============================================================================
    // SCENARIO 2: VETOING RECEPTOR
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_check_never_defines() {
        let broker = InMemoryBroker::new();
        let (system, _) = online(&broker, config(), &clock()).await;
        let reject = |_name: String, _origin: CertInfo| async { Err::<(), _>("no producer is trusted".to_string()) };
        let check: Arc<dyn CertCheck> = Arc::new(reject);
        let (receptor, mut events) = system.new_receptor("site/", Some(check)).await.unwrap();

        let (a, _) = system.new_gland("site/a", GlandSpec::new()).await.unwrap();
        let (b, _) = system.new_gland("site/b", GlandSpec::new()).await.unwrap();
        a.send(None).await.unwrap();
        b.send(None).await.unwrap();

        assert_eq!(until(&mut events, rejected_name).await, "site/a");
        assert_eq!(until(&mut events, rejected_name).await, "site/b");
        assert!(events.try_recv().is_err());
        assert!(receptor.streams().is_empty());
        assert!(receptor.hormones().is_empty());
        assert_eq!(broker.subscribe_count("hormone/site/a"), 0);
        assert_eq!(broker.subscribe_count("hormone/site/b"), 0);
        system.shutdown().await;
    }

    // =============================================================================
    // SCENARIO 3: EXPIRY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_one_second_stream_expires_after_one_second() {
        let broker = InMemoryBroker::new();
        let (system, _) = online(&broker, config(), &clock()).await;
        let (receptor, mut events) = system.new_receptor("pulse/", None).await.unwrap();
        let spec = GlandSpec::new()
            .with_freshness(1)
            .auto_refresh(false)
            .with_field(Field::new("on", FieldType::Boolean));
        let (gland, _) = system.new_gland("pulse/beat", spec).await.unwrap();
        expect_defined(&mut events).await;

        gland
            .send(Some(Sample::from([("on".to_string(), FieldValue::Boolean(true))])))
            .await
            .unwrap();
        let received = hormone(next(&mut events).await);
        assert!(received.is_fresh);
        assert_eq!(received.freshness, Some(1));
        assert_eq!(receptor.good_hormones().len(), 1);

        let start = Instant::now();
        let expired = match next(&mut events).await {
            ReceptorEvent::HormoneExpiration(env) => env,
            other => panic!("expected HormoneExpiration, got {other:?}"),
        };
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(expired.name, "pulse/beat");
        assert!(!expired.is_fresh);
        assert!(receptor.good_hormones().is_empty());
        assert_eq!(receptor.expired_hormones().len(), 1);
        system.shutdown().await;
    }

    // =============================================================================
    // SCENARIO 4: DISCOVERY FALLBACK
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_failing_resolver_falls_through_to_literal() {
        let broker = InMemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let failing = move |_fingerprint: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(DiscoveryError::NotFound)
            }
        };

        let (system, mut events) = builder(&broker, config(), &clock())
            .discovery(vec![
                DiscoveryMethod::resolver(failing),
                MEMORY_BROKER_ADDRESS.into(),
            ])
            .start()
            .unwrap();
        system.ready().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SystemEvent::Connecting {
                address: MEMORY_BROKER_ADDRESS.to_string()
            }
        );
        assert_eq!(events.recv().await.unwrap(), SystemEvent::Online);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connect_attempts(), vec![MEMORY_BROKER_ADDRESS.to_string()]);
        system.shutdown().await;
    }
}
