//! Harness lifecycle tests against the in-memory broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amqp_harness_core::harness::CleanupStep;
use amqp_harness_core::testing::{BrokerOperation, InMemoryBroker};
use amqp_harness_core::{
    Connector, HarnessConfig, HarnessError, HarnessState, IntegrationHarness, NameGenerator,
    OutboundMessage, SessionRole,
};

fn harness(broker: &InMemoryBroker) -> IntegrationHarness {
    IntegrationHarness::new(HarnessConfig::default(), Arc::new(broker.clone()))
}

fn hex_suffix<'a>(name: &'a str, prefix: &str) -> &'a str {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or_else(|| panic!("{name} does not start with {prefix}-"))
}

#[tokio::test]
async fn test_route_names_are_distinct_role_hex() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();

    let inbound = harness.inbound().unwrap().to_string();
    let outbound = harness.outbound().unwrap().to_string();
    assert_ne!(inbound, outbound);

    for (name, prefix) in [(&inbound, "inbound"), (&outbound, "outbound")] {
        let suffix = hex_suffix(name, prefix);
        assert_eq!(suffix.len(), 16);
        let value = u64::from_str_radix(suffix, 16).unwrap();
        assert_eq!(format!("{value:016x}"), suffix);
    }

    harness.teardown().await;
}

#[tokio::test]
async fn test_routes_are_durable_fanout_not_auto_delete() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();

    let (kind, options) = broker.exchange_info(&inbound).unwrap();
    assert_eq!(kind, amqp_harness_core::ExchangeKind::Fanout);
    assert!(options.durable);
    assert!(!options.auto_delete);
    let queue = broker.queue_options(&inbound).unwrap();
    assert!(queue.durable);
    assert!(!queue.auto_delete);

    harness.teardown().await;
}

#[tokio::test]
async fn test_publish_then_receive_round_trips_payload() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();

    let payload: Vec<u8> = (0u8..=255).collect();
    let message = OutboundMessage::new(payload.clone())
        .content_type("application/octet-stream")
        .correlation_id("req-1")
        .header("source", "test");
    harness
        .publish(SessionRole::Driver, &inbound, &message)
        .await
        .unwrap();

    let delivery = harness
        .consume_once(SessionRole::Application, &inbound, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(delivery.payload.as_ref(), payload.as_slice());
    assert_eq!(delivery.properties, message.properties);
    assert_eq!(delivery.envelope.exchange, inbound);
    assert_eq!(delivery.envelope.routing_key, "");
    assert!(!delivery.envelope.redelivered);

    harness.teardown().await;
}

#[tokio::test]
async fn test_routes_are_one_to_one() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();
    let outbound = harness.outbound().unwrap().to_string();

    harness
        .publish(
            SessionRole::Application,
            &outbound,
            &OutboundMessage::new("reply"),
        )
        .await
        .unwrap();

    assert_eq!(broker.queue_depth(&outbound), Some(1));
    assert_eq!(broker.queue_depth(&inbound), Some(0));

    let result = harness
        .consume_once(SessionRole::Driver, &inbound, Duration::from_millis(100))
        .await;
    assert!(result.unwrap_err().is_timeout());

    let reply = harness
        .consume_once(SessionRole::Driver, &outbound, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(reply.payload.as_ref(), b"reply");

    harness.teardown().await;
}

#[tokio::test]
async fn test_receive_timeout_is_bounded() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();

    let started = Instant::now();
    let result = harness
        .consume_once(SessionRole::Application, &inbound, Duration::from_millis(500))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(HarnessError::ReceiveTimeout { .. })));
    assert!(elapsed >= Duration::from_millis(500), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_500), "too late: {elapsed:?}");

    // No consumer is left behind.
    assert_eq!(broker.consumer_count(&inbound), Some(0));
    harness.teardown().await;
}

#[tokio::test]
async fn test_receive_cancels_consumer_after_delivery() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();

    for body in ["first", "second"] {
        harness
            .publish(SessionRole::Driver, &inbound, &OutboundMessage::new(body))
            .await
            .unwrap();
    }

    let first = harness
        .consume_once(SessionRole::Application, &inbound, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(first.payload.as_ref(), b"first");
    assert_eq!(broker.consumer_count(&inbound), Some(0));
    assert_eq!(broker.calls_for(BrokerOperation::Consume).await.len(), 1);
    assert_eq!(broker.calls_for(BrokerOperation::Cancel).await.len(), 1);

    let second = harness
        .consume_once(SessionRole::Application, &inbound, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(second.payload.as_ref(), b"second");

    harness.teardown().await;
}

#[tokio::test]
async fn test_teardown_removes_everything() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();
    let outbound = harness.outbound().unwrap().to_string();

    let report = harness.teardown().await;

    assert!(report.is_clean(), "{:?}", report.warnings());
    assert_eq!(harness.state(), HarnessState::TornDown);
    for name in [&inbound, &outbound] {
        assert!(!broker.has_queue(name));
        assert!(!broker.has_exchange(name));
    }
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_teardown_twice_does_not_fail() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();

    let first = harness.teardown().await;
    assert!(first.is_clean());
    broker.clear_calls().await;

    let second = harness.teardown().await;
    assert!(second.is_clean());
    assert!(second.deleted_routes().is_empty());
    assert!(second.closed_sessions().is_empty());
    assert!(broker.calls().await.is_empty());
    assert_eq!(harness.state(), HarnessState::TornDown);
}

#[tokio::test]
async fn test_teardown_closes_sessions_when_deletes_fail() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();
    let outbound = harness.outbound().unwrap().to_string();

    // Delete the inbound route out-of-band.
    let intruder = broker.connect("intruder").await.unwrap();
    intruder.delete_queue(&inbound).await.unwrap();
    intruder.delete_exchange(&inbound).await.unwrap();
    intruder.close().await.unwrap();

    let report = harness.teardown().await;

    let steps: Vec<CleanupStep> = report.warnings_for(&inbound).map(|w| w.step).collect();
    assert_eq!(steps, vec![CleanupStep::DeleteQueue, CleanupStep::DeleteExchange]);
    // The outbound route is still cleaned up after the inbound failures.
    assert_eq!(report.deleted_routes(), &[outbound.clone()]);
    assert!(!broker.has_queue(&outbound));
    assert_eq!(report.closed_sessions(), &["driver", "application"]);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_teardown_survives_close_failure() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();

    broker
        .fail_next(BrokerOperation::Close, Some("driver"))
        .await;
    let report = harness.teardown().await;

    assert_eq!(report.warnings().len(), 1);
    assert_eq!(report.warnings()[0].step, CleanupStep::CloseSession);
    assert_eq!(report.warnings()[0].resource, "driver");
    assert_eq!(report.closed_sessions(), &["application"]);
    assert_eq!(report.deleted_routes().len(), 2);
}

#[tokio::test]
async fn test_setup_failure_propagates_and_teardown_cleans_partial_state() {
    let broker = InMemoryBroker::new();
    broker
        .fail_next(BrokerOperation::DeclareQueue, None)
        .await;
    let mut harness = harness(&broker);

    let result = harness.setup().await;
    assert!(matches!(result, Err(HarnessError::Broker(_))));
    assert_eq!(harness.state(), HarnessState::Unconfigured);

    // The inbound exchange was declared before the queue failed.
    let inbound = harness.registered_routes()[0].clone();
    assert!(broker.has_exchange(&inbound));

    let report = harness.teardown().await;
    assert!(!broker.has_exchange(&inbound));
    assert_eq!(
        report.warnings_for(&inbound).map(|w| w.step).collect::<Vec<_>>(),
        vec![CleanupStep::DeleteQueue]
    );
    assert_eq!(report.closed_sessions(), &["driver"]);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_unreachable_broker_fails_setup() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let mut harness = harness(&broker);

    let err = harness.setup().await.unwrap_err();
    assert!(matches!(err, HarnessError::Broker(_)));
    assert!(!err.is_timeout());

    let report = harness.teardown().await;
    assert!(report.is_clean());
    assert!(report.closed_sessions().is_empty());
}

#[tokio::test]
async fn test_routes_survive_consumer_cancel_and_restart() {
    let broker = InMemoryBroker::new();
    let mut harness = harness(&broker);
    harness.setup().await.unwrap();
    let inbound = harness.inbound().unwrap().to_string();

    let _ = harness
        .consume_once(SessionRole::Application, &inbound, Duration::from_millis(20))
        .await;
    assert!(broker.has_queue(&inbound));

    harness
        .publish(
            SessionRole::Driver,
            &inbound,
            &OutboundMessage::new("durable").persistent(),
        )
        .await
        .unwrap();
    broker.restart();

    assert!(broker.has_exchange(&inbound));
    assert_eq!(broker.queue_depth(&inbound), Some(1));

    // Sessions died with the restart, so only the deletes are reported.
    let report = harness.teardown().await;
    assert!(report.closed_sessions().is_empty());
    assert_eq!(report.warnings_for(&inbound).count(), 2);
}

#[tokio::test]
async fn test_run_tears_down_after_body() {
    let broker = InMemoryBroker::new();
    let harness = harness(&broker);

    let (result, report) = harness
        .run(|h| {
            Box::pin(async move {
                let inbound = h.inbound().unwrap_or_default().to_string();
                h.publish(SessionRole::Application, &inbound, &OutboundMessage::new("ping"))
                    .await?;
                let delivery = h
                    .consume_once(SessionRole::Driver, &inbound, Duration::from_secs(1))
                    .await?;
                Ok((inbound, delivery.payload))
            })
        })
        .await;

    let (inbound, payload) = result.unwrap();
    assert_eq!(payload.as_ref(), b"ping");
    assert!(report.is_clean());
    assert!(!broker.has_queue(&inbound));
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_run_tears_down_after_body_error() {
    let broker = InMemoryBroker::new();
    let harness = harness(&broker);

    let (result, report) = harness
        .run(|h| {
            Box::pin(async move {
                let outbound = h.outbound().unwrap_or_default().to_string();
                h.consume_once(SessionRole::Driver, &outbound, Duration::from_millis(50))
                    .await
            })
        })
        .await;

    assert!(result.unwrap_err().is_timeout());
    assert!(report.is_clean());
    assert_eq!(report.deleted_routes().len(), 2);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_run_tears_down_after_panic() {
    let broker = InMemoryBroker::new();
    let harness = harness(&broker);

    let task = tokio::spawn(harness.run(|_h| {
        Box::pin(async move {
            assert_eq!(1 + 1, 3, "assertion in test body");
            Ok(())
        })
    }));

    let joined = task.await;
    assert!(joined.unwrap_err().is_panic());
    assert_eq!(broker.open_sessions(), 0);
    assert_eq!(broker.calls_for(BrokerOperation::DeleteQueue).await.len(), 2);
}

#[tokio::test]
async fn test_parallel_harnesses_never_collide() {
    let broker = InMemoryBroker::new();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let mut harness =
                IntegrationHarness::new(HarnessConfig::default(), Arc::new(broker));
            harness.setup().await.unwrap();
            let names = harness.registered_routes().to_vec();
            let report = harness.teardown().await;
            assert!(report.is_clean());
            names
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for name in handle.await.unwrap() {
            assert!(seen.insert(name));
        }
    }
    assert_eq!(seen.len(), 32);
    assert_eq!(broker.open_sessions(), 0);
}

#[test]
fn test_name_generators_never_collide_over_ten_thousand_runs() {
    let mut a = NameGenerator::from_entropy();
    let mut b = NameGenerator::from_entropy();
    let mut seen = HashSet::with_capacity(40_000);

    for _ in 0..10_000 {
        for names in [&mut a, &mut b] {
            assert!(seen.insert(names.randomise("inbound")));
            assert!(seen.insert(names.randomise("outbound")));
        }
    }
}
