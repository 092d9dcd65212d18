//! Event bus fan-out, routing, redelivery and dead-lettering.

use confluence_core::error::ConfluenceError;
use confluence_core::events::{
    handler_fn, BusConfig, EventBus, EventDelivery, SubscriptionFilter, System, UnifiedEvent,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn bus() -> EventBus {
    EventBus::new(BusConfig {
        handler_retry_delay: Duration::from_millis(1),
        ..BusConfig::default()
    })
}

fn recorder(name: &str) -> (Arc<Mutex<Vec<EventDelivery>>>, Arc<dyn confluence_core::events::EventHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(name, move |delivery: EventDelivery| {
        let sink = sink.clone();
        async move {
            sink.lock().push(delivery);
            Ok(())
        }
    });
    (seen, handler)
}

#[tokio::test]
async fn test_type_subscription_receives_only_matching_events() {
    let bus = bus();
    let (seen, handler) = recorder("payments");
    let _sub = bus.subscribe(["PAYMENT_*"], handler);

    bus.publish(UnifiedEvent::new("PAYMENT_CAPTURED", System::Backend, json!({})));
    bus.publish(UnifiedEvent::new("USER_CREATED", System::Backend, json!({})));
    assert!(bus.drain(Duration::from_secs(1)).await);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event.event_type, "PAYMENT_CAPTURED");
}

#[tokio::test]
async fn test_backend_user_events_route_to_legacy_topic() {
    let bus = bus();
    let (legacy_seen, legacy) = recorder("legacy-adapter");
    let (frontend_seen, frontend) = recorder("frontend-adapter");
    let _a = bus.subscribe_filtered(SubscriptionFilter::default().with_topics(&[System::Legacy]), legacy);
    let _b = bus.subscribe_filtered(SubscriptionFilter::default().with_topics(&[System::Frontend]), frontend);

    let receipt = bus.publish(UnifiedEvent::new("USER_PROFILE_UPDATED", System::Backend, json!({})));
    assert!(receipt.topics.contains(&System::Legacy));
    assert!(bus.drain(Duration::from_secs(1)).await);

    assert_eq!(legacy_seen.lock().len(), 1);
    assert!(frontend_seen.lock().is_empty());
}

#[tokio::test]
async fn test_per_subscriber_order_is_publish_order() {
    let bus = bus();
    let (seen, handler) = recorder("ordered");
    let _sub = bus.subscribe(Vec::<String>::new(), handler);

    for seq in 1..=20u64 {
        bus.publish_stored(UnifiedEvent::new("TICK", System::Legacy, json!({"n": seq})), seq);
    }
    assert!(bus.drain(Duration::from_secs(1)).await);

    let sequences: Vec<u64> = seen.lock().iter().filter_map(|d| d.sequence).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_failing_handler_is_retried_then_succeeds() {
    let bus = bus();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let _sub = bus.subscribe(
        ["FLAKY"],
        handler_fn("flaky", move |_d: EventDelivery| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ConfluenceError::collaborator_unavailable("legacy", "timeout"))
                } else {
                    Ok(())
                }
            }
        }),
    );

    bus.publish(UnifiedEvent::new("FLAKY", System::Legacy, json!({})));
    assert!(bus.drain(Duration::from_secs(1)).await);

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let stats = bus.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.handler_failures, 1);
    assert!(bus.dead_letters().is_empty());
}

#[tokio::test]
async fn test_exhausted_delivery_is_dead_lettered_without_blocking_others() {
    let bus = bus();
    let _broken = bus.subscribe(
        ["ORDER_PLACED"],
        handler_fn("broken", |_d: EventDelivery| async {
            Err(ConfluenceError::internal("schema mismatch"))
        }),
    );
    let (seen, healthy) = recorder("healthy");
    let _ok = bus.subscribe(["ORDER_PLACED"], healthy);

    let event = UnifiedEvent::new("ORDER_PLACED", System::Frontend, json!({}));
    let id = event.id;
    bus.publish(event);
    assert!(bus.drain(Duration::from_secs(2)).await);

    assert_eq!(seen.lock().len(), 1);
    let letters = bus.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].subscriber, "broken");
    assert_eq!(letters[0].event_id, id);
    assert_eq!(letters[0].attempts, BusConfig::default().handler_max_attempts);
}

#[tokio::test]
async fn test_replays_are_flagged() {
    let bus = bus();
    let (seen, handler) = recorder("audit");
    let _sub = bus.subscribe(Vec::<String>::new(), handler);

    bus.publish_replay(UnifiedEvent::new("USER_CREATED", System::Legacy, json!({})), 7);
    assert!(bus.drain(Duration::from_secs(1)).await);

    let seen = seen.lock();
    assert!(seen[0].is_replay());
    assert_eq!(seen[0].sequence, Some(7));
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = bus();
    let (seen, handler) = recorder("temporary");
    let sub = bus.subscribe(Vec::<String>::new(), handler);
    sub.unsubscribe();

    let receipt = bus.publish(UnifiedEvent::new("USER_CREATED", System::Legacy, json!({})));
    assert_eq!(receipt.deliveries, 0);
    assert!(bus.drain(Duration::from_secs(1)).await);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_dropping_handle_keeps_subscription() {
    let bus = bus();
    let (seen, handler) = recorder("long-lived");
    drop(bus.subscribe(["USER_*"], handler));

    bus.publish(UnifiedEvent::new("USER_CREATED", System::Legacy, json!({})));
    bus.publish(UnifiedEvent::new("USERS_IMPORTED", System::Legacy, json!({})));
    assert!(bus.drain(Duration::from_secs(1)).await);

    assert_eq!(bus.subscriber_count(), 1);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event.event_type, "USER_CREATED");
}
