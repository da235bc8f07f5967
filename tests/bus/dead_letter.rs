use order_events::{
    BusConfig, DeadLetterAlert, Dispatcher, EventBus, HandlerError, OrderId, OrderStatus,
    RetryPolicy, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::support::{created, init_logging, status, wait_until, Recorder};

fn config() -> BusConfig {
    BusConfig::default()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(5))
        .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
}

// =============================================================================
// Dead-letter lifecycle
// =============================================================================

#[test]
fn event_failing_every_attempt_is_dead_lettered_then_retried() {
    init_logging();
    let recorder = Recorder::new();
    let record = recorder.handler();
    let healthy = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    let alerts: Arc<Mutex<Vec<DeadLetterAlert>>> = Arc::default();

    let handlers = {
        let healthy = Arc::clone(&healthy);
        let attempts = Arc::clone(&attempts);
        let alerts = Arc::clone(&alerts);
        Dispatcher::builder()
            .subscribe("OrderCreated", move |envelope| {
                attempts.fetch_add(1, Ordering::SeqCst);
                if !healthy.load(Ordering::SeqCst) {
                    return Err(HandlerError::failed("inventory service down"));
                }
                record(envelope)
            })
            .on_dead_letter(move |alert| alerts.lock().unwrap().push(alert.clone()))
    };
    let bus = EventBus::start(config(), handlers).unwrap();

    let receipt = bus.publish(created(OrderId::new(), 6500)).unwrap();
    assert!(wait_until(|| bus.dead_letters().unwrap().len() == 1));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let dead = bus.dead_letters().unwrap().remove(0);
    assert_eq!(dead.tag, receipt.tag);
    assert_eq!(dead.record.event_id, receipt.event_id);
    assert!(dead.reason.contains("inventory service down"));

    let alert = alerts.lock().unwrap()[0].clone();
    assert_eq!(alert.delivery_attempt, 2);
    assert_eq!(alert.event_type, "OrderCreated");

    healthy.store(true, Ordering::SeqCst);
    bus.retry_dead_letter(dead.tag).unwrap();

    assert!(wait_until(|| recorder.seen_len() == 1));
    assert_eq!(recorder.seen()[0].delivery_attempt, 0);
    assert!(bus.dead_letters().unwrap().is_empty());

    let stats = bus.shutdown();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.handled, 1);
}

#[test]
fn discarded_dead_letter_is_gone_for_good() {
    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", |_| Err(HandlerError::failed("always")));
    let bus = EventBus::start(config(), handlers).unwrap();

    let receipt = bus.publish(created(OrderId::new(), 1)).unwrap();
    assert!(wait_until(|| bus.dead_letters().unwrap().len() == 1));

    let discarded = bus.discard_dead_letter(receipt.tag).unwrap();
    assert_eq!(discarded.record.event_id, receipt.event_id);
    assert!(bus.dead_letters().unwrap().is_empty());

    assert!(matches!(
        bus.retry_dead_letter(receipt.tag),
        Err(TransportError::NotDeadLettered(tag)) if tag == receipt.tag
    ));
    bus.shutdown();
}

#[test]
fn dead_lettered_event_does_not_block_its_key() {
    let recorder = Recorder::new();
    let record = recorder.handler();
    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", |_| Err(HandlerError::failed("poison")))
        .subscribe("OrderStatusUpdated", move |envelope| record(envelope));
    let bus = EventBus::start(config(), handlers).unwrap();

    let order = OrderId::new();
    bus.publish(created(order, 1)).unwrap();
    bus.publish(status(order, OrderStatus::Created, OrderStatus::Cancelled))
        .unwrap();

    assert!(wait_until(|| recorder.seen_len() == 1));
    assert_eq!(bus.dead_letters().unwrap().len(), 1);
    assert_eq!(recorder.seen()[0].sequence_token, 2);
    bus.shutdown();
}
