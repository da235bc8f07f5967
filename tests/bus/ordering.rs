use order_events::{BusConfig, Dispatcher, EventBus, OrderId, OrderStatus, RetryPolicy};
use std::time::Duration;

use crate::support::{created, init_logging, status, wait_until, Recorder};

// =============================================================================
// Per-key ordering
// =============================================================================

#[test]
fn same_key_events_arrive_in_publish_order_across_workers() {
    init_logging();
    let recorder = Recorder::new();
    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", recorder.handler())
        .subscribe("OrderStatusUpdated", recorder.handler());
    let bus = EventBus::start(
        BusConfig::default()
            .with_workers(4)
            .with_poll_interval(Duration::from_millis(5)),
        handlers,
    )
    .unwrap();

    let orders: Vec<OrderId> = (0..8).map(|_| OrderId::new()).collect();
    for order in &orders {
        bus.publish(created(*order, 100)).unwrap();
    }
    for _ in 0..10 {
        for order in &orders {
            bus.publish(status(*order, OrderStatus::InProgress, OrderStatus::InProgress))
                .unwrap();
        }
    }

    assert!(wait_until(|| recorder.seen_len() == orders.len() * 11));
    for order in &orders {
        let tokens = recorder.tokens_for(&order.to_string());
        assert_eq!(tokens, (1..=11).collect::<Vec<u64>>(), "order {order}");
    }

    let stats = bus.shutdown();
    assert_eq!(stats.handled, orders.len() * 11);
}

#[test]
fn a_retrying_event_holds_back_later_events_of_its_key() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let recorder = Recorder::new();
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed_once);
    let record = recorder.handler();

    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", move |envelope| {
            if !flag.swap(true, Ordering::SeqCst) {
                return Err(order_events::HandlerError::failed("first try fails"));
            }
            record(envelope)
        })
        .subscribe("OrderStatusUpdated", recorder.handler());

    let bus = EventBus::start(
        BusConfig::default()
            .with_workers(3)
            .with_poll_interval(Duration::from_millis(5))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(50))),
        handlers,
    )
    .unwrap();

    let order = OrderId::new();
    bus.publish(created(order, 6500)).unwrap();
    bus.publish(status(order, OrderStatus::Created, OrderStatus::InProgress))
        .unwrap();

    assert!(wait_until(|| recorder.seen_len() == 2));
    let seen = recorder.seen();
    assert_eq!(seen[0].event_type, "OrderCreated");
    assert_eq!(seen[0].delivery_attempt, 1);
    assert_eq!(seen[1].event_type, "OrderStatusUpdated");

    let stats = bus.shutdown();
    assert_eq!(stats.retried, 1);
}
