use order_events::{BusConfig, Dispatcher, EventBus, OrderId, PublishError, TransportConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::support::{created, wait_until};

// =============================================================================
// Publish never waits on handlers
// =============================================================================

#[test]
fn publish_returns_while_handlers_are_stuck() {
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&entered);
    let handlers = Dispatcher::builder().subscribe("OrderCreated", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_secs(3600));
        Ok(())
    });

    let bus = EventBus::start(
        BusConfig::default()
            .with_workers(1)
            .with_poll_interval(Duration::from_millis(5))
            .with_submit_timeout(Duration::from_millis(200)),
        handlers,
    )
    .unwrap();

    bus.publish(created(OrderId::new(), 1)).unwrap();
    assert!(wait_until(|| entered.load(Ordering::SeqCst) == 1));

    let started = Instant::now();
    for _ in 0..50 {
        bus.publish(created(OrderId::new(), 1)).unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    // The worker thread is parked in the handler; dropping the bus only
    // signals it.
    drop(bus);
}

#[test]
fn full_queue_fails_publish_within_the_submit_timeout() {
    let handlers = Dispatcher::builder().subscribe("OrderCreated", |_| {
        thread::sleep(Duration::from_secs(3600));
        Ok(())
    });
    let bus = EventBus::start(
        BusConfig::default()
            .with_transport(TransportConfig::InMemory {
                capacity: 2,
                guarantee: Default::default(),
            })
            .with_workers(1)
            .with_submit_timeout(Duration::from_millis(50)),
        handlers,
    )
    .unwrap();

    bus.publish(created(OrderId::new(), 1)).unwrap();
    bus.publish(created(OrderId::new(), 1)).unwrap();

    let started = Instant::now();
    let err = bus.publish(created(OrderId::new(), 1)).unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, PublishError::TransportUnavailable(_)));
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_secs(2));
    drop(bus);
}
