use order_events::{
    BusConfig, Dispatcher, EventBus, EventCodec, JsonCodec, LogTransport, OrderId, OrderStatus,
    Publisher, Transport, TransportConfig, TransportOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::support::{created, init_logging, status, wait_until, Recorder};

// =============================================================================
// Lease expiry (in-memory)
// =============================================================================

#[test]
fn stalled_handler_loses_its_lease_and_the_event_is_redelivered() {
    init_logging();
    let recorder = Recorder::new();
    let record = recorder.handler();

    let handlers = Dispatcher::builder().subscribe("OrderCreated", move |envelope| {
        record(envelope)?;
        if envelope.delivery_attempt == 0 {
            // Effect applied, then the worker stalls past its lease.
            thread::sleep(Duration::from_millis(400));
        }
        Ok(())
    });

    let bus = EventBus::start(
        BusConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5))
            .with_ack_timeout(Duration::from_millis(100)),
        handlers,
    )
    .unwrap();

    bus.publish(created(OrderId::new(), 6500)).unwrap();

    assert!(wait_until(|| recorder.seen_len() == 2));
    let attempts: Vec<u32> = recorder.seen().iter().map(|s| s.delivery_attempt).collect();
    assert_eq!(attempts, vec![0, 1]);
    assert_eq!(recorder.applied(), 1);

    bus.shutdown();
}

// =============================================================================
// Restart (durable log)
// =============================================================================

#[test]
fn unacknowledged_events_come_back_after_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.journal");
    let recorder = Recorder::new();
    let order = OrderId::new();

    {
        let transport = LogTransport::open(&path, TransportOptions::default(), false).unwrap();
        let publisher = Publisher::new(transport.clone()).unwrap();
        publisher.publish(created(order, 6500)).unwrap();
        publisher
            .publish(status(order, OrderStatus::Created, OrderStatus::InProgress))
            .unwrap();

        // A worker picks up the first event, applies it and dies before the ack.
        let delivery = transport.poll(Duration::from_millis(50)).unwrap().unwrap();
        let event = JsonCodec::default().decode(&delivery.record.payload).unwrap();
        recorder.record(&delivery.record.to_envelope(event)).unwrap();
    }

    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", recorder.handler())
        .subscribe("OrderStatusUpdated", recorder.handler());
    let bus = EventBus::start(
        BusConfig::default()
            .with_transport(TransportConfig::log(&path))
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5)),
        handlers,
    )
    .unwrap();

    assert!(wait_until(|| recorder.seen_len() == 3));
    let seen = recorder.seen();
    assert_eq!(seen[1].event_id, seen[0].event_id);
    assert_eq!(seen[1].delivery_attempt, 1);
    assert_eq!(seen[2].sequence_token, 2);
    assert_eq!(recorder.applied(), 2);

    // The publisher picks up where the previous process stopped.
    let next = bus
        .publish(status(order, OrderStatus::InProgress, OrderStatus::Completed))
        .unwrap();
    assert_eq!(next.sequence_token, 3);
    assert!(wait_until(|| recorder.seen_len() == 4));

    bus.shutdown();
}

#[test]
fn acknowledged_events_are_not_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.journal");
    let config = BusConfig::default()
        .with_transport(TransportConfig::log(&path))
        .with_workers(1)
        .with_poll_interval(Duration::from_millis(5));

    let first_run = Recorder::new();
    let bus = EventBus::start(
        config.clone(),
        Dispatcher::builder().subscribe("OrderCreated", first_run.handler()),
    )
    .unwrap();
    bus.publish(created(OrderId::new(), 100)).unwrap();
    assert!(wait_until(|| first_run.seen_len() == 1));
    assert!(wait_until(|| bus.transport().is_empty()));
    bus.shutdown();

    let second_run = Recorder::new();
    let bus = EventBus::start(
        config,
        Dispatcher::builder().subscribe("OrderCreated", second_run.handler()),
    )
    .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(second_run.seen_len(), 0);
    bus.shutdown();
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn shutdown_stops_waiting_for_a_hung_handler() {
    init_logging();
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let (inside, gate) = (Arc::clone(&entered), Arc::clone(&release));

    let handlers = Dispatcher::builder().subscribe("OrderCreated", move |_| {
        inside.store(true, Ordering::Release);
        while !gate.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    });
    let bus = EventBus::start(
        BusConfig::default()
            .with_workers(1)
            .with_poll_interval(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_millis(100)),
        handlers,
    )
    .unwrap();

    bus.publish(created(OrderId::new(), 100)).unwrap();
    assert!(wait_until(|| entered.load(Ordering::Acquire)));

    let started = Instant::now();
    let stats = bus.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.handled, 0);

    release.store(true, Ordering::Release);
}
