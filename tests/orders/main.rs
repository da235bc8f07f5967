//! Order service wired to a running event bus.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use order_events::{
    BusConfig, Dispatcher, EventBus, EventPayload, InMemoryOrderStore, InMemoryTransport,
    JsonCodec, OrderError, OrderLine, OrderService, OrderStatus, Publisher, PublisherOptions,
    Transport, TransportOptions, UserId,
};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn cement_and_sand() -> Vec<OrderLine> {
    vec![OrderLine::new("Cement", 10, 500), OrderLine::new("Sand", 5, 300)]
}

// =============================================================================
// Lifecycle through the bus
// =============================================================================

#[test]
fn order_lifecycle_reaches_subscribers_in_order() {
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let on_created = Arc::clone(&log);
    let on_status = Arc::clone(&log);

    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", move |envelope| {
            if let EventPayload::OrderCreated(created) = envelope.event.payload() {
                on_created.lock().unwrap().push(format!(
                    "#{} created {} ({} lines)",
                    envelope.sequence_token,
                    created.total_amount,
                    created.items.len()
                ));
            }
            Ok(())
        })
        .subscribe("OrderStatusUpdated", move |envelope| {
            if let EventPayload::OrderStatusUpdated(update) = envelope.event.payload() {
                on_status.lock().unwrap().push(format!(
                    "#{} {} -> {}",
                    envelope.sequence_token, update.old_status, update.new_status
                ));
            }
            Ok(())
        });

    let bus = Arc::new(
        EventBus::start(
            BusConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(5)),
            handlers,
        )
        .unwrap(),
    );
    let service = OrderService::new(InMemoryOrderStore::new(), Arc::clone(&bus));
    let user = UserId::new();

    let order = service.create_order(user, cement_and_sand()).unwrap();
    service
        .update_status(order.id, user, OrderStatus::InProgress)
        .unwrap();
    service
        .cancel_order(order.id, user, Some("customer request".into()))
        .unwrap();

    assert!(wait_until(|| log.lock().unwrap().len() == 3));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "#1 created 6500 (2 lines)".to_string(),
            "#2 created -> in_progress".to_string(),
            "#3 in_progress -> cancelled".to_string(),
        ]
    );

    let err = service
        .update_status(order.id, user, OrderStatus::Completed)
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition { .. }));

    drop(service);
    let bus = Arc::try_unwrap(bus).ok().unwrap();
    assert_eq!(bus.shutdown().handled, 3);
}

// =============================================================================
// Failed announcements
// =============================================================================

#[test]
fn unannounced_change_is_kept_and_can_be_published_later() {
    let transport = InMemoryTransport::with_options(TransportOptions::default().with_capacity(1));
    let publisher = Publisher::with_codec(
        transport.clone(),
        JsonCodec::default(),
        PublisherOptions::default().with_submit_timeout(Duration::from_millis(10)),
    )
    .unwrap();
    let service = OrderService::new(InMemoryOrderStore::new(), publisher);
    let user = UserId::new();

    let order = service.create_order(user, cement_and_sand()).unwrap();
    let err = service
        .update_status(order.id, user, OrderStatus::InProgress)
        .unwrap_err();
    let (stored, event) = match err {
        OrderError::NotAnnounced { order, event, .. } => (order, event),
        other => panic!("expected NotAnnounced, got {other:?}"),
    };
    assert_eq!(stored.status, OrderStatus::InProgress);
    assert_eq!(
        service.get_order(order.id, user).unwrap().status,
        OrderStatus::InProgress
    );

    let delivery = transport.poll(Duration::from_millis(10)).unwrap().unwrap();
    transport.ack(delivery.lease).unwrap();

    let receipt = service.announce(*event).unwrap();
    assert_eq!(receipt.sequence_token, 2);
    assert_eq!(receipt.partition_key, order.id.to_string());
}
