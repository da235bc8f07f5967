use order_events::{
    BusConfig, CodecError, Dispatcher, EventBus, EventCodec, EventPayload, JsonCodec, OrderId,
    OrderStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::support::{created, status, wait_until};

// =============================================================================
// Order lifecycle
// =============================================================================

#[test]
fn created_then_in_progress_is_observed_in_that_order() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let on_created = Arc::clone(&observed);
    let on_status = Arc::clone(&observed);

    let handlers = Dispatcher::builder()
        .subscribe("OrderCreated", move |envelope| {
            if let EventPayload::OrderCreated(created) = envelope.event.payload() {
                on_created
                    .lock()
                    .unwrap()
                    .push(format!("created {}", created.total_amount));
            }
            Ok(())
        })
        .subscribe("OrderStatusUpdated", move |envelope| {
            if let EventPayload::OrderStatusUpdated(update) = envelope.event.payload() {
                on_status
                    .lock()
                    .unwrap()
                    .push(format!("{} -> {}", update.old_status, update.new_status));
            }
            Ok(())
        });

    let bus = EventBus::start(
        BusConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5)),
        handlers,
    )
    .unwrap();

    let order = OrderId::new();
    let first = bus.publish(created(order, 6500)).unwrap();
    let second = bus
        .publish(status(order, OrderStatus::Created, OrderStatus::InProgress))
        .unwrap();
    assert_eq!(first.sequence_token, 1);
    assert_eq!(second.sequence_token, 2);

    assert!(wait_until(|| observed.lock().unwrap().len() == 2));
    assert_eq!(
        *observed.lock().unwrap(),
        vec!["created 6500".to_string(), "created -> in_progress".to_string()]
    );
    bus.shutdown();
}

#[test]
fn unknown_event_type_is_rejected_by_the_codec() {
    let codec = JsonCodec::default();
    let bytes = codec.encode(&created(OrderId::new(), 1)).unwrap();
    let mut frame: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    frame["event_type"] = "UnknownType".into();

    let err = codec
        .decode(&serde_json::to_vec(&frame).unwrap())
        .unwrap_err();
    assert_eq!(err, CodecError::UnknownEventType("UnknownType".to_string()));
}

#[test]
fn every_variant_survives_the_codec() {
    let codec = JsonCodec::default();
    let order = OrderId::new();
    for event in [
        created(order, 6500),
        status(order, OrderStatus::Created, OrderStatus::Cancelled),
    ] {
        let decoded = codec.decode(&codec.encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
