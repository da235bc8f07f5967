//! Shared helpers: event builders, bounded waits and a recording handler.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use order_events::{
    Envelope, Event, EventId, HandlerError, OrderCreated, OrderId, OrderStatus,
    OrderStatusUpdated, UserId,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test log subscriber once. Respects `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn created(order_id: OrderId, total_amount: u64) -> Event {
    Event::new(OrderCreated {
        order_id,
        user_id: UserId::new(),
        total_amount,
        items: Vec::new(),
    })
}

pub fn status(order_id: OrderId, old_status: OrderStatus, new_status: OrderStatus) -> Event {
    Event::new(OrderStatusUpdated {
        order_id,
        user_id: UserId::new(),
        old_status,
        new_status,
        reason: None,
    })
}

/// Poll `condition` until it holds or `WAIT` runs out.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// What a handler saw, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seen {
    pub event_id: EventId,
    pub event_type: &'static str,
    pub partition_key: String,
    pub sequence_token: u64,
    pub delivery_attempt: u32,
}

/// Thread-safe log of deliveries plus an idempotent "effect" counter.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    applied: Arc<Mutex<HashSet<EventId>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the delivery and apply its effect once per event id.
    pub fn record(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen {
            event_id: envelope.event.event_id(),
            event_type: envelope.event.event_type(),
            partition_key: envelope.event.partition_key(),
            sequence_token: envelope.sequence_token,
            delivery_attempt: envelope.delivery_attempt,
        });
        self.applied.lock().unwrap().insert(envelope.event.event_id());
        Ok(())
    }

    pub fn handler(&self) -> impl Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static {
        let recorder = self.clone();
        move |envelope| recorder.record(envelope)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn applied(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    /// Sequence tokens seen for one key, in arrival order.
    pub fn tokens_for(&self, partition_key: &str) -> Vec<u64> {
        self.seen()
            .into_iter()
            .filter(|seen| seen.partition_key == partition_key)
            .map(|seen| seen.sequence_token)
            .collect()
    }
}
