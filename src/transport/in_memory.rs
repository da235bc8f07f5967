//! In-memory transport for tests and single-process deployments.
//!
//! Records live in a bounded queue shared by every clone of the handle.
//! Under at-least-once nothing is lost while the process runs. A worker that
//! dies mid-delivery never acknowledges, its lease runs out and the record
//! goes to the next poller.

use super::journal::NoJournal;
use super::queue::QueueState;
use super::queued::QueueTransport;
use super::TransportOptions;

/// Bounded in-memory transport.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use order_events::{Event, EnvelopeRecord, InMemoryTransport, OrderCreated, OrderId, Transport, UserId};
///
/// let transport = InMemoryTransport::new();
/// let event = Event::new(OrderCreated {
///     order_id: OrderId::new(),
///     user_id: UserId::new(),
///     total_amount: 0,
///     items: Vec::new(),
/// });
/// transport
///     .send(EnvelopeRecord::new(&event, 1, Vec::new()), Duration::from_millis(10))
///     .unwrap();
///
/// let delivery = transport.poll(Duration::from_millis(10)).unwrap().unwrap();
/// assert_eq!(delivery.record.event_id, event.event_id());
/// transport.ack(delivery.lease).unwrap();
/// assert!(transport.is_empty());
/// ```
pub type InMemoryTransport = QueueTransport<NoJournal>;

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_options(TransportOptions::default())
    }

    pub fn with_options(options: TransportOptions) -> Self {
        QueueTransport::from_parts(QueueState::new(options.guarantee), NoJournal, options)
    }
}
