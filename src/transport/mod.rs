//! Transports - move envelope records from the publisher to the dispatcher.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  send   ┌──────────────────────────┐  poll   ┌────────────┐
//! │  Publisher  │ ──────▶ │        Transport         │ ──────▶ │ Dispatcher │
//! └─────────────┘         │ pending │ in flight │ DLQ│ ◀────── └────────────┘
//!                         └──────────────────────────┘ ack/nack/dead_letter
//!          │                     │                      │
//!          ▼                     ▼                      ▼
//!  InMemoryTransport       LogTransport           (broker-backed,
//!     (included)            (included)         implement `Transport`)
//! ```
//!
//! A transport declares its [`DeliveryGuarantee`]. Under at-least-once a
//! record stays stored until acknowledged. A nack or an expired lease makes
//! it come back with `delivery_attempt + 1`. Within one partition key records
//! are handed out strictly in sequence order.

mod any;
mod error;
mod in_memory;
mod journal;
mod log;
mod queue;
mod queued;

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::envelope::{Delivery, DeliveryTag, EnvelopeRecord, Lease};

pub use any::AnyTransport;
pub use error::TransportError;
pub use in_memory::InMemoryTransport;
pub use journal::{FileJournal, Journal, JournalEntry, NoJournal};
pub use log::{LogTransport, DEFAULT_COMPACT_THRESHOLD};
pub use queued::QueueTransport;

/// Delivery guarantee declared by a transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Fire-and-forget. Failed or abandoned deliveries are dropped.
    AtMostOnce,
    /// Retained until acknowledged; redelivered after a failure or crash.
    #[default]
    AtLeastOnce,
}

/// Settings shared by the bundled transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    /// Maximum records held for delivery before `send` applies backpressure.
    pub capacity: usize,
    pub guarantee: DeliveryGuarantee,
    /// How long a consumer may hold a delivery before it is given back.
    pub ack_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            guarantee: DeliveryGuarantee::AtLeastOnce,
            ack_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportOptions {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

/// A record that exhausted its retries or could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub tag: DeliveryTag,
    pub record: EnvelopeRecord,
    pub reason: String,
    pub dead_lettered_at: SystemTime,
}

/// Moves envelope records between publisher and dispatcher.
///
/// Implementations must be safe to share between the publishing threads and
/// the worker pool; the bundled ones are cheap `Clone` handles.
pub trait Transport: Send + Sync {
    fn guarantee(&self) -> DeliveryGuarantee;

    /// Accept a record, waiting at most `timeout` for capacity.
    ///
    /// On error nothing was stored.
    fn send(&self, record: EnvelopeRecord, timeout: Duration)
        -> Result<DeliveryTag, TransportError>;

    /// Lease the next deliverable record, waiting up to `timeout`.
    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    /// The record was fully handled; forget it.
    ///
    /// Settling fails with [`TransportError::LeaseExpired`] once `lease` has
    /// run out, and the record stays with whoever holds it now.
    fn ack(&self, lease: Lease) -> Result<(), TransportError>;

    /// Handling failed; redeliver after `retry_after` (dropped under at-most-once).
    fn nack(&self, lease: Lease, retry_after: Duration, reason: &str)
        -> Result<(), TransportError>;

    /// Park the record in the dead-letter area (dropped under at-most-once).
    fn dead_letter(&self, lease: Lease, reason: &str) -> Result<(), TransportError>;

    /// Highest sequence token stored per partition key.
    ///
    /// Lets a publisher continue sequences across restarts.
    fn sequence_high_watermarks(&self) -> Result<HashMap<String, u64>, TransportError> {
        Ok(HashMap::new())
    }

    /// Highest sequence token stored for one partition key.
    ///
    /// Publishers ask this for keys they no longer cache. A transport that
    /// keeps no watermarks answers `None`; publishers over it should keep
    /// every key cached (`sequence_cache` 0).
    fn sequence_high_watermark(&self, partition_key: &str) -> Result<Option<u64>, TransportError> {
        Ok(self.sequence_high_watermarks()?.get(partition_key).copied())
    }

    /// Stop accepting records. Pending records stay deliverable.
    fn close(&self) {}

    /// Lazy sequence of deliveries.
    ///
    /// The iterator ends when a poll times out with nothing ready. Calling
    /// `deliver` again later picks up where delivery left off, including any
    /// record that was leased but never acknowledged.
    fn deliver(&self, poll_timeout: Duration) -> Deliveries<'_, Self>
    where
        Self: Sized,
    {
        Deliveries {
            transport: self,
            poll_timeout,
        }
    }
}

/// Operator interface over dead-lettered records.
pub trait DeadLetterQueue: Send + Sync {
    fn dead_letters(&self) -> Result<Vec<DeadLetter>, TransportError>;

    /// Queue the record again with a fresh retry budget.
    fn retry_dead_letter(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Drop the record for good.
    fn discard_dead_letter(&self, tag: DeliveryTag) -> Result<DeadLetter, TransportError>;
}

/// Iterator returned by [`Transport::deliver`].
pub struct Deliveries<'a, T> {
    transport: &'a T,
    poll_timeout: Duration,
}

impl<T: Transport> Iterator for Deliveries<'_, T> {
    type Item = Result<Delivery, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.transport.poll(self.poll_timeout).transpose()
    }
}
