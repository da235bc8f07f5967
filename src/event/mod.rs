//! Domain events - immutable facts emitted by the order service.
//!
//! An [`Event`] wraps one variant of the closed [`EventPayload`] set together
//! with its identity (`event_id`) and the time the fact happened
//! (`occurred_at`). Fields are private: once built an event cannot change.
//!
//! ```
//! use order_events::{Event, OrderCreated, OrderId, UserId};
//!
//! let event = Event::new(OrderCreated {
//!     order_id: OrderId::new(),
//!     user_id: UserId::new(),
//!     total_amount: 6500,
//!     items: Vec::new(),
//! });
//! assert_eq!(event.event_type(), "OrderCreated");
//! ```

mod order;

use std::fmt;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::PayloadUpcaster;

pub use order::{OrderCreated, OrderId, OrderLine, OrderStatus, OrderStatusUpdated, UserId};

/// Globally unique identifier of an event. Generated once, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A payload type that can travel inside an [`Event`].
///
/// `EVENT_TYPE` is the wire discriminator and `SCHEMA_VERSION` the current
/// version of the payload layout. Fields added in a later version must be
/// `#[serde(default)]`; breaking changes ship an upcaster.
pub trait EventKind: Serialize + DeserializeOwned + Into<EventPayload> {
    const EVENT_TYPE: &'static str;
    const SCHEMA_VERSION: u32;

    /// Payload transformations from older schema versions.
    fn upcasters() -> &'static [PayloadUpcaster] {
        &[]
    }
}

/// Closed set of event variants the order service emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    OrderCreated(OrderCreated),
    OrderStatusUpdated(OrderStatusUpdated),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::OrderCreated(_) => OrderCreated::EVENT_TYPE,
            EventPayload::OrderStatusUpdated(_) => OrderStatusUpdated::EVENT_TYPE,
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            EventPayload::OrderCreated(_) => OrderCreated::SCHEMA_VERSION,
            EventPayload::OrderStatusUpdated(_) => OrderStatusUpdated::SCHEMA_VERSION,
        }
    }

    /// The order this fact belongs to. Events of one order form one stream.
    pub fn order_id(&self) -> OrderId {
        match self {
            EventPayload::OrderCreated(e) => e.order_id,
            EventPayload::OrderStatusUpdated(e) => e.order_id,
        }
    }

    pub(crate) fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::OrderCreated(e) => serde_json::to_value(e),
            EventPayload::OrderStatusUpdated(e) => serde_json::to_value(e),
        }
    }
}

/// An immutable record of something that already happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    event_id: EventId,
    occurred_at: SystemTime,
    payload: EventPayload,
}

impl Event {
    /// Create an event for a fact happening now, with a fresh id.
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        Self {
            event_id: EventId::new(),
            occurred_at: SystemTime::now(),
            payload: payload.into(),
        }
    }

    /// Rebuild an event from stored parts. Used by codecs.
    pub fn from_parts(event_id: EventId, occurred_at: SystemTime, payload: EventPayload) -> Self {
        Self {
            event_id,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn occurred_at(&self) -> SystemTime {
        self.occurred_at
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Key within which delivery order must match publish order.
    pub fn partition_key(&self) -> String {
        self.payload.order_id().to_string()
    }
}
