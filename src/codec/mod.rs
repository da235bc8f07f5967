//! Event codec - converts events to and from transport bytes.
//!
//! The wire format is a versioned JSON frame:
//!
//! ```text
//! {
//!   "event_type": "OrderStatusUpdated",
//!   "schema_version": 2,
//!   "event_id": "1f0c...",
//!   "occurred_at": { "secs_since_epoch": ..., "nanos_since_epoch": ... },
//!   "payload": { ...variant fields... }
//! }
//! ```
//!
//! `schema_version` records the layout the payload was written with. On
//! decode the [`EventRegistry`] upcasts older payloads and serde fills fields
//! added later from their declared defaults.

mod error;
mod registry;

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventId};

pub use error::CodecError;
pub use registry::{EventRegistry, PayloadUpcaster};

/// Converts events to a transport-neutral byte form and back.
///
/// `decode(encode(e)) == e` must hold for every registered variant.
pub trait EventCodec: Send + Sync {
    fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Event, CodecError>;
}

#[derive(Serialize, Deserialize)]
struct Frame {
    event_type: String,
    schema_version: u32,
    event_id: EventId,
    occurred_at: SystemTime,
    payload: Value,
}

/// JSON codec backed by an explicit [`EventRegistry`].
#[derive(Clone)]
pub struct JsonCodec {
    registry: Arc<EventRegistry>,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(EventRegistry::default())
    }
}

impl JsonCodec {
    pub fn new(registry: EventRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }
}

impl EventCodec for JsonCodec {
    fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        let event_type = event.event_type();
        if !self.registry.contains(event_type) {
            return Err(CodecError::UnknownEventType(event_type.to_string()));
        }

        let frame = Frame {
            event_type: event_type.to_string(),
            schema_version: event.payload().schema_version(),
            event_id: event.event_id(),
            occurred_at: event.occurred_at(),
            payload: event.payload().to_json()?,
        };
        Ok(serde_json::to_vec(&frame)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Event, CodecError> {
        let frame: Frame = serde_json::from_slice(bytes)?;
        let payload =
            self.registry
                .decode_payload(&frame.event_type, frame.schema_version, frame.payload)?;
        Ok(Event::from_parts(frame.event_id, frame.occurred_at, payload))
    }
}
