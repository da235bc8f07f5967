use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventId};

/// Transport wrapper around an immutable event, as seen by handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sequence_token: u64,
    pub delivery_attempt: u32,
    pub event: Event,
}

/// The stored and transported form of an envelope.
///
/// Carries the encoded event plus the indexing fields a transport needs
/// without decoding it. In JSON the payload bytes are base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    pub partition_key: String,
    pub sequence_token: u64,
    pub event_type: String,
    pub event_id: EventId,
    pub occurred_at: SystemTime,
    pub delivery_attempt: u32,
    #[serde(with = "payload_serde")]
    pub payload: Vec<u8>,
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl EnvelopeRecord {
    /// Build a first-attempt record for an event encoded as `payload`.
    pub fn new(event: &Event, sequence_token: u64, payload: Vec<u8>) -> Self {
        Self {
            partition_key: event.partition_key(),
            sequence_token,
            event_type: event.event_type().to_string(),
            event_id: event.event_id(),
            occurred_at: event.occurred_at(),
            delivery_attempt: 0,
            payload,
        }
    }

    pub fn to_envelope(&self, event: Event) -> Envelope {
        Envelope {
            sequence_token: self.sequence_token,
            delivery_attempt: self.delivery_attempt,
            event,
        }
    }
}

/// Transport-assigned position of a record. Monotonic per transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One hand-out of the record at `tag`.
///
/// Every lease gets a fresh `id`. Once a lease expires and the record goes
/// out again, settling with the old lease fails, so a slow consumer cannot
/// settle the newer holder's delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Lease {
    pub tag: DeliveryTag,
    pub id: u64,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tag, self.id)
    }
}

/// One leased hand-out of a record. Settle it with ack, nack or dead-letter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub lease: Lease,
    pub record: EnvelopeRecord,
}

impl Delivery {
    pub fn tag(&self) -> DeliveryTag {
        self.lease.tag
    }
}
