use std::collections::HashMap;
use std::time::Duration;

use super::{
    DeadLetter, DeadLetterQueue, DeliveryGuarantee, InMemoryTransport, LogTransport, Transport,
    TransportError,
};
use crate::envelope::{Delivery, DeliveryTag, EnvelopeRecord, Lease};

/// Either bundled transport, picked at runtime from configuration.
#[derive(Clone)]
pub enum AnyTransport {
    InMemory(InMemoryTransport),
    Log(LogTransport),
}

impl AnyTransport {
    /// Records held for delivery (pending and in flight).
    pub fn len(&self) -> usize {
        match self {
            Self::InMemory(t) => t.len(),
            Self::Log(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<InMemoryTransport> for AnyTransport {
    fn from(transport: InMemoryTransport) -> Self {
        Self::InMemory(transport)
    }
}

impl From<LogTransport> for AnyTransport {
    fn from(transport: LogTransport) -> Self {
        Self::Log(transport)
    }
}

macro_rules! each {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            AnyTransport::InMemory($t) => $body,
            AnyTransport::Log($t) => $body,
        }
    };
}

impl Transport for AnyTransport {
    fn guarantee(&self) -> DeliveryGuarantee {
        each!(self, t => t.guarantee())
    }

    fn send(
        &self,
        record: EnvelopeRecord,
        timeout: Duration,
    ) -> Result<DeliveryTag, TransportError> {
        each!(self, t => t.send(record, timeout))
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        each!(self, t => t.poll(timeout))
    }

    fn ack(&self, lease: Lease) -> Result<(), TransportError> {
        each!(self, t => t.ack(lease))
    }

    fn nack(&self, lease: Lease, retry_after: Duration, reason: &str) -> Result<(), TransportError> {
        each!(self, t => t.nack(lease, retry_after, reason))
    }

    fn dead_letter(&self, lease: Lease, reason: &str) -> Result<(), TransportError> {
        each!(self, t => t.dead_letter(lease, reason))
    }

    fn sequence_high_watermarks(&self) -> Result<HashMap<String, u64>, TransportError> {
        each!(self, t => t.sequence_high_watermarks())
    }

    fn sequence_high_watermark(&self, partition_key: &str) -> Result<Option<u64>, TransportError> {
        each!(self, t => t.sequence_high_watermark(partition_key))
    }

    fn close(&self) {
        each!(self, t => t.close())
    }
}

impl DeadLetterQueue for AnyTransport {
    fn dead_letters(&self) -> Result<Vec<DeadLetter>, TransportError> {
        each!(self, t => t.dead_letters())
    }

    fn retry_dead_letter(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        each!(self, t => t.retry_dead_letter(tag))
    }

    fn discard_dead_letter(&self, tag: DeliveryTag) -> Result<DeadLetter, TransportError> {
        each!(self, t => t.discard_dead_letter(tag))
    }
}
