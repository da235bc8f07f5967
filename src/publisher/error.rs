use thiserror::Error;

use crate::codec::CodecError;
use crate::event::EventId;
use crate::transport::TransportError;

/// Error type for [`Publisher::publish`](super::Publisher::publish).
///
/// On every variant the event was not stored and no sequence token was used.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event id was already published within the deduplication window.
    #[error("duplicate event {0}")]
    DuplicateEvent(EventId),
    /// The transport did not accept the record in time.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),
    #[error("could not encode event: {0}")]
    Encode(#[from] CodecError),
}
