use std::io;

use thiserror::Error;

use crate::envelope::{DeliveryTag, Lease};

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport cannot accept the record right now (queue full, I/O down).
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The transport was closed and accepts no more records.
    #[error("transport closed")]
    Closed,
    /// The tag is not currently leased to a consumer.
    #[error("unknown delivery {0}")]
    UnknownDelivery(DeliveryTag),
    /// The lease ran out and the record was handed out again or given back.
    #[error("lease {0} is no longer held")]
    LeaseExpired(Lease),
    /// The tag does not name a dead-lettered record.
    #[error("no dead letter {0}")]
    NotDeadLettered(DeliveryTag),
    #[error("transport lock poisoned during {0}")]
    Poisoned(&'static str),
    #[error("journal i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt journal entry at line {line}: {message}")]
    Journal { line: usize, message: String },
}
