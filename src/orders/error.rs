use thiserror::Error;

use super::Order;
use crate::event::{Event, OrderId, OrderStatus};
use crate::publisher::PublishError;

/// Error type for order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order: {0}")]
    Validation(String),
    /// Missing, or owned by someone else.
    #[error("order not found: {0}")]
    NotFound(OrderId),
    #[error("order {order_id} cannot go from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    /// The change is stored but its event was not published. Hand `event`
    /// to [`OrderService::announce`](super::OrderService::announce) to retry.
    #[error("order saved but its event was not published: {source}")]
    NotAnnounced {
        order: Box<Order>,
        event: Box<Event>,
        #[source]
        source: PublishError,
    },
    #[error("order storage error: {0}")]
    Storage(String),
}
