//! Order service - the code that mutates orders and announces each change.
//!
//! Every mutation writes the order store first and then publishes exactly one
//! event, so subscribers only ever hear about changes that were stored.

mod error;
mod service;
mod store;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::event::{OrderId, OrderLine, OrderStatus, UserId};

pub use error::OrderError;
pub use service::OrderService;
pub use store::{InMemoryOrderStore, OrderStore};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderLine>,
    pub status: OrderStatus,
    /// Sum of `quantity * price` over the items.
    pub total_amount: u64,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// One page of a user's orders, newest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    /// Orders the user has across all pages.
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}
