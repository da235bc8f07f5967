use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EventKind, EventPayload};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
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

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Identifier of an order. Also the partition key of its events.
    OrderId
);
id_type!(
    /// Identifier of the user owning an order.
    UserId
);

/// Lifecycle status of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Completed and cancelled orders accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Created => "created",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One ordered line item. `price` is per unit, in minor currency units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product: String,
    pub quantity: u32,
    pub price: u64,
}

impl OrderLine {
    pub fn new(product: impl Into<String>, quantity: u32, price: u64) -> Self {
        Self {
            product: product.into(),
            quantity,
            price,
        }
    }

    pub fn line_total(&self) -> u64 {
        u64::from(self.quantity) * self.price
    }
}

/// An order was placed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub total_amount: u64,
    #[serde(default)]
    pub items: Vec<OrderLine>,
}

impl EventKind for OrderCreated {
    const EVENT_TYPE: &'static str = "OrderCreated";
    const SCHEMA_VERSION: u32 = 1;
}

impl From<OrderCreated> for EventPayload {
    fn from(event: OrderCreated) -> Self {
        EventPayload::OrderCreated(event)
    }
}

/// An order moved from one status to another.
///
/// Schema v2 added `reason`; v1 payloads decode with `reason: None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusUpdated {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl EventKind for OrderStatusUpdated {
    const EVENT_TYPE: &'static str = "OrderStatusUpdated";
    const SCHEMA_VERSION: u32 = 2;
}

impl From<OrderStatusUpdated> for EventPayload {
    fn from(event: OrderStatusUpdated) -> Self {
        EventPayload::OrderStatusUpdated(event)
    }
}
