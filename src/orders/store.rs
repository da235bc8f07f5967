use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Order, OrderError};
use crate::event::{OrderId, OrderStatus, UserId};

/// Primary storage for orders.
pub trait OrderStore: Send + Sync {
    fn insert(&self, order: Order) -> Result<(), OrderError>;
    fn get(&self, id: OrderId) -> Result<Option<Order>, OrderError>;
    /// Replace a stored order whose status is still `expected`.
    ///
    /// Fails with `NotFound` if it does not exist, and with
    /// `InvalidTransition` (from the stored status) if another writer changed
    /// the status first.
    fn update(&self, order: Order, expected: OrderStatus) -> Result<(), OrderError>;
    fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>, OrderError>;
}

/// Thread-safe in-memory store. Clones share the same orders.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.read().map(|orders| orders.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(operation: &str) -> OrderError {
    OrderError::Storage(format!("order store lock poisoned during {operation}"))
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) -> Result<(), OrderError> {
        let mut orders = self.orders.write().map_err(|_| poisoned("insert"))?;
        if orders.contains_key(&order.id) {
            return Err(OrderError::Storage(format!("order {} already exists", order.id)));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    fn get(&self, id: OrderId) -> Result<Option<Order>, OrderError> {
        let orders = self.orders.read().map_err(|_| poisoned("get"))?;
        Ok(orders.get(&id).cloned())
    }

    fn update(&self, order: Order, expected: OrderStatus) -> Result<(), OrderError> {
        let mut orders = self.orders.write().map_err(|_| poisoned("update"))?;
        match orders.get_mut(&order.id) {
            Some(stored) if stored.status != expected => Err(OrderError::InvalidTransition {
                order_id: order.id,
                from: stored.status,
                to: order.status,
            }),
            Some(stored) => {
                *stored = order;
                Ok(())
            }
            None => Err(OrderError::NotFound(order.id)),
        }
    }

    fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>, OrderError> {
        let orders = self.orders.read().map_err(|_| poisoned("list_by_user"))?;
        Ok(orders
            .values()
            .filter(|order| order.user_id == user_id)
            .cloned()
            .collect())
    }
}
