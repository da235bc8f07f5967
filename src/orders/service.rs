use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use super::{Order, OrderError, OrderPage, OrderStore};
use crate::event::{Event, OrderCreated, OrderId, OrderLine, OrderStatus, OrderStatusUpdated, UserId};
use crate::publisher::{EventSink, PublishError, PublishReceipt};

/// Order operations over a store and an event sink.
///
/// ## Example
///
/// ```
/// use order_events::{InMemoryOrderStore, InMemoryTransport, OrderLine, OrderService, OrderStatus, Publisher, UserId};
///
/// let publisher = Publisher::new(InMemoryTransport::new()).unwrap();
/// let service = OrderService::new(InMemoryOrderStore::new(), publisher);
/// let user = UserId::new();
///
/// let order = service
///     .create_order(user, vec![OrderLine::new("Cement", 10, 500), OrderLine::new("Sand", 5, 300)])
///     .unwrap();
/// assert_eq!(order.total_amount, 6500);
///
/// let order = service.update_status(order.id, user, OrderStatus::InProgress).unwrap();
/// assert_eq!(order.status, OrderStatus::InProgress);
/// ```
pub struct OrderService<S, P> {
    store: S,
    events: P,
    changes: OrderLocks,
}

/// Striped locks that serialize status changes of one order, so its events
/// are published in the order the store applied them.
struct OrderLocks {
    stripes: Vec<Mutex<()>>,
}

impl OrderLocks {
    const STRIPES: usize = 64;

    fn new() -> Self {
        Self {
            stripes: (0..Self::STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, order_id: OrderId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        order_id.hash(&mut hasher);
        let stripe = (hasher.finish() % Self::STRIPES as u64) as usize;
        // The guarded value is `()`, so a poisoned stripe holds nothing broken.
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: OrderStore, P: EventSink> OrderService<S, P> {
    pub fn new(store: S, events: P) -> Self {
        Self {
            store,
            events,
            changes: OrderLocks::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Place an order for `user_id` and announce `OrderCreated`.
    pub fn create_order(&self, user_id: UserId, items: Vec<OrderLine>) -> Result<Order, OrderError> {
        let total_amount = order_total(&items)?;
        let now = SystemTime::now();
        let order = Order {
            id: OrderId::new(),
            user_id,
            items,
            status: OrderStatus::Created,
            total_amount,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(order.clone())?;
        tracing::info!(order_id = %order.id, user_id = %user_id, total_amount, "order created");

        let event = Event::new(OrderCreated {
            order_id: order.id,
            user_id,
            total_amount,
            items: order.items.clone(),
        });
        self.announce_change(order, event)
    }

    /// The order, if it exists and belongs to `user_id`.
    pub fn get_order(&self, order_id: OrderId, user_id: UserId) -> Result<Order, OrderError> {
        self.store
            .get(order_id)?
            .filter(|order| order.user_id == user_id)
            .ok_or(OrderError::NotFound(order_id))
    }

    /// A page of the user's orders, newest first. `page` starts at 1.
    pub fn list_user_orders(
        &self,
        user_id: UserId,
        page: usize,
        limit: usize,
    ) -> Result<OrderPage, OrderError> {
        if page == 0 || limit == 0 {
            return Err(OrderError::Validation(
                "page and limit must be at least 1".into(),
            ));
        }

        let mut orders = self.store.list_by_user(user_id)?;
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = orders.len();
        let orders = orders
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();

        Ok(OrderPage {
            orders,
            total,
            page,
            limit,
        })
    }

    /// Move the order to `new_status` and announce `OrderStatusUpdated`.
    pub fn update_status(
        &self,
        order_id: OrderId,
        user_id: UserId,
        new_status: OrderStatus,
    ) -> Result<Order, OrderError> {
        self.transition(order_id, user_id, new_status, None)
    }

    pub fn cancel_order(
        &self,
        order_id: OrderId,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<Order, OrderError> {
        self.transition(order_id, user_id, OrderStatus::Cancelled, reason)
    }

    /// Publish an event whose earlier announcement failed.
    pub fn announce(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        self.events.publish(event)
    }

    fn transition(
        &self,
        order_id: OrderId,
        user_id: UserId,
        new_status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, OrderError> {
        let _change = self.changes.lock(order_id);
        let mut order = self.get_order(order_id, user_id)?;
        let old_status = order.status;

        if old_status.is_terminal() || old_status == new_status {
            return Err(OrderError::InvalidTransition {
                order_id,
                from: old_status,
                to: new_status,
            });
        }

        order.status = new_status;
        order.updated_at = SystemTime::now();
        // Another service over the same store may have moved it meanwhile.
        self.store.update(order.clone(), old_status)?;
        tracing::info!(order_id = %order_id, from = %old_status, to = %new_status, "order status changed");

        let event = Event::new(OrderStatusUpdated {
            order_id,
            user_id,
            old_status,
            new_status,
            reason,
        });
        self.announce_change(order, event)
    }

    fn announce_change(&self, order: Order, event: Event) -> Result<Order, OrderError> {
        match self.events.publish(event.clone()) {
            Ok(_) => Ok(order),
            Err(source) => {
                tracing::error!(order_id = %order.id, error = %source, "order stored but event not published");
                Err(OrderError::NotAnnounced {
                    order: Box::new(order),
                    event: Box::new(event),
                    source,
                })
            }
        }
    }
}

fn order_total(items: &[OrderLine]) -> Result<u64, OrderError> {
    items.iter().try_fold(0u64, |total, line| {
        if line.quantity == 0 {
            return Err(OrderError::Validation(format!(
                "quantity for {} must be at least 1",
                line.product
            )));
        }
        u64::from(line.quantity)
            .checked_mul(line.price)
            .and_then(|line_total| total.checked_add(line_total))
            .ok_or_else(|| OrderError::Validation("order total overflows".into()))
    })
}
