//! Order state fed by the realtime channel.

use std::sync::{Mutex, MutexGuard, PoisonError};

use courier_types::Order;
use tracing::debug;

/// The order-append operation the realtime coordinator forwards into.
pub trait OrderSink: Send + Sync {
    fn add_order(&self, order: Order);
}

#[derive(Debug, Default)]
struct Book {
    orders: Vec<Order>,
    deliveries: Vec<Order>,
}

/// Offered orders plus the ones the courier accepted.
#[derive(Debug, Default)]
pub struct OrderBook {
    book: Mutex<Book>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Orders offered and not yet accepted or rejected, oldest first.
    pub fn orders(&self) -> Vec<Order> {
        self.book().orders.clone()
    }

    /// Accepted orders, in acceptance order.
    pub fn deliveries(&self) -> Vec<Order> {
        self.book().deliveries.clone()
    }

    /// Moves an offered order to the deliveries. Returns false if unknown.
    pub fn accept_order(&self, order_id: &str) -> bool {
        let mut book = self.book();
        let Some(index) = book.orders.iter().position(|o| o.order_id == order_id) else {
            return false;
        };
        let order = book.orders.remove(index);
        book.deliveries.push(order);
        true
    }

    /// Drops an offered order. Returns false if unknown.
    pub fn reject_order(&self, order_id: &str) -> bool {
        let mut book = self.book();
        let before = book.orders.len();
        book.orders.retain(|o| o.order_id != order_id);
        book.orders.len() != before
    }

    pub fn clear(&self) {
        let mut book = self.book();
        book.orders.clear();
        book.deliveries.clear();
    }
}

impl OrderSink for OrderBook {
    fn add_order(&self, order: Order) {
        let mut book = self.book();
        let known = book
            .orders
            .iter()
            .chain(book.deliveries.iter())
            .any(|o| o.order_id == order.order_id);
        if known {
            debug!(order_id = %order.order_id, "duplicate order ignored");
            return;
        }
        book.orders.push(order);
    }
}
