// ===============================
// src/orderbook.rs
// ===============================
//
// Per (symbol, side) collection of resting orders. Writers are the placement
// path and the event dispatcher; readers are the ladder and cancellation
// scans, which only ever see snapshots.

use std::sync::RwLock;

use ahash::AHashMap as HashMap;

use crate::domain::{Order, OrderStatus};

const CANCELLED_CACHE_SOFT_CAP: usize = 50;
const CANCELLED_CACHE_TTL_S: i64 = 10;

struct BookInner {
    orders: Vec<Order>,
    /// Recently removed orders, kept briefly so late exchange events for an
    /// already-dropped order can be recognized and ignored.
    cancelled: HashMap<String, (Order, i64)>,
}

pub struct OrderBook {
    inner: RwLock<BookInner>,
}

impl OrderBook {
    pub fn new() -> OrderBook {
        OrderBook {
            inner: RwLock::new(BookInner { orders: Vec::new(), cancelled: HashMap::new() }),
        }
    }

    /// Insert a new order. Rejects a duplicate client id; the caller treats
    /// that as a placement bug and drops the order.
    pub fn add(&self, order: Order) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.orders.iter().any(|o| o.client_order_id == order.client_order_id) {
            return false;
        }
        inner.orders.push(order);
        true
    }

    /// Update the status of one order in place. No-op when the id is absent
    /// or when the order already reached a terminal status.
    pub fn update_status(&self, client_order_id: &str, status: OrderStatus) -> Option<Order> {
        let mut inner = self.inner.write().unwrap();
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.client_order_id == client_order_id)?;
        if order.status.is_terminal() {
            return None;
        }
        order.status = status;
        Some(order.clone())
    }

    pub fn set_exchange_order_id(&self, client_order_id: &str, exchange_order_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(order) = inner
            .orders
            .iter_mut()
            .find(|o| o.client_order_id == client_order_id)
        {
            order.exchange_order_id = exchange_order_id.to_string();
        }
    }

    /// Remove an order and park it in the recently-cancelled cache. When the
    /// cache grows past its soft cap, entries older than the TTL are pruned.
    pub fn delete_by_client_order_id(&self, client_order_id: &str, now_s: i64) -> Option<Order> {
        let mut inner = self.inner.write().unwrap();
        let idx = inner
            .orders
            .iter()
            .position(|o| o.client_order_id == client_order_id);
        let removed = idx.map(|i| inner.orders.remove(i));
        if let Some(order) = &removed {
            inner
                .cancelled
                .insert(order.client_order_id.clone(), (order.clone(), now_s));
        }

        if inner.cancelled.len() > CANCELLED_CACHE_SOFT_CAP {
            inner
                .cancelled
                .retain(|_, (_, cancelled_at)| now_s - *cancelled_at <= CANCELLED_CACHE_TTL_S);
        }
        removed
    }

    pub fn recently_cancelled(&self, client_order_id: &str) -> bool {
        self.inner.read().unwrap().cancelled.contains_key(client_order_id)
    }

    pub fn size(&self) -> usize {
        self.inner.read().unwrap().orders.len()
    }

    pub fn cancelled_cache_size(&self) -> usize {
        self.inner.read().unwrap().cancelled.len()
    }

    pub fn snapshot(&self) -> Vec<Order> {
        self.inner.read().unwrap().orders.clone()
    }

    /// Price-ascending view for ladder-distance computations.
    pub fn sorted_snapshot(&self) -> Vec<Order> {
        let mut orders = self.snapshot();
        orders.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        orders
    }

    /// Orders still resting (or on their way to the exchange).
    pub fn open_orders(&self) -> Vec<Order> {
        self.inner
            .read()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.status.is_open())
            .cloned()
            .collect()
    }
}
