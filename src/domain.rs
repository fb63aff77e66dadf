// ===============================
// src/domain.rs
// ===============================
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    /// Economic opposite, used when hedging a fill on the spot venue.
    pub fn hedge(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType { Spot, Futures, Delivery }

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Spot => "spot",
            ProductType::Futures => "futures",
            ProductType::Delivery => "delivery",
        }
    }
}

/// Order lifecycle. `New` is local-only (placement not yet acknowledged);
/// `Create` means the REST call returned an exchange order id; `Created` is
/// the exchange ack from the user stream. Terminal states never advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Create,
    Created,
    Cancel,
    Canceled,
    PartiallyFilled,
    Filled,
    Expired,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Failed
        )
    }

    /// Whether the order still rests on the exchange (or is on its way there).
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::Create | OrderStatus::Created)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub volume: f64,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub created_at: i64, // unix seconds
    pub status: OrderStatus,
    // hedge routing
    pub base_asset: String,
    pub quote_asset: String,
    pub precision: (u32, u32), // (volume decimals, price decimals)
}

impl Order {
    pub fn format(&self) -> String {
        format!(
            "id={}, client_id={}, side={}, price={}, volume={}, symbol={}",
            self.exchange_order_id,
            self.client_order_id,
            self.side.as_str(),
            self.price,
            self.volume,
            self.symbol
        )
    }
}

// ---- Normalized inbound events (produced by the transport adapters) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub exchange: String,
    pub symbol: String,
    pub product: ProductType,
    pub bid_price: f64,
    pub bid_volume: f64,
    pub ask_price: f64,
    pub ask_volume: f64,
    pub update_id: i64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub exchange: String,
    pub symbol: String,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_price: f64,
    pub filled_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub exchange: String,
    pub symbol: String,
    /// Net position in contracts, long positive.
    pub position: f64,
    /// Margin balance in base asset, when the account stream carries it.
    pub margin_balance: Option<f64>,
}

// ---- Outbound commands consumed by the gateway worker pool ----

#[derive(Debug, Clone)]
pub enum GatewayCommand {
    PlaceLimitPostOnly(Order),
    PlaceMarket(Order),
    CancelAll { symbol: String },
    CancelByClientIds { symbol: String, ids: Vec<String> },
}

// ---- Recorder events ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Order(OrderUpdate),
    Account(AccountUpdate),
}

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// Client order ids are a process-wide monotonic counter seeded from the
// wall clock, so restarts never reuse an id the exchange may still know.
static CLIENT_ORDER_ID: Lazy<AtomicI64> = Lazy::new(|| AtomicI64::new(timestamp_ms()));

pub fn next_client_order_id() -> String {
    let id = CLIENT_ORDER_ID.fetch_add(1, Ordering::Relaxed) + 1;
    id.to_string()
}

/// Round to `decimals` fractional digits; quote prices and hedge amounts must
/// match the instrument precision or the exchange rejects the request.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_ids_are_unique_and_increasing() {
        let a: i64 = next_client_order_id().parse().unwrap();
        let b: i64 = next_client_order_id().parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Created.is_terminal());
        assert!(OrderStatus::New.is_open());
        assert!(!OrderStatus::PartiallyFilled.is_open());
    }

    #[test]
    fn hedge_side_is_opposite() {
        assert_eq!(Side::Buy.hedge(), Side::Sell);
        assert_eq!(Side::Sell.hedge(), Side::Buy);
    }

    #[test]
    fn rounding_follows_precision() {
        assert_eq!(round_to(49990.123456, 2), 49990.12);
        assert_eq!(round_to(0.0012345, 4), 0.0012);
    }
}
