// ===============================
// src/binance.rs
// ===============================
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(query.as_bytes());
    let sig = mac.finalize().into_bytes();
    hex::encode(sig)
}

// ---- bookTicker frame (delivery / futures / spot share the shape) ----
// {"u":400900217,"s":"BTCUSD_PERP","b":"25.35190000","B":"31.21","a":"25.36520000","A":"40.66"}
#[derive(Debug, Deserialize)]
pub struct BookTickerFrame {
    #[serde(rename = "u")]
    pub update_id: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "B")]
    pub bid_volume: String,
    #[serde(rename = "a")]
    pub ask_price: String,
    #[serde(rename = "A")]
    pub ask_volume: String,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
}

// ---- user data stream models (delivery) ----

#[derive(Debug, Deserialize)]
pub struct UserStreamEnvelope {
    #[serde(rename = "e", default)]
    pub event_type: Option<String>,
    #[serde(rename = "E", default)]
    pub event_time: Option<u64>,
    #[serde(rename = "o", default)]
    pub order: Option<OrderTradeUpdate>,
    #[serde(rename = "a", default)]
    pub account: Option<AccountPayload>,
}

#[derive(Debug, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String, // BUY | SELL
    #[serde(rename = "X")]
    pub status: String, // NEW, PARTIALLY_FILLED, FILLED, CANCELED, REJECTED, EXPIRED
    #[serde(rename = "x")]
    pub exec_type: String,
    #[serde(rename = "i", default)]
    pub order_id: Option<i64>,
    #[serde(rename = "L", default)]
    pub last_filled_price: Option<String>,
    #[serde(rename = "l", default)]
    pub last_filled_volume: Option<String>,
    #[serde(rename = "z", default)]
    pub cum_filled_volume: Option<String>,
    #[serde(rename = "ap", default)]
    pub avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountPayload {
    #[serde(rename = "B", default)]
    pub balances: Vec<AccountBalance>,
    #[serde(rename = "P", default)]
    pub positions: Vec<AccountPosition>,
}

#[derive(Debug, Deserialize)]
pub struct AccountBalance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb")]
    pub wallet_balance: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountPosition {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa")]
    pub position_amount: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        let sig = sign_query("secret", "symbol=BTCUSD_PERP&side=BUY");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign_query("secret", "symbol=BTCUSD_PERP&side=BUY"));
        assert_ne!(sig, sign_query("other", "symbol=BTCUSD_PERP&side=BUY"));
    }

    #[test]
    fn parses_book_ticker_frame() {
        let raw = r#"{"u":400900217,"s":"BTCUSD_PERP","b":"50000.1","B":"31.21","a":"50000.9","A":"40.66"}"#;
        let frame: BookTickerFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.update_id, 400900217);
        assert_eq!(frame.symbol, "BTCUSD_PERP");
        assert_eq!(frame.bid_price, "50000.1");
        assert!(frame.event_time.is_none());
    }

    #[test]
    fn parses_order_trade_update() {
        let raw = r#"{"e":"ORDER_TRADE_UPDATE","E":1700000000000,
            "o":{"s":"BTCUSD_PERP","c":"12345","S":"BUY","X":"PARTIALLY_FILLED","x":"TRADE",
                 "i":8886774,"L":"49990.0","l":"1","z":"1","ap":"49990.0"}}"#;
        let env: UserStreamEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event_type.as_deref(), Some("ORDER_TRADE_UPDATE"));
        let o = env.order.unwrap();
        assert_eq!(o.client_order_id, "12345");
        assert_eq!(o.status, "PARTIALLY_FILLED");
        assert_eq!(o.last_filled_volume.as_deref(), Some("1"));
    }

    #[test]
    fn parses_account_update() {
        let raw = r#"{"e":"ACCOUNT_UPDATE","E":1700000000000,
            "a":{"B":[{"a":"BTC","wb":"1.5"}],"P":[{"s":"BTCUSD_PERP","pa":"5"}]}}"#;
        let env: UserStreamEnvelope = serde_json::from_str(raw).unwrap();
        let a = env.account.unwrap();
        assert_eq!(a.balances[0].asset, "BTC");
        assert_eq!(a.positions[0].position_amount, "5");
    }
}
