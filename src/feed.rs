// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters:
// - run_mock     : random-walk generator for all three product types
// - run_binance  : bookTicker WS for one (symbol, product) stream
//
// A malformed frame is a ParseFailure: the single event is dropped, nothing
// instrument-wide happens.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::binance::BookTickerFrame;
use crate::domain::{timestamp_ms, PriceUpdate, ProductType};
use crate::metrics::{PARSE_FAILURES, TICKS, WS_RECONNECTS};

#[derive(Debug, thiserror::Error)]
pub enum ParseFailure {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad number in field {field}: {value}")]
    BadNumber { field: &'static str, value: String },
}

fn parse_price(field: &'static str, value: &str) -> Result<f64, ParseFailure> {
    value
        .parse::<f64>()
        .map_err(|_| ParseFailure::BadNumber { field, value: value.to_string() })
}

/// Normalize one bookTicker frame into a PriceUpdate.
pub fn parse_book_ticker(
    txt: &str,
    exchange: &str,
    product: ProductType,
) -> Result<PriceUpdate, ParseFailure> {
    let frame: BookTickerFrame = serde_json::from_str(txt)?;
    Ok(PriceUpdate {
        exchange: exchange.to_string(),
        symbol: frame.symbol.clone(),
        product,
        bid_price: parse_price("b", &frame.bid_price)?,
        bid_volume: parse_price("B", &frame.bid_volume)?,
        ask_price: parse_price("a", &frame.ask_price)?,
        ask_volume: parse_price("A", &frame.ask_volume)?,
        update_id: frame.update_id,
        ts_ms: frame.event_time.unwrap_or_else(timestamp_ms),
    })
}

// Shared sequence for mock updates so every stream stays strictly monotonic.
static MOCK_SEQ: Lazy<AtomicI64> = Lazy::new(|| AtomicI64::new(1));

/// Random-walk generator covering the delivery symbol and its companion
/// futures/spot symbol, enough to drive the whole quoting loop offline.
pub async fn run_mock(
    price_tx: mpsc::Sender<PriceUpdate>,
    exchange: String,
    delivery_symbol: String,
    companion_symbol: String,
) {
    let mut mid: f64 = 50_000.0;
    info!(symbol = %delivery_symbol, "mock feed started");
    loop {
        let step = {
            // ThreadRng must not live across an .await
            let mut rng = rand::thread_rng();
            rng.gen_range(-5.0..=5.0)
        };
        mid = (mid + step).max(1_000.0);
        let ts = timestamp_ms();

        let delivery = PriceUpdate {
            exchange: exchange.clone(),
            symbol: delivery_symbol.clone(),
            product: ProductType::Delivery,
            bid_price: mid - 0.5,
            bid_volume: 50.0,
            ask_price: mid + 0.5,
            ask_volume: 50.0,
            update_id: MOCK_SEQ.fetch_add(1, Ordering::Relaxed),
            ts_ms: ts,
        };
        // companions hover slightly above so buy quotes stay attractive
        let futures = PriceUpdate {
            symbol: companion_symbol.clone(),
            product: ProductType::Futures,
            bid_price: mid + 3.0,
            ask_price: mid + 4.0,
            update_id: MOCK_SEQ.fetch_add(1, Ordering::Relaxed),
            ..delivery.clone()
        };
        let spot = PriceUpdate {
            symbol: companion_symbol.clone(),
            product: ProductType::Spot,
            bid_price: mid + 3.5,
            ask_price: mid + 4.5,
            update_id: MOCK_SEQ.fetch_add(1, Ordering::Relaxed),
            ..delivery.clone()
        };

        for upd in [delivery, futures, spot] {
            let _ = price_tx.send(upd).await;
            TICKS.inc();
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// bookTicker adapter for one (symbol, product) stream with reconnect
/// backoff. `stream_symbol` is the exchange-side name (lowercased for the
/// topic); the frame's own symbol field flows into the PriceUpdate.
pub async fn run_binance(
    price_tx: mpsc::Sender<PriceUpdate>,
    exchange: String,
    stream_symbol: String,
    product: ProductType,
    ws_base: String,
) {
    let topic = format!("{}@bookTicker", stream_symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);

    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                return;
            }
        };

        info!(%ws_url, product = product.as_str(), "connecting bookTicker");
        match connect_async(url).await {
            Ok((mut ws, _resp)) => {
                info!(symbol = %stream_symbol, product = product.as_str(), "bookTicker connected");
                attempt = 0;

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            match parse_book_ticker(&txt, &exchange, product) {
                                Ok(upd) => {
                                    let _ = price_tx.send(upd).await;
                                    TICKS.inc();
                                }
                                Err(failure) => {
                                    PARSE_FAILURES.inc();
                                    debug!(%failure, "dropped unparseable frame");
                                }
                            }
                        }
                        Ok(_) => {} // ignore non-text frames
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                info!(symbol = %stream_symbol, "bookTicker disconnected, will reconnect");
                WS_RECONNECTS
                    .with_label_values(&[product.as_str()])
                    .inc();
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);
        let factor = 1u64 << shift;
        let base_ms = 500u64.saturating_mul(factor);
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_frame() {
        let raw = r#"{"u":7,"s":"BTCUSD_PERP","b":"50000.1","B":"12","a":"50000.9","A":"8"}"#;
        let upd = parse_book_ticker(raw, "Binance", ProductType::Delivery).unwrap();
        assert_eq!(upd.symbol, "BTCUSD_PERP");
        assert_eq!(upd.bid_price, 50_000.1);
        assert_eq!(upd.ask_volume, 8.0);
        assert_eq!(upd.update_id, 7);
        assert_eq!(upd.product, ProductType::Delivery);
    }

    #[test]
    fn malformed_number_is_a_typed_failure() {
        let raw = r#"{"u":7,"s":"BTCUSD_PERP","b":"not-a-price","B":"12","a":"50000.9","A":"8"}"#;
        match parse_book_ticker(raw, "Binance", ProductType::Delivery) {
            Err(ParseFailure::BadNumber { field, value }) => {
                assert_eq!(field, "b");
                assert_eq!(value, "not-a-price");
            }
            other => panic!("expected BadNumber, got {:?}", other.map(|u| u.symbol)),
        }
    }

    #[test]
    fn malformed_json_is_a_typed_failure() {
        assert!(matches!(
            parse_book_ticker("garbage", "Binance", ProductType::Spot),
            Err(ParseFailure::Json(_))
        ));
    }
}
