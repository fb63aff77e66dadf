// ===============================
// src/gateway_binance.rs
// ===============================
//
// Real venue: signed REST against the coin-margined API for quoting and the
// spot API for hedges, plus the user-data-stream WS that feeds order and
// account events back into the dispatcher. The REST result is only used to
// detect immediate failure; everything else reconciles through the stream.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::connect_async;
use url::Url;

use crate::binance::{sign_query, timestamp_ms, UserStreamEnvelope};
use crate::config::Args;
use crate::context::AppState;
use crate::domain::{
    AccountUpdate, GatewayCommand, Order, OrderStatus, OrderUpdate, Side,
};
use crate::gateway::RateLimiter;
use crate::metrics::{ORDERS_FAILED, WS_RECONNECTS};

const LISTEN_KEY_KEEPALIVE_S: u64 = 1_800;

pub struct BinanceClient {
    http: reqwest::Client,
    delivery_rest: String,
    spot_rest: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
}

impl BinanceClient {
    pub fn new(args: &Args) -> Arc<BinanceClient> {
        Arc::new(BinanceClient {
            http: reqwest::Client::new(),
            delivery_rest: args.delivery_rest_url.clone(),
            spot_rest: args.spot_rest_url.clone(),
            api_key: args.binance_api_key.clone(),
            api_secret: args.binance_api_secret.clone(),
            recv_window: 5_000,
        })
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("timestamp".to_string(), timestamp_ms().to_string()));
        params.push(("recvWindow".to_string(), self.recv_window.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let sig = sign_query(&self.api_secret, &query);
        format!("{query}&signature={sig}")
    }

    /// Post-only limit order on the delivery market. GTX is rejected by the
    /// exchange instead of crossing, which is exactly what a quoter wants.
    pub async fn place_order_gtx(&self, order: &Order) -> Option<String> {
        let params = vec![
            ("symbol".to_string(), order.symbol.to_ascii_uppercase()),
            ("side".to_string(), binance_side(order.side).to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTX".to_string()),
            ("quantity".to_string(), format!("{}", order.volume)),
            (
                "price".to_string(),
                format!("{:.*}", order.precision.1 as usize, order.price),
            ),
            ("newClientOrderId".to_string(), order.client_order_id.clone()),
        ];
        let url = format!("{}/dapi/v1/order?{}", self.delivery_rest, self.signed_query(params));
        let resp = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        match resp {
            Ok(rsp) if rsp.status().is_success() => {
                let body = rsp.json::<serde_json::Value>().await.ok()?;
                body.get("orderId").map(|id| id.to_string())
            }
            Ok(rsp) => {
                let code = rsp.status();
                let body = rsp.text().await.unwrap_or_default();
                tracing::error!(%code, %body, client_id = %order.client_order_id, "place order failed");
                None
            }
            Err(e) => {
                tracing::error!(?e, client_id = %order.client_order_id, "place order error");
                None
            }
        }
    }

    /// Market order on the spot venue (hedge leg).
    pub async fn place_market_spot(&self, order: &Order) -> Option<String> {
        let params = vec![
            ("symbol".to_string(), order.symbol.to_ascii_uppercase()),
            ("side".to_string(), binance_side(order.side).to_string()),
            ("type".to_string(), "MARKET".to_string()),
            (
                "quantity".to_string(),
                format!("{:.*}", order.precision.0 as usize, order.volume),
            ),
            ("newClientOrderId".to_string(), order.client_order_id.clone()),
        ];
        let url = format!("{}/api/v3/order?{}", self.spot_rest, self.signed_query(params));
        let resp = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        match resp {
            Ok(rsp) if rsp.status().is_success() => {
                let body = rsp.json::<serde_json::Value>().await.ok()?;
                body.get("orderId").map(|id| id.to_string())
            }
            Ok(rsp) => {
                let code = rsp.status();
                let body = rsp.text().await.unwrap_or_default();
                tracing::error!(%code, %body, client_id = %order.client_order_id, "hedge order failed");
                None
            }
            Err(e) => {
                tracing::error!(?e, client_id = %order.client_order_id, "hedge order error");
                None
            }
        }
    }

    pub async fn cancel_all(&self, symbol: &str) -> bool {
        let params = vec![("symbol".to_string(), symbol.to_ascii_uppercase())];
        let url = format!(
            "{}/dapi/v1/allOpenOrders?{}",
            self.delivery_rest,
            self.signed_query(params)
        );
        let resp = self
            .http
            .delete(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        match resp {
            Ok(rsp) if rsp.status().is_success() => true,
            Ok(rsp) => {
                let body = rsp.text().await.unwrap_or_default();
                tracing::error!(%symbol, %body, "cancel all failed");
                false
            }
            Err(e) => {
                tracing::error!(?e, %symbol, "cancel all error");
                false
            }
        }
    }

    /// Batched cancel, at most 10 ids per request (API constraint). Returns
    /// the client ids the exchange confirmed.
    pub async fn cancel_by_client_ids(&self, symbol: &str, ids: &[String]) -> Vec<String> {
        let mut succeeded = Vec::new();
        for chunk in ids.chunks(10) {
            let list = serde_json::to_string(chunk).unwrap_or_else(|_| "[]".to_string());
            let params = vec![
                ("symbol".to_string(), symbol.to_ascii_uppercase()),
                ("origClientOrderIdList".to_string(), list),
            ];
            let url = format!(
                "{}/dapi/v1/batchOrders?{}",
                self.delivery_rest,
                self.signed_query(params)
            );
            let resp = self
                .http
                .delete(url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await;
            match resp {
                Ok(rsp) if rsp.status().is_success() => {
                    if let Ok(body) = rsp.json::<serde_json::Value>().await {
                        if let Some(entries) = body.as_array() {
                            for entry in entries {
                                if let Some(id) =
                                    entry.get("clientOrderId").and_then(|v| v.as_str())
                                {
                                    succeeded.push(id.to_string());
                                }
                            }
                        }
                    }
                }
                Ok(rsp) => {
                    let body = rsp.text().await.unwrap_or_default();
                    tracing::error!(%symbol, %body, "batch cancel failed");
                }
                Err(e) => {
                    tracing::error!(?e, %symbol, "batch cancel error");
                }
            }
        }
        succeeded
    }

    /// Set instrument leverage once at startup.
    pub async fn change_leverage(&self, symbol: &str, leverage: f64) {
        let params = vec![
            ("symbol".to_string(), symbol.to_ascii_uppercase()),
            ("leverage".to_string(), format!("{}", leverage as i64)),
        ];
        let url = format!(
            "{}/dapi/v1/leverage?{}",
            self.delivery_rest,
            self.signed_query(params)
        );
        let resp = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        if let Ok(rsp) = resp {
            if !rsp.status().is_success() {
                let body = rsp.text().await.unwrap_or_default();
                tracing::warn!(%symbol, %body, "change leverage failed");
            }
        }
    }

    pub async fn create_listen_key(&self) -> Result<String, String> {
        let url = format!("{}/dapi/v1/listenKey", self.delivery_rest);
        let rsp = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let v = rsp.json::<serde_json::Value>().await.map_err(|e| e.to_string())?;
        v.get("listenKey")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "no listenKey in response".to_string())
    }

    pub async fn keepalive_listen_key(&self) {
        let url = format!("{}/dapi/v1/listenKey", self.delivery_rest);
        let resp = self
            .http
            .put(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        if let Err(e) = resp {
            tracing::warn!(?e, "listenKey keepalive failed");
        }
    }
}

fn binance_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn map_stream_status(status: &str) -> Option<OrderStatus> {
    match status {
        "NEW" => Some(OrderStatus::Created),
        "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
        "FILLED" => Some(OrderStatus::Filled),
        "CANCELED" => Some(OrderStatus::Canceled),
        "EXPIRED" => Some(OrderStatus::Expired),
        "REJECTED" => Some(OrderStatus::Failed),
        _ => None,
    }
}

/// One worker of the gateway pool. Blocking on the shared receiver keeps the
/// in-flight API call count bounded by the pool size.
pub async fn run_worker(
    worker: usize,
    state: Arc<AppState>,
    client: Arc<BinanceClient>,
    rx: Arc<Mutex<mpsc::Receiver<GatewayCommand>>>,
    order_tx: mpsc::Sender<OrderUpdate>,
    limiter: Arc<RateLimiter>,
) {
    loop {
        let cmd = { rx.lock().await.recv().await };
        let Some(cmd) = cmd else {
            tracing::info!(worker, "command queue closed, worker stopping");
            break;
        };
        if !limiter.acquire().await {
            if let GatewayCommand::PlaceLimitPostOnly(order) | GatewayCommand::PlaceMarket(order) =
                &cmd
            {
                tracing::warn!(client_id = %order.client_order_id, "API budget dry, placement dropped");
                let _ = order_tx.send(synthetic_failure(order)).await;
            }
            continue;
        }

        match cmd {
            GatewayCommand::PlaceLimitPostOnly(order) => {
                match client.place_order_gtx(&order).await {
                    Some(exchange_id) => {
                        let _ = order_tx
                            .send(OrderUpdate {
                                exchange: state.cfg.exchange.clone(),
                                symbol: order.symbol.clone(),
                                client_order_id: order.client_order_id.clone(),
                                exchange_order_id: exchange_id,
                                side: order.side,
                                status: OrderStatus::Create,
                                filled_price: 0.0,
                                filled_volume: 0.0,
                            })
                            .await;
                    }
                    None => {
                        ORDERS_FAILED.inc();
                        let _ = order_tx.send(synthetic_failure(&order)).await;
                    }
                }
            }
            GatewayCommand::PlaceMarket(order) => {
                if client.place_market_spot(&order).await.is_none() {
                    // fills of a successful hedge come back on the spot user
                    // stream; only the immediate failure is reported locally
                    ORDERS_FAILED.inc();
                    let _ = order_tx.send(synthetic_failure(&order)).await;
                }
            }
            GatewayCommand::CancelAll { symbol } => {
                client.cancel_all(&symbol).await;
            }
            GatewayCommand::CancelByClientIds { symbol, ids } => {
                for id in client.cancel_by_client_ids(&symbol, &ids).await {
                    // mark Cancel locally so the sweeps stop re-flagging it;
                    // the final CANCELED arrives on the user stream
                    let Some(order) = state.find_order(&symbol, &id) else { continue };
                    let _ = order_tx
                        .send(OrderUpdate {
                            exchange: state.cfg.exchange.clone(),
                            symbol: symbol.clone(),
                            client_order_id: id,
                            exchange_order_id: order.exchange_order_id.clone(),
                            side: order.side,
                            status: OrderStatus::Cancel,
                            filled_price: 0.0,
                            filled_volume: 0.0,
                        })
                        .await;
                }
            }
        }
    }
}

fn synthetic_failure(order: &Order) -> OrderUpdate {
    OrderUpdate {
        exchange: "Binance".to_string(),
        symbol: order.symbol.clone(),
        client_order_id: order.client_order_id.clone(),
        exchange_order_id: order.exchange_order_id.clone(),
        side: order.side,
        status: OrderStatus::Failed,
        filled_price: 0.0,
        filled_volume: 0.0,
    }
}

/// Delivery user-data stream: order and account events, with listen-key
/// keepalive and reconnect.
pub async fn run_user_stream(
    state: Arc<AppState>,
    client: Arc<BinanceClient>,
    ws_base: String,
    order_tx: mpsc::Sender<OrderUpdate>,
    account_tx: mpsc::Sender<AccountUpdate>,
) {
    loop {
        let listen_key = match client.create_listen_key().await {
            Ok(k) => k,
            Err(e) => {
                tracing::error!(%e, "create listenKey failed");
                sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), listen_key);
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                tracing::error!(?e, %ws_url, "bad userDataStream url");
                return;
            }
        };

        tracing::info!(%ws_url, "connecting userDataStream");
        match connect_async(url).await {
            Ok((mut ws, _)) => {
                let mut keepalive = interval(Duration::from_secs(LISTEN_KEY_KEEPALIVE_S));
                keepalive.tick().await; // skip immediate tick
                loop {
                    tokio::select! {
                        _ = keepalive.tick() => {
                            client.keepalive_listen_key().await;
                        }
                        frame = ws.next() => {
                            match frame {
                                Some(Ok(m)) if m.is_text() => {
                                    let txt = m.into_text().unwrap_or_default();
                                    handle_user_frame(&state, &txt, &order_tx, &account_tx).await;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::error!(?e, "userDataStream ws error");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
                tracing::warn!("userDataStream disconnected, reconnecting");
                WS_RECONNECTS.with_label_values(&["user_stream"]).inc();
            }
            Err(e) => {
                tracing::error!(?e, "connect userDataStream failed");
            }
        }
        sleep(Duration::from_secs(2)).await;
    }
}

async fn handle_user_frame(
    state: &AppState,
    txt: &str,
    order_tx: &mpsc::Sender<OrderUpdate>,
    account_tx: &mpsc::Sender<AccountUpdate>,
) {
    let Ok(env) = serde_json::from_str::<UserStreamEnvelope>(txt) else {
        tracing::debug!("unparseable user stream frame dropped");
        return;
    };
    match env.event_type.as_deref() {
        Some("ORDER_TRADE_UPDATE") => {
            let Some(o) = env.order else { return };
            let Some(status) = map_stream_status(&o.status) else { return };
            let side = if o.side == "SELL" { Side::Sell } else { Side::Buy };
            let filled_price = o
                .last_filled_price
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            let filled_volume = o
                .last_filled_volume
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            let _ = order_tx
                .send(OrderUpdate {
                    exchange: state.cfg.exchange.clone(),
                    symbol: o.symbol,
                    client_order_id: o.client_order_id,
                    exchange_order_id: o.order_id.map(|i| i.to_string()).unwrap_or_default(),
                    side,
                    status,
                    filled_price,
                    filled_volume,
                })
                .await;
        }
        Some("ACCOUNT_UPDATE") => {
            let Some(a) = env.account else { return };
            for position in a.positions {
                let Some(symbol_cfg) = state.cfg.symbol_configs.get(&position.symbol) else {
                    continue;
                };
                let Ok(amount) = position.position_amount.parse::<f64>() else { continue };
                let margin_balance = a
                    .balances
                    .iter()
                    .find(|b| b.asset == symbol_cfg.base_asset)
                    .and_then(|b| b.wallet_balance.parse::<f64>().ok());
                let _ = account_tx
                    .send(AccountUpdate {
                        exchange: state.cfg.exchange.clone(),
                        symbol: position.symbol.clone(),
                        position: amount,
                        margin_balance,
                    })
                    .await;
            }
        }
        _ => {}
    }
}
