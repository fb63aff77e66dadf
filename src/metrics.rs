// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static PRICE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_events_total", "applied price updates per product"),
        &["product"],
    )
    .unwrap()
});

pub static PRICE_EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "price_events_dropped_total",
        "price updates discarded by the sequence-id gate",
    )
    .unwrap()
});

pub static PARSE_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("parse_failures_total", "dropped unparseable frames").unwrap());

// -------- Orders --------
pub static ORDERS_PLACED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_placed_total", "orders handed to the gateway").unwrap());

pub static ORDERS_FAILED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_failed_total", "orders failed at placement").unwrap());

pub static ORDER_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_events_total", "order stream events by status"),
        &["status"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fills_total", "partial and full fills").unwrap());

pub static HEDGES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("hedges_total", "hedge market orders dispatched").unwrap());

pub static CANCEL_ALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cancels_total", "cancel commands by reason"),
        &["reason"],
    )
    .unwrap()
});

pub static BOOK_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("book_size", "resting orders per symbol and side"),
        &["symbol", "side"],
    )
    .unwrap()
});

// -------- Quoting model --------
pub static ADJUSTED_GAP_SIZE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("adjusted_gap_size", "adaptive order spacing per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static ADJUSTED_FORGIVE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("adjusted_forgive_percent", "adaptive profitability bar per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Risk / positions --------
pub static RISK_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("risk_state", "risk state per scope (symbol or global)"),
        &["scope"],
    )
    .unwrap()
});

pub static POSITION: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("position_contracts", "net position in contracts"),
        &["symbol"],
    )
    .unwrap()
});

pub static ERRORS_LAST_MINUTE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("errors_last_minute", "ERROR log events counted in the last minute").unwrap()
});

// -------- Gateway / transport health --------
pub static GATEWAY_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "gateway_dropped_total",
        "API calls dropped by the token bucket",
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "websocket reconnects per stream"),
        &["stream"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_venue_mode", "venue mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(PRICE_EVENTS.clone())),
        REGISTRY.register(Box::new(PRICE_EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(PARSE_FAILURES.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDERS_FAILED.clone())),
        REGISTRY.register(Box::new(ORDER_EVENTS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(HEDGES.clone())),
        REGISTRY.register(Box::new(CANCEL_ALLS.clone())),
        REGISTRY.register(Box::new(BOOK_SIZE.clone())),
        REGISTRY.register(Box::new(ADJUSTED_GAP_SIZE.clone())),
        REGISTRY.register(Box::new(ADJUSTED_FORGIVE.clone())),
        REGISTRY.register(Box::new(RISK_STATE.clone())),
        REGISTRY.register(Box::new(POSITION.clone())),
        REGISTRY.register(Box::new(ERRORS_LAST_MINUTE.clone())),
        REGISTRY.register(Box::new(GATEWAY_DROPPED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
