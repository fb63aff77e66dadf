// ===============================
// src/main.rs
// ===============================
//
// basis_bot_rust — quoting and risk engine for coin-margined contracts.
// Rests post-only ladders on the delivery market, watches linear-contract and
// spot references, hedges fills on spot, and gates everything behind a risk
// state machine. One process, a handful of periodic tasks, typed channels in
// between.

mod alert;
mod binance;
mod config;
mod context;
mod domain;
mod dynamic;
mod events;
mod feed;
mod gateway;
mod gateway_binance;
mod metrics;
mod orderbook;
mod quoter;
mod recorder;
mod risk;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::alert::AlertSink;
use crate::config::MarketMode;
use crate::context::AppState;
use crate::domain::{AccountUpdate, Event, GatewayCommand, OrderUpdate, PriceUpdate};
use crate::gateway::RateLimiter;
use crate::gateway_binance::BinanceClient;

#[tokio::main]
async fn main() {
    let cli = config::Cli::parse();

    // ---- Logging (fmt layer + ERROR counter for the risk monitor) ----
    let error_count = Arc::new(AtomicU64::new(0));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(risk::ErrorRateLayer::new(error_count.clone()))
        .init();

    // ---- Load config ----
    let args = config::load_args();
    let cfg = match config::Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));
    metrics::CONFIG_FEED_MODE
        .with_label_values(&[args.feed_mode.as_str()])
        .set(1);
    metrics::CONFIG_VENUE_MODE
        .with_label_values(&[args.venue_mode.as_str()])
        .set(1);
    for s in &cfg.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    info!(
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        symbols = ?cfg.symbols,
        hedge = cfg.function_hedge,
        metrics_port = args.metrics_port,
        "startup config"
    );

    let state = AppState::new(cfg);

    // ---- Buses ----
    let (price_tx, price_rx) = mpsc::channel::<PriceUpdate>(4096);
    let (order_tx, order_rx) = mpsc::channel::<OrderUpdate>(1024);
    let (account_tx, account_rx) = mpsc::channel::<AccountUpdate>(256);
    let (cmd_tx, cmd_rx) = mpsc::channel::<GatewayCommand>(512);
    let (alert_tx, alert_rx) = mpsc::channel::<String>(64);

    // ---- Recorder (optional) ----
    let rec_tx = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            tokio::spawn(recorder::run(rx, path));
            Some(tx)
        }
        None => None,
    };

    // ---- Alerts ----
    tokio::spawn(alert::run(
        alert_rx,
        AlertSink::new(
            state.cfg.tg_bot_token.clone(),
            state.cfg.tg_chat_id,
            state.cfg.alert_interval_ms,
        ),
    ));

    // ---- Gateway ----
    let limiter = RateLimiter::new(state.cfg.api_limit, state.cfg.limit_process);
    match args.venue_mode {
        MarketMode::Mock => {
            tokio::spawn(gateway::run_mock_venue(
                state.clone(),
                cmd_rx,
                order_tx.clone(),
                limiter,
                5,
            ));
        }
        MarketMode::BinanceSandbox | MarketMode::BinanceMainnet => {
            let client = BinanceClient::new(&args);
            for symbol in &state.cfg.symbols {
                client
                    .change_leverage(symbol, state.cfg.symbol(symbol).leverage)
                    .await;
            }
            gateway::spawn_binance_pool(
                state.clone(),
                client.clone(),
                cmd_rx,
                order_tx.clone(),
                limiter,
            );
            tokio::spawn(gateway_binance::run_user_stream(
                state.clone(),
                client,
                args.delivery_ws_url.clone(),
                order_tx.clone(),
                account_tx.clone(),
            ));
        }
    }

    // ---- Feeds ----
    match args.feed_mode {
        MarketMode::Mock => {
            for symbol in state.cfg.symbols.iter().cloned() {
                let companion = context::format_companion_symbol(
                    &symbol,
                    &state.cfg.symbol(&symbol).quote_asset,
                );
                tokio::spawn(feed::run_mock(
                    price_tx.clone(),
                    state.cfg.exchange.clone(),
                    symbol,
                    companion,
                ));
            }
        }
        MarketMode::BinanceSandbox | MarketMode::BinanceMainnet => {
            for symbol in state.cfg.symbols.iter().cloned() {
                tokio::spawn(feed::run_binance(
                    price_tx.clone(),
                    state.cfg.exchange.clone(),
                    symbol,
                    domain::ProductType::Delivery,
                    args.delivery_ws_url.clone(),
                ));
            }
            for companion in state.companion_map.keys().cloned() {
                tokio::spawn(feed::run_binance(
                    price_tx.clone(),
                    state.cfg.exchange.clone(),
                    companion.clone(),
                    domain::ProductType::Futures,
                    args.futures_ws_url.clone(),
                ));
                tokio::spawn(feed::run_binance(
                    price_tx.clone(),
                    state.cfg.exchange.clone(),
                    companion,
                    domain::ProductType::Spot,
                    args.spot_ws_url.clone(),
                ));
            }
        }
    }

    // ---- Event dispatcher ----
    let dispatcher = events::EventDispatcher::new(
        state.clone(),
        cmd_tx.clone(),
        alert_tx.clone(),
        rec_tx,
    );
    tokio::spawn(dispatcher.run(price_rx, order_rx, account_rx));

    // ---- Periodic tasks ----
    tokio::spawn(dynamic::run(state.clone()));
    tokio::spawn(quoter::run(state.clone(), cmd_tx.clone()));
    tokio::spawn(quoter::run_sweeps(state.clone(), cmd_tx.clone()));
    tokio::spawn(risk::run_staleness(
        state.clone(),
        cmd_tx.clone(),
        alert_tx.clone(),
    ));
    tokio::spawn(risk::run_error_check(
        state.clone(),
        cmd_tx.clone(),
        alert_tx.clone(),
        error_count,
    ));

    // ---- Heartbeat ----
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut open = 0usize;
        for symbol in &state.cfg.symbols {
            if let Some(books) = state.side_books(symbol) {
                open += books.buy.size() + books.sell.size();
            }
        }
        info!(
            open_orders = open,
            risk = ?state.global_risk(),
            "heartbeat"
        );
    }
}
