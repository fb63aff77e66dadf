// ===============================
// src/quoter.rs
// ===============================
//
// Order lifecycle: ladder evaluation on a fixed period, economic cancels when
// the market moves, far/close-distance cleanup sweeps. Everything here is
// non-blocking toward the gateway: commands go through a bounded queue and a
// full queue degrades to a FAILED order, never to a stalled timer task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::AppState;
use crate::domain::{
    next_client_order_id, round_to, timestamp_ms, GatewayCommand, Order, OrderStatus, Side,
};
use crate::metrics::{BOOK_SIZE, CANCEL_ALLS, ORDERS_FAILED, ORDERS_PLACED};

pub const QUOTE_INTERVAL_MS: u64 = 1_000;
pub const CANCEL_MIN_INTERVAL_MS: i64 = 200;
pub const CANCEL_FAR_MIN_INTERVAL_MS: i64 = 2_000;
pub const SWEEP_INTERVAL_MS: u64 = 2_000;
/// Hard bound on ladder extension: skipped-unprofitable levels may grow the
/// scan up to this multiple of max_order_num, never beyond.
const LADDER_EXTEND_FACTOR: usize = 3;
const CANCEL_BATCH: usize = 10;

pub fn ladder_price(reference: f64, index: usize, step: f64, side: Side) -> f64 {
    match side {
        Side::Buy => reference - index as f64 * step,
        Side::Sell => reference + index as f64 * step,
    }
}

/// Skew a target away from the inventory-heavy side: a long book makes buys
/// look more expensive and sells look cheaper, in both cases harder to place.
fn adjusted_price(price: f64, ratio: f64, position: f64) -> f64 {
    if position > 0.0 {
        price * ratio
    } else if position < 0.0 {
        price / ratio
    } else {
        price
    }
}

/// Walk the ladder for one instrument and side, returning the orders that
/// should exist but do not. Pure with respect to exchange I/O.
pub fn plan_side(state: &AppState, symbol: &str, side: Side, now_ms: i64) -> Vec<Order> {
    let cfg = &state.cfg;
    let Some(ctx) = state.context(symbol) else { return Vec::new() };
    if !ctx.risk().is_ok() {
        return Vec::new();
    }

    let (Some(spot), Some(futures)) = (state.spot_item(symbol), state.futures_item(symbol))
    else {
        return Vec::new();
    };
    if now_ms - spot.last_update_ms > cfg.companion_stale_ms
        || now_ms - futures.last_update_ms > cfg.companion_stale_ms
    {
        return Vec::new();
    }

    let quote = ctx.snapshot();
    if quote.bid_price < cfg.min_accuracy {
        return Vec::new();
    }
    let reference = match side {
        Side::Buy => quote.bid_price,
        Side::Sell => quote.ask_price,
    };
    if reference < cfg.min_accuracy {
        return Vec::new();
    }

    let Some(params) = state.dynamics.get(symbol) else { return Vec::new() };
    let (gap, forgive) = params.values();
    if gap < cfg.min_accuracy {
        return Vec::new();
    }

    let symbol_cfg = cfg.symbol(symbol);
    let position = state.position(symbol);
    let ratio = 1.0 + cfg.ticker_shift * position.position_abs / symbol_cfg.contract_num;

    let Some(books) = state.side_books(symbol) else { return Vec::new() };
    let book = match side {
        Side::Buy => &books.buy,
        Side::Sell => &books.sell,
    };
    let open = book.open_orders();

    let step = cfg.gap_size_k * gap;
    let hard_cap = cfg.max_order_num * LADDER_EXTEND_FACTOR;
    let mut budget = cfg.max_order_num;
    let mut planned: Vec<Order> = Vec::new();

    let mut i = 1;
    while i <= budget {
        let target = ladder_price(reference, i, step, side);
        if target < cfg.min_accuracy {
            break;
        }
        let in_range = open.iter().any(|o| (o.price - target).abs() <= step);

        let adjusted = adjusted_price(target, ratio, position.position);
        // Edge is measured against both companion bids, scaled by the
        // adaptive profitability bar.
        let (spot_ref, futures_ref) = match side {
            Side::Buy => (spot.bid_price * forgive, futures.bid_price * forgive),
            Side::Sell => (spot.bid_price / forgive, futures.bid_price / forgive),
        };
        let edge_ok = match side {
            Side::Buy => adjusted < spot_ref && adjusted < futures_ref,
            Side::Sell => adjusted > spot_ref && adjusted > futures_ref,
        };
        // Resulting position counts orders already queued this cycle.
        let queued = symbol_cfg.contract_num * (planned.len() + 1) as f64;
        let within_position = match side {
            Side::Buy => position.position + queued <= symbol_cfg.max_contract_num,
            Side::Sell => position.position - queued >= -symbol_cfg.max_contract_num,
        };

        if !in_range && edge_ok && within_position && planned.len() < cfg.max_order_one_step {
            debug!(
                symbol = %symbol,
                side = side.as_str(),
                index = i,
                target,
                adjusted,
                spot_ref,
                futures_ref,
                position = position.position,
                "plan order"
            );
            planned.push(Order {
                symbol: symbol.to_string(),
                side,
                price: round_to(target, symbol_cfg.precision.1),
                volume: symbol_cfg.contract_num,
                client_order_id: String::new(),
                exchange_order_id: String::new(),
                created_at: 0,
                status: OrderStatus::New,
                base_asset: symbol_cfg.base_asset.clone(),
                quote_asset: symbol_cfg.quote_asset.clone(),
                precision: symbol_cfg.precision,
            });
        } else if !in_range && !edge_ok && budget < hard_cap {
            // keep searching deeper for a level that clears the bar
            budget += 1;
        }
        i += 1;
    }
    planned
}

/// Insert optimistically, then hand off to the gateway pool. A full queue
/// fails the order on the spot; the next cycle re-evaluates the level.
pub fn dispatch_orders(state: &AppState, cmd_tx: &mpsc::Sender<GatewayCommand>, orders: Vec<Order>) {
    let now_s = timestamp_ms() / 1_000;
    for mut order in orders {
        order.client_order_id = next_client_order_id();
        order.created_at = now_s;

        let Some(books) = state.side_books(&order.symbol) else { continue };
        let book = match order.side {
            Side::Buy => &books.buy,
            Side::Sell => &books.sell,
        };
        if !book.add(order.clone()) {
            warn!(client_id = %order.client_order_id, "duplicate client id, order dropped");
            continue;
        }

        info!("op=New, {}", order.format());
        match cmd_tx.try_send(GatewayCommand::PlaceLimitPostOnly(order.clone())) {
            Ok(()) => {
                ORDERS_PLACED.inc();
            }
            Err(e) => {
                warn!(client_id = %order.client_order_id, ?e, "gateway queue full, order failed");
                book.update_status(&order.client_order_id, OrderStatus::Failed);
                book.delete_by_client_order_id(&order.client_order_id, now_s);
                ORDERS_FAILED.inc();
            }
        }
    }
}

/// Periodic ladder refresh across all instruments.
pub async fn run(state: Arc<AppState>, cmd_tx: mpsc::Sender<GatewayCommand>) {
    let mut tick = interval(Duration::from_millis(QUOTE_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        if !state.global_risk().is_ok() {
            continue;
        }
        let now_ms = timestamp_ms();
        for symbol in &state.cfg.symbols {
            let mut planned = plan_side(&state, symbol, Side::Buy, now_ms);
            planned.extend(plan_side(&state, symbol, Side::Sell, now_ms));

            if let Some(books) = state.side_books(symbol) {
                BOOK_SIZE
                    .with_label_values(&[symbol, "buy"])
                    .set(books.buy.size() as i64);
                BOOK_SIZE
                    .with_label_values(&[symbol, "sell"])
                    .set(books.sell.size() as i64);
            }
            if !planned.is_empty() {
                info!(symbol = %symbol, count = planned.len(), "create orders");
                dispatch_orders(&state, &cmd_tx, planned);
            }
        }
    }
}

/// Economic cancellation sweep for one instrument, triggered by the
/// dispatcher when a reference price moved more than min_delta_rate.
/// Orders near the touch whose edge against spot fell below the
/// inventory-adjusted threshold flag a symbol-wide cancel-all.
pub fn cancel_orders(state: &AppState, cmd_tx: &mpsc::Sender<GatewayCommand>, symbol: &str) {
    let cfg = &state.cfg;
    let now_ms = timestamp_ms();
    let Some(ctx) = state.context(symbol) else { return };
    let quote = ctx.snapshot();
    if now_ms - quote.last_cancel_ms < CANCEL_MIN_INTERVAL_MS {
        return;
    }
    if quote.bid_price < cfg.min_accuracy || quote.ask_price < cfg.min_accuracy {
        return;
    }
    let Some(spot) = state.spot_item(symbol) else { return };
    let Some(params) = state.dynamics.get(symbol) else { return };
    let (gap, _) = params.values();
    let Some(books) = state.side_books(symbol) else { return };

    let symbol_cfg = cfg.symbol(symbol);
    let position = state.position(symbol);
    let position_ratio = position.position_abs / symbol_cfg.max_contract_num;
    // How much loss we tolerate before pulling quotes: the maker rebate plus
    // an inventory-proportional allowance for shedding a heavy book.
    let threshold = -(cfg.commission + cfg.cancel_shift * position_ratio - cfg.loss);

    let mut flagged = 0usize;
    for side in [Side::Buy, Side::Sell] {
        let book = match side {
            Side::Buy => &books.buy,
            Side::Sell => &books.sell,
        };
        for order in book.open_orders() {
            let distance = match side {
                Side::Buy => quote.bid_price - order.price,
                Side::Sell => order.price - quote.ask_price,
            };
            // far from the touch, not worth an API call yet
            if distance > gap {
                continue;
            }
            let profit_ratio = match side {
                Side::Buy => (spot.bid_price - quote.ask_price) / quote.ask_price,
                Side::Sell => (quote.bid_price - spot.ask_price) / quote.bid_price,
            };
            if profit_ratio < threshold {
                info!(
                    symbol = %symbol,
                    side = side.as_str(),
                    order_price = order.price,
                    profit_ratio,
                    threshold,
                    position_ratio,
                    "flag for cancel"
                );
                flagged += 1;
            }
        }
    }

    if flagged > 0 {
        // one cancel-all instead of per-order cancels, to conserve API budget
        if cmd_tx
            .try_send(GatewayCommand::CancelAll { symbol: symbol.to_string() })
            .is_ok()
        {
            CANCEL_ALLS.with_label_values(&["economic"]).inc();
        }
        ctx.stamp_cancel(now_ms);
    }
}

fn push_batched_cancels(
    cmd_tx: &mpsc::Sender<GatewayCommand>,
    symbol: &str,
    ids: Vec<String>,
) {
    for chunk in ids.chunks(CANCEL_BATCH) {
        let _ = cmd_tx.try_send(GatewayCommand::CancelByClientIds {
            symbol: symbol.to_string(),
            ids: chunk.to_vec(),
        });
    }
}

/// Cancel the overflow orders farthest from the touch when a side holds more
/// than max_order_num orders.
pub fn cancel_far_orders(state: &AppState, cmd_tx: &mpsc::Sender<GatewayCommand>, symbol: &str) {
    let now_ms = timestamp_ms();
    let Some(ctx) = state.context(symbol) else { return };
    if now_ms - ctx.snapshot().last_cancel_far_ms < CANCEL_FAR_MIN_INTERVAL_MS {
        return;
    }
    let Some(books) = state.side_books(symbol) else { return };

    let mut ids: Vec<String> = Vec::new();

    let buys = books.buy.sorted_snapshot();
    let excess = buys.len().saturating_sub(state.cfg.max_order_num);
    // lowest buy prices are the farthest from the touch
    ids.extend(
        buys.iter()
            .filter(|o| o.status.is_open())
            .take(excess)
            .map(|o| o.client_order_id.clone()),
    );

    let sells = books.sell.sorted_snapshot();
    let excess = sells.len().saturating_sub(state.cfg.max_order_num);
    ids.extend(
        sells
            .iter()
            .filter(|o| o.status.is_open())
            .rev()
            .take(excess)
            .map(|o| o.client_order_id.clone()),
    );

    if ids.len() > 2 {
        ctx.stamp_cancel_far(now_ms);
    }
    if !ids.is_empty() {
        debug!(symbol = %symbol, count = ids.len(), "cancel far orders");
        CANCEL_ALLS.with_label_values(&["far"]).inc();
        push_batched_cancels(cmd_tx, symbol, ids);
    }
}

/// Cancel interior orders packed closer than the adjusted gap to their
/// neighbor; the orders nearest and farthest from the touch are left alone.
pub fn cancel_close_distance_orders(
    state: &AppState,
    cmd_tx: &mpsc::Sender<GatewayCommand>,
    symbol: &str,
) {
    let Some(params) = state.dynamics.get(symbol) else { return };
    let (gap, _) = params.values();
    if gap <= 0.0 {
        return;
    }
    let Some(books) = state.side_books(symbol) else { return };

    let mut ids: Vec<String> = Vec::new();

    let buys = books.buy.sorted_snapshot();
    if buys.len() > 2 {
        let mut kept = &buys[buys.len() - 2];
        for order in buys[1..buys.len() - 2].iter().rev() {
            if kept.price - order.price < gap {
                ids.push(order.client_order_id.clone());
            } else {
                kept = order;
            }
        }
    }

    let sells = books.sell.sorted_snapshot();
    if sells.len() > 2 {
        let mut kept = &sells[1];
        for order in sells[2..sells.len() - 1].iter() {
            if order.price - kept.price < gap {
                ids.push(order.client_order_id.clone());
            } else {
                kept = order;
            }
        }
    }

    if !ids.is_empty() {
        debug!(symbol = %symbol, count = ids.len(), "cancel close-distance orders");
        CANCEL_ALLS.with_label_values(&["close_distance"]).inc();
        push_batched_cancels(cmd_tx, symbol, ids);
    }
}

/// Slow periodic cleanup: far-order and close-distance sweeps.
pub async fn run_sweeps(state: Arc<AppState>, cmd_tx: mpsc::Sender<GatewayCommand>) {
    let mut tick = interval(Duration::from_millis(SWEEP_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        for symbol in &state.cfg.symbols {
            cancel_far_orders(&state, &cmd_tx, symbol);
            cancel_close_distance_orders(&state, &cmd_tx, symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::format_price_key;
    use crate::domain::ProductType;

    fn test_state() -> Arc<AppState> {
        let cfg: Config = serde_json::from_str(
            r#"{
                "exchange": "Binance",
                "symbols": ["BTCUSD_PERP"],
                "symbol_configs": {
                    "BTCUSD_PERP": {
                        "contract_num": 1.0,
                        "base_asset": "BTC",
                        "quote_asset": "USDT",
                        "cont": 100.0,
                        "leverage": 20.0,
                        "max_contract_num": 10.0,
                        "min_hedge_size": 1.0,
                        "precision": [4, 1],
                        "effective_num": 0.0
                    }
                },
                "max_order_num": 3,
                "max_order_one_step": 2,
                "gap_size_percent": 0.0002,
                "gap_size_k": 1.0,
                "forgive_percent": 1.0005,
                "ticker_shift": 0.0,
                "cancel_shift": 0.0,
                "commission": 0.0001,
                "loss": 0.0
            }"#,
        )
        .unwrap();
        AppState::new(cfg)
    }

    fn prime_prices(state: &AppState, now_ms: i64) {
        // own book at 50000/50001, companions comfortably above the ladder
        let ctx = state.context("BTCUSD_PERP").unwrap();
        ctx.apply_quote(50_000.0, 10.0, 50_001.0, 10.0, state.cfg.min_accuracy, 0.0, now_ms);

        let spot = format_price_key("Binance", "BTCUSD_PERP", ProductType::Spot);
        let futures = format_price_key("Binance", "BTCUSD_PERP", ProductType::Futures);
        state
            .prices
            .update(&spot, 50_050.0, 5.0, 50_051.0, 5.0, state.cfg.min_accuracy, now_ms);
        state
            .prices
            .update(&futures, 50_050.0, 5.0, 50_051.0, 5.0, state.cfg.min_accuracy, now_ms);

        let params = state.dynamics.get("BTCUSD_PERP").unwrap();
        params.recompute(
            50_000.0,
            &crate::dynamic::QuoteTuning::from_config(&state.cfg),
        );
    }

    #[test]
    fn ladder_prices_are_strictly_monotonic() {
        let step = 10.0;
        let mut last_buy = f64::MAX;
        let mut last_sell = f64::MIN;
        for i in 1..=20 {
            let buy = ladder_price(50_000.0, i, step, Side::Buy);
            let sell = ladder_price(50_000.0, i, step, Side::Sell);
            assert!(buy < last_buy);
            assert!(sell > last_sell);
            last_buy = buy;
            last_sell = sell;
        }
    }

    #[test]
    fn first_buy_target_at_one_gap_below_bid() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);

        // warm-up: adjusted gap = 0.0002 * 50000 = 10
        let planned = plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms);
        assert!(!planned.is_empty());
        assert_eq!(planned[0].price, 49_990.0);
        assert!(planned.len() <= state.cfg.max_order_one_step);
    }

    #[test]
    fn quoting_suspended_when_risk_not_ok() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);
        state
            .context("BTCUSD_PERP")
            .unwrap()
            .set_risk(crate::context::RiskState::Stale);
        assert!(plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms).is_empty());
    }

    #[test]
    fn quoting_suspended_on_stale_companion() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);
        // evaluate 20s later without a companion refresh
        assert!(plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms + 20_000).is_empty());
    }

    #[test]
    fn in_range_levels_are_not_requoted() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);

        let first = plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms);
        let books = state.side_books("BTCUSD_PERP").unwrap();
        for order in &first {
            let mut o = order.clone();
            o.client_order_id = next_client_order_id();
            books.buy.add(o);
        }
        let second = plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms);
        for order in &second {
            assert!(first.iter().all(|f| (f.price - order.price).abs() > 1e-9));
        }
    }

    #[test]
    fn position_bound_blocks_new_buys() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);
        state.set_position("BTCUSD_PERP", 10.0, None);
        assert!(plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms).is_empty());
        // the sell side is still free to quote
        assert!(!plan_side(&state, "BTCUSD_PERP", Side::Sell, now_ms).is_empty());
    }

    #[test]
    fn unprofitable_ladder_stays_within_hard_cap() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);
        // companion prices far below every buy target: nothing profitable
        let spot = format_price_key("Binance", "BTCUSD_PERP", ProductType::Spot);
        let futures = format_price_key("Binance", "BTCUSD_PERP", ProductType::Futures);
        state
            .prices
            .update(&spot, 40_000.0, 5.0, 40_001.0, 5.0, state.cfg.min_accuracy, now_ms);
        state
            .prices
            .update(&futures, 40_000.0, 5.0, 40_001.0, 5.0, state.cfg.min_accuracy, now_ms);
        // terminates (hard cap) and plans nothing
        assert!(plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms).is_empty());
    }

    #[tokio::test]
    async fn economic_sweep_issues_one_cancel_all() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        // resting buy near the touch
        let books = state.side_books("BTCUSD_PERP").unwrap();
        books.buy.add(Order {
            symbol: "BTCUSD_PERP".to_string(),
            side: Side::Buy,
            price: 49_999.0,
            volume: 1.0,
            client_order_id: "1".to_string(),
            exchange_order_id: String::new(),
            created_at: 0,
            status: OrderStatus::Created,
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            precision: (4, 1),
        });

        // spot collapses: profit ratio goes deeply negative
        let spot = format_price_key("Binance", "BTCUSD_PERP", ProductType::Spot);
        state
            .prices
            .update(&spot, 49_900.0, 5.0, 49_901.0, 5.0, state.cfg.min_accuracy, now_ms);

        cancel_orders(&state, &cmd_tx, "BTCUSD_PERP");
        match cmd_rx.try_recv() {
            Ok(GatewayCommand::CancelAll { symbol }) => assert_eq!(symbol, "BTCUSD_PERP"),
            other => panic!("expected CancelAll, got {:?}", other),
        }

        // within the 200ms spacing the sweep is suppressed
        cancel_orders(&state, &cmd_tx, "BTCUSD_PERP");
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn far_orders_are_cancelled_in_batches() {
        let state = test_state();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let books = state.side_books("BTCUSD_PERP").unwrap();
        // max_order_num = 3; rest 5 buys -> the two lowest are excess
        for i in 0..5 {
            books.buy.add(Order {
                symbol: "BTCUSD_PERP".to_string(),
                side: Side::Buy,
                price: 49_900.0 + i as f64 * 10.0,
                volume: 1.0,
                client_order_id: format!("b{i}"),
                exchange_order_id: String::new(),
                created_at: 0,
                status: OrderStatus::Created,
                base_asset: "BTC".to_string(),
                quote_asset: "USDT".to_string(),
                precision: (4, 1),
            });
        }

        cancel_far_orders(&state, &cmd_tx, "BTCUSD_PERP");
        match cmd_rx.try_recv() {
            Ok(GatewayCommand::CancelByClientIds { ids, .. }) => {
                assert_eq!(ids, vec!["b0".to_string(), "b1".to_string()]);
            }
            other => panic!("expected CancelByClientIds, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dispatch_assigns_ids_and_books_orders() {
        let state = test_state();
        let now_ms = timestamp_ms();
        prime_prices(&state, now_ms);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        let planned = plan_side(&state, "BTCUSD_PERP", Side::Buy, now_ms);
        let count = planned.len();
        assert!(count > 0);
        dispatch_orders(&state, &cmd_tx, planned);

        let books = state.side_books("BTCUSD_PERP").unwrap();
        assert_eq!(books.buy.size(), count);
        for order in books.buy.snapshot() {
            assert!(!order.client_order_id.is_empty());
            assert_eq!(order.status, OrderStatus::New);
        }
        assert!(matches!(
            cmd_rx.try_recv(),
            Ok(GatewayCommand::PlaceLimitPostOnly(_))
        ));
    }
}
