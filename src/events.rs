// ===============================
// src/events.rs
// ===============================
//
// Single-consumer dispatcher over the typed inbound channels. Price updates
// carry a per-stream sequence id; anything not strictly newer than the last
// applied id for that stream is dropped, which makes redelivery safe.

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::{format_companion_symbol, format_price_key, AppState};
use crate::domain::{
    next_client_order_id, round_to, timestamp_ms, AccountUpdate, Event, GatewayCommand, Order,
    OrderStatus, OrderUpdate, PriceUpdate, ProductType, Side,
};
use crate::metrics::{
    FILLS, HEDGES, ORDER_EVENTS, POSITION, PRICE_EVENTS, PRICE_EVENTS_DROPPED,
};
use crate::{quoter, risk};

pub struct EventDispatcher {
    state: Arc<AppState>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    alert_tx: mpsc::Sender<String>,
    rec_tx: Option<mpsc::Sender<Event>>,
    /// Last applied sequence id per inbound stream (exchange_symbol_product).
    last_price_ids: HashMap<String, i64>,
}

impl EventDispatcher {
    pub fn new(
        state: Arc<AppState>,
        cmd_tx: mpsc::Sender<GatewayCommand>,
        alert_tx: mpsc::Sender<String>,
        rec_tx: Option<mpsc::Sender<Event>>,
    ) -> EventDispatcher {
        EventDispatcher { state, cmd_tx, alert_tx, rec_tx, last_price_ids: HashMap::new() }
    }

    fn record(&self, event: Event) {
        if let Some(tx) = &self.rec_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Returns false when the update was discarded by the sequence-id gate.
    pub fn on_price(&mut self, upd: PriceUpdate) -> bool {
        let stream = format_price_key(&upd.exchange, &upd.symbol, upd.product);
        let last = self.last_price_ids.entry(stream).or_insert(i64::MIN);
        if upd.update_id <= *last {
            PRICE_EVENTS_DROPPED.inc();
            return false;
        }
        *last = upd.update_id;
        PRICE_EVENTS.with_label_values(&[upd.product.as_str()]).inc();

        let cfg = &self.state.cfg;
        let now_ms = timestamp_ms();
        match upd.product {
            ProductType::Delivery => {
                let Some(ctx) = self.state.context(&upd.symbol) else { return true };
                let effective_num = cfg.symbol(&upd.symbol).effective_num;
                let (buy_delta, sell_delta) = ctx.apply_quote(
                    upd.bid_price,
                    upd.bid_volume,
                    upd.ask_price,
                    upd.ask_volume,
                    cfg.min_accuracy,
                    effective_num,
                    now_ms,
                );
                debug!(
                    symbol = %upd.symbol,
                    bid = upd.bid_price,
                    ask = upd.ask_price,
                    "delivery book ticker"
                );
                if buy_delta > cfg.min_delta_rate || sell_delta > cfg.min_delta_rate {
                    quoter::cancel_orders(&self.state, &self.cmd_tx, &upd.symbol);
                }
            }
            ProductType::Futures | ProductType::Spot => {
                // a futures/spot symbol can price several coin-margined
                // instruments (perp + dated contracts)
                let Some(delivery_symbols) =
                    self.state.companion_map.get(&upd.symbol).cloned()
                else {
                    return true;
                };
                for symbol in delivery_symbols {
                    let key = format_price_key(&cfg.exchange, &symbol, upd.product);
                    let (buy_delta, sell_delta) = self.state.prices.update(
                        &key,
                        upd.bid_price,
                        upd.bid_volume,
                        upd.ask_price,
                        upd.ask_volume,
                        cfg.min_accuracy,
                        now_ms,
                    );
                    if buy_delta > cfg.min_delta_rate || sell_delta > cfg.min_delta_rate {
                        quoter::cancel_orders(&self.state, &self.cmd_tx, &symbol);
                    }
                }
            }
        }
        true
    }

    pub fn on_order(&mut self, upd: OrderUpdate) {
        let status_label = format!("{:?}", upd.status);
        ORDER_EVENTS.with_label_values(&[status_label.as_str()]).inc();
        self.record(Event::Order(upd.clone()));

        let Some(books) = self.state.side_books(&upd.symbol) else {
            // fills of hedge orders come back on the spot symbol
            debug!(symbol = %upd.symbol, "order event for unmanaged symbol");
            return;
        };
        let book = match upd.side {
            Side::Buy => &books.buy,
            Side::Sell => &books.sell,
        };
        let now_s = timestamp_ms() / 1_000;

        match upd.status {
            OrderStatus::Create => {
                book.set_exchange_order_id(&upd.client_order_id, &upd.exchange_order_id);
                book.update_status(&upd.client_order_id, OrderStatus::Create);
            }
            OrderStatus::Created => {
                if book.update_status(&upd.client_order_id, OrderStatus::Created).is_none()
                    && book.recently_cancelled(&upd.client_order_id)
                {
                    // ack raced the removal; the grace cache lets us drop it
                    debug!(client_id = %upd.client_order_id, "late ack for removed order");
                }
            }
            OrderStatus::Cancel => {
                book.update_status(&upd.client_order_id, OrderStatus::Cancel);
            }
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                let quote = self
                    .state
                    .context(&upd.symbol)
                    .map(|c| c.snapshot())
                    .unwrap_or_default();
                info!(
                    symbol = %upd.symbol,
                    side = upd.side.as_str(),
                    client_id = %upd.client_order_id,
                    filled_price = upd.filled_price,
                    filled_volume = upd.filled_volume,
                    bid = quote.bid_price,
                    ask = quote.ask_price,
                    "op=Fill"
                );
                FILLS.inc();
                self.dispatch_hedge(&upd);
                if upd.status == OrderStatus::Filled {
                    book.update_status(&upd.client_order_id, OrderStatus::Filled);
                    book.delete_by_client_order_id(&upd.client_order_id, now_s);
                } else {
                    book.update_status(&upd.client_order_id, OrderStatus::PartiallyFilled);
                }
            }
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Failed => {
                if upd.status == OrderStatus::Failed {
                    warn!(client_id = %upd.client_order_id, "op=Failed, {}", upd.symbol);
                }
                book.update_status(&upd.client_order_id, upd.status);
                book.delete_by_client_order_id(&upd.client_order_id, now_s);
            }
            OrderStatus::New => {}
        }
    }

    /// Offset a (partial) fill with a market order on the companion spot
    /// venue. Skipped for dust fills below the instrument minimum.
    fn dispatch_hedge(&self, upd: &OrderUpdate) {
        let cfg = &self.state.cfg;
        if !cfg.function_hedge {
            return;
        }
        let Some(symbol_cfg) = cfg.symbol_configs.get(&upd.symbol) else { return };
        if upd.filled_volume < symbol_cfg.min_hedge_size {
            debug!(
                symbol = %upd.symbol,
                filled = upd.filled_volume,
                min = symbol_cfg.min_hedge_size,
                "fill below hedge minimum"
            );
            return;
        }
        let Some(spot) = self.state.spot_item(&upd.symbol) else { return };

        let hedge_side = upd.side.hedge();
        let price = match hedge_side {
            Side::Buy => spot.bid_price,
            Side::Sell => spot.ask_price,
        };
        if price < cfg.min_accuracy {
            return;
        }
        // contracts -> base-asset amount at the current spot reference
        let amount = round_to(
            upd.filled_volume * symbol_cfg.cont / price,
            symbol_cfg.precision.0,
        );
        if amount <= 0.0 {
            return;
        }

        let order = Order {
            symbol: format_companion_symbol(&upd.symbol, &symbol_cfg.quote_asset),
            side: hedge_side,
            price,
            volume: amount,
            client_order_id: next_client_order_id(),
            exchange_order_id: String::new(),
            created_at: timestamp_ms() / 1_000,
            status: OrderStatus::New,
            base_asset: symbol_cfg.base_asset.clone(),
            quote_asset: symbol_cfg.quote_asset.clone(),
            precision: symbol_cfg.precision,
        };
        info!("op=Hedge, {}", order.format());
        if self
            .cmd_tx
            .try_send(GatewayCommand::PlaceMarket(order))
            .is_ok()
        {
            HEDGES.inc();
        } else {
            warn!(symbol = %upd.symbol, "gateway queue full, hedge dropped");
        }
    }

    pub fn on_account(&mut self, upd: AccountUpdate) {
        self.record(Event::Account(upd.clone()));
        self.state
            .set_position(&upd.symbol, upd.position, upd.margin_balance);
        POSITION.with_label_values(&[&upd.symbol]).set(upd.position);
        info!(
            symbol = %upd.symbol,
            position = upd.position,
            margin = ?upd.margin_balance,
            "position update"
        );
        risk::check_leverage(&self.state, &self.cmd_tx, &self.alert_tx);
    }

    pub async fn run(
        mut self,
        mut price_rx: mpsc::Receiver<PriceUpdate>,
        mut order_rx: mpsc::Receiver<OrderUpdate>,
        mut account_rx: mpsc::Receiver<AccountUpdate>,
    ) {
        loop {
            tokio::select! {
                Some(upd) = price_rx.recv() => { self.on_price(upd); }
                Some(upd) = order_rx.recv() => { self.on_order(upd); }
                Some(upd) = account_rx.recv() => { self.on_account(upd); }
                else => {
                    warn!("event channels closed, dispatcher stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

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
                        "min_hedge_size": 2.0,
                        "precision": [4, 1],
                        "effective_num": 0.0
                    }
                },
                "function_hedge": true
            }"#,
        )
        .unwrap();
        AppState::new(cfg)
    }

    fn dispatcher(
        state: Arc<AppState>,
    ) -> (EventDispatcher, mpsc::Receiver<GatewayCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (alert_tx, _alert_rx) = mpsc::channel(16);
        (EventDispatcher::new(state, cmd_tx, alert_tx, None), cmd_rx)
    }

    fn price(update_id: i64, bid: f64, ask: f64) -> PriceUpdate {
        PriceUpdate {
            exchange: "Binance".to_string(),
            symbol: "BTCUSD_PERP".to_string(),
            product: ProductType::Delivery,
            bid_price: bid,
            bid_volume: 10.0,
            ask_price: ask,
            ask_volume: 10.0,
            update_id,
            ts_ms: 0,
        }
    }

    fn booked(state: &AppState, id: &str, side: Side, status: OrderStatus) {
        let books = state.side_books("BTCUSD_PERP").unwrap();
        let book = match side {
            Side::Buy => &books.buy,
            Side::Sell => &books.sell,
        };
        book.add(Order {
            symbol: "BTCUSD_PERP".to_string(),
            side,
            price: 50_000.0,
            volume: 1.0,
            client_order_id: id.to_string(),
            exchange_order_id: String::new(),
            created_at: 0,
            status,
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            precision: (4, 1),
        });
    }

    fn order_event(id: &str, side: Side, status: OrderStatus, filled: f64) -> OrderUpdate {
        OrderUpdate {
            exchange: "Binance".to_string(),
            symbol: "BTCUSD_PERP".to_string(),
            client_order_id: id.to_string(),
            exchange_order_id: "77".to_string(),
            side,
            status,
            filled_price: 50_000.0,
            filled_volume: filled,
        }
    }

    #[tokio::test]
    async fn stale_sequence_ids_are_discarded() {
        let state = test_state();
        let (mut disp, _cmd_rx) = dispatcher(state.clone());

        assert!(disp.on_price(price(5, 50_000.0, 50_001.0)));
        let before = state.context("BTCUSD_PERP").unwrap().snapshot();

        // same id and an older id leave the context untouched
        assert!(!disp.on_price(price(5, 60_000.0, 60_001.0)));
        assert!(!disp.on_price(price(4, 60_000.0, 60_001.0)));
        let after = state.context("BTCUSD_PERP").unwrap().snapshot();
        assert_eq!(before.bid_price, after.bid_price);
        assert_eq!(before.ask_price, after.ask_price);

        assert!(disp.on_price(price(6, 50_010.0, 50_011.0)));
        assert_eq!(
            state.context("BTCUSD_PERP").unwrap().snapshot().bid_price,
            50_010.0
        );
    }

    #[tokio::test]
    async fn companion_updates_fan_out_by_symbol_map() {
        let state = test_state();
        let (mut disp, _cmd_rx) = dispatcher(state.clone());
        let upd = PriceUpdate {
            exchange: "Binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            product: ProductType::Spot,
            bid_price: 50_050.0,
            bid_volume: 3.0,
            ask_price: 50_051.0,
            ask_volume: 3.0,
            update_id: 1,
            ts_ms: 0,
        };
        assert!(disp.on_price(upd));
        let item = state.spot_item("BTCUSD_PERP").unwrap();
        assert_eq!(item.bid_price, 50_050.0);
        assert_eq!(item.ask_price, 50_051.0);
    }

    #[tokio::test]
    async fn order_ack_and_fill_reconcile_the_book() {
        let state = test_state();
        let (mut disp, _cmd_rx) = dispatcher(state.clone());
        booked(&state, "1", Side::Buy, OrderStatus::New);

        disp.on_order(order_event("1", Side::Buy, OrderStatus::Create, 0.0));
        let books = state.side_books("BTCUSD_PERP").unwrap();
        assert_eq!(books.buy.snapshot()[0].status, OrderStatus::Create);
        assert_eq!(books.buy.snapshot()[0].exchange_order_id, "77");

        disp.on_order(order_event("1", Side::Buy, OrderStatus::Created, 0.0));
        assert_eq!(books.buy.snapshot()[0].status, OrderStatus::Created);

        disp.on_order(order_event("1", Side::Buy, OrderStatus::Filled, 1.0));
        assert_eq!(books.buy.size(), 0);
        assert!(books.buy.recently_cancelled("1"));
    }

    #[tokio::test]
    async fn failed_placement_is_removed_without_retry() {
        let state = test_state();
        let (mut disp, _cmd_rx) = dispatcher(state.clone());
        booked(&state, "9", Side::Sell, OrderStatus::New);

        disp.on_order(order_event("9", Side::Sell, OrderStatus::Failed, 0.0));
        let books = state.side_books("BTCUSD_PERP").unwrap();
        assert_eq!(books.sell.size(), 0);
    }

    #[tokio::test]
    async fn fills_above_minimum_trigger_a_spot_hedge() {
        let state = test_state();
        let (mut disp, mut cmd_rx) = dispatcher(state.clone());
        booked(&state, "1", Side::Buy, OrderStatus::Created);

        // spot reference for hedge pricing
        let key = format_price_key("Binance", "BTCUSD_PERP", ProductType::Spot);
        state
            .prices
            .update(&key, 50_000.0, 5.0, 50_002.0, 5.0, state.cfg.min_accuracy, 1_000);

        // dust fill: below min_hedge_size = 2 contracts, no hedge
        disp.on_order(order_event("1", Side::Buy, OrderStatus::PartiallyFilled, 1.0));
        assert!(cmd_rx.try_recv().is_err());

        // a full fill of 2 contracts hedges sell-side at the spot ask
        disp.on_order(order_event("1", Side::Buy, OrderStatus::Filled, 2.0));
        match cmd_rx.try_recv() {
            Ok(GatewayCommand::PlaceMarket(order)) => {
                assert_eq!(order.symbol, "BTCUSDT");
                assert_eq!(order.side, Side::Sell);
                assert_eq!(order.price, 50_002.0);
                // 2 contracts * 100 USD / 50002 rounded to 4 decimals
                assert_eq!(order.volume, round_to(200.0 / 50_002.0, 4));
            }
            other => panic!("expected PlaceMarket, got {:?}", other),
        }
    }
}
