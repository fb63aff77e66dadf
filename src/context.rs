// ===============================
// src/context.rs
// ===============================
//
// All mutable state shared by the periodic tasks lives here, built once at
// startup and handed to every task as Arc<AppState>. Maps are keyed per
// instrument and fixed after construction; the values carry their own locks.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use ahash::AHashMap as HashMap;

use crate::config::Config;
use crate::domain::{timestamp_ms, ProductType};
use crate::dynamic::DynamicParams;
use crate::orderbook::OrderBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RiskState {
    Ok = 0,
    Error = 1,
    Settlement = 2,
    Stale = 3,
    Overleveraged = 4,
}

impl RiskState {
    pub fn from_u8(v: u8) -> RiskState {
        match v {
            1 => RiskState::Error,
            2 => RiskState::Settlement,
            3 => RiskState::Stale,
            4 => RiskState::Overleveraged,
            _ => RiskState::Ok,
        }
    }

    pub fn is_ok(&self) -> bool { matches!(self, RiskState::Ok) }
}

/// Live quoting state of one coin-margined instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolQuote {
    pub bid_price: f64,
    pub bid_volume: f64,
    pub ask_price: f64,
    pub ask_volume: f64,
    pub last_update_ms: i64,
    pub last_cancel_ms: i64,
    pub last_cancel_far_ms: i64,
}

pub struct SymbolContext {
    quote: RwLock<SymbolQuote>,
    risk: AtomicU8,
    /// One cancel-all per stale episode.
    stale_cancelled: AtomicBool,
}

impl SymbolContext {
    pub fn new() -> SymbolContext {
        let quote = SymbolQuote { last_update_ms: timestamp_ms(), ..Default::default() };
        SymbolContext {
            quote: RwLock::new(quote),
            risk: AtomicU8::new(RiskState::Ok as u8),
            stale_cancelled: AtomicBool::new(false),
        }
    }

    /// Apply an own-book top-of-book update. Each side only overwrites when
    /// the price clears `min_accuracy` and the source volume clears the
    /// per-symbol `effective_num`. Returns the relative (buy, sell) deltas so
    /// the dispatcher can decide whether a cancellation sweep is worth it.
    pub fn apply_quote(
        &self,
        bid_price: f64,
        bid_volume: f64,
        ask_price: f64,
        ask_volume: f64,
        min_accuracy: f64,
        effective_num: f64,
        now_ms: i64,
    ) -> (f64, f64) {
        let mut q = self.quote.write().unwrap();
        let mut buy_delta = 0.0;
        let mut sell_delta = 0.0;

        if bid_price > min_accuracy && bid_volume >= effective_num {
            if q.bid_price > min_accuracy {
                buy_delta = (bid_price - q.bid_price).abs() / bid_price;
            }
            q.bid_price = bid_price;
            q.bid_volume = bid_volume;
        }
        if ask_price > min_accuracy && ask_volume >= effective_num {
            if q.ask_price > min_accuracy {
                sell_delta = (ask_price - q.ask_price).abs() / ask_price;
            }
            q.ask_price = ask_price;
            q.ask_volume = ask_volume;
        }
        if bid_price > min_accuracy || ask_price > min_accuracy {
            q.last_update_ms = now_ms;
        }
        (buy_delta, sell_delta)
    }

    pub fn snapshot(&self) -> SymbolQuote {
        *self.quote.read().unwrap()
    }

    /// The spacing gate is checked before a sweep; the timestamp is only
    /// stamped when the sweep actually cancels something, so an idle sweep
    /// does not push back the next eligible one.
    pub fn stamp_cancel(&self, now_ms: i64) {
        self.quote.write().unwrap().last_cancel_ms = now_ms;
    }

    pub fn stamp_cancel_far(&self, now_ms: i64) {
        self.quote.write().unwrap().last_cancel_far_ms = now_ms;
    }

    pub fn risk(&self) -> RiskState {
        RiskState::from_u8(self.risk.load(Ordering::Relaxed))
    }

    pub fn set_risk(&self, state: RiskState) {
        self.risk.store(state as u8, Ordering::Relaxed);
    }

    /// Returns true the first time it is called in a stale episode.
    pub fn begin_stale_cancel(&self) -> bool {
        !self.stale_cancelled.swap(true, Ordering::Relaxed)
    }

    pub fn end_stale_episode(&self) {
        self.stale_cancelled.store(false, Ordering::Relaxed);
    }
}

/// Companion-venue best bid/ask for one instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceItem {
    pub bid_price: f64,
    pub bid_volume: f64,
    pub ask_price: f64,
    pub ask_volume: f64,
    pub last_update_ms: i64,
}

/// Reference prices keyed by exchange_symbol_product. Unknown keys return
/// None; callers treat that as quoting suspended for the instrument.
pub struct PriceBoard {
    items: RwLock<HashMap<String, PriceItem>>,
}

pub fn format_price_key(exchange: &str, symbol: &str, product: ProductType) -> String {
    format!("{}_{}_{}", exchange, symbol, product.as_str())
}

impl PriceBoard {
    pub fn new() -> PriceBoard {
        PriceBoard { items: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, key: String) {
        self.items.write().unwrap().entry(key).or_default();
    }

    /// Bid and ask are applied independently, each gated on the accuracy
    /// floor so a zero/garbage parse never clobbers a good quote. Returns the
    /// relative (buy, sell) deltas; (0, 0) for unregistered keys.
    pub fn update(
        &self,
        key: &str,
        bid_price: f64,
        bid_volume: f64,
        ask_price: f64,
        ask_volume: f64,
        min_accuracy: f64,
        now_ms: i64,
    ) -> (f64, f64) {
        let mut items = self.items.write().unwrap();
        let item = match items.get_mut(key) {
            Some(item) => item,
            None => return (0.0, 0.0),
        };

        let mut buy_delta = 0.0;
        let mut sell_delta = 0.0;
        if bid_price > min_accuracy {
            if item.bid_price > min_accuracy {
                buy_delta = (bid_price - item.bid_price).abs() / bid_price;
            }
            item.bid_price = bid_price;
            item.bid_volume = bid_volume;
        }
        if ask_price > min_accuracy {
            if item.ask_price > min_accuracy {
                sell_delta = (ask_price - item.ask_price).abs() / ask_price;
            }
            item.ask_price = ask_price;
            item.ask_volume = ask_volume;
        }
        if bid_price > min_accuracy || ask_price > min_accuracy {
            item.last_update_ms = now_ms;
        }
        (buy_delta, sell_delta)
    }

    pub fn get(&self, key: &str) -> Option<PriceItem> {
        let items = self.items.read().unwrap();
        items.get(key).filter(|item| item.last_update_ms > 0).copied()
    }
}

/// Net exposure for one instrument; written only from authoritative account
/// events, never inferred from local fills.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionInfo {
    pub position: f64,
    pub position_abs: f64,
    pub margin_balance: f64,
}

pub struct SideBooks {
    pub buy: OrderBook,
    pub sell: OrderBook,
}

pub struct AppState {
    pub cfg: Config,
    pub contexts: HashMap<String, Arc<SymbolContext>>,
    pub prices: PriceBoard,
    pub books: HashMap<String, SideBooks>,
    pub dynamics: HashMap<String, DynamicParams>,
    positions: HashMap<String, RwLock<PositionInfo>>,
    risk: AtomicU8,
    /// futures/spot symbol -> coin-margined symbols it prices (one-to-many).
    pub companion_map: HashMap<String, Vec<String>>,
}

/// BTCUSD_PERP + USDT -> BTCUSDT; same shape for the linear contract and spot.
pub fn format_companion_symbol(delivery_symbol: &str, quote_asset: &str) -> String {
    let head = delivery_symbol
        .split('_')
        .next()
        .unwrap_or(delivery_symbol)
        .to_ascii_uppercase();
    head.replace("USD", quote_asset)
}

impl AppState {
    pub fn new(cfg: Config) -> Arc<AppState> {
        let mut contexts = HashMap::new();
        let mut books = HashMap::new();
        let mut dynamics = HashMap::new();
        let mut positions = HashMap::new();
        let mut companion_map: HashMap<String, Vec<String>> = HashMap::new();
        let prices = PriceBoard::new();

        for symbol in &cfg.symbols {
            contexts.insert(symbol.clone(), Arc::new(SymbolContext::new()));
            books.insert(
                symbol.clone(),
                SideBooks { buy: OrderBook::new(), sell: OrderBook::new() },
            );
            dynamics.insert(symbol.clone(), DynamicParams::new(cfg.forgive_percent));
            positions.insert(symbol.clone(), RwLock::new(PositionInfo::default()));

            let symbol_cfg = cfg.symbol(symbol);
            let companion = format_companion_symbol(symbol, &symbol_cfg.quote_asset);
            companion_map.entry(companion).or_default().push(symbol.clone());

            prices.register(format_price_key(&cfg.exchange, symbol, ProductType::Spot));
            prices.register(format_price_key(&cfg.exchange, symbol, ProductType::Futures));
        }

        Arc::new(AppState {
            cfg,
            contexts,
            prices,
            books,
            dynamics,
            positions,
            risk: AtomicU8::new(RiskState::Ok as u8),
            companion_map,
        })
    }

    pub fn context(&self, symbol: &str) -> Option<&Arc<SymbolContext>> {
        self.contexts.get(symbol)
    }

    pub fn side_books(&self, symbol: &str) -> Option<&SideBooks> {
        self.books.get(symbol)
    }

    pub fn position(&self, symbol: &str) -> PositionInfo {
        self.positions
            .get(symbol)
            .map(|p| *p.read().unwrap())
            .unwrap_or_default()
    }

    pub fn set_position(&self, symbol: &str, position: f64, margin_balance: Option<f64>) {
        if let Some(slot) = self.positions.get(symbol) {
            let mut p = slot.write().unwrap();
            p.position = position;
            p.position_abs = position.abs();
            if let Some(balance) = margin_balance {
                p.margin_balance = balance;
            }
        }
    }

    pub fn global_risk(&self) -> RiskState {
        RiskState::from_u8(self.risk.load(Ordering::Relaxed))
    }

    pub fn set_global_risk(&self, state: RiskState) {
        self.risk.store(state as u8, Ordering::Relaxed);
    }

    /// Find a live order by client id, searching both sides.
    pub fn find_order(&self, symbol: &str, client_order_id: &str) -> Option<crate::domain::Order> {
        let books = self.books.get(symbol)?;
        books
            .buy
            .snapshot()
            .into_iter()
            .chain(books.sell.snapshot())
            .find(|o| o.client_order_id == client_order_id)
    }

    pub fn spot_item(&self, symbol: &str) -> Option<PriceItem> {
        self.prices
            .get(&format_price_key(&self.cfg.exchange, symbol, ProductType::Spot))
    }

    pub fn futures_item(&self, symbol: &str) -> Option<PriceItem> {
        self.prices
            .get(&format_price_key(&self.cfg.exchange, symbol, ProductType::Futures))
    }
}
