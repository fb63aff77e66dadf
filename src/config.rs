// ===============================
// src/config.rs
// ===============================
use std::env;
use std::path::PathBuf;

use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use serde::Deserialize;

/// Where market data / order flow comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl MarketMode {
    pub fn from_env(key: &str, default_mode: MarketMode) -> MarketMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock"            => MarketMode::Mock,
            "binance_sandbox" => MarketMode::BinanceSandbox,
            "binance_mainnet" => MarketMode::BinanceMainnet,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock => "mock",
            MarketMode::BinanceSandbox => "binance_sandbox",
            MarketMode::BinanceMainnet => "binance_mainnet",
        }
    }

    // Coin-margined (delivery) endpoints; sandbox = Binance testnet.
    pub fn default_delivery_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock => "wss://dstream.binancefuture.com/ws",
            MarketMode::BinanceSandbox => "wss://dstream.binancefuture.com/ws",
            MarketMode::BinanceMainnet => "wss://dstream.binance.com/ws",
        }
    }

    pub fn default_delivery_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock => "https://testnet.binancefuture.com",
            MarketMode::BinanceSandbox => "https://testnet.binancefuture.com",
            MarketMode::BinanceMainnet => "https://dapi.binance.com",
        }
    }

    pub fn default_futures_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock => "wss://stream.binancefuture.com/ws",
            MarketMode::BinanceSandbox => "wss://stream.binancefuture.com/ws",
            MarketMode::BinanceMainnet => "wss://fstream.binance.com/ws",
        }
    }

    pub fn default_spot_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock => "wss://testnet.binance.vision/ws",
            MarketMode::BinanceSandbox => "wss://testnet.binance.vision/ws",
            MarketMode::BinanceMainnet => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn default_spot_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock => "https://testnet.binance.vision",
            MarketMode::BinanceSandbox => "https://testnet.binance.vision",
            MarketMode::BinanceMainnet => "https://api.binance.com",
        }
    }
}

/// What to do with an API call when the token bucket is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitProcess {
    /// Sleep until a token is available.
    Wait,
    /// Drop the call; placements fail, cancels are retried by the next sweep.
    Drop,
}

impl Default for LimitProcess {
    fn default() -> Self { LimitProcess::Drop }
}

#[derive(Parser, Debug)]
#[command(name = "basis_bot_rust", about = "coin-margined quoting / basis arbitrage engine")]
pub struct Cli {
    /// Path to the JSON config file.
    pub config: PathBuf,
}

/// Runtime knobs taken from the environment, not the config file.
#[derive(Clone, Debug)]
pub struct Args {
    pub feed_mode: MarketMode,
    pub venue_mode: MarketMode,
    pub metrics_port: u16,
    pub record_file: Option<String>,

    pub delivery_ws_url: String,
    pub delivery_rest_url: String,
    pub futures_ws_url: String,
    pub spot_ws_url: String,
    pub spot_rest_url: String,

    pub binance_api_key: String,
    pub binance_api_secret: String,
}

/// Static per-instrument parameters; immutable after load.
#[derive(Clone, Debug, Deserialize)]
pub struct SymbolConfig {
    /// Contracts per quoted order.
    pub contract_num: f64,
    pub base_asset: String,
    pub quote_asset: String,
    /// Quote value of one contract (BTC contracts are 100 USD, most others 10).
    pub cont: f64,
    pub leverage: f64,
    /// Position bound in contracts, each side.
    pub max_contract_num: f64,
    /// Fills below this many contracts are not worth hedging.
    pub min_hedge_size: f64,
    /// (volume decimals, price decimals)
    pub precision: (u32, u32),
    /// Minimum source volume for a quote to overwrite our own best bid/ask.
    pub effective_num: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    // alerting
    #[serde(default)]
    pub tg_bot_token: Option<String>,
    #[serde(default)]
    pub tg_chat_id: i64,
    #[serde(default = "default_alert_interval_ms")]
    pub alert_interval_ms: i64,

    // API budget
    #[serde(default = "default_api_limit")]
    pub api_limit: u32,
    #[serde(default)]
    pub limit_process: LimitProcess,

    // quoting universe
    pub exchange: String,
    pub symbols: Vec<String>,
    pub symbol_configs: HashMap<String, SymbolConfig>,

    // ladder shape
    #[serde(default = "default_max_order_num")]
    pub max_order_num: usize,
    #[serde(default = "default_max_order_one_step")]
    pub max_order_one_step: usize,
    #[serde(default = "default_gap_size_percent")]
    pub gap_size_percent: f64,
    /// Ladder step multiplier applied on top of the adjusted gap size.
    #[serde(default = "default_gap_size_k")]
    pub gap_size_k: f64,
    #[serde(default = "default_spread_times")]
    pub spread_times: f64,

    // adaptive profitability bar
    #[serde(default = "default_forgive_percent")]
    pub forgive_percent: f64,
    #[serde(default = "default_exponent_base")]
    pub exponent_base: f64,
    #[serde(default = "default_exponent_power")]
    pub exponent_power: f64,
    #[serde(default = "default_denominator")]
    pub denominator: f64,

    // inventory shaping
    #[serde(default)]
    pub ticker_shift: f64,
    #[serde(default)]
    pub cancel_shift: f64,
    #[serde(default = "default_commission")]
    pub commission: f64,
    #[serde(default)]
    pub loss: f64,

    // behavior toggles & thresholds
    #[serde(default)]
    pub function_hedge: bool,
    #[serde(default = "default_max_errors_per_minute")]
    pub max_errors_per_minute: u64,
    #[serde(default = "default_min_delta_rate")]
    pub min_delta_rate: f64,
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f64,
    /// Companion-venue quotes older than this suspend quoting.
    #[serde(default = "default_companion_stale_ms")]
    pub companion_stale_ms: i64,
}

fn default_alert_interval_ms() -> i64 { 1_000 }
fn default_api_limit() -> u32 { 20 }
fn default_max_order_num() -> usize { 5 }
fn default_max_order_one_step() -> usize { 2 }
fn default_gap_size_percent() -> f64 { 0.0002 }
fn default_gap_size_k() -> f64 { 1.0 }
fn default_spread_times() -> f64 { 10.0 }
fn default_forgive_percent() -> f64 { 1.0005 }
fn default_exponent_base() -> f64 { 100.0 }
fn default_exponent_power() -> f64 { 0.75 }
fn default_denominator() -> f64 { 4.0 }
fn default_commission() -> f64 { 0.0001 }
fn default_max_errors_per_minute() -> u64 { 50 }
fn default_min_delta_rate() -> f64 { 0.00005 }
fn default_min_accuracy() -> f64 { 0.0001 }
fn default_companion_stale_ms() -> i64 { 10_000 }

impl Config {
    pub fn load(path: &PathBuf) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        let cfg: Config = serde_json::from_str(&raw)?;
        for symbol in &cfg.symbols {
            if !cfg.symbol_configs.contains_key(symbol) {
                return Err(ConfigError::MissingSymbol(symbol.clone()));
            }
        }
        Ok(cfg)
    }

    pub fn symbol(&self, symbol: &str) -> &SymbolConfig {
        // load() guarantees every configured symbol has an entry
        &self.symbol_configs[symbol]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("symbol {0} listed but has no symbol_configs entry")]
    MissingSymbol(String),
}

pub fn load_args() -> Args {
    let _ = dotenv();

    let feed_mode = MarketMode::from_env("FEED_MODE", MarketMode::Mock);
    let venue_mode = MarketMode::from_env("VENUE_MODE", MarketMode::Mock);

    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);
    let record_file = env::var("RECORD_FILE").ok();

    let delivery_ws_url = env::var("DELIVERY_WS_URL")
        .unwrap_or_else(|_| feed_mode.default_delivery_ws_url().to_string());
    let delivery_rest_url = env::var("DELIVERY_REST_URL")
        .unwrap_or_else(|_| venue_mode.default_delivery_rest_url().to_string());
    let futures_ws_url = env::var("FUTURES_WS_URL")
        .unwrap_or_else(|_| feed_mode.default_futures_ws_url().to_string());
    let spot_ws_url = env::var("SPOT_WS_URL")
        .unwrap_or_else(|_| feed_mode.default_spot_ws_url().to_string());
    let spot_rest_url = env::var("SPOT_REST_URL")
        .unwrap_or_else(|_| venue_mode.default_spot_rest_url().to_string());

    let binance_api_key = env::var("BINANCE_API_KEY").unwrap_or_default();
    let binance_api_secret = env::var("BINANCE_API_SECRET").unwrap_or_default();

    Args {
        feed_mode,
        venue_mode,
        metrics_port,
        record_file,
        delivery_ws_url,
        delivery_rest_url,
        futures_ws_url,
        spot_ws_url,
        spot_rest_url,
        binance_api_key,
        binance_api_secret,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
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
                    "effective_num": 5.0
                }
            },
            "ticker_shift": 0.0001,
            "cancel_shift": 0.0002,
            "function_hedge": true
        }"#
    }

    #[test]
    fn parses_config_with_defaults() {
        let cfg: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSD_PERP"]);
        assert_eq!(cfg.max_order_num, 5);
        assert_eq!(cfg.gap_size_percent, 0.0002);
        assert_eq!(cfg.limit_process, LimitProcess::Drop);
        assert!(cfg.function_hedge);
        let sym = cfg.symbol("BTCUSD_PERP");
        assert_eq!(sym.cont, 100.0);
        assert_eq!(sym.precision, (4, 1));
    }

    #[test]
    fn rejects_symbol_without_config_entry() {
        let mut cfg: Config = serde_json::from_str(sample_json()).unwrap();
        cfg.symbols.push("ETHUSD_PERP".to_string());
        // same check load() applies
        assert!(!cfg.symbol_configs.contains_key("ETHUSD_PERP"));
    }
}
