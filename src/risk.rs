// ===============================
// src/risk.rs
// ===============================
//
// Risk gates in front of all order placement. Per-symbol staleness recovers
// on its own; the global error-rate halt is sticky and needs an operator;
// the leverage halt clears itself once every instrument is back under its
// configured maximum.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::layer::{Context, Layer};

use crate::context::{AppState, RiskState};
use crate::domain::{timestamp_ms, GatewayCommand};
use crate::metrics::{CANCEL_ALLS, ERRORS_LAST_MINUTE, RISK_STATE};

pub const STALE_SUSPEND_MS: i64 = 1_000;
pub const STALE_CANCEL_MS: i64 = 10_000;
pub const STALENESS_INTERVAL_MS: u64 = 100;
pub const ERROR_CHECK_INTERVAL_S: u64 = 60;

/// Counts ERROR-level log events; the per-minute check drains it. This is the
/// subscriber-side equivalent of grepping the last minute of the log file.
pub struct ErrorRateLayer {
    count: Arc<AtomicU64>,
}

impl ErrorRateLayer {
    pub fn new(count: Arc<AtomicU64>) -> ErrorRateLayer {
        ErrorRateLayer { count }
    }
}

impl<S: tracing::Subscriber> Layer<S> for ErrorRateLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Delivery contracts settle every 8 hours; quoting pauses for a few minutes
/// around 00:00, 08:00 and 16:00 UTC.
pub fn is_settlement(ts_s: i64) -> bool {
    let tmp = (ts_s + 60).rem_euclid(60 * 60 * 24);
    (0..=3 * 60).contains(&tmp)
        || (8 * 3600..=8 * 3600 + 3 * 60).contains(&tmp)
        || (16 * 3600..=16 * 3600 + 3 * 60).contains(&tmp)
}

fn send_alert(alert_tx: &mpsc::Sender<String>, message: String) {
    let _ = alert_tx.try_send(message);
}

/// One staleness pass over every instrument. >1s without an own-book update
/// suspends quoting for the symbol; >10s additionally cancels its resting
/// orders, once per episode. Fresh prices clear the suspension.
pub fn check_staleness(
    state: &AppState,
    cmd_tx: &mpsc::Sender<GatewayCommand>,
    alert_tx: &mpsc::Sender<String>,
    now_ms: i64,
) {
    for symbol in &state.cfg.symbols {
        let Some(ctx) = state.context(symbol) else { continue };
        let diff = now_ms - ctx.snapshot().last_update_ms;
        if diff > STALE_SUSPEND_MS {
            if diff > STALE_CANCEL_MS && ctx.begin_stale_cancel() {
                warn!(symbol = %symbol, diff, "price not updated in 10s, cancelling orders");
                let _ = cmd_tx.try_send(GatewayCommand::CancelAll { symbol: symbol.clone() });
                CANCEL_ALLS.with_label_values(&["stale"]).inc();
            }
            if ctx.risk() == RiskState::Ok {
                ctx.set_risk(RiskState::Stale);
                RISK_STATE
                    .with_label_values(&[symbol])
                    .set(RiskState::Stale as i64);
                warn!(symbol = %symbol, "quoting suspended, price stale >1s");
                send_alert(alert_tx, format!("{symbol}: quoting suspended, stale prices"));
            }
        } else if ctx.risk() == RiskState::Stale {
            ctx.set_risk(RiskState::Ok);
            ctx.end_stale_episode();
            RISK_STATE
                .with_label_values(&[symbol])
                .set(RiskState::Ok as i64);
            warn!(symbol = %symbol, "price updates resumed, quoting re-enabled");
            send_alert(alert_tx, format!("{symbol}: price updates resumed"));
        }
    }
}

/// Flip the global flag into and out of the settlement window. Sticky states
/// (Error, Overleveraged) are never touched here.
pub fn check_settlement_gate(state: &AppState, now_s: i64) {
    match (state.global_risk(), is_settlement(now_s)) {
        (RiskState::Ok, true) => {
            info!("settlement window entered, quoting paused");
            state.set_global_risk(RiskState::Settlement);
            RISK_STATE
                .with_label_values(&["global"])
                .set(RiskState::Settlement as i64);
        }
        (RiskState::Settlement, false) => {
            info!("settlement window left, quoting resumed");
            state.set_global_risk(RiskState::Ok);
            RISK_STATE
                .with_label_values(&["global"])
                .set(RiskState::Ok as i64);
        }
        _ => {}
    }
}

pub async fn run_staleness(
    state: Arc<AppState>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    alert_tx: mpsc::Sender<String>,
) {
    let mut tick = interval(Duration::from_millis(STALENESS_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let now_ms = timestamp_ms();
        check_staleness(&state, &cmd_tx, &alert_tx, now_ms);
        check_settlement_gate(&state, now_ms / 1_000);
    }
}

/// One error-rate evaluation. Over the limit: hard stop, cancel everything,
/// alert. There is no automatic recovery from Error.
pub fn evaluate_error_rate(
    state: &AppState,
    cmd_tx: &mpsc::Sender<GatewayCommand>,
    alert_tx: &mpsc::Sender<String>,
    count: u64,
    now_s: i64,
) {
    ERRORS_LAST_MINUTE.set(count as i64);
    if is_settlement(now_s) {
        return;
    }
    if count > state.cfg.max_errors_per_minute && state.global_risk() == RiskState::Ok {
        warn!(count, max = state.cfg.max_errors_per_minute, "error rate over limit, halting");
        state.set_global_risk(RiskState::Error);
        RISK_STATE
            .with_label_values(&["global"])
            .set(RiskState::Error as i64);
        for symbol in &state.cfg.symbols {
            let _ = cmd_tx.try_send(GatewayCommand::CancelAll { symbol: symbol.clone() });
            CANCEL_ALLS.with_label_values(&["error_rate"]).inc();
        }
        send_alert(
            alert_tx,
            format!("quoting halted: {count} errors in the last minute"),
        );
    }
}

pub async fn run_error_check(
    state: Arc<AppState>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    alert_tx: mpsc::Sender<String>,
    counter: Arc<AtomicU64>,
) {
    let mut tick = interval(Duration::from_secs(ERROR_CHECK_INTERVAL_S));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately
    loop {
        tick.tick().await;
        let count = counter.swap(0, Ordering::Relaxed);
        evaluate_error_rate(&state, &cmd_tx, &alert_tx, count, timestamp_ms() / 1_000);
    }
}

/// Notional leverage actually used for one instrument, in multiples of the
/// margin balance. None when the inputs cannot support the computation.
pub fn realized_leverage(
    position_abs: f64,
    cont: f64,
    spot_bid: f64,
    margin_balance: f64,
) -> Option<f64> {
    if margin_balance <= 0.0 || spot_bid <= 0.0 {
        return None;
    }
    Some(position_abs * cont / (spot_bid * margin_balance))
}

fn symbol_over_levered(state: &AppState, symbol: &str) -> bool {
    let symbol_cfg = state.cfg.symbol(symbol);
    let position = state.position(symbol);
    let Some(spot) = state.spot_item(symbol) else { return false };
    match realized_leverage(
        position.position_abs,
        symbol_cfg.cont,
        spot.bid_price,
        position.margin_balance,
    ) {
        Some(lev) => lev > symbol_cfg.leverage,
        None => false,
    }
}

/// Called on every authoritative position update. Any instrument over its
/// configured leverage halts quoting globally; the halt clears only when all
/// instruments are back under.
pub fn check_leverage(
    state: &AppState,
    cmd_tx: &mpsc::Sender<GatewayCommand>,
    alert_tx: &mpsc::Sender<String>,
) {
    match state.global_risk() {
        RiskState::Ok => {
            for symbol in &state.cfg.symbols {
                if symbol_over_levered(state, symbol) {
                    error!(symbol = %symbol, "leverage over configured max, halting");
                    state.set_global_risk(RiskState::Overleveraged);
                    RISK_STATE
                        .with_label_values(&["global"])
                        .set(RiskState::Overleveraged as i64);
                    for s in &state.cfg.symbols {
                        let _ = cmd_tx.try_send(GatewayCommand::CancelAll { symbol: s.clone() });
                        CANCEL_ALLS.with_label_values(&["leverage"]).inc();
                    }
                    send_alert(alert_tx, format!("{symbol}: leverage over max, quoting halted"));
                    return;
                }
            }
        }
        RiskState::Overleveraged => {
            let all_under = state
                .cfg
                .symbols
                .iter()
                .all(|s| !symbol_over_levered(state, s));
            if all_under {
                warn!("leverage back under max for every instrument, resuming");
                state.set_global_risk(RiskState::Ok);
                RISK_STATE
                    .with_label_values(&["global"])
                    .set(RiskState::Ok as i64);
                send_alert(alert_tx, "leverage recovered, quoting resumed".to_string());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::format_price_key;
    use crate::domain::ProductType;

    fn test_state(max_errors: u64) -> Arc<AppState> {
        let cfg: Config = serde_json::from_str(&format!(
            r#"{{
                "exchange": "Binance",
                "symbols": ["BTCUSD_PERP"],
                "symbol_configs": {{
                    "BTCUSD_PERP": {{
                        "contract_num": 1.0,
                        "base_asset": "BTC",
                        "quote_asset": "USDT",
                        "cont": 100.0,
                        "leverage": 20.0,
                        "max_contract_num": 10.0,
                        "min_hedge_size": 1.0,
                        "precision": [4, 1],
                        "effective_num": 0.0
                    }}
                }},
                "max_errors_per_minute": {max_errors}
            }}"#
        ))
        .unwrap();
        AppState::new(cfg)
    }

    fn channels() -> (
        mpsc::Sender<GatewayCommand>,
        mpsc::Receiver<GatewayCommand>,
        mpsc::Sender<String>,
        mpsc::Receiver<String>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (alert_tx, alert_rx) = mpsc::channel(16);
        (cmd_tx, cmd_rx, alert_tx, alert_rx)
    }

    #[tokio::test]
    async fn stale_episode_cancels_exactly_once() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, _alert_rx) = channels();
        let ctx = state.context("BTCUSD_PERP").unwrap();
        let start = ctx.snapshot().last_update_ms;

        // >10s without updates: suspend + one cancel-all
        check_staleness(&state, &cmd_tx, &alert_tx, start + 11_000);
        assert_eq!(ctx.risk(), RiskState::Stale);
        assert!(matches!(cmd_rx.try_recv(), Ok(GatewayCommand::CancelAll { .. })));

        // still stale on later passes: no second cancel-all
        check_staleness(&state, &cmd_tx, &alert_tx, start + 12_000);
        check_staleness(&state, &cmd_tx, &alert_tx, start + 13_000);
        assert!(cmd_rx.try_recv().is_err());

        // price resumes: back to Ok, episode flag reset
        ctx.apply_quote(50_000.0, 10.0, 50_001.0, 10.0, 0.0001, 0.0, start + 14_000);
        check_staleness(&state, &cmd_tx, &alert_tx, start + 14_100);
        assert_eq!(ctx.risk(), RiskState::Ok);

        // a second episode cancels again
        check_staleness(&state, &cmd_tx, &alert_tx, start + 26_000);
        assert!(matches!(cmd_rx.try_recv(), Ok(GatewayCommand::CancelAll { .. })));
    }

    #[tokio::test]
    async fn short_staleness_suspends_without_cancel() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, _alert_rx) = channels();
        let ctx = state.context("BTCUSD_PERP").unwrap();
        let start = ctx.snapshot().last_update_ms;

        check_staleness(&state, &cmd_tx, &alert_tx, start + 2_000);
        assert_eq!(ctx.risk(), RiskState::Stale);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_rate_over_limit_halts_and_cancels_once() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, mut alert_rx) = channels();

        // pick a timestamp outside settlement windows
        let now_s = 4 * 3600;
        evaluate_error_rate(&state, &cmd_tx, &alert_tx, 60, now_s);
        assert_eq!(state.global_risk(), RiskState::Error);
        assert!(matches!(cmd_rx.try_recv(), Ok(GatewayCommand::CancelAll { .. })));
        assert!(cmd_rx.try_recv().is_err()); // one symbol, one cancel-all
        assert!(alert_rx.try_recv().is_ok());

        // sticky: a calm minute later the halt remains
        evaluate_error_rate(&state, &cmd_tx, &alert_tx, 0, now_s + 60);
        assert_eq!(state.global_risk(), RiskState::Error);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_rate_under_limit_is_ignored() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, _alert_rx) = channels();
        evaluate_error_rate(&state, &cmd_tx, &alert_tx, 50, 4 * 3600);
        assert_eq!(state.global_risk(), RiskState::Ok);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_rate_check_skipped_in_settlement() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, _alert_rx) = channels();
        assert!(is_settlement(0));
        evaluate_error_rate(&state, &cmd_tx, &alert_tx, 500, 0);
        assert_eq!(state.global_risk(), RiskState::Ok);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn settlement_windows_every_eight_hours() {
        assert!(is_settlement(0));
        assert!(is_settlement(120));
        assert!(is_settlement(8 * 3600 + 60));
        assert!(is_settlement(16 * 3600 - 30)); // the minute before, via +60 shift
        assert!(!is_settlement(4 * 3600));
        assert!(!is_settlement(12 * 3600));
    }

    #[tokio::test]
    async fn moderate_position_does_not_trip_leverage() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, _alert_rx) = channels();
        let key = format_price_key("Binance", "BTCUSD_PERP", ProductType::Spot);
        state
            .prices
            .update(&key, 50_000.0, 5.0, 50_001.0, 5.0, 0.0001, 1_000);

        // +5 of max 10 contracts with a whole BTC of margin: far under 20x
        state.set_position("BTCUSD_PERP", 5.0, Some(1.0));
        let lev = realized_leverage(5.0, 100.0, 50_000.0, 1.0).unwrap();
        assert!(lev < 20.0);
        check_leverage(&state, &cmd_tx, &alert_tx);
        assert_eq!(state.global_risk(), RiskState::Ok);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leverage_breach_halts_and_recovers() {
        let state = test_state(50);
        let (cmd_tx, mut cmd_rx, alert_tx, _alert_rx) = channels();
        let key = format_price_key("Binance", "BTCUSD_PERP", ProductType::Spot);
        state
            .prices
            .update(&key, 50_000.0, 5.0, 50_001.0, 5.0, 0.0001, 1_000);

        // thin margin: 5 * 100 / (50000 * 0.0002) = 50x > 20x
        state.set_position("BTCUSD_PERP", 5.0, Some(0.0002));
        check_leverage(&state, &cmd_tx, &alert_tx);
        assert_eq!(state.global_risk(), RiskState::Overleveraged);
        assert!(matches!(cmd_rx.try_recv(), Ok(GatewayCommand::CancelAll { .. })));

        // margin restored: recovery clears the halt
        state.set_position("BTCUSD_PERP", 5.0, Some(1.0));
        check_leverage(&state, &cmd_tx, &alert_tx);
        assert_eq!(state.global_risk(), RiskState::Ok);
    }

    #[test]
    fn settlement_gate_toggles_global_flag() {
        let state = test_state(50);
        check_settlement_gate(&state, 0);
        assert_eq!(state.global_risk(), RiskState::Settlement);
        check_settlement_gate(&state, 4 * 3600);
        assert_eq!(state.global_risk(), RiskState::Ok);

        // sticky states are not overridden
        state.set_global_risk(RiskState::Error);
        check_settlement_gate(&state, 0);
        assert_eq!(state.global_risk(), RiskState::Error);
    }
}
