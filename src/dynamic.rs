// ===============================
// src/dynamic.rs
// ===============================
//
// Adaptive quoting thresholds. Each instrument keeps a rolling window of
// recent reference prices; the range-over-price of that window widens the
// order spacing and loosens the profitability bar in choppy markets.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::context::AppState;
use crate::metrics::{ADJUSTED_FORGIVE, ADJUSTED_GAP_SIZE};

pub const WINDOW_CAPACITY: usize = 3_000;
pub const WARMUP_SAMPLES: usize = 300;
pub const RECOMPUTE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct QuoteTuning {
    pub gap_size_percent: f64,
    pub spread_times: f64,
    pub forgive_percent: f64,
    pub exponent_base: f64,
    pub exponent_power: f64,
    pub denominator: f64,
    pub min_accuracy: f64,
}

struct DynInner {
    prices: VecDeque<f64>,
    adjusted_gap_size: f64,
    adjusted_forgive_percent: f64,
}

pub struct DynamicParams {
    inner: RwLock<DynInner>,
}

impl DynamicParams {
    pub fn new(forgive_percent: f64) -> DynamicParams {
        DynamicParams {
            inner: RwLock::new(DynInner {
                prices: VecDeque::with_capacity(WINDOW_CAPACITY),
                adjusted_gap_size: 0.0,
                adjusted_forgive_percent: forgive_percent,
            }),
        }
    }

    /// Append a reference price, dropping the oldest sample once the window
    /// is full. Prices at or below the accuracy floor are ignored.
    pub fn observe(&self, reference_price: f64, min_accuracy: f64) {
        if reference_price <= min_accuracy {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.prices.len() == WINDOW_CAPACITY {
            inner.prices.pop_front();
        }
        inner.prices.push_back(reference_price);
    }

    /// Pure given the window contents: below warm-up the static defaults
    /// apply; beyond it the range-over-price spread scales both thresholds.
    pub fn recompute(&self, reference_price: f64, tuning: &QuoteTuning) {
        if reference_price <= tuning.min_accuracy {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let gap_size = tuning.gap_size_percent * reference_price;

        if inner.prices.len() < WARMUP_SAMPLES {
            inner.adjusted_gap_size = gap_size;
            inner.adjusted_forgive_percent = tuning.forgive_percent;
            return;
        }

        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for &p in inner.prices.iter() {
            if p > max { max = p; }
            if p < min { min = p; }
        }
        let spread = (max - min) / reference_price;
        inner.adjusted_gap_size = gap_size + gap_size * spread * tuning.spread_times;
        inner.adjusted_forgive_percent = tuning.forgive_percent
            - (spread / tuning.exponent_base).powf(tuning.exponent_power) / tuning.denominator;
    }

    /// (adjusted gap size, adjusted forgive percent). Gap size is 0 until the
    /// first recompute with a live reference price.
    pub fn values(&self) -> (f64, f64) {
        let inner = self.inner.read().unwrap();
        (inner.adjusted_gap_size, inner.adjusted_forgive_percent)
    }

    pub fn window_len(&self) -> usize {
        self.inner.read().unwrap().prices.len()
    }
}

impl QuoteTuning {
    pub fn from_config(cfg: &crate::config::Config) -> QuoteTuning {
        QuoteTuning {
            gap_size_percent: cfg.gap_size_percent,
            spread_times: cfg.spread_times,
            forgive_percent: cfg.forgive_percent,
            exponent_base: cfg.exponent_base,
            exponent_power: cfg.exponent_power,
            denominator: cfg.denominator,
            min_accuracy: cfg.min_accuracy,
        }
    }
}

/// Periodic refresh across all instruments. The own-book bid is the reference
/// price, same as the quoting path.
pub async fn run(state: Arc<AppState>) {
    let tuning = QuoteTuning::from_config(&state.cfg);
    let mut tick = interval(Duration::from_millis(RECOMPUTE_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        for symbol in &state.cfg.symbols {
            let (Some(ctx), Some(params)) = (state.context(symbol), state.dynamics.get(symbol))
            else {
                continue;
            };
            let reference = ctx.snapshot().bid_price;
            if reference <= tuning.min_accuracy {
                continue;
            }
            params.observe(reference, tuning.min_accuracy);
            params.recompute(reference, &tuning);

            let (gap, forgive) = params.values();
            ADJUSTED_GAP_SIZE.with_label_values(&[symbol]).set(gap);
            ADJUSTED_FORGIVE.with_label_values(&[symbol]).set(forgive);
            debug!(symbol = %symbol, gap, forgive, window = params.window_len(), "dynamic refresh");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> QuoteTuning {
        QuoteTuning {
            gap_size_percent: 0.0002,
            spread_times: 10.0,
            forgive_percent: 1.0005,
            exponent_base: 100.0,
            exponent_power: 0.75,
            denominator: 4.0,
            min_accuracy: 0.0001,
        }
    }

    #[test]
    fn warmup_uses_static_gap() {
        let params = DynamicParams::new(1.0005);
        let t = tuning();
        for _ in 0..WARMUP_SAMPLES - 1 {
            params.observe(50_000.0, t.min_accuracy);
        }
        params.recompute(50_000.0, &t);
        let (gap, forgive) = params.values();
        assert_eq!(gap, 0.0002 * 50_000.0);
        assert_eq!(forgive, 1.0005);
    }

    #[test]
    fn spread_widens_gap_and_loosens_forgive() {
        let params = DynamicParams::new(1.0005);
        let t = tuning();
        for i in 0..WARMUP_SAMPLES {
            // prices ranging 50_000..=50_299
            params.observe(50_000.0 + i as f64, t.min_accuracy);
        }
        params.recompute(50_000.0, &t);
        let (gap, forgive) = params.values();

        let base_gap = 0.0002 * 50_000.0;
        let spread = 299.0 / 50_000.0;
        assert!((gap - (base_gap + base_gap * spread * 10.0)).abs() < 1e-9);
        let expected_forgive = 1.0005 - (spread / 100.0_f64).powf(0.75) / 4.0;
        assert!((forgive - expected_forgive).abs() < 1e-12);
        assert!(forgive < 1.0005);
    }

    #[test]
    fn window_is_bounded() {
        let params = DynamicParams::new(1.0005);
        let t = tuning();
        for i in 0..(WINDOW_CAPACITY + 500) {
            params.observe(50_000.0 + i as f64, t.min_accuracy);
        }
        assert_eq!(params.window_len(), WINDOW_CAPACITY);
    }

    #[test]
    fn accuracy_floor_filters_observations() {
        let params = DynamicParams::new(1.0005);
        let t = tuning();
        params.observe(0.0, t.min_accuracy);
        params.observe(-1.0, t.min_accuracy);
        assert_eq!(params.window_len(), 0);
        // recompute with a garbage reference is a no-op
        params.recompute(0.0, &t);
        assert_eq!(params.values().0, 0.0);
    }
}
