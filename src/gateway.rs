// ===============================
// src/gateway.rs
// ===============================
//
// Consumes GatewayCommands from the bounded queue the quoter/risk tasks feed.
// The API budget is a token bucket; the configured policy decides whether an
// exhausted bucket waits or drops. The mock venue acknowledges placements and
// answers cancels with synthetic order events, which keeps the whole
// reconciliation loop exercisable without network access.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::config::LimitProcess;
use crate::context::AppState;
use crate::domain::{GatewayCommand, Order, OrderStatus, OrderUpdate, Side};
use crate::metrics::GATEWAY_DROPPED;

pub const POOL_WORKERS: usize = 4;

pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_s: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_s: u32) -> TokenBucket {
        let capacity = rate_per_s.max(1) as f64;
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_s: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_s).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.refill_per_s)
    }
}

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    policy: LimitProcess,
}

impl RateLimiter {
    pub fn new(rate_per_s: u32, policy: LimitProcess) -> Arc<RateLimiter> {
        Arc::new(RateLimiter { bucket: Mutex::new(TokenBucket::new(rate_per_s)), policy })
    }

    /// True when a token was obtained. Under the Drop policy a dry bucket
    /// returns false immediately; under Wait this sleeps until refilled.
    pub async fn acquire(&self) -> bool {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_take(Instant::now()) {
                    return true;
                }
                match self.policy {
                    LimitProcess::Drop => {
                        GATEWAY_DROPPED.inc();
                        return false;
                    }
                    LimitProcess::Wait => bucket.time_until_token(),
                }
            };
            sleep(wait).await;
        }
    }
}

fn failed_update(order: &Order) -> OrderUpdate {
    OrderUpdate {
        exchange: "Mock".to_string(),
        symbol: order.symbol.clone(),
        client_order_id: order.client_order_id.clone(),
        exchange_order_id: order.exchange_order_id.clone(),
        side: order.side,
        status: OrderStatus::Failed,
        filled_price: 0.0,
        filled_volume: 0.0,
    }
}

/// Mock venue: one consumer, acks placements after a latency, answers
/// cancel-alls by cancelling every open order it finds in the local books.
pub async fn run_mock_venue(
    state: Arc<AppState>,
    mut cmd_rx: mpsc::Receiver<GatewayCommand>,
    order_tx: mpsc::Sender<OrderUpdate>,
    limiter: Arc<RateLimiter>,
    latency_ms: u64,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        if !limiter.acquire().await {
            match &cmd {
                GatewayCommand::PlaceLimitPostOnly(order) | GatewayCommand::PlaceMarket(order) => {
                    warn!(client_id = %order.client_order_id, "API budget dry, placement dropped");
                    let _ = order_tx.send(failed_update(order)).await;
                }
                _ => debug!("API budget dry, cancel dropped"),
            }
            continue;
        }

        sleep(Duration::from_millis(latency_ms)).await;
        match cmd {
            GatewayCommand::PlaceLimitPostOnly(order) => {
                let exchange_id = format!("M{}", order.client_order_id);
                let mut ack = failed_update(&order);
                ack.exchange_order_id = exchange_id;
                ack.status = OrderStatus::Create;
                let _ = order_tx.send(ack.clone()).await;
                ack.status = OrderStatus::Created;
                let _ = order_tx.send(ack).await;
            }
            GatewayCommand::PlaceMarket(order) => {
                // market orders fill at their reference price right away
                let mut fill = failed_update(&order);
                fill.exchange_order_id = format!("M{}", order.client_order_id);
                fill.status = OrderStatus::Filled;
                fill.filled_price = order.price;
                fill.filled_volume = order.volume;
                let _ = order_tx.send(fill).await;
            }
            GatewayCommand::CancelAll { symbol } => {
                let Some(books) = state.side_books(&symbol) else { continue };
                for (side, book) in
                    [(Side::Buy, &books.buy), (Side::Sell, &books.sell)]
                {
                    for order in book.open_orders() {
                        let _ = order_tx
                            .send(OrderUpdate {
                                exchange: "Mock".to_string(),
                                symbol: symbol.clone(),
                                client_order_id: order.client_order_id.clone(),
                                exchange_order_id: order.exchange_order_id.clone(),
                                side,
                                status: OrderStatus::Canceled,
                                filled_price: 0.0,
                                filled_volume: 0.0,
                            })
                            .await;
                    }
                }
            }
            GatewayCommand::CancelByClientIds { symbol, ids } => {
                for id in ids {
                    let Some(order) = state.find_order(&symbol, &id) else { continue };
                    let _ = order_tx
                        .send(OrderUpdate {
                            exchange: "Mock".to_string(),
                            symbol: symbol.clone(),
                            client_order_id: id,
                            exchange_order_id: order.exchange_order_id.clone(),
                            side: order.side,
                            status: OrderStatus::Canceled,
                            filled_price: 0.0,
                            filled_volume: 0.0,
                        })
                        .await;
                }
            }
        }
    }
}

/// Fan a single command receiver out to a fixed pool of Binance workers.
/// Queue capacity plus pool size bound the number of in-flight API calls.
pub fn spawn_binance_pool(
    state: Arc<AppState>,
    client: Arc<crate::gateway_binance::BinanceClient>,
    cmd_rx: mpsc::Receiver<GatewayCommand>,
    order_tx: mpsc::Sender<OrderUpdate>,
    limiter: Arc<RateLimiter>,
) {
    let shared_rx = Arc::new(Mutex::new(cmd_rx));
    for worker in 0..POOL_WORKERS {
        let state = state.clone();
        let client = client.clone();
        let rx = shared_rx.clone();
        let order_tx = order_tx.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            crate::gateway_binance::run_worker(worker, state, client, rx, order_tx, limiter).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_drains_and_refills() {
        let mut bucket = TokenBucket::new(2);
        let now = Instant::now();
        assert!(bucket.try_take(now));
        assert!(bucket.try_take(now));
        assert!(!bucket.try_take(now));
        // one second later the bucket is full again
        assert!(bucket.try_take(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn drop_policy_refuses_when_dry() {
        let limiter = RateLimiter::new(1, LimitProcess::Drop);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
    }

    #[tokio::test]
    async fn wait_policy_eventually_acquires() {
        let limiter = RateLimiter::new(10, LimitProcess::Wait);
        for _ in 0..12 {
            assert!(limiter.acquire().await);
        }
    }
}
