// ===============================
// src/alert.rs
// ===============================
//
// Best-effort operator alerts. With a Telegram token configured, messages go
// to the bot HTTP API; otherwise they only hit the log. A minimum send
// interval keeps a risk flap from flooding the channel; trading never waits
// on this task.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::timestamp_ms;

pub struct AlertSink {
    http: reqwest::Client,
    token: Option<String>,
    chat_id: i64,
    min_interval_ms: i64,
    last_sent_ms: i64,
}

impl AlertSink {
    pub fn new(token: Option<String>, chat_id: i64, min_interval_ms: i64) -> AlertSink {
        AlertSink {
            http: reqwest::Client::new(),
            token: token.filter(|t| !t.is_empty()),
            chat_id,
            min_interval_ms,
            last_sent_ms: 0,
        }
    }

    pub async fn notify(&mut self, message: &str) {
        let now = timestamp_ms();
        if now - self.last_sent_ms < self.min_interval_ms {
            return;
        }
        self.last_sent_ms = now;

        warn!(alert = %message, "operator alert");
        let Some(token) = &self.token else { return };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = json!({ "chat_id": self.chat_id, "text": message });
        match self.http.post(url).json(&body).send().await {
            Ok(rsp) if rsp.status().is_success() => {}
            Ok(rsp) => warn!(code = %rsp.status(), "telegram send failed"),
            Err(e) => warn!(?e, "telegram send error"),
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<String>, mut sink: AlertSink) {
    while let Some(message) = rx.recv().await {
        sink.notify(&message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interval_suppresses_rapid_alerts() {
        let mut sink = AlertSink::new(None, 0, 60_000);
        sink.notify("first").await;
        let stamped = sink.last_sent_ms;
        assert!(stamped > 0);
        // immediately after, the send window is still closed
        sink.notify("second").await;
        assert_eq!(sink.last_sent_ms, stamped);
    }
}
