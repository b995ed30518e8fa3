//! Notification sinks for per-tick events.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::NotifyError;
use crate::models::Resolved;
use crate::registry::MirrorStatus;
use crate::report::{EventKind, EventReport};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EventReport) -> Result<(), NotifyError>;
}

/// Writes every event to the log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &EventReport) -> Result<(), NotifyError> {
        info!(
            kind = %event.kind,
            entity = %event.entity,
            symbol = %event.symbol,
            side = %event.side,
            volume = event.volume,
            price = %event.price,
            exit = %event.exit_price,
            pnl = %event.pnl,
            ok = event.succeeded(),
            failed = event.failed(),
            "Replication event"
        );
        for f in &event.followers {
            match &f.status {
                MirrorStatus::Failed(reason) => {
                    warn!(kind = %event.kind, follower = %f.label, error = %reason, "Follower failed")
                }
                status => info!(
                    kind = %event.kind,
                    follower = %f.label,
                    status = ?status,
                    volume = f.volume,
                    leverage = f.leverage,
                    entry = %f.entry_price,
                    exit = %f.exit_price,
                    pnl = %f.pnl,
                    margin = %f.margin,
                    "Follower outcome"
                ),
            }
        }
        Ok(())
    }
}

fn money(v: Resolved<f64>) -> String {
    match v.known() {
        Some(v) => format!("${v:.2}"),
        None => "unavailable".to_string(),
    }
}

/// P/L with a band marker: large wins and large losses stand out.
fn signed(v: Resolved<f64>) -> String {
    let Some(v) = v.known() else {
        return "unavailable".to_string();
    };
    let sign = if v >= 0.0 { "+" } else { "" };
    let mark = match v {
        v if v >= 10.0 => "☠️",
        v if v <= -5.0 => "🤡",
        v if v >= 0.0 => "🟢",
        _ => "🔴",
    };
    format!("{mark}<code>{sign}{v:.4}</code>{mark}")
}

/// HTML text for one event, as sent to Telegram.
pub fn render_html(event: &EventReport) -> String {
    let icon = match event.kind {
        EventKind::Opened => "🚀",
        EventKind::Closed => "❌",
        EventKind::OrderPlaced => "📝",
        EventKind::OrderAmended => "✏️",
        EventKind::OrderCanceled => "🚫",
    };
    let mut out = format!(
        "{icon} <b>{} {}</b> {}\n",
        event.symbol, event.side, event.kind
    );
    let _ = writeln!(
        out,
        "Leader: vol={} lev={} price={}",
        event.volume, event.leverage, event.price
    );
    if event.kind == EventKind::Closed {
        let _ = writeln!(out, "  exit={}, PNL={}", event.exit_price, signed(event.pnl));
    }
    for (i, f) in event.followers.iter().enumerate() {
        let n = i + 1;
        let _ = match (&f.status, event.kind) {
            (MirrorStatus::Failed(reason), _) => writeln!(out, "{n}) {} ⚠️ {reason}", f.label),
            (_, EventKind::Closed) => writeln!(
                out,
                "{n}) margin={}, exit={}, PNL={}",
                money(f.margin),
                f.exit_price,
                signed(f.pnl)
            ),
            (_, EventKind::Opened) => writeln!(
                out,
                "{n}) vol={} lev={} margin={}, entry={}",
                f.volume,
                f.leverage,
                money(f.margin),
                f.entry_price
            ),
            _ => writeln!(out, "{n}) vol={} lev={}", f.volume, f.leverage),
        };
    }
    let _ = write!(out, "ok {}/{}", event.succeeded(), event.followers.len());
    out
}

/// Posts events to a Telegram chat through the Bot API.
pub struct TelegramNotifier {
    http: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub const API_BASE: &'static str = "https://api.telegram.org";

    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> reqwest::Result<Self> {
        Self::with_base(Self::API_BASE, token, chat_id)
    }

    pub fn with_base(
        api_base: impl Into<String>,
        token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            http: Client::builder().timeout(Duration::from_secs(10)).build()?,
            api_base: api_base.into(),
            token: token.into(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &EventReport) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": render_html(event),
            "parse_mode": "HTML",
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected(format!("HTTP {status}: {text}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FollowerId, Side};
    use crate::registry::EntityId;
    use crate::report::FollowerOutcome;

    fn closed_event() -> EventReport {
        let follower = |i: usize, status: MirrorStatus, pnl: Resolved<f64>| FollowerOutcome {
            follower: FollowerId(i),
            label: format!("acct-{i}"),
            status,
            volume: 5.0,
            leverage: 8,
            entry_price: Resolved::Known(100.0),
            exit_price: Resolved::Known(101.0),
            pnl,
            margin: Resolved::Unavailable,
        };
        EventReport {
            kind: EventKind::Closed,
            entity: EntityId::Position(1),
            symbol: "BTC_USDT".into(),
            side: Side::Long,
            leverage: 10,
            volume: 5.0,
            price: Resolved::Known(100.0),
            exit_price: Resolved::Unavailable,
            pnl: Resolved::Known(-1.5),
            margin: Resolved::Unavailable,
            followers: vec![
                follower(0, MirrorStatus::Closed, Resolved::Known(0.25)),
                follower(1, MirrorStatus::Failed("timed out".into()), Resolved::Unavailable),
            ],
        }
    }

    #[test]
    fn html_never_prints_zero_for_unknowns() {
        let text = render_html(&closed_event());
        assert!(text.contains("BTC_USDT LONG"));
        assert!(text.contains("exit=unavailable"));
        assert!(text.contains("margin=unavailable"));
        assert!(text.contains("+0.2500"));
        assert!(text.contains("🔴<code>-1.5000</code>🔴"));
        assert!(text.contains("acct-1 ⚠️ timed out"));
        assert!(text.ends_with("ok 1/2"));
    }

    #[test]
    fn pnl_bands_mark_large_moves() {
        assert_eq!(signed(Resolved::Known(12.0)), "☠️<code>+12.0000</code>☠️");
        assert_eq!(signed(Resolved::Known(10.0)), "☠️<code>+10.0000</code>☠️");
        assert_eq!(signed(Resolved::Known(9.99)), "🟢<code>+9.9900</code>🟢");
        assert_eq!(signed(Resolved::Known(0.0)), "🟢<code>+0.0000</code>🟢");
        assert_eq!(signed(Resolved::Known(-4.5)), "🔴<code>-4.5000</code>🔴");
        assert_eq!(signed(Resolved::Known(-5.0)), "🤡<code>-5.0000</code>🤡");
        assert_eq!(signed(Resolved::Unavailable), "unavailable");
    }

    #[tokio::test]
    async fn tracing_notifier_never_fails() {
        assert!(TracingNotifier.notify(&closed_event()).await.is_ok());
    }
}
