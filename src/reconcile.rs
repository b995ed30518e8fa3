//! Reconciliation: what actually happened after a mutation was accepted.
//!
//! Venue responses and history records do not share one schema, so every
//! quantity is read through an ordered table of candidate field names and a
//! first-match-wins scan. Anything not found stays `Unavailable`.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::client::AccountClient;
use crate::models::{
    HistoricalOrder, HistoricalPosition, MutationResult, PositionHistoryQuery, PositionId, Resolved,
    Side,
};
use crate::retry::RemoteCaller;

pub const ENTRY_PRICE_FIELDS: &[&str] = &[
    "openAvgPrice",
    "dealAvgPrice",
    "dealAvgPriceStr",
    "avgPrice",
    "holdAvgPrice",
];
pub const EXIT_PRICE_FIELDS: &[&str] = &[
    "closeAvgPrice",
    "dealAvgPrice",
    "dealAvgPriceStr",
    "avgPrice",
];
pub const PNL_FIELDS: &[&str] = &["realised", "closeProfitLoss", "profit", "pnl"];
pub const MARGIN_FIELDS: &[&str] = &["orderMargin", "oim", "im", "margin"];

/// Venue clocks and ours disagree by a few seconds; close records stamped
/// up to this much before the open was observed are still accepted.
const CLOCK_SKEW_MS: i64 = 60_000;

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Breadth-first search for `key`, so shallow fields win over nested ones.
fn find_number(root: &Value, key: &str, accept: fn(f64) -> bool) -> Option<f64> {
    let mut queue = VecDeque::from([root]);
    while let Some(v) = queue.pop_front() {
        match v {
            Value::Object(map) => {
                if let Some(n) = map.get(key).and_then(as_f64).filter(|n| accept(*n)) {
                    return Some(n);
                }
                queue.extend(map.values());
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

/// First field in `fields` (by priority) that holds an acceptable number.
pub fn scan_fields(root: &Value, fields: &[&str], accept: fn(f64) -> bool) -> Option<f64> {
    fields.iter().find_map(|key| find_number(root, key, accept))
}

fn positive(n: f64) -> bool {
    n.is_finite() && n > 0.0
}

fn finite(n: f64) -> bool {
    n.is_finite()
}

pub fn entry_price(raw: &Value) -> Option<f64> {
    scan_fields(raw, ENTRY_PRICE_FIELDS, positive)
}

pub fn exit_price(raw: &Value) -> Option<f64> {
    scan_fields(raw, EXIT_PRICE_FIELDS, positive)
}

/// Zero is a real P/L, so only non-finite values are rejected.
pub fn pnl(raw: &Value) -> Option<f64> {
    scan_fields(raw, PNL_FIELDS, finite)
}

pub fn margin(raw: &Value) -> Option<f64> {
    scan_fields(raw, MARGIN_FIELDS, positive)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolverSettings {
    pub open_settle: Duration,
    pub close_settle: Duration,
    pub history_window: Duration,
    pub page_size: u32,
    /// Absolute volume tolerance for approximate matches
    pub volume_tolerance: f64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            open_settle: Duration::from_secs(2),
            close_settle: Duration::from_secs(3),
            history_window: Duration::from_secs(3600),
            page_size: 20,
            volume_tolerance: 1.0,
        }
    }
}

impl ResolverSettings {
    fn settle_for(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Open => self.open_settle,
            Phase::Close => self.close_settle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    Response,
    ExactId,
    Approximate,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub entry_price: Resolved<f64>,
    pub exit_price: Resolved<f64>,
    pub pnl: Resolved<f64>,
    pub margin: Resolved<f64>,
    pub source: OutcomeSource,
}

impl Outcome {
    pub fn unavailable() -> Self {
        Self {
            entry_price: Resolved::Unavailable,
            exit_price: Resolved::Unavailable,
            pnl: Resolved::Unavailable,
            margin: Resolved::Unavailable,
            source: OutcomeSource::Unavailable,
        }
    }

    /// The price the phase is about is known.
    pub fn is_resolved(&self, phase: Phase) -> bool {
        match phase {
            Phase::Open => self.entry_price.is_known(),
            Phase::Close => self.exit_price.is_known(),
        }
    }

    /// Read an outcome out of one venue record. Position history records
    /// describe a whole open/close lifecycle; order records and mutation
    /// responses only describe the leg the phase is about.
    pub fn from_record(raw: &Value, phase: Phase, source: OutcomeSource, lifecycle: bool) -> Self {
        let mut out = Self {
            source,
            ..Self::unavailable()
        };
        if lifecycle || phase == Phase::Open {
            out.entry_price = entry_price(raw).into();
            out.margin = margin(raw).into();
        }
        if lifecycle || phase == Phase::Close {
            out.exit_price = exit_price(raw).into();
            out.pnl = pnl(raw).into();
        }
        out
    }
}

/// What we know about the mutation whose outcome is wanted.
#[derive(Debug, Clone)]
pub struct OutcomeQuery<'a> {
    pub phase: Phase,
    pub symbol: &'a str,
    pub side: Side,
    pub expected_volume: f64,
    pub order_id: Option<&'a str>,
    pub client_oid: Option<&'a str>,
    pub position_id: Option<PositionId>,
    /// Epoch ms of the mutation; approximate candidates are ranked by their
    /// distance to it
    pub anchor_ms: i64,
    /// Epoch ms the entity was opened; close records before it are rejected
    pub opened_at_ms: Option<i64>,
}

impl OutcomeQuery<'_> {
    fn close_after_open(&self, closed_at: i64) -> bool {
        match self.opened_at_ms {
            Some(opened) => closed_at >= opened - CLOCK_SKEW_MS,
            None => true,
        }
    }

    fn volume_close(&self, volume: f64, tolerance: f64) -> bool {
        (volume - self.expected_volume).abs() <= tolerance
    }
}

/// Closed position whose id is the one we are looking for.
pub fn exact_position<'a>(records: &'a [HistoricalPosition], q: &OutcomeQuery<'_>) -> Option<&'a HistoricalPosition> {
    let id = q.position_id?;
    records.iter().find(|r| r.id == id && r.is_closed())
}

/// Filled order carrying our order id or our client token.
pub fn exact_order<'a>(records: &'a [HistoricalOrder], q: &OutcomeQuery<'_>) -> Option<&'a HistoricalOrder> {
    records.iter().find(|r| {
        let by_id = q.order_id.is_some_and(|id| r.id == id);
        let by_oid = q
            .client_oid
            .is_some_and(|oid| r.client_oid.as_deref() == Some(oid));
        r.is_filled() && (by_id || by_oid)
    })
}

/// Nearest-in-time closed position with the same symbol and side and a
/// volume within tolerance.
pub fn approximate_position<'a>(
    records: &'a [HistoricalPosition],
    q: &OutcomeQuery<'_>,
    tolerance: f64,
) -> Option<&'a HistoricalPosition> {
    records
        .iter()
        .filter(|r| {
            r.is_closed()
                && r.symbol == q.symbol
                && r.side == q.side
                && q.volume_close(r.volume, tolerance)
                && r.opened_at <= r.updated_at
                && q.close_after_open(r.updated_at)
        })
        .min_by_key(|r| (r.updated_at - q.anchor_ms).abs())
}

/// Nearest-in-time filled order for the same leg.
pub fn approximate_order<'a>(
    records: &'a [HistoricalOrder],
    q: &OutcomeQuery<'_>,
    tolerance: f64,
) -> Option<&'a HistoricalOrder> {
    let opening = q.phase == Phase::Open;
    records
        .iter()
        .filter(|r| {
            r.is_filled()
                && r.opening == opening
                && r.symbol == q.symbol
                && r.side == q.side
                && q.volume_close(r.volume, tolerance)
                && (opening || q.close_after_open(r.created_at))
        })
        .min_by_key(|r| (r.created_at - q.anchor_ms).abs())
}

/// Best-effort outcome lookup. Never fails: whatever cannot be determined
/// is reported as unavailable.
#[derive(Clone)]
pub struct Resolver {
    caller: RemoteCaller,
    settings: ResolverSettings,
}

impl Resolver {
    pub fn new(caller: RemoteCaller, settings: ResolverSettings) -> Self {
        Self { caller, settings }
    }

    pub async fn resolve_outcome(
        &self,
        client: &dyn AccountClient,
        response: Option<&MutationResult>,
        q: &OutcomeQuery<'_>,
    ) -> Outcome {
        // 1. immediate response
        let from_response = response
            .and_then(|r| r.data.as_ref())
            .map(|d| Outcome::from_record(d, q.phase, OutcomeSource::Response, false));
        if let Some(out) = from_response.filter(|o| o.is_resolved(q.phase)) {
            debug!(symbol = %q.symbol, side = %q.side, "Outcome taken from mutation response");
            return out;
        }

        // 2. history, after the venue had time to settle
        tokio::time::sleep(self.settings.settle_for(q.phase)).await;
        let now = chrono::Utc::now().timestamp_millis();
        let start_ms = now - self.settings.history_window.as_millis() as i64;
        let tol = self.settings.volume_tolerance;

        let positions = match q.phase {
            Phase::Close => {
                let query = PositionHistoryQuery {
                    symbol: q.symbol.to_string(),
                    side: Some(q.side),
                    start_ms,
                    end_ms: now,
                    page_size: self.settings.page_size,
                };
                match self
                    .caller
                    .call("history_positions", || client.history_positions(&query))
                    .await
                {
                    Ok(records) => records,
                    Err(e) => {
                        debug!(symbol = %q.symbol, error = %e, "Position history unavailable");
                        Vec::new()
                    }
                }
            }
            Phase::Open => Vec::new(),
        };

        // 3. exact id
        if let Some(rec) = exact_position(&positions, q) {
            debug!(symbol = %q.symbol, position_id = rec.id, "Outcome matched by position id");
            return Outcome::from_record(&rec.raw, q.phase, OutcomeSource::ExactId, true);
        }

        let page_size = self.settings.page_size;
        let orders: Vec<HistoricalOrder> = match self
            .caller
            .call("history_orders", || client.history_orders(q.symbol, page_size))
            .await
        {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.created_at == 0 || r.created_at >= start_ms)
                .collect(),
            Err(e) => {
                debug!(symbol = %q.symbol, error = %e, "Order history unavailable");
                Vec::new()
            }
        };

        if let Some(rec) = exact_order(&orders, q) {
            debug!(symbol = %q.symbol, order_id = %rec.id, "Outcome matched by order id");
            return Outcome::from_record(&rec.raw, q.phase, OutcomeSource::ExactId, false);
        }

        // 4. approximate
        if let Some(rec) = approximate_position(&positions, q, tol) {
            debug!(symbol = %q.symbol, position_id = rec.id, "Outcome matched approximately (position history)");
            return Outcome::from_record(&rec.raw, q.phase, OutcomeSource::Approximate, true);
        }
        if let Some(rec) = approximate_order(&orders, q, tol) {
            debug!(symbol = %q.symbol, order_id = %rec.id, "Outcome matched approximately (order history)");
            return Outcome::from_record(&rec.raw, q.phase, OutcomeSource::Approximate, false);
        }

        // 5. keep whatever partial data the response had
        debug!(symbol = %q.symbol, side = %q.side, "Outcome unavailable");
        from_response.unwrap_or_else(Outcome::unavailable)
    }
}
