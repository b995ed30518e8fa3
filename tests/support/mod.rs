//! Scripted in-memory venue account shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use mirrorx::error::RemoteError;
use mirrorx::models::{
    CloseRequest, HistoricalOrder, HistoricalPosition, MarginMode, MutationResult, OpenRequest,
    Order, OrderId, Position, PositionHistoryQuery, PositionId, Side,
};
use mirrorx::AccountClient;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListPositions,
    ListOrders,
    Open(OpenRequest),
    Close(CloseRequest),
    Amend { order_id: String, price: f64, volume: f64 },
    Cancel(Vec<OrderId>),
    HistoryPositions,
    HistoryOrders,
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::Open(_) | Call::Close(_) | Call::Amend { .. } | Call::Cancel(_)
        )
    }
}

/// Opens currently running across every account that shares it.
#[derive(Default)]
pub struct InFlight {
    now: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let n = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(n, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.now.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Venue account whose state is set by the test and whose calls are
/// recorded. Fill prices are fixed so reconciliation resolves from the
/// mutation response.
pub struct ScriptedClient {
    label: String,
    positions: Mutex<Vec<Position>>,
    orders: Mutex<Vec<Order>>,
    history_positions: Mutex<Vec<HistoricalPosition>>,
    history_orders: Mutex<Vec<HistoricalOrder>>,
    open_delay: Mutex<Duration>,
    gauge: Mutex<Option<Arc<InFlight>>>,
    open_times: Mutex<Vec<Instant>>,
    fail_snapshot: AtomicBool,
    fail_mutations: AtomicBool,
    calls: Mutex<Vec<Call>>,
    seq: AtomicU64,
}

impl ScriptedClient {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            positions: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            history_positions: Mutex::new(Vec::new()),
            history_orders: Mutex::new(Vec::new()),
            open_delay: Mutex::new(Duration::ZERO),
            gauge: Mutex::new(None),
            open_times: Mutex::new(Vec::new()),
            fail_snapshot: AtomicBool::new(false),
            fail_mutations: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            seq: AtomicU64::new(1),
        })
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock().unwrap() = positions;
    }

    pub fn set_orders(&self, orders: Vec<Order>) {
        *self.orders.lock().unwrap() = orders;
    }

    pub fn set_history_positions(&self, records: Vec<HistoricalPosition>) {
        *self.history_positions.lock().unwrap() = records;
    }

    pub fn set_history_orders(&self, records: Vec<HistoricalOrder>) {
        *self.history_orders.lock().unwrap() = records;
    }

    /// Every open takes `delay` and is counted in `gauge` while it runs.
    pub fn slow_opens(&self, delay: Duration, gauge: Arc<InFlight>) {
        *self.open_delay.lock().unwrap() = delay;
        *self.gauge.lock().unwrap() = Some(gauge);
    }

    /// Instants (tokio clock) at which each open call started.
    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }

    pub fn fail_snapshot(&self, on: bool) {
        self.fail_snapshot.store(on, Ordering::SeqCst);
    }

    pub fn fail_mutations(&self, on: bool) {
        self.fail_mutations.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn opens(&self) -> Vec<OpenRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Open(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<CloseRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Close(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> Vec<OrderId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cancel(ids) => Some(ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self) -> String {
        format!("{}-{}", self.label, self.seq.fetch_add(1, Ordering::SeqCst))
    }

    fn mutation_gate(&self) -> Result<(), RemoteError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountClient for ScriptedClient {
    async fn list_open_positions(&self) -> Result<Vec<Position>, RemoteError> {
        self.record(Call::ListPositions);
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("timed out"));
        }
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn list_open_orders(&self) -> Result<Vec<Order>, RemoteError> {
        self.record(Call::ListOrders);
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("timed out"));
        }
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn open(&self, req: &OpenRequest) -> Result<MutationResult, RemoteError> {
        self.record(Call::Open(req.clone()));
        self.open_times.lock().unwrap().push(Instant::now());
        let gauge = self.gauge.lock().unwrap().clone();
        let delay = *self.open_delay.lock().unwrap();
        if let Some(g) = &gauge {
            g.enter();
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(g) = &gauge {
            g.leave();
        }
        self.mutation_gate()?;
        Ok(MutationResult {
            success: true,
            data: Some(json!({"orderId": self.next_id(), "dealAvgPrice": 100.0})),
            message: None,
        })
    }

    async fn close(&self, req: &CloseRequest) -> Result<MutationResult, RemoteError> {
        self.record(Call::Close(req.clone()));
        self.mutation_gate()?;
        Ok(MutationResult {
            success: true,
            data: Some(json!({"orderId": self.next_id(), "dealAvgPrice": 105.0, "profit": 0.5})),
            message: None,
        })
    }

    async fn amend_order(&self, order_id: &str, price: f64, volume: f64) -> Result<MutationResult, RemoteError> {
        self.record(Call::Amend {
            order_id: order_id.to_string(),
            price,
            volume,
        });
        self.mutation_gate()?;
        Ok(MutationResult {
            success: true,
            data: Some(json!(self.next_id())),
            message: None,
        })
    }

    async fn cancel_orders(&self, order_ids: &[OrderId]) -> Result<MutationResult, RemoteError> {
        self.record(Call::Cancel(order_ids.to_vec()));
        self.mutation_gate()?;
        Ok(MutationResult {
            success: true,
            data: None,
            message: None,
        })
    }

    async fn history_positions(&self, _: &PositionHistoryQuery) -> Result<Vec<HistoricalPosition>, RemoteError> {
        self.record(Call::HistoryPositions);
        Ok(self.history_positions.lock().unwrap().clone())
    }

    async fn history_orders(&self, _: &str, _: u32) -> Result<Vec<HistoricalOrder>, RemoteError> {
        self.record(Call::HistoryOrders);
        Ok(self.history_orders.lock().unwrap().clone())
    }
}

pub fn position(id: PositionId, symbol: &str, side: Side, leverage: u32, volume: f64) -> Position {
    Position {
        id,
        symbol: symbol.to_string(),
        side,
        leverage,
        volume,
        margin_mode: MarginMode::Isolated,
        stop_loss_price: None,
        entry_price: Some(64_000.0),
    }
}

pub fn limit_order(id: &str, symbol: &str, side: Side, price: f64, volume: f64) -> Order {
    Order {
        id: id.to_string(),
        symbol: symbol.to_string(),
        side,
        leverage: 10,
        volume,
        price,
        margin_mode: MarginMode::Isolated,
    }
}

/// Closed position history record with an exit price and realised P/L.
pub fn closed_history(id: PositionId, symbol: &str, volume: f64, close_price: f64, realised: f64) -> HistoricalPosition {
    let now = chrono::Utc::now().timestamp_millis();
    HistoricalPosition::from_raw(json!({
        "positionId": id,
        "symbol": symbol,
        "positionType": 1,
        "state": 3,
        "closeVol": volume,
        "openAvgPrice": 64_000.0,
        "closeAvgPrice": close_price,
        "realised": realised,
        "createTime": now - 60_000,
        "updateTime": now
    }))
    .unwrap()
}

/// Filled opening order in order history, as the venue reports it.
pub fn filled_history_order(id: &str, symbol: &str, side: Side, volume: f64, avg_price: f64, margin: f64) -> HistoricalOrder {
    let now = chrono::Utc::now().timestamp_millis();
    let side_code = match side {
        Side::Long => 1,
        Side::Short => 3,
    };
    HistoricalOrder::from_raw(json!({
        "orderId": id,
        "symbol": symbol,
        "side": side_code,
        "vol": volume,
        "dealVol": volume,
        "state": 3,
        "dealAvgPrice": avg_price,
        "orderMargin": margin,
        "createTime": now,
        "updateTime": now
    }))
    .unwrap()
}
