use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type PositionId = i64;
pub type OrderId = String;

/// Follower identity: its position in the configured follower list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FollowerId(pub usize);

impl std::fmt::Display for FollowerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0 + 1)
    }
}

// ===== Domain =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order `side` code that opens this direction.
    pub fn open_code(self) -> i32 {
        match self {
            Side::Long => 1,
            Side::Short => 3,
        }
    }

    /// Order `side` code that closes this direction.
    pub fn close_code(self) -> i32 {
        match self {
            Side::Long => 4,
            Side::Short => 2,
        }
    }

    /// `positionType` filter used by history queries.
    pub fn position_type(self) -> i32 {
        match self {
            Side::Long => 1,
            Side::Short => 2,
        }
    }

    pub fn from_position_type(code: i32) -> Option<Self> {
        match code {
            1 => Some(Side::Long),
            2 => Some(Side::Short),
            _ => None,
        }
    }

    /// Decode an order `side` code into (direction, is_opening).
    pub fn from_order_code(code: i32) -> Option<(Self, bool)> {
        match code {
            1 => Some((Side::Long, true)),
            2 => Some((Side::Short, false)),
            3 => Some((Side::Short, true)),
            4 => Some((Side::Long, false)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn code(self) -> i32 {
        match self {
            MarginMode::Isolated => 1,
            MarginMode::Cross => 2,
        }
    }

    pub fn from_code(code: i32) -> Self {
        if code == 2 {
            MarginMode::Cross
        } else {
            MarginMode::Isolated
        }
    }
}

/// A reconciled quantity. `Unavailable` is never to be read as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Resolved<T> {
    Known(T),
    Unavailable,
}

impl<T> Default for Resolved<T> {
    fn default() -> Self {
        Resolved::Unavailable
    }
}

impl<T> Resolved<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Resolved::Known(v) => Some(v),
            Resolved::Unavailable => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Resolved::Known(_))
    }

    /// Keep `self` when known, otherwise take `other`.
    pub fn or(self, other: Resolved<T>) -> Resolved<T> {
        match self {
            Resolved::Known(_) => self,
            Resolved::Unavailable => other,
        }
    }
}

impl<T> From<Option<T>> for Resolved<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Resolved::Known(v),
            None => Resolved::Unavailable,
        }
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Resolved<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolved::Known(v) => write!(f, "{v}"),
            Resolved::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// One open position as reported by `list_open_positions`.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub volume: f64,
    pub margin_mode: MarginMode,
    pub stop_loss_price: Option<f64>,
    pub entry_price: Option<f64>,
}

/// One resting (unfilled) order as reported by `list_open_orders`.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub volume: f64,
    pub price: f64,
    pub margin_mode: MarginMode,
}

/// Parameters of a follower-side open (market when `limit_price` is None).
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub volume: f64,
    pub margin_mode: MarginMode,
    pub stop_loss_price: Option<f64>,
    pub limit_price: Option<f64>,
    /// Idempotency token, stable across retries of one placement
    pub client_oid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub symbol: String,
    /// None when closing from cached data without a fresh position lookup
    pub position_id: Option<PositionId>,
    pub leverage: u32,
    pub volume: f64,
    pub side: Side,
    pub margin_mode: MarginMode,
}

/// Window of a `history_positions` lookup (epoch milliseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct PositionHistoryQuery {
    pub symbol: String,
    pub side: Option<Side>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub page_size: u32,
}

/// Answer to a mutating call. The payload schema is venue-specific and
/// deliberately left untyped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MutationResult {
    pub success: bool,
    pub data: Option<Value>,
    pub message: Option<String>,
}

impl MutationResult {
    /// Order id embedded in the payload: either `data.orderId` or a bare `data` id.
    pub fn order_id(&self) -> Option<OrderId> {
        let data = self.data.as_ref()?;
        match data {
            Value::Object(map) => map.get("orderId").and_then(value_as_id),
            other => value_as_id(other),
        }
    }
}

/// Entry of `history_positions`; `raw` keeps the full venue record.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalPosition {
    pub id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub state: i32,
    pub opened_at: i64,
    pub updated_at: i64,
    pub raw: Value,
}

impl HistoricalPosition {
    pub const STATE_CLOSED: i32 = 3;

    pub fn is_closed(&self) -> bool {
        self.state == Self::STATE_CLOSED
    }
}

/// Entry of `history_orders`; `raw` keeps the full venue record.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalOrder {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub opening: bool,
    pub volume: f64,
    pub state: i32,
    pub created_at: i64,
    pub updated_at: i64,
    pub client_oid: Option<String>,
    pub raw: Value,
}

impl HistoricalOrder {
    pub const STATE_FILLED: i32 = 3;

    pub fn is_filled(&self) -> bool {
        self.state == Self::STATE_FILLED
    }
}

fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts ids sent either as JSON strings or numbers.
fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    value_as_id(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {v}")))
}

/// Accepts numbers sent either as JSON numbers or numeric strings.
fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// ===== Common API envelope =====
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

// ===== Open positions =====
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub position_id: i64,
    pub symbol: String,
    pub position_type: i32, // 1=Long, 2=Short
    #[serde(default)]
    pub open_type: i32,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub hold_vol: Option<f64>,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open_avg_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub stop_loss_price: Option<f64>,
}

impl PositionRecord {
    pub fn into_position(self) -> Option<Position> {
        let side = Side::from_position_type(self.position_type)?;
        Some(Position {
            id: self.position_id,
            symbol: self.symbol,
            side,
            leverage: self.leverage,
            volume: self.hold_vol.unwrap_or_default(),
            margin_mode: MarginMode::from_code(self.open_type),
            stop_loss_price: self.stop_loss_price,
            entry_price: self.open_avg_price,
        })
    }
}

// ===== Open orders =====
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    pub symbol: String,
    pub side: i32, // 1=open long, 2=close short, 3=open short, 4=close long
    #[serde(default, deserialize_with = "lenient_f64")]
    pub vol: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub open_type: i32,
}

impl OrderRecord {
    /// Only opening limit orders are mirrored; closing orders are ignored.
    pub fn into_order(self) -> Option<Order> {
        let (side, opening) = Side::from_order_code(self.side)?;
        if !opening {
            return None;
        }
        Some(Order {
            id: self.order_id,
            symbol: self.symbol,
            side,
            leverage: self.leverage,
            volume: self.vol.unwrap_or_default(),
            price: self.price?,
            margin_mode: MarginMode::from_code(self.open_type),
        })
    }
}

// ===== History =====
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPositionRecord {
    pub position_id: i64,
    pub symbol: String,
    pub position_type: i32,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub close_vol: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub hold_vol: Option<f64>,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
}

impl HistoricalPosition {
    pub fn from_raw(raw: Value) -> Option<Self> {
        let rec: HistoryPositionRecord = serde_json::from_value(raw.clone()).ok()?;
        let side = Side::from_position_type(rec.position_type)?;
        let volume = rec
            .close_vol
            .filter(|v| *v > 0.0)
            .or(rec.hold_vol)
            .unwrap_or_default();
        Some(Self {
            id: rec.position_id,
            symbol: rec.symbol,
            side,
            volume,
            state: rec.state,
            opened_at: rec.create_time,
            updated_at: rec.update_time,
            raw,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOrderRecord {
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    pub symbol: String,
    pub side: i32,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub deal_vol: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub vol: Option<f64>,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub external_oid: Option<String>,
}

impl HistoricalOrder {
    pub fn from_raw(raw: Value) -> Option<Self> {
        let rec: HistoryOrderRecord = serde_json::from_value(raw.clone()).ok()?;
        let (side, opening) = Side::from_order_code(rec.side)?;
        let volume = rec
            .deal_vol
            .filter(|v| *v > 0.0)
            .or(rec.vol)
            .unwrap_or_default();
        Some(Self {
            id: rec.order_id,
            symbol: rec.symbol,
            side,
            opening,
            volume,
            state: rec.state,
            created_at: rec.create_time,
            updated_at: rec.update_time,
            client_oid: rec.external_oid,
            raw,
        })
    }
}

// ===== Mutations =====
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderReq<'a> {
    pub symbol: &'a str,
    pub side: i32,
    pub open_type: i32,
    pub r#type: i32, // 1 = limit, 5 = market
    pub vol: f64,
    pub leverage: u32,
    #[serde(skip_serializing_if = "Option::is_none")] pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub stop_loss_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub loss_trend: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")] pub position_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub flash_close: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")] pub market_ceiling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")] pub external_oid: Option<&'a str>,
    pub price_protect: &'a str,
}

impl<'a> PlaceOrderReq<'a> {
    pub const TYPE_LIMIT: i32 = 1;
    pub const TYPE_MARKET: i32 = 5;

    pub fn open(req: &'a OpenRequest) -> Self {
        let r#type = if req.limit_price.is_some() {
            Self::TYPE_LIMIT
        } else {
            Self::TYPE_MARKET
        };
        Self {
            symbol: &req.symbol,
            side: req.side.open_code(),
            open_type: req.margin_mode.code(),
            r#type,
            vol: req.volume,
            leverage: req.leverage,
            price: req.limit_price,
            stop_loss_price: req.stop_loss_price.map(|p| p.to_string()),
            loss_trend: req.stop_loss_price.map(|_| "1"),
            position_id: None,
            flash_close: None,
            market_ceiling: req.limit_price.is_none().then_some(false),
            external_oid: Some(&req.client_oid),
            price_protect: "0",
        }
    }

    pub fn close(req: &'a CloseRequest) -> Self {
        Self {
            symbol: &req.symbol,
            side: req.side.close_code(),
            open_type: req.margin_mode.code(),
            r#type: Self::TYPE_MARKET,
            vol: req.volume,
            leverage: req.leverage,
            price: None,
            stop_loss_price: None,
            loss_trend: None,
            position_id: req.position_id,
            flash_close: Some(true),
            market_ceiling: None,
            external_oid: None,
            price_protect: "0",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOrderReq<'a> {
    pub order_id: &'a str,
    pub price: f64,
    pub vol: f64,
}
