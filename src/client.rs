use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE};
use reqwest::{Client, Proxy, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::accounts::Credentials;
use crate::error::RemoteError;
use crate::models::{
    ApiEnvelope, ChangeOrderReq, CloseRequest, HistoricalOrder, HistoricalPosition,
    MutationResult, OpenRequest, Order, OrderId, OrderRecord, PlaceOrderReq, Position,
    PositionHistoryQuery, PositionRecord,
};

static ORDER_TAG_SEQ: AtomicU64 = AtomicU64::new(1);

/// Client-side idempotency token for one logical placement.
#[inline]
pub fn next_client_oid(symbol: &str) -> String {
    let seq = ORDER_TAG_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts = chrono::Utc::now().timestamp_millis();
    format!("mx{}{}{}", symbol.replace('_', "").to_lowercase(), ts, seq)
}

/// Per-account capability the engine drives. Implementations must not
/// retry internally; the engine wraps every call in its own policy.
#[async_trait]
pub trait AccountClient: Send + Sync {
    async fn list_open_positions(&self) -> Result<Vec<Position>, RemoteError>;

    async fn list_open_orders(&self) -> Result<Vec<Order>, RemoteError>;

    async fn open(&self, req: &OpenRequest) -> Result<MutationResult, RemoteError>;

    async fn close(&self, req: &CloseRequest) -> Result<MutationResult, RemoteError>;

    /// Amending replaces the order; the new id is in the result payload.
    async fn amend_order(
        &self,
        order_id: &str,
        price: f64,
        volume: f64,
    ) -> Result<MutationResult, RemoteError>;

    async fn cancel_orders(&self, order_ids: &[OrderId]) -> Result<MutationResult, RemoteError>;

    async fn history_positions(
        &self,
        query: &PositionHistoryQuery,
    ) -> Result<Vec<HistoricalPosition>, RemoteError>;

    async fn history_orders(
        &self,
        symbol: &str,
        page_size: u32,
    ) -> Result<Vec<HistoricalOrder>, RemoteError>;
}

/// Hosts of the futures web API.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Host accepting signed order mutations
    pub order_base: String,
    /// Host serving position/order queries
    pub query_base: String,
}

// =============== API Client =================
pub struct MexcClient {
    pub endpoints: Endpoints,
    uid: String,
    http: Client,
}

impl MexcClient {
    pub fn new(endpoints: Endpoints, creds: &Credentials, timeout: Duration) -> reqwest::Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(proxy) = creds.proxy.as_deref() {
            builder = builder.proxy(Proxy::all(format!("socks5h://{proxy}"))?);
        }
        Ok(Self {
            endpoints,
            uid: creds.uid.clone(),
            http: builder.build()?,
        })
    }

    /// `x-mxc-sign` over the exact body bytes sent.
    fn sign(&self, nonce: &str, body: &str) -> String {
        let key_digest = format!("{:x}", md5::compute(format!("{}{}", self.uid, nonce)));
        let salt = &key_digest[7..];
        format!("{:x}", md5::compute(format!("{nonce}{body}{salt}")))
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.header(AUTHORIZATION, &self.uid)
            .header(COOKIE, format!("u_id={}", self.uid))
            .header(ACCEPT, "application/json")
            .header("language", "English")
            .header("platform", "H5-web")
    }

    async fn authed_get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, RemoteError> {
        let url = format!("{}{}", self.endpoints.query_base, path);
        let resp = self.authed(self.http.get(url)).query(query).send().await?;
        decode_envelope(resp).await
    }

    async fn signed_post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, RemoteError> {
        let body = serde_json::to_string(body).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let nonce = chrono::Utc::now().timestamp_millis().to_string();
        let sign = self.sign(&nonce, &body);
        let url = format!("{}{}", self.endpoints.order_base, path);
        let resp = self
            .authed(self.http.post(url))
            .header(CONTENT_TYPE, "application/json")
            .header("x-mxc-nonce", nonce)
            .header("x-mxc-sign", sign)
            .body(body)
            .send()
            .await?;
        decode_envelope(resp).await
    }

    async fn mutate<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<MutationResult, RemoteError> {
        let data = self.signed_post(path, body).await?;
        Ok(MutationResult {
            success: true,
            data: (!data.is_null()).then_some(data),
            message: None,
        })
    }
}

/// Classify an HTTP response into data, rejection, or transport failure.
async fn decode_envelope(resp: reqwest::Response) -> Result<Value, RemoteError> {
    let status = resp.status();
    let body = resp.text().await?;

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(RemoteError::transport(format!("HTTP {status}: {}", truncate(&body))));
    }

    let env: ApiEnvelope<Value> = match serde_json::from_str(&body) {
        Ok(env) => env,
        Err(e) if status.is_success() => {
            return Err(RemoteError::Malformed(format!("{e}: {}", truncate(&body))));
        }
        Err(_) => {
            return Err(RemoteError::transport(format!("HTTP {status}: {}", truncate(&body))));
        }
    };

    if !env.success || !status.is_success() {
        let message = env
            .message
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(RemoteError::rejected(Some(env.code), message));
    }
    Ok(env.data.unwrap_or(Value::Null))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn data_list(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        // paginated shape: { "resultList": [...] }
        Value::Object(mut map) => match map.remove("resultList") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl AccountClient for MexcClient {
    async fn list_open_positions(&self) -> Result<Vec<Position>, RemoteError> {
        let data = self
            .authed_get("/api/v1/private/position/open_positions", &[])
            .await?;
        let mut out = Vec::new();
        for raw in data_list(data) {
            match serde_json::from_value::<PositionRecord>(raw) {
                Ok(rec) => out.extend(rec.into_position()),
                Err(e) => return Err(RemoteError::Malformed(format!("position record: {e}"))),
            }
        }
        Ok(out)
    }

    async fn list_open_orders(&self) -> Result<Vec<Order>, RemoteError> {
        let query = [("page_num", "1".to_string()), ("page_size", "200".to_string())];
        let data = self
            .authed_get("/api/v1/private/order/list/open_orders", &query)
            .await?;
        let mut out = Vec::new();
        for raw in data_list(data) {
            match serde_json::from_value::<OrderRecord>(raw) {
                Ok(rec) => out.extend(rec.into_order()),
                Err(e) => return Err(RemoteError::Malformed(format!("order record: {e}"))),
            }
        }
        Ok(out)
    }

    async fn open(&self, req: &OpenRequest) -> Result<MutationResult, RemoteError> {
        self.mutate("/api/v1/private/order/create", &PlaceOrderReq::open(req))
            .await
    }

    async fn close(&self, req: &CloseRequest) -> Result<MutationResult, RemoteError> {
        self.mutate("/api/v1/private/order/create", &PlaceOrderReq::close(req))
            .await
    }

    async fn amend_order(
        &self,
        order_id: &str,
        price: f64,
        volume: f64,
    ) -> Result<MutationResult, RemoteError> {
        let req = ChangeOrderReq { order_id, price, vol: volume };
        self.mutate("/api/v1/private/order/change_limit_order", &req)
            .await
    }

    async fn cancel_orders(&self, order_ids: &[OrderId]) -> Result<MutationResult, RemoteError> {
        self.mutate("/api/v1/private/order/cancel", order_ids).await
    }

    async fn history_positions(
        &self,
        query: &PositionHistoryQuery,
    ) -> Result<Vec<HistoricalPosition>, RemoteError> {
        let mut params = vec![
            ("page_num", "1".to_string()),
            ("page_size", query.page_size.to_string()),
            ("symbol", query.symbol.clone()),
            ("start_time", query.start_ms.to_string()),
            ("end_time", query.end_ms.to_string()),
        ];
        if let Some(side) = query.side {
            params.push(("position_type", side.position_type().to_string()));
        }
        let data = self
            .authed_get("/api/v1/private/position/list/history_positions", &params)
            .await?;
        Ok(data_list(data)
            .into_iter()
            .filter_map(HistoricalPosition::from_raw)
            .collect())
    }

    async fn history_orders(
        &self,
        symbol: &str,
        page_size: u32,
    ) -> Result<Vec<HistoricalOrder>, RemoteError> {
        let params = [
            ("page_num", "1".to_string()),
            ("page_size", page_size.to_string()),
            ("symbol", symbol.to_string()),
        ];
        let data = self
            .authed_get("/api/v1/private/order/list/history_orders", &params)
            .await?;
        Ok(data_list(data)
            .into_iter()
            .filter_map(HistoricalOrder::from_raw)
            .collect())
    }
}
