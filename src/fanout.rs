//! Fan-out of leader events to every follower.
//!
//! Each event is planned on the tick loop (dispatch mark, sizing draw,
//! pending mirror states), executed concurrently with every other event of
//! the same tick under the shared `RemoteCaller` gate, then committed back
//! to the registry. No follower future is cancelled when a peer fails.

use std::sync::Arc;

use futures_util::future::join_all;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::client::{next_client_oid, AccountClient};
use crate::models::{
    CloseRequest, FollowerId, MutationResult, OpenRequest, Order, OrderId, Position, Resolved, Side,
};
use crate::reconcile::{Outcome, OutcomeQuery, Phase, Resolver};
use crate::registry::{
    EntityId, EventClass, FollowerMirrorState, LinkRegistry, MirrorStatus, ReplicationRecord,
};
use crate::retry::RemoteCaller;
use crate::sizing::{Sizing, SizingPolicy};
use crate::tracker::OrderAmendment;

pub struct Follower {
    pub id: FollowerId,
    /// Name used in logs and reports
    pub name: String,
    pub client: Arc<dyn AccountClient>,
    /// Scales the leader's volume
    pub multiplier: f64,
}

/// Tally of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub attempted: usize,
    pub failed: usize,
}

impl Dispatch {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn rejection(res: &MutationResult, what: &str) -> String {
    res.message
        .clone()
        .unwrap_or_else(|| format!("{what} rejected"))
}

// ===== Plans =====

/// Market-open of a leader position or placement of a resting order.
pub struct OpenPlan<'f> {
    pub id: EntityId,
    /// Leader-side parameters the follower requests were drawn from
    pub leader: OpenRequest,
    requests: Vec<(&'f Follower, OpenRequest)>,
    resolve: bool,
}

pub struct ClosePlan<'f> {
    pub id: EntityId,
    pub record: ReplicationRecord,
    targets: Vec<(&'f Follower, FollowerMirrorState)>,
}

pub struct AmendPlan<'f> {
    pub id: EntityId,
    price: f64,
    targets: Vec<(&'f Follower, OrderId, f64)>,
}

pub struct CancelPlan<'f> {
    pub id: EntityId,
    targets: Vec<(&'f Follower, FollowerMirrorState, OrderId)>,
}

/// Fill-price lookup for mirrors of a resting order that became a position.
pub struct FillPlan<'f> {
    pub id: EntityId,
    symbol: String,
    side: Side,
    targets: Vec<(&'f Follower, FollowerMirrorState, OrderId)>,
}

fn commit_states(
    registry: &mut LinkRegistry,
    id: &EntityId,
    results: impl Iterator<Item = (FollowerId, FollowerMirrorState)>,
) -> Dispatch {
    let mut dispatch = Dispatch::default();
    for (follower, state) in results {
        dispatch.attempted += 1;
        if state.status.is_failed() {
            dispatch.failed += 1;
        }
        registry.update_follower(id, follower, state);
    }
    dispatch
}

impl OpenPlan<'_> {
    pub fn commit(&self, registry: &mut LinkRegistry, states: Vec<FollowerMirrorState>) -> Dispatch {
        let ids = self.requests.iter().map(|(f, _)| f.id);
        commit_states(registry, &self.id, ids.zip(states))
    }
}

impl ClosePlan<'_> {
    pub fn commit(&self, registry: &mut LinkRegistry, states: Vec<FollowerMirrorState>) -> Dispatch {
        let ids = self.targets.iter().map(|(f, _)| f.id);
        commit_states(registry, &self.id, ids.zip(states))
    }
}

impl CancelPlan<'_> {
    pub fn commit(&self, registry: &mut LinkRegistry, states: Vec<FollowerMirrorState>) -> Dispatch {
        let ids = self.targets.iter().map(|(f, _, _)| f.id);
        commit_states(registry, &self.id, ids.zip(states))
    }
}

impl AmendPlan<'_> {
    /// Successful amends replace the mirror's order id; a failed one leaves
    /// the old order resting, so the mirror stays live.
    pub fn commit(&self, registry: &mut LinkRegistry, results: Vec<Result<OrderId, String>>) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for ((f, old_id, volume), result) in self.targets.iter().zip(results) {
            dispatch.attempted += 1;
            match result {
                Ok(new_id) => {
                    info!(follower = %f.name, old_order = %old_id, new_order = %new_id, price = self.price, volume, "Mirror order amended");
                    if let Some(m) = registry.get_mut(&self.id).and_then(|r| r.mirrors.get_mut(&f.id)) {
                        m.remote_id = Some(new_id);
                        m.requested_volume = *volume;
                    }
                }
                Err(reason) => {
                    warn!(follower = %f.name, order_id = %old_id, error = %reason, "Amend failed");
                    dispatch.failed += 1;
                }
            }
        }
        dispatch
    }
}

impl FillPlan<'_> {
    pub fn commit(&self, registry: &mut LinkRegistry, outcomes: Vec<Outcome>) {
        let Some(record) = registry.get_mut(&self.id) else {
            return;
        };
        for ((f, _, _), out) in self.targets.iter().zip(outcomes) {
            if let Some(m) = record.mirrors.get_mut(&f.id) {
                m.entry_price = m.entry_price.or(out.entry_price);
                m.margin = m.margin.or(out.margin);
            }
        }
    }
}

pub struct FanOut {
    caller: RemoteCaller,
    resolver: Resolver,
    sizing: SizingPolicy,
    rng: StdRng,
}

impl FanOut {
    pub fn new(caller: RemoteCaller, resolver: Resolver, sizing: SizingPolicy, rng: StdRng) -> Self {
        Self {
            caller,
            resolver,
            sizing,
            rng,
        }
    }

    // ===== Planning =====

    /// Plan market-opens for newly observed leader positions. Positions
    /// whose open was already dispatched get no plan.
    pub fn plan_opens<'f>(
        &mut self,
        registry: &mut LinkRegistry,
        positions: &[&Position],
        followers: &'f [Follower],
    ) -> Vec<OpenPlan<'f>> {
        let mut plans = Vec::with_capacity(positions.len());
        for position in positions {
            let id = EntityId::Position(position.id);
            if !registry.mark_dispatched(&id, EventClass::Open) {
                debug!(entity = %id, "Open already dispatched");
                continue;
            }
            let mut record = ReplicationRecord::new(
                &position.symbol,
                position.side,
                position.leverage,
                position.margin_mode,
                position.volume,
            );
            record.price = position.entry_price.into();
            record.stop_loss_price = position.stop_loss_price;
            registry.register(id.clone(), record);

            let leader = OpenRequest {
                symbol: position.symbol.clone(),
                side: position.side,
                leverage: position.leverage,
                volume: position.volume,
                margin_mode: position.margin_mode,
                stop_loss_price: position.stop_loss_price,
                limit_price: None,
                client_oid: String::new(),
            };
            plans.push(self.plan_requests(registry, id, leader, followers, true));
        }
        plans
    }

    /// Plan mirrors of new resting limit orders.
    pub fn plan_place_orders<'f>(
        &mut self,
        registry: &mut LinkRegistry,
        orders: &[&Order],
        followers: &'f [Follower],
    ) -> Vec<OpenPlan<'f>> {
        let mut plans = Vec::with_capacity(orders.len());
        for order in orders {
            let id = EntityId::Order(order.id.clone());
            if !registry.mark_dispatched(&id, EventClass::Open) {
                debug!(entity = %id, "Order placement already dispatched");
                continue;
            }
            let mut record = ReplicationRecord::new(
                &order.symbol,
                order.side,
                order.leverage,
                order.margin_mode,
                order.volume,
            );
            record.price = Resolved::Known(order.price);
            registry.register(id.clone(), record);

            let leader = OpenRequest {
                symbol: order.symbol.clone(),
                side: order.side,
                leverage: order.leverage,
                volume: order.volume,
                margin_mode: order.margin_mode,
                stop_loss_price: None,
                limit_price: Some(order.price),
                client_oid: String::new(),
            };
            plans.push(self.plan_requests(registry, id, leader, followers, false));
        }
        plans
    }

    fn plan_requests<'f>(
        &mut self,
        registry: &mut LinkRegistry,
        id: EntityId,
        leader: OpenRequest,
        followers: &'f [Follower],
        resolve: bool,
    ) -> OpenPlan<'f> {
        let mut requests = Vec::with_capacity(followers.len());
        for f in followers {
            let s: Sizing = self.sizing.draw(&mut self.rng, leader.volume, f.multiplier);
            debug!(entity = %id, follower = %f.name, vol_pct = s.vol_pct, volume = s.volume, leverage = s.leverage, "Follower sizing drawn");
            let req = OpenRequest {
                leverage: s.leverage,
                volume: s.volume,
                client_oid: next_client_oid(&leader.symbol),
                ..leader.clone()
            };
            registry.update_follower(&id, f.id, FollowerMirrorState::pending(&f.name, req.volume, req.leverage));
            requests.push((f, req));
        }
        OpenPlan {
            id,
            leader,
            requests,
            resolve,
        }
    }

    /// Plan closes of every live mirror of leader positions that are gone.
    /// Unlinked positions and closes already dispatched get no plan.
    pub fn plan_closes<'f>(
        &self,
        registry: &mut LinkRegistry,
        positions: &[&Position],
        followers: &'f [Follower],
    ) -> Vec<ClosePlan<'f>> {
        let mut plans = Vec::with_capacity(positions.len());
        for position in positions {
            let id = EntityId::Position(position.id);
            let Some(record) = registry.get(&id).cloned() else {
                debug!(entity = %id, "Closed position was never mirrored");
                continue;
            };
            if !registry.mark_dispatched(&id, EventClass::Close) {
                debug!(entity = %id, "Close already dispatched");
                continue;
            }
            let targets = followers
                .iter()
                .filter_map(|f| {
                    let m = record.mirrors.get(&f.id)?;
                    (m.status == MirrorStatus::Live).then(|| (f, m.clone()))
                })
                .collect();
            plans.push(ClosePlan { id, record, targets });
        }
        plans
    }

    /// Plan moves of linked follower orders to the leader's new price, each
    /// with a freshly randomized volume. Unlinked orders and amendments
    /// already mirrored get no plan.
    pub fn plan_amends<'f>(
        &mut self,
        registry: &mut LinkRegistry,
        amendments: &[&OrderAmendment],
        followers: &'f [Follower],
    ) -> Vec<AmendPlan<'f>> {
        let mut plans = Vec::with_capacity(amendments.len());
        for amendment in amendments {
            let after = &amendment.after;
            let id = EntityId::Order(after.id.clone());
            let Some(record) = registry.get_mut(&id) else {
                continue;
            };
            if record.price == Resolved::Known(after.price) && record.volume == after.volume {
                debug!(entity = %id, "Amendment already mirrored");
                continue;
            }
            record.price = Resolved::Known(after.price);
            record.volume = after.volume;

            let mut targets = Vec::new();
            for f in followers {
                let Some(remote_id) = record
                    .mirrors
                    .get(&f.id)
                    .filter(|m| m.status == MirrorStatus::Live)
                    .and_then(|m| m.remote_id.clone())
                else {
                    continue;
                };
                let (volume, _) = self.sizing.volume(&mut self.rng, after.volume, f.multiplier);
                targets.push((f, remote_id, volume));
            }
            plans.push(AmendPlan {
                id,
                price: after.price,
                targets,
            });
        }
        plans
    }

    /// Plan cancels of every linked follower order of canceled leader orders.
    pub fn plan_cancels<'f>(
        &self,
        registry: &mut LinkRegistry,
        orders: &[&Order],
        followers: &'f [Follower],
    ) -> Vec<CancelPlan<'f>> {
        let mut plans = Vec::with_capacity(orders.len());
        for order in orders {
            let id = EntityId::Order(order.id.clone());
            let Some(record) = registry.get(&id) else {
                continue;
            };
            let targets = followers
                .iter()
                .filter_map(|f| {
                    let m = record.mirrors.get(&f.id)?;
                    let remote_id = m.remote_id.clone()?;
                    (m.status == MirrorStatus::Live).then(|| (f, m.clone(), remote_id))
                })
                .collect();
            if !registry.mark_dispatched(&id, EventClass::Cancel) {
                debug!(entity = %id, "Cancel already dispatched");
                continue;
            }
            plans.push(CancelPlan { id, targets });
        }
        plans
    }

    /// Plan fill-price lookups for the mirrors of adopted order fills.
    pub fn plan_fills<'f>(
        &self,
        registry: &LinkRegistry,
        ids: &[EntityId],
        followers: &'f [Follower],
    ) -> Vec<FillPlan<'f>> {
        ids.iter()
            .filter_map(|id| {
                let record = registry.get(id)?;
                let targets = followers
                    .iter()
                    .filter_map(|f| {
                        let m = record.mirrors.get(&f.id)?;
                        let remote_id = m.remote_id.clone()?;
                        (m.status == MirrorStatus::Live).then(|| (f, m.clone(), remote_id))
                    })
                    .collect();
                Some(FillPlan {
                    id: id.clone(),
                    symbol: record.symbol.clone(),
                    side: record.side,
                    targets,
                })
            })
            .collect()
    }

    // ===== Execution =====

    /// Run every follower request of every plan at once. Results come back
    /// in plan order, then follower order.
    pub async fn execute_opens(&self, plans: &[OpenPlan<'_>]) -> Vec<Vec<FollowerMirrorState>> {
        join_all(plans.iter().map(|plan| {
            join_all(
                plan.requests
                    .iter()
                    .map(move |(f, req)| self.open_one(f, req, plan.resolve)),
            )
        }))
        .await
    }

    pub async fn execute_closes(&self, plans: &[ClosePlan<'_>]) -> Vec<Vec<FollowerMirrorState>> {
        join_all(plans.iter().map(|plan| {
            join_all(
                plan.targets
                    .iter()
                    .map(move |(f, m)| self.close_one(f, &plan.record, m.clone())),
            )
        }))
        .await
    }

    pub async fn execute_amends(&self, plans: &[AmendPlan<'_>]) -> Vec<Vec<Result<OrderId, String>>> {
        join_all(plans.iter().map(|plan| {
            join_all(
                plan.targets
                    .iter()
                    .map(move |(f, remote_id, volume)| self.amend_one(f, remote_id, plan.price, *volume)),
            )
        }))
        .await
    }

    pub async fn execute_cancels(&self, plans: &[CancelPlan<'_>]) -> Vec<Vec<FollowerMirrorState>> {
        join_all(plans.iter().map(|plan| {
            join_all(
                plan.targets
                    .iter()
                    .map(move |(f, m, remote_id)| self.cancel_one(f, m.clone(), remote_id)),
            )
        }))
        .await
    }

    pub async fn execute_fills(&self, plans: &[FillPlan<'_>]) -> Vec<Vec<Outcome>> {
        let anchor_ms = now_ms();
        join_all(plans.iter().map(|plan| {
            join_all(plan.targets.iter().map(move |(f, m, remote_id)| async move {
                let q = OutcomeQuery {
                    phase: Phase::Open,
                    symbol: &plan.symbol,
                    side: plan.side,
                    expected_volume: m.requested_volume,
                    order_id: Some(remote_id.as_str()),
                    client_oid: None,
                    position_id: None,
                    anchor_ms,
                    opened_at_ms: None,
                };
                self.resolver.resolve_outcome(f.client.as_ref(), None, &q).await
            }))
        }))
        .await
    }

    async fn open_one(&self, f: &Follower, req: &OpenRequest, resolve: bool) -> FollowerMirrorState {
        let state = FollowerMirrorState::pending(&f.name, req.volume, req.leverage);
        let anchor_ms = now_ms();
        let res = match self.caller.call("open", || f.client.open(req)).await {
            Ok(res) if res.success => res,
            Ok(res) => {
                warn!(follower = %f.name, symbol = %req.symbol, "Open rejected");
                return state.failed(rejection(&res, "open"));
            }
            Err(e) => {
                warn!(follower = %f.name, symbol = %req.symbol, error = %e, "Open failed");
                return state.failed(e.to_string());
            }
        };

        let mut state = FollowerMirrorState {
            status: MirrorStatus::Live,
            remote_id: res.order_id(),
            ..state
        };
        info!(
            follower = %f.name,
            symbol = %req.symbol,
            side = %req.side,
            volume = req.volume,
            leverage = req.leverage,
            limit = ?req.limit_price,
            order_id = ?state.remote_id,
            "Mirror opened"
        );
        if resolve {
            let q = OutcomeQuery {
                phase: Phase::Open,
                symbol: &req.symbol,
                side: req.side,
                expected_volume: req.volume,
                order_id: state.remote_id.as_deref(),
                client_oid: Some(&req.client_oid),
                position_id: None,
                anchor_ms,
                opened_at_ms: None,
            };
            let out = self
                .resolver
                .resolve_outcome(f.client.as_ref(), Some(&res), &q)
                .await;
            state.entry_price = out.entry_price;
            state.margin = out.margin;
        }
        state
    }

    async fn close_one(
        &self,
        f: &Follower,
        record: &ReplicationRecord,
        mirror: FollowerMirrorState,
    ) -> FollowerMirrorState {
        let requests: Vec<CloseRequest> = match self
            .caller
            .call("list_open_positions", || f.client.list_open_positions())
            .await
        {
            Ok(open) => open
                .into_iter()
                .filter(|p| p.symbol == record.symbol && p.side == record.side)
                .map(|p| CloseRequest {
                    symbol: p.symbol,
                    position_id: Some(p.id),
                    leverage: p.leverage,
                    volume: p.volume,
                    side: p.side,
                    margin_mode: p.margin_mode,
                })
                .collect(),
            Err(e) => {
                warn!(follower = %f.name, symbol = %record.symbol, error = %e, "Position lookup failed, closing from cached data");
                vec![CloseRequest {
                    symbol: record.symbol.clone(),
                    position_id: None,
                    leverage: mirror.leverage,
                    volume: mirror.requested_volume,
                    side: record.side,
                    margin_mode: record.margin_mode,
                }]
            }
        };
        if requests.is_empty() {
            warn!(follower = %f.name, symbol = %record.symbol, side = %record.side, "No open position to close");
            return mirror.failed("no open position to close");
        }

        let anchor_ms = now_ms();
        let mut closed: Option<(CloseRequest, MutationResult)> = None;
        let mut last_error = None;
        for req in requests {
            let result = self.caller.call("close", || f.client.close(&req)).await;
            match result {
                Ok(res) if res.success => {
                    info!(follower = %f.name, symbol = %req.symbol, side = %req.side, volume = req.volume, position_id = ?req.position_id, "Mirror closed");
                    if closed.is_none() {
                        closed = Some((req, res));
                    }
                }
                Ok(res) => {
                    warn!(follower = %f.name, symbol = %req.symbol, "Close rejected");
                    last_error = Some(rejection(&res, "close"));
                }
                Err(e) => {
                    warn!(follower = %f.name, symbol = %req.symbol, error = %e, "Close failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        let Some((req, res)) = closed else {
            return mirror.failed(last_error.unwrap_or_else(|| "close failed".to_string()));
        };

        let order_id = res.order_id();
        let q = OutcomeQuery {
            phase: Phase::Close,
            symbol: &req.symbol,
            side: req.side,
            expected_volume: req.volume,
            order_id: order_id.as_deref(),
            client_oid: None,
            position_id: req.position_id,
            anchor_ms,
            opened_at_ms: Some(record.observed_at),
        };
        let out = self
            .resolver
            .resolve_outcome(f.client.as_ref(), Some(&res), &q)
            .await;
        FollowerMirrorState {
            status: MirrorStatus::Closed,
            exit_price: out.exit_price,
            pnl: out.pnl,
            entry_price: mirror.entry_price.or(out.entry_price),
            margin: mirror.margin.or(out.margin),
            ..mirror
        }
    }

    async fn amend_one(&self, f: &Follower, remote_id: &str, price: f64, volume: f64) -> Result<OrderId, String> {
        match self
            .caller
            .call("amend_order", || f.client.amend_order(remote_id, price, volume))
            .await
        {
            Ok(res) if res.success => Ok(res.order_id().unwrap_or_else(|| remote_id.to_string())),
            Ok(res) => Err(rejection(&res, "amend")),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn cancel_one(&self, f: &Follower, mirror: FollowerMirrorState, remote_id: &str) -> FollowerMirrorState {
        let ids = [remote_id.to_string()];
        match self
            .caller
            .call("cancel_orders", || f.client.cancel_orders(&ids))
            .await
        {
            Ok(res) if res.success => {
                info!(follower = %f.name, order_id = %remote_id, "Mirror order canceled");
                FollowerMirrorState {
                    status: MirrorStatus::Canceled,
                    ..mirror
                }
            }
            Ok(res) => mirror.failed(rejection(&res, "cancel")),
            Err(e) => {
                warn!(follower = %f.name, order_id = %remote_id, error = %e, "Cancel failed");
                mirror.failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::models::{HistoricalOrder, HistoricalPosition, MarginMode, PositionHistoryQuery};
    use crate::reconcile::ResolverSettings;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Counts calls; `fail_open` makes every open a transport failure.
    #[derive(Default)]
    struct Venue {
        fail_open: bool,
        fail_lookup: bool,
        positions: Vec<Position>,
        opens: Mutex<Vec<OpenRequest>>,
        closes: Mutex<Vec<CloseRequest>>,
        amends: Mutex<Vec<(String, f64, f64)>>,
        cancels: Mutex<Vec<OrderId>>,
    }

    #[async_trait]
    impl AccountClient for Venue {
        async fn list_open_positions(&self) -> Result<Vec<Position>, RemoteError> {
            if self.fail_lookup {
                return Err(RemoteError::transport("connection reset"));
            }
            Ok(self.positions.clone())
        }
        async fn list_open_orders(&self) -> Result<Vec<Order>, RemoteError> {
            Ok(Vec::new())
        }
        async fn open(&self, req: &OpenRequest) -> Result<MutationResult, RemoteError> {
            self.opens.lock().unwrap().push(req.clone());
            if self.fail_open {
                return Err(RemoteError::transport("connection reset"));
            }
            Ok(MutationResult {
                success: true,
                data: Some(json!({"orderId": format!("f-{}", req.client_oid), "dealAvgPrice": 100.0})),
                message: None,
            })
        }
        async fn close(&self, req: &CloseRequest) -> Result<MutationResult, RemoteError> {
            self.closes.lock().unwrap().push(req.clone());
            Ok(MutationResult {
                success: true,
                data: Some(json!({"orderId": "c-1", "dealAvgPrice": 110.0, "profit": 2.0})),
                message: None,
            })
        }
        async fn amend_order(&self, order_id: &str, price: f64, volume: f64) -> Result<MutationResult, RemoteError> {
            self.amends.lock().unwrap().push((order_id.to_string(), price, volume));
            Ok(MutationResult {
                success: true,
                data: Some(json!(format!("{order_id}-v2"))),
                message: None,
            })
        }
        async fn cancel_orders(&self, ids: &[OrderId]) -> Result<MutationResult, RemoteError> {
            self.cancels.lock().unwrap().extend(ids.iter().cloned());
            Ok(MutationResult {
                success: true,
                data: None,
                message: None,
            })
        }
        async fn history_positions(&self, _: &PositionHistoryQuery) -> Result<Vec<HistoricalPosition>, RemoteError> {
            Ok(Vec::new())
        }
        async fn history_orders(&self, _: &str, _: u32) -> Result<Vec<HistoricalOrder>, RemoteError> {
            Ok(Vec::new())
        }
    }

    fn fanout() -> FanOut {
        let caller = RemoteCaller::new(
            4,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
            Duration::from_secs(1),
        );
        let resolver = Resolver::new(caller.clone(), ResolverSettings::default());
        let sizing = SizingPolicy {
            volume_step: None,
            ..SizingPolicy::default()
        };
        FanOut::new(caller, resolver, sizing, StdRng::seed_from_u64(42))
    }

    fn follower(idx: usize, venue: Arc<Venue>, multiplier: f64) -> Follower {
        Follower {
            id: FollowerId(idx),
            name: format!("acct-{idx}"),
            client: venue,
            multiplier,
        }
    }

    async fn open(fan: &mut FanOut, reg: &mut LinkRegistry, position: &Position, followers: &[Follower]) -> Option<Dispatch> {
        let plans = fan.plan_opens(reg, &[position], followers);
        let states = fan.execute_opens(&plans).await;
        plans.iter().zip(states).map(|(p, s)| p.commit(reg, s)).next()
    }

    async fn place(fan: &mut FanOut, reg: &mut LinkRegistry, order: &Order, followers: &[Follower]) -> Option<Dispatch> {
        let plans = fan.plan_place_orders(reg, &[order], followers);
        let states = fan.execute_opens(&plans).await;
        plans.iter().zip(states).map(|(p, s)| p.commit(reg, s)).next()
    }

    async fn close(fan: &mut FanOut, reg: &mut LinkRegistry, position: &Position, followers: &[Follower]) -> Option<Dispatch> {
        let plans = fan.plan_closes(reg, &[position], followers);
        let states = fan.execute_closes(&plans).await;
        plans.iter().zip(states).map(|(p, s)| p.commit(reg, s)).next()
    }

    async fn amend(fan: &mut FanOut, reg: &mut LinkRegistry, amendment: &OrderAmendment, followers: &[Follower]) -> Option<Dispatch> {
        let plans = fan.plan_amends(reg, &[amendment], followers);
        let results = fan.execute_amends(&plans).await;
        plans.iter().zip(results).map(|(p, r)| p.commit(reg, r)).next()
    }

    async fn cancel(fan: &mut FanOut, reg: &mut LinkRegistry, order: &Order, followers: &[Follower]) -> Option<Dispatch> {
        let plans = fan.plan_cancels(reg, &[order], followers);
        let states = fan.execute_cancels(&plans).await;
        plans.iter().zip(states).map(|(p, s)| p.commit(reg, s)).next()
    }

    fn leader_position() -> Position {
        Position {
            id: 1,
            symbol: "BTC_USDT".into(),
            side: Side::Long,
            leverage: 10,
            volume: 5.0,
            margin_mode: MarginMode::Isolated,
            stop_loss_price: Some(90.0),
            entry_price: Some(100.0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_follower_does_not_block_peers() {
        let bad = Arc::new(Venue {
            fail_open: true,
            ..Venue::default()
        });
        let good = Arc::new(Venue::default());
        let followers = vec![follower(0, bad.clone(), 1.0), follower(1, good.clone(), 1.0)];
        let mut reg = LinkRegistry::new();
        let mut fan = fanout();

        let d = open(&mut fan, &mut reg, &leader_position(), &followers).await.unwrap();
        assert_eq!(d, Dispatch { attempted: 2, failed: 1 });
        assert_eq!(bad.opens.lock().unwrap().len(), 3);

        let rec = reg.get(&EntityId::Position(1)).unwrap();
        assert!(rec.mirrors[&FollowerId(0)].status.is_failed());
        let ok = &rec.mirrors[&FollowerId(1)];
        assert_eq!(ok.status, MirrorStatus::Live);
        assert_eq!(ok.entry_price, Resolved::Known(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_reuse_one_client_token() {
        let bad = Arc::new(Venue {
            fail_open: true,
            ..Venue::default()
        });
        let followers = vec![follower(0, bad.clone(), 1.0)];
        let mut reg = LinkRegistry::new();
        open(&mut fanout(), &mut reg, &leader_position(), &followers).await;
        let opens = bad.opens.lock().unwrap();
        assert!(opens.windows(2).all(|w| w[0].client_oid == w[1].client_oid));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_open_is_not_dispatched() {
        let venue = Arc::new(Venue::default());
        let followers = vec![follower(0, venue.clone(), 1.0)];
        let mut reg = LinkRegistry::new();
        let mut fan = fanout();
        assert!(open(&mut fan, &mut reg, &leader_position(), &followers).await.is_some());
        assert!(open(&mut fan, &mut reg, &leader_position(), &followers).await.is_none());
        assert_eq!(venue.opens.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_falls_back_to_cached_mirror_data() {
        let venue = Arc::new(Venue {
            fail_lookup: true,
            ..Venue::default()
        });
        let followers = vec![follower(0, venue.clone(), 2.0)];
        let mut reg = LinkRegistry::new();
        let mut fan = fanout();
        open(&mut fan, &mut reg, &leader_position(), &followers).await;
        let opened = venue.opens.lock().unwrap()[0].clone();

        let d = close(&mut fan, &mut reg, &leader_position(), &followers).await.unwrap();
        assert_eq!(d.failed, 0);
        let closes = venue.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].position_id, None);
        assert_eq!(closes[0].volume, opened.volume);
        assert_eq!(closes[0].leverage, opened.leverage);

        let m = &reg.get(&EntityId::Position(1)).unwrap().mirrors[&FollowerId(0)];
        assert_eq!(m.status, MirrorStatus::Closed);
        assert_eq!(m.exit_price, Resolved::Known(110.0));
        assert_eq!(m.pnl, Resolved::Known(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn close_uses_follower_position_when_found() {
        let mut follower_pos = leader_position();
        follower_pos.id = 555;
        follower_pos.volume = 7.0;
        follower_pos.leverage = 12;
        let venue = Arc::new(Venue {
            positions: vec![follower_pos],
            ..Venue::default()
        });
        let followers = vec![follower(0, venue.clone(), 1.0)];
        let mut reg = LinkRegistry::new();
        let mut fan = fanout();
        open(&mut fan, &mut reg, &leader_position(), &followers).await;
        close(&mut fan, &mut reg, &leader_position(), &followers).await;
        let closes = venue.closes.lock().unwrap();
        assert_eq!(closes[0].position_id, Some(555));
        assert_eq!(closes[0].volume, 7.0);
        assert_eq!(closes[0].leverage, 12);
    }

    fn leader_order(price: f64) -> Order {
        Order {
            id: "L-1".into(),
            symbol: "ETH_USDT".into(),
            side: Side::Short,
            leverage: 20,
            volume: 10.0,
            price,
            margin_mode: MarginMode::Cross,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn amend_replaces_mirror_id_once() {
        let venue = Arc::new(Venue::default());
        let followers = vec![follower(0, venue.clone(), 1.0)];
        let mut reg = LinkRegistry::new();
        let mut fan = fanout();
        place(&mut fan, &mut reg, &leader_order(3000.0), &followers).await;
        let placed = venue.opens.lock().unwrap()[0].clone();
        assert_eq!(placed.limit_price, Some(3000.0));

        let amendment = OrderAmendment {
            before: leader_order(3000.0),
            after: leader_order(2990.0),
        };
        assert!(amend(&mut fan, &mut reg, &amendment, &followers).await.is_some());
        assert!(amend(&mut fan, &mut reg, &amendment, &followers).await.is_none());

        let amends = venue.amends.lock().unwrap();
        assert_eq!(amends.len(), 1);
        assert_eq!(amends[0].1, 2990.0);
        let m = &reg.get(&EntityId::Order("L-1".into())).unwrap().mirrors[&FollowerId(0)];
        assert_eq!(m.remote_id.as_deref(), Some(format!("f-{}-v2", placed.client_oid).as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_targets_linked_mirrors_only() {
        let venue = Arc::new(Venue::default());
        let followers = vec![follower(0, venue.clone(), 1.0)];
        let mut reg = LinkRegistry::new();
        let mut fan = fanout();
        assert!(cancel(&mut fan, &mut reg, &leader_order(1.0), &followers).await.is_none());

        place(&mut fan, &mut reg, &leader_order(3000.0), &followers).await;
        let d = cancel(&mut fan, &mut reg, &leader_order(3000.0), &followers).await.unwrap();
        assert_eq!(d.attempted, 1);
        assert_eq!(venue.cancels.lock().unwrap().len(), 1);
        assert!(cancel(&mut fan, &mut reg, &leader_order(3000.0), &followers).await.is_none());
    }
}
