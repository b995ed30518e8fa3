//! The tick loop: poll the leader, diff, fan out, reconcile, report.
//!
//! Exactly one tick runs at a time, so the tracker and the link registry
//! are plain owned values with no locking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::client::AccountClient;
use crate::error::EngineError;
use crate::fanout::{Dispatch, FanOut, Follower};
use crate::models::{Order, Position};
use crate::notify::Notifier;
use crate::reconcile::{OutcomeQuery, Phase, Resolver, ResolverSettings};
use crate::registry::{EntityId, EventClass, LinkRegistry};
use crate::report::{event_report, EventKind, EventReport, TickReport};
use crate::retry::{RemoteCaller, RetryPolicy};
use crate::sizing::SizingPolicy;
use crate::tracker::{OpenedPosition, OrderAmendment, OrderRemoval, Snapshot, SnapshotDiff, StateTracker};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    /// Remote calls allowed in flight across the whole engine
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub sizing: SizingPolicy,
    pub resolver: ResolverSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_in_flight: 8,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            sizing: SizingPolicy::default(),
            resolver: ResolverSettings::default(),
        }
    }
}

pub struct Leader {
    pub name: String,
    pub client: Arc<dyn AccountClient>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn log_dispatch(kind: EventKind, id: &EntityId, d: Dispatch) {
    if d.failed > 0 {
        warn!(kind = %kind, entity = %id, ok = d.succeeded(), failed = d.failed, "Fan-out partially failed");
    } else {
        debug!(kind = %kind, entity = %id, ok = d.succeeded(), "Fan-out done");
    }
}

pub struct Engine {
    leader: Leader,
    followers: Vec<Follower>,
    caller: RemoteCaller,
    resolver: Resolver,
    fanout: FanOut,
    tracker: StateTracker,
    registry: LinkRegistry,
    notifiers: Vec<Arc<dyn Notifier>>,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        leader: Leader,
        followers: Vec<Follower>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Self {
        Self::with_rng(settings, leader, followers, notifiers, StdRng::from_entropy())
    }

    /// Same as `new` with a caller-provided randomness source.
    pub fn with_rng(
        settings: EngineSettings,
        leader: Leader,
        followers: Vec<Follower>,
        notifiers: Vec<Arc<dyn Notifier>>,
        rng: StdRng,
    ) -> Self {
        let caller = RemoteCaller::new(settings.max_in_flight, settings.retry, settings.request_timeout);
        let resolver = Resolver::new(caller.clone(), settings.resolver);
        let fanout = FanOut::new(caller.clone(), resolver.clone(), settings.sizing, rng);
        Self {
            leader,
            followers,
            caller,
            resolver,
            fanout,
            tracker: StateTracker::new(),
            registry: LinkRegistry::new(),
            notifiers,
            poll_interval: settings.poll_interval,
        }
    }

    pub fn registry(&self) -> &LinkRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// Positions first, then orders: an order filling between the two reads
    /// shows up as canceled now and as a fresh position next tick.
    pub async fn fetch_snapshot(&self) -> Result<Snapshot, EngineError> {
        let client = &self.leader.client;
        let positions = self
            .caller
            .call("leader positions", || client.list_open_positions())
            .await
            .map_err(EngineError::SnapshotFetch)?;
        let orders = self
            .caller
            .call("leader orders", || client.list_open_orders())
            .await
            .map_err(EngineError::SnapshotFetch)?;
        Ok(Snapshot::new(positions, orders))
    }

    /// One poll/diff/dispatch cycle. A failed snapshot leaves every piece
    /// of tracked state as it was.
    pub async fn tick(&mut self) -> Result<TickReport, EngineError> {
        let snapshot = self.fetch_snapshot().await?;
        let diff = self.tracker.advance(snapshot);
        if diff.is_empty() {
            return Ok(TickReport::default());
        }
        info!(
            opened = diff.opened.len(),
            closed = diff.closed.len(),
            placed = diff.placed.len(),
            amended = diff.amended.len(),
            removed = diff.removed.len(),
            "Leader changed"
        );
        let report = self.apply(&diff).await;
        self.notify(&report).await;
        Ok(report)
    }

    /// Dispatch one diff. Order changes go first, then closes, then opens;
    /// within each phase every event's fan-out and leader lookup run
    /// concurrently and results are written back afterwards. Delivering the
    /// same diff twice issues no additional remote mutations.
    pub async fn apply(&mut self, diff: &SnapshotDiff) -> TickReport {
        let mut report = TickReport::default();
        self.apply_order_changes(diff, &mut report).await;
        self.apply_closes(&diff.closed, &mut report).await;
        self.apply_opens(&diff.opened, &mut report).await;
        report
    }

    async fn apply_order_changes(&mut self, diff: &SnapshotDiff, report: &mut TickReport) {
        let adopted: Vec<&str> = diff
            .opened
            .iter()
            .filter_map(|o| o.filled_order.as_ref().map(|f| f.id.as_str()))
            .collect();
        let mut canceled: Vec<&Order> = Vec::new();
        for (order, removal) in &diff.removed {
            match removal {
                OrderRemoval::Canceled => {
                    info!(order_id = %order.id, symbol = %order.symbol, "Leader canceled order");
                    canceled.push(order);
                }
                OrderRemoval::Filled if adopted.contains(&order.id.as_str()) => {}
                OrderRemoval::Filled => {
                    debug!(order_id = %order.id, symbol = %order.symbol, "Order filled into an existing position");
                    self.registry.remove(&EntityId::Order(order.id.clone()));
                }
            }
        }
        for order in &diff.placed {
            info!(order_id = %order.id, symbol = %order.symbol, side = %order.side, price = order.price, volume = order.volume, "Leader placed order");
        }
        for amendment in &diff.amended {
            info!(
                order_id = %amendment.after.id,
                price = amendment.after.price,
                volume = amendment.after.volume,
                "Leader amended order"
            );
        }
        let placed: Vec<&Order> = diff.placed.iter().collect();
        let amended: Vec<&OrderAmendment> = diff.amended.iter().collect();

        let cancels = self.fanout.plan_cancels(&mut self.registry, &canceled, &self.followers);
        let places = self.fanout.plan_place_orders(&mut self.registry, &placed, &self.followers);
        let amends = self.fanout.plan_amends(&mut self.registry, &amended, &self.followers);

        let fanout = &self.fanout;
        let (cancel_states, place_states, amend_results) = tokio::join!(
            fanout.execute_cancels(&cancels),
            fanout.execute_opens(&places),
            fanout.execute_amends(&amends),
        );

        for (plan, states) in cancels.iter().zip(cancel_states) {
            let d = plan.commit(&mut self.registry, states);
            log_dispatch(EventKind::OrderCanceled, &plan.id, d);
            self.push_report(report, EventKind::OrderCanceled, &plan.id);
        }
        for order in canceled {
            self.registry.remove(&EntityId::Order(order.id.clone()));
        }
        for (plan, states) in places.iter().zip(place_states) {
            let d = plan.commit(&mut self.registry, states);
            log_dispatch(EventKind::OrderPlaced, &plan.id, d);
            self.push_report(report, EventKind::OrderPlaced, &plan.id);
        }
        for (plan, results) in amends.iter().zip(amend_results) {
            let d = plan.commit(&mut self.registry, results);
            log_dispatch(EventKind::OrderAmended, &plan.id, d);
            self.push_report(report, EventKind::OrderAmended, &plan.id);
        }
    }

    async fn apply_closes(&mut self, closed: &[Position], report: &mut TickReport) {
        let mut targets: Vec<&Position> = Vec::new();
        for position in closed {
            let id = EntityId::Position(position.id);
            if self.registry.get(&id).is_none() {
                debug!(position_id = position.id, "Closed position was never linked");
                continue;
            }
            if self.registry.was_dispatched(&id, EventClass::Close) {
                self.registry.remove(&id);
                continue;
            }
            info!(position_id = position.id, symbol = %position.symbol, side = %position.side, "Leader closed position");
            targets.push(position);
        }
        if targets.is_empty() {
            return;
        }

        let plans = self.fanout.plan_closes(&mut self.registry, &targets, &self.followers);
        let anchor_ms = now_ms();
        let queries: Vec<OutcomeQuery<'_>> = plans
            .iter()
            .map(|plan| OutcomeQuery {
                phase: Phase::Close,
                symbol: &plan.record.symbol,
                side: plan.record.side,
                expected_volume: plan.record.volume,
                order_id: None,
                client_oid: None,
                position_id: plan.id.position_id(),
                anchor_ms,
                opened_at_ms: Some(plan.record.observed_at),
            })
            .collect();
        let leader = self.leader.client.as_ref();
        let resolver = &self.resolver;
        let (states, outcomes) = tokio::join!(
            self.fanout.execute_closes(&plans),
            join_all(queries.iter().map(move |q| resolver.resolve_outcome(leader, None, q))),
        );

        for ((plan, states), out) in plans.iter().zip(states).zip(outcomes) {
            let d = plan.commit(&mut self.registry, states);
            log_dispatch(EventKind::Closed, &plan.id, d);
            if let Some(rec) = self.registry.get_mut(&plan.id) {
                rec.exit_price = out.exit_price;
                rec.pnl = out.pnl;
                rec.margin = rec.margin.or(out.margin);
            }
            self.push_report(report, EventKind::Closed, &plan.id);
            self.registry.remove(&plan.id);
        }
    }

    async fn apply_opens(&mut self, opened: &[OpenedPosition], report: &mut TickReport) {
        let mut adopted: Vec<EntityId> = Vec::new();
        let mut fresh: Vec<&Position> = Vec::new();
        for o in opened {
            if let Some(id) = o
                .filled_order
                .as_ref()
                .and_then(|order| self.adopt_fill(order, &o.position))
            {
                adopted.push(id);
                continue;
            }
            let position = &o.position;
            if self
                .registry
                .was_dispatched(&EntityId::Position(position.id), EventClass::Open)
            {
                debug!(position_id = position.id, "Open already handled");
                continue;
            }
            info!(
                position_id = position.id,
                symbol = %position.symbol,
                side = %position.side,
                leverage = position.leverage,
                volume = position.volume,
                "Leader opened position"
            );
            fresh.push(position);
        }
        if adopted.is_empty() && fresh.is_empty() {
            return;
        }

        let fills = self.fanout.plan_fills(&self.registry, &adopted, &self.followers);
        let plans = self.fanout.plan_opens(&mut self.registry, &fresh, &self.followers);
        let anchor_ms = now_ms();
        let queries: Vec<OutcomeQuery<'_>> = plans
            .iter()
            .map(|plan| OutcomeQuery {
                phase: Phase::Open,
                symbol: &plan.leader.symbol,
                side: plan.leader.side,
                expected_volume: plan.leader.volume,
                order_id: None,
                client_oid: None,
                position_id: plan.id.position_id(),
                anchor_ms,
                opened_at_ms: None,
            })
            .collect();
        let fanout = &self.fanout;
        let leader = self.leader.client.as_ref();
        let resolver = &self.resolver;
        let (states, fill_outcomes, outcomes) = tokio::join!(
            fanout.execute_opens(&plans),
            fanout.execute_fills(&fills),
            join_all(queries.iter().map(move |q| resolver.resolve_outcome(leader, None, q))),
        );

        for (plan, outcomes) in fills.iter().zip(fill_outcomes) {
            plan.commit(&mut self.registry, outcomes);
            self.push_report(report, EventKind::Opened, &plan.id);
        }
        for ((plan, states), out) in plans.iter().zip(states).zip(outcomes) {
            let d = plan.commit(&mut self.registry, states);
            log_dispatch(EventKind::Opened, &plan.id, d);
            if let Some(rec) = self.registry.get_mut(&plan.id) {
                rec.price = rec.price.or(out.entry_price);
                rec.margin = out.margin;
            }
            self.push_report(report, EventKind::Opened, &plan.id);
        }
    }

    /// A mirrored resting order became this position: the followers already
    /// hold (or will hold) it through their own orders, so no market-open.
    fn adopt_fill(&mut self, order: &Order, position: &Position) -> Option<EntityId> {
        let mut record = self.registry.remove(&EntityId::Order(order.id.clone()))?;
        let id = EntityId::Position(position.id);
        record.volume = position.volume;
        record.leverage = position.leverage;
        record.price = position.entry_price.into();
        record.stop_loss_price = position.stop_loss_price;
        record.observed_at = now_ms();
        if !self.registry.register(id.clone(), record) {
            return None;
        }
        self.registry.mark_dispatched(&id, EventClass::Open);
        info!(
            position_id = position.id,
            order_id = %order.id,
            symbol = %position.symbol,
            side = %position.side,
            "Position opened by a mirrored order fill, market-open suppressed"
        );
        Some(id)
    }

    fn push_report(&self, report: &mut TickReport, kind: EventKind, id: &EntityId) {
        if let Some(rec) = self.registry.get(id) {
            report.push(event_report(kind, id, rec));
        }
    }

    async fn notify(&self, report: &TickReport) {
        for event in &report.events {
            self.deliver(event).await;
        }
    }

    async fn deliver(&self, event: &EventReport) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                warn!(kind = %event.kind, entity = %event.entity, error = %e, "Notification failed");
            }
        }
    }

    /// Tick until `shutdown` resolves. Shutdown is only observed between
    /// ticks, so an in-flight tick always completes.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            leader = %self.leader.name,
            followers = self.followers.len(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "Replication engine starting"
        );
        tokio::pin!(shutdown);
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Tick aborted, tracked state unchanged");
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!(linked = self.registry.len(), "Shutdown requested, engine stopped");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
