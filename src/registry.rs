use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use serde::Serialize;

use crate::models::{FollowerId, MarginMode, OrderId, PositionId, Resolved, Side};

// ===== Keys =====

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityId {
    Position(PositionId),
    Order(OrderId),
}

impl EntityId {
    pub fn position_id(&self) -> Option<PositionId> {
        match self {
            EntityId::Position(id) => Some(*id),
            EntityId::Order(_) => None,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Position(id) => write!(f, "position {id}"),
            EntityId::Order(id) => write!(f, "order {id}"),
        }
    }
}

// dispatched at most once per entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Open,
    Close,
    Cancel,
}

// ===== Records =====
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MirrorStatus {
    Pending,
    Live,
    Closed,
    Canceled,
    Failed(String),
}

impl MirrorStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, MirrorStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowerMirrorState {
    pub label: String,
    pub remote_id: Option<String>,
    pub requested_volume: f64,
    pub leverage: u32,
    pub status: MirrorStatus,
    pub entry_price: Resolved<f64>,
    pub exit_price: Resolved<f64>,
    pub pnl: Resolved<f64>,
    pub margin: Resolved<f64>,
}

impl FollowerMirrorState {
    pub fn pending(label: impl Into<String>, requested_volume: f64, leverage: u32) -> Self {
        Self {
            label: label.into(),
            remote_id: None,
            requested_volume,
            leverage,
            status: MirrorStatus::Pending,
            entry_price: Resolved::Unavailable,
            exit_price: Resolved::Unavailable,
            pnl: Resolved::Unavailable,
            margin: Resolved::Unavailable,
        }
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.status = MirrorStatus::Failed(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationRecord {
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub volume: f64,
    pub price: Resolved<f64>,
    pub stop_loss_price: Option<f64>,
    pub exit_price: Resolved<f64>,
    pub pnl: Resolved<f64>,
    pub margin: Resolved<f64>,
    pub observed_at: i64,
    pub mirrors: BTreeMap<FollowerId, FollowerMirrorState>,
}

impl ReplicationRecord {
    pub fn new(symbol: impl Into<String>, side: Side, leverage: u32, margin_mode: MarginMode, volume: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            leverage,
            margin_mode,
            volume,
            price: Resolved::Unavailable,
            stop_loss_price: None,
            exit_price: Resolved::Unavailable,
            pnl: Resolved::Unavailable,
            margin: Resolved::Unavailable,
            observed_at: chrono::Utc::now().timestamp_millis(),
            mirrors: BTreeMap::new(),
        }
    }

    pub fn live_mirrors(&self) -> impl Iterator<Item = (FollowerId, &FollowerMirrorState)> + '_ {
        self.mirrors
            .iter()
            .filter(|(_, m)| m.status == MirrorStatus::Live && m.remote_id.is_some())
            .map(|(id, m)| (*id, m))
    }
}

// ===== Registry =====
/// Owned by the tick loop; a restart forgets every link.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    records: AHashMap<EntityId, ReplicationRecord>,
    dispatched: AHashSet<(EntityId, EventClass)>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // keeps the existing record if `id` is already linked
    pub fn register(&mut self, id: EntityId, record: ReplicationRecord) -> bool {
        if self.records.contains_key(&id) {
            return false;
        }
        self.records.insert(id, record);
        true
    }

    pub fn update_follower(&mut self, id: &EntityId, follower: FollowerId, state: FollowerMirrorState) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.mirrors.insert(follower, state);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&ReplicationRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut ReplicationRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<ReplicationRecord> {
        self.dispatched.retain(|(e, _)| e != id);
        self.records.remove(id)
    }

    pub fn mark_dispatched(&mut self, id: &EntityId, class: EventClass) -> bool {
        self.dispatched.insert((id.clone(), class))
    }

    pub fn was_dispatched(&self, id: &EntityId, class: EventClass) -> bool {
        self.dispatched.contains(&(id.clone(), class))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ReplicationRecord {
        ReplicationRecord::new("BTC_USDT", Side::Long, 10, MarginMode::Isolated, 5.0)
    }

    #[test]
    fn register_is_unique_per_entity() {
        let mut reg = LinkRegistry::new();
        let id = EntityId::Position(7);
        assert!(reg.register(id.clone(), record()));
        let mut other = record();
        other.volume = 99.0;
        assert!(!reg.register(id.clone(), other));
        assert_eq!(reg.get(&id).map(|r| r.volume), Some(5.0));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn update_follower_requires_record() {
        let mut reg = LinkRegistry::new();
        let id = EntityId::Order("o-1".into());
        let state = FollowerMirrorState::pending("acct-1", 2.0, 5);
        assert!(!reg.update_follower(&id, FollowerId(0), state.clone()));
        reg.register(id.clone(), record());
        assert!(reg.update_follower(&id, FollowerId(0), state));
        assert_eq!(reg.get(&id).unwrap().mirrors.len(), 1);
    }

    #[test]
    fn dispatch_marks_are_one_shot_and_cleared_on_remove() {
        let mut reg = LinkRegistry::new();
        let id = EntityId::Position(1);
        reg.register(id.clone(), record());
        assert!(reg.mark_dispatched(&id, EventClass::Open));
        assert!(!reg.mark_dispatched(&id, EventClass::Open));
        assert!(reg.mark_dispatched(&id, EventClass::Close));
        assert!(reg.remove(&id).is_some());
        assert!(!reg.was_dispatched(&id, EventClass::Open));
        assert!(reg.is_empty());
    }

    #[test]
    fn live_mirrors_skip_failed_and_idless() {
        let mut rec = record();
        let mut live = FollowerMirrorState::pending("a", 1.0, 3);
        live.status = MirrorStatus::Live;
        live.remote_id = Some("x".into());
        rec.mirrors.insert(FollowerId(0), live);
        rec.mirrors.insert(FollowerId(1), FollowerMirrorState::pending("b", 1.0, 3).failed("rejected"));
        let mut no_id = FollowerMirrorState::pending("c", 1.0, 3);
        no_id.status = MirrorStatus::Live;
        rec.mirrors.insert(FollowerId(2), no_id);
        let ids: Vec<_> = rec.live_mirrors().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![FollowerId(0)]);
    }
}
