use serde::Serialize;

use crate::models::{FollowerId, Resolved, Side};
use crate::registry::{EntityId, MirrorStatus, ReplicationRecord};

// ===== Events =====
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Opened,
    Closed,
    OrderPlaced,
    OrderAmended,
    OrderCanceled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Opened => "opened",
            EventKind::Closed => "closed",
            EventKind::OrderPlaced => "order placed",
            EventKind::OrderAmended => "order amended",
            EventKind::OrderCanceled => "order canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowerOutcome {
    pub follower: FollowerId,
    pub label: String,
    pub status: MirrorStatus,
    pub volume: f64,
    pub leverage: u32,
    pub entry_price: Resolved<f64>,
    pub exit_price: Resolved<f64>,
    pub pnl: Resolved<f64>,
    pub margin: Resolved<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReport {
    pub kind: EventKind,
    pub entity: EntityId,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub volume: f64,
    pub price: Resolved<f64>,
    pub exit_price: Resolved<f64>,
    pub pnl: Resolved<f64>,
    pub margin: Resolved<f64>,
    pub followers: Vec<FollowerOutcome>,
}

impl EventReport {
    pub fn failed(&self) -> usize {
        self.followers
            .iter()
            .filter(|f| f.status.is_failed())
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.followers.len() - self.failed()
    }
}

/// The only mapping from a replication record to a report.
pub fn event_report(kind: EventKind, entity: &EntityId, record: &ReplicationRecord) -> EventReport {
    let followers = record
        .mirrors
        .iter()
        .map(|(id, m)| FollowerOutcome {
            follower: *id,
            label: m.label.clone(),
            status: m.status.clone(),
            volume: m.requested_volume,
            leverage: m.leverage,
            entry_price: m.entry_price,
            exit_price: m.exit_price,
            pnl: m.pnl,
            margin: m.margin,
        })
        .collect();
    EventReport {
        kind,
        entity: entity.clone(),
        symbol: record.symbol.clone(),
        side: record.side,
        leverage: record.leverage,
        volume: record.volume,
        price: record.price,
        exit_price: record.exit_price,
        pnl: record.pnl,
        margin: record.margin,
        followers,
    }
}

// ===== Tick =====
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub events: Vec<EventReport>,
}

impl TickReport {
    pub fn push(&mut self, event: EventReport) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}
