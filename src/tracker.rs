use ahash::AHashMap;

use crate::models::{Order, OrderId, Position, PositionId, Side};

// ===== Snapshot =====
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub positions: AHashMap<PositionId, Position>,
    pub orders: AHashMap<OrderId, Order>,
}

impl Snapshot {
    pub fn new(positions: Vec<Position>, orders: Vec<Order>) -> Self {
        Self {
            positions: positions.into_iter().map(|p| (p.id, p)).collect(),
            orders: orders.into_iter().map(|o| (o.id.clone(), o)).collect(),
        }
    }

    pub fn has_position(&self, symbol: &str, side: Side) -> bool {
        self.positions
            .values()
            .any(|p| p.symbol == symbol && p.side == side)
    }
}

// ===== Diff =====
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRemoval {
    // a position with the same symbol and side exists now
    Filled,
    Canceled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAmendment {
    pub before: Order,
    pub after: Order,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenedPosition {
    pub position: Position,
    /// Resting order that filled into this position in the same tick
    pub filled_order: Option<Order>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub opened: Vec<OpenedPosition>,
    pub closed: Vec<Position>,
    pub placed: Vec<Order>,
    pub amended: Vec<OrderAmendment>,
    pub removed: Vec<(Order, OrderRemoval)>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
            && self.closed.is_empty()
            && self.placed.is_empty()
            && self.amended.is_empty()
            && self.removed.is_empty()
    }
}

fn order_changed(before: &Order, after: &Order) -> bool {
    before.price != after.price || before.volume != after.volume
}

/// Output vectors are sorted by id.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut opened: Vec<Position> = current
        .positions
        .values()
        .filter(|p| !previous.positions.contains_key(&p.id))
        .cloned()
        .collect();
    opened.sort_by_key(|p| p.id);

    let mut closed: Vec<Position> = previous
        .positions
        .values()
        .filter(|p| !current.positions.contains_key(&p.id))
        .cloned()
        .collect();
    closed.sort_by_key(|p| p.id);

    let mut placed: Vec<Order> = current
        .orders
        .values()
        .filter(|o| !previous.orders.contains_key(&o.id))
        .cloned()
        .collect();
    placed.sort_by(|a, b| a.id.cmp(&b.id));

    let mut amended: Vec<OrderAmendment> = current
        .orders
        .values()
        .filter_map(|after| {
            let before = previous.orders.get(&after.id)?;
            order_changed(before, after).then(|| OrderAmendment {
                before: before.clone(),
                after: after.clone(),
            })
        })
        .collect();
    amended.sort_by(|a, b| a.after.id.cmp(&b.after.id));

    let mut removed: Vec<(Order, OrderRemoval)> = previous
        .orders
        .values()
        .filter(|o| !current.orders.contains_key(&o.id))
        .map(|o| {
            let kind = if current.has_position(&o.symbol, o.side) {
                OrderRemoval::Filled
            } else {
                OrderRemoval::Canceled
            };
            (o.clone(), kind)
        })
        .collect();
    removed.sort_by(|a, b| a.0.id.cmp(&b.0.id));

    // A fill only suppresses a market-open when its position is new this tick.
    let mut fills: Vec<&Order> = removed
        .iter()
        .filter(|(_, kind)| *kind == OrderRemoval::Filled)
        .map(|(o, _)| o)
        .collect();
    let opened = opened
        .into_iter()
        .map(|position| {
            let idx = fills
                .iter()
                .position(|o| o.symbol == position.symbol && o.side == position.side);
            let filled_order = idx.map(|i| fills.remove(i).clone());
            OpenedPosition {
                position,
                filled_order,
            }
        })
        .collect();

    SnapshotDiff {
        opened,
        closed,
        placed,
        amended,
        removed,
    }
}

// ===== Tracker =====
#[derive(Debug, Default)]
pub struct StateTracker {
    last: Snapshot,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> &Snapshot {
        &self.last
    }

    pub fn advance(&mut self, current: Snapshot) -> SnapshotDiff {
        let d = diff(&self.last, &current);
        self.last = current;
        d
    }
}
