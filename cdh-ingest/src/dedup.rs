use std::collections::{HashSet, VecDeque};

use cdh_core::EventId;

/// Bounded set of recently accepted event ids.
///
/// Once more than `capacity` ids are held, the oldest are dropped until only
/// the `retain` most recent remain. Trimming in bulk keeps the common insert
/// path O(1).
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
    retain: usize,
}

impl DedupWindow {
    /// `retain` is clamped below `capacity`. `FeedConfig::validate` rejects
    /// configurations where it is not.
    pub fn new(capacity: usize, retain: usize) -> Self {
        let retain = retain.min(capacity.saturating_sub(1));

        Self {
            seen: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
            capacity,
            retain,
        }
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    /// Records `id`. Returns `false` if it was already in the window.
    pub fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);

        if self.order.len() > self.capacity {
            let excess = self.order.len() - self.retain;
            for old in self.order.drain(..excess) {
                self.seen.remove(&old);
            }
        }

        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
