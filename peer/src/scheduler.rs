//! Scheduled continuations for the per-peer update loop.
//!
//! Anything that has to happen "later" (closing a damage window, a fragment
//! timing out, the next placement attempt) is queued here and resumed from
//! [`crate::Peer::tick`]. Continuations carry ids, not references, and must
//! re-check that their entity still exists when they run.

use shared::{EntityId, FragmentTier};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    CloseDamageWindow { entity: EntityId, launch: u32 },
    FragmentTimeout { entity: EntityId, tier: FragmentTier },
    PlacementRetry { job: u64 },
}

impl Continuation {
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Continuation::CloseDamageWindow { entity, .. }
            | Continuation::FragmentTimeout { entity, .. } => Some(*entity),
            Continuation::PlacementRetry { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Scheduled {
    due: Duration,
    seq: u64,
    continuation: Continuation,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest deadline first; ties keep
    // insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Duration, continuation: Continuation) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Scheduled {
            due,
            seq,
            continuation,
        });
    }

    /// Removes and returns every continuation due at or before `now`, in
    /// deadline order.
    pub fn pop_due(&mut self, now: Duration) -> Vec<Continuation> {
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|next| next.due <= now) {
            if let Some(next) = self.queue.pop() {
                due.push(next.continuation);
            }
        }
        due
    }

    /// Drops every queued continuation about `entity`.
    pub fn cancel_entity(&mut self, entity: EntityId) -> usize {
        self.cancel_where(|c| c.entity() == Some(entity))
    }

    pub fn cancel_where(&mut self, predicate: impl Fn(&Continuation) -> bool) -> usize {
        let before = self.queue.len();
        let kept: Vec<Scheduled> = std::mem::take(&mut self.queue)
            .into_vec()
            .into_iter()
            .filter(|scheduled| !predicate(&scheduled.continuation))
            .collect();
        self.queue = BinaryHeap::from(kept);
        before - self.queue.len()
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.queue.peek().map(|next| next.due)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
