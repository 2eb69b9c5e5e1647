//! Spawn placement search.
//!
//! The master samples random positions that keep a clearance from every
//! existing entity. Each attempt is one sample; failed attempts are retried
//! from the scheduler after a fixed backoff, and once the attempt budget is
//! spent the clearance requirement is dropped.

use crate::peer::Peer;
use crate::scheduler::Continuation;
use log::{debug, warn};
use rand::Rng;
use shared::{ActorId, CoreError, Vec2};

pub fn random_position<R: Rng>(rng: &mut R, radius: f32, width: f32, height: f32) -> Vec2 {
    let max_x = (width - radius).max(radius);
    let max_y = (height - radius).max(radius);
    Vec2::new(
        if max_x > radius { rng.gen_range(radius..max_x) } else { radius },
        if max_y > radius { rng.gen_range(radius..max_y) } else { radius },
    )
}

pub fn is_clear(candidate: Vec2, radius: f32, occupied: &[(Vec2, f32)], clearance: f32) -> bool {
    occupied
        .iter()
        .all(|(position, other)| candidate.distance(*position) >= radius + other + clearance)
}

/// One placement attempt.
pub fn try_place<R: Rng>(
    rng: &mut R,
    occupied: &[(Vec2, f32)],
    radius: f32,
    clearance: f32,
    width: f32,
    height: f32,
) -> Option<Vec2> {
    let candidate = random_position(rng, radius, width, height);
    is_clear(candidate, radius, occupied, clearance).then_some(candidate)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementKind {
    Bot { actor: ActorId, name: String },
    Body,
}

#[derive(Debug, Clone)]
pub struct PlacementJob {
    pub kind: PlacementKind,
    pub attempts: u32,
}

impl Peer {
    pub(crate) fn start_placement(&mut self, kind: PlacementKind) -> u64 {
        let job = self.next_job;
        self.next_job += 1;
        self.placements.insert(job, PlacementJob { kind, attempts: 0 });
        self.attempt_placement(job);
        job
    }

    pub(crate) fn start_body_placement(&mut self) {
        self.start_placement(PlacementKind::Body);
    }

    pub(crate) fn pending_body_placements(&self) -> usize {
        self.placements
            .values()
            .filter(|job| job.kind == PlacementKind::Body)
            .count()
    }

    pub(crate) fn attempt_placement(&mut self, job: u64) {
        if !self.is_master() {
            debug!("Dropping placement job {} after losing master", job);
            self.placements.remove(&job);
            return;
        }
        let Some(entry) = self.placements.get_mut(&job) else {
            return;
        };
        entry.attempts += 1;
        let attempts = entry.attempts;
        let radius = match entry.kind {
            PlacementKind::Bot { .. } => self.config.combatant_radius,
            PlacementKind::Body => self.config.body_radius,
        };

        let occupied: Vec<(Vec2, f32)> = self.world.iter().map(|e| (e.position, e.radius)).collect();
        let (width, height) = (self.config.world_width, self.config.world_height);

        let position = match try_place(
            &mut self.rng,
            &occupied,
            radius,
            self.config.spawn_clearance,
            width,
            height,
        ) {
            Some(position) => position,
            None if attempts >= self.config.spawn_attempts => {
                let err = CoreError::ResourceUnavailable {
                    what: "clear spawn position",
                };
                warn!("{} after {} attempts, relaxing placement", err, attempts);
                random_position(&mut self.rng, radius, width, height)
            }
            None => {
                self.scheduler.schedule(
                    self.now + self.config.spawn_backoff(),
                    Continuation::PlacementRetry { job },
                );
                return;
            }
        };

        let Some(finished) = self.placements.remove(&job) else {
            return;
        };
        let result = match finished.kind {
            PlacementKind::Bot { actor, name } => self.finalize_bot_spawn(actor, name, position),
            PlacementKind::Body => self.spawn_body(position, Vec2::ZERO, true).map(|_| ()),
        };
        if let Err(e) = result {
            warn!("Placement job {} failed: {}", job, e);
        }
    }

    /// Cancels the newest pending bot placement, returning its actor id.
    pub(crate) fn cancel_newest_bot_placement(&mut self) -> Option<ActorId> {
        let (job, actor) = self
            .placements
            .iter()
            .rev()
            .find_map(|(job, entry)| match &entry.kind {
                PlacementKind::Bot { actor, .. } => Some((*job, *actor)),
                PlacementKind::Body => None,
            })?;
        self.placements.remove(&job);
        self.scheduler
            .cancel_where(|c| *c == Continuation::PlacementRetry { job });
        Some(actor)
    }

    pub(crate) fn pending_bot_placements(&self) -> usize {
        self.placements.len() - self.pending_body_placements()
    }
}
