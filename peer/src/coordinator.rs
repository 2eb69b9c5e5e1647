//! Room coordinator: the master role and the room's peer set.
//!
//! The relay decides who is master. Peers only follow its `MasterChanged`
//! announcements, which carry an epoch so that late or duplicated ones are
//! ignored. Everything here runs on every peer; the master-only duties
//! check [`Peer::is_master`] before acting.

use crate::bus::Envelope;
use crate::peer::Peer;
use log::{debug, info, warn};
use shared::{ActorId, CoreError, EntityId, EntityKind, FragmentTier, PeerId, Rpc};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Unelected,
    Elected(PeerId),
    /// The master left and no replacement has been announced yet.
    Migrating { previous: PeerId },
}

/// A master-only timer that fires every `interval` of accumulated time.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    interval: Duration,
    elapsed: Duration,
}

impl PeriodicTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            elapsed: Duration::ZERO,
        }
    }

    pub fn advance(&mut self, dt: Duration) -> bool {
        self.elapsed += dt;
        if self.elapsed >= self.interval {
            self.elapsed = Duration::ZERO;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Hands out bot actor ids: -1, -2, ... Never reissues an id, including ids
/// that another master allocated before a migration.
#[derive(Debug, Clone)]
pub struct ActorIdAllocator {
    next: i32,
}

impl Default for ActorIdAllocator {
    fn default() -> Self {
        Self { next: -1 }
    }
}

impl ActorIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> ActorId {
        let id = ActorId(self.next);
        self.next = self.next.saturating_sub(1);
        id
    }

    /// Notes an id seen in the roster so it is never handed out again.
    pub fn observe(&mut self, actor: ActorId) {
        if actor.is_synthetic() && actor.0 <= self.next {
            self.next = actor.0.saturating_sub(1);
        }
    }
}

pub fn desired_bot_count(capacity: usize, humans: usize) -> usize {
    capacity.saturating_sub(humans)
}

#[derive(Debug)]
pub struct Coordinator {
    state: MasterState,
    epoch: u32,
    peers: BTreeSet<PeerId>,
    pub(crate) allocator: ActorIdAllocator,
    bodies: BTreeSet<EntityId>,
    refill: PeriodicTimer,
}

impl Coordinator {
    pub fn new(refill_interval: Duration) -> Self {
        Self {
            state: MasterState::Unelected,
            epoch: 0,
            peers: BTreeSet::new(),
            allocator: ActorIdAllocator::new(),
            bodies: BTreeSet::new(),
            refill: PeriodicTimer::new(refill_interval),
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn master(&self) -> Result<PeerId, CoreError> {
        match self.state {
            MasterState::Elected(master) => Ok(master),
            _ => Err(CoreError::CoordinatorAbsent),
        }
    }

    /// Applies an election announcement. Returns false for stale or repeated
    /// announcements.
    pub fn elect(&mut self, master: PeerId, epoch: u32) -> bool {
        if epoch < self.epoch || (epoch == self.epoch && self.state == MasterState::Elected(master)) {
            return false;
        }
        self.epoch = epoch;
        self.state = MasterState::Elected(master);
        self.refill.reset();
        true
    }

    pub fn begin_migration(&mut self, previous: PeerId) {
        if self.state == MasterState::Elected(previous) {
            self.state = MasterState::Migrating { previous };
            self.refill.reset();
        }
    }

    /// Returns false if the peer was already known.
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove_peer(&mut self, peer: PeerId) -> bool {
        self.peers.remove(&peer)
    }

    pub fn is_present(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    pub fn human_count(&self) -> usize {
        self.peers.len()
    }

    pub fn track_body(&mut self, entity: EntityId) {
        self.bodies.insert(entity);
    }

    pub fn untrack_body(&mut self, entity: EntityId) -> bool {
        self.bodies.remove(&entity)
    }

    pub fn tracked_bodies(&self) -> usize {
        self.bodies.len()
    }

    pub fn tick_refill(&mut self, dt: Duration) -> bool {
        self.refill.advance(dt)
    }

    pub fn refill_elapsed(&self) -> Duration {
        self.refill.elapsed()
    }

    /// Forgets the room. Actor ids keep counting down across rooms.
    pub fn reset(&mut self) {
        self.state = MasterState::Unelected;
        self.epoch = 0;
        self.peers.clear();
        self.bodies.clear();
        self.refill.reset();
    }

    /// Makes `local` its own master for offline play.
    pub fn go_solo(&mut self, local: PeerId) {
        self.peers.clear();
        self.peers.insert(local);
        self.epoch += 1;
        self.state = MasterState::Elected(local);
        self.refill.reset();
    }
}

impl Peer {
    pub fn is_master(&self) -> bool {
        self.coordinator.master() == Ok(self.local)
    }

    pub fn master(&self) -> Result<PeerId, CoreError> {
        self.coordinator.master()
    }

    /// Start of a fresh room session.
    pub fn on_welcome(&mut self, peer_id: PeerId, master: PeerId, epoch: u32, peers: &[PeerId]) {
        info!("Joined room as {} ({} peers, master {})", peer_id, peers.len(), master);
        self.reset_for_room(peer_id);
        self.coordinator.add_peer(peer_id);
        for peer in peers {
            self.coordinator.add_peer(*peer);
        }
        self.on_master_changed(master, epoch);
    }

    pub fn on_peer_joined(&mut self, peer: PeerId) {
        if peer == self.local || !self.coordinator.add_peer(peer) {
            return;
        }
        info!("{} joined the room", peer);

        // Late-join sync for everything that is not in the replay log
        for entity in self.authority.owned_by(self.local) {
            if let Some(snapshot) = self.world.get(entity).map(|e| e.snapshot(self.local, self.now)) {
                self.bus.deliver_to(peer, Rpc::SpawnEntity { entity: snapshot });
            }
        }

        if self.is_master() {
            self.reconcile_bots();
        }
    }

    pub fn on_peer_left(&mut self, peer: PeerId) {
        if !self.coordinator.remove_peer(peer) {
            return;
        }
        info!("{} left the room", peer);

        self.coordinator.begin_migration(peer);
        if let Ok(master) = self.coordinator.master() {
            self.adopt_orphans(master);
        }

        if self.is_master() {
            self.reconcile_bots();
        }
    }

    pub fn on_master_changed(&mut self, master: PeerId, epoch: u32) {
        if !self.coordinator.elect(master, epoch) {
            debug!("Ignoring stale election of {} (epoch {})", master, epoch);
            return;
        }
        info!("{} is master (epoch {})", master, epoch);

        self.adopt_orphans(master);
        let flushed = self.bus.flush_deferred(master);
        if flushed > 0 {
            debug!("Flushed {} deferred master messages", flushed);
        }

        if master == self.local {
            self.become_master();
        }
    }

    /// Room objects of departed peers go to `master`; anything else they
    /// owned leaves with them.
    fn adopt_orphans(&mut self, master: PeerId) {
        let departed: BTreeSet<PeerId> = self
            .world
            .iter()
            .filter_map(|entity| self.authority.owner_of(entity.id))
            .filter(|owner| *owner != self.local && !self.coordinator.is_present(*owner))
            .collect();

        for peer in departed {
            let world = &self.world;
            let adopted = self
                .authority
                .reassign(peer, master, |entity| world.get(entity).is_some_and(|e| e.room_object));
            if master == self.local {
                for entity in adopted {
                    self.on_gained_authority(entity);
                }
            }
            self.remove_owned_by(peer);
        }
    }

    /// Drops every entity still registered to `owner`.
    fn remove_owned_by(&mut self, owner: PeerId) {
        for entity in self.authority.owned_by(owner) {
            self.forget_entity(entity);
        }
    }

    // Local removal without telling anyone; the owner is gone.
    fn forget_entity(&mut self, entity: EntityId) {
        self.authority.remove(entity);
        if let Some(removed) = self.world.remove(entity) {
            self.after_removed(&removed);
        }
    }

    fn become_master(&mut self) {
        info!("Taking over master duties");

        // Rebuild the body registry from the local replica
        let tracked: Vec<EntityId> = self
            .world
            .iter()
            .filter(|e| {
                e.tracked
                    && matches!(
                        e.kind,
                        EntityKind::Body {
                            tier: FragmentTier::Whole
                        }
                    )
            })
            .map(|e| e.id)
            .collect();
        for entity in tracked {
            self.coordinator.track_body(entity);
        }

        self.reconcile_bots();
        self.refill_bodies();
    }

    /// Falls back to single-player: claim everything and act as master.
    pub fn go_offline(&mut self, reason: CoreError) {
        if self.bus.is_offline() {
            return;
        }
        warn!("Going offline: {}", reason);

        self.bus.set_offline(true);
        self.coordinator.go_solo(self.local);

        let dropped: Vec<EntityId> = self
            .world
            .iter()
            .filter(|e| !e.room_object && !self.authority.owns(e.id))
            .map(|e| e.id)
            .collect();
        for entity in dropped {
            self.forget_entity(entity);
        }
        for entity in self.authority.claim_all() {
            self.on_gained_authority(entity);
        }

        self.bus.flush_deferred(self.local);
        self.become_master();
    }

    pub fn is_offline(&self) -> bool {
        self.bus.is_offline()
    }

    pub(crate) fn run_master_duties(&mut self, dt: Duration) {
        if !self.is_master() {
            return;
        }
        if self.coordinator.tick_refill(dt) {
            self.refill_bodies();
        }
    }

    fn refill_bodies(&mut self) {
        let pending = self.pending_body_placements();
        let missing = self
            .config
            .target_bodies
            .saturating_sub(self.coordinator.tracked_bodies() + pending);
        if missing > 0 {
            debug!("Refilling {} bodies", missing);
        }
        for _ in 0..missing {
            self.start_body_placement();
        }
    }

    pub fn refill_elapsed(&self) -> Duration {
        self.coordinator.refill_elapsed()
    }

    pub(crate) fn on_untrack_body(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::UntrackBody { entity } = envelope.rpc else {
            return Ok(());
        };
        if !self.is_master() {
            debug!("Untrack of {} reached a non-master", entity);
            return Ok(());
        }
        self.coordinator.untrack_body(entity);
        Ok(())
    }
}
