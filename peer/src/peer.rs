//! The per-participant runtime.
//!
//! A [`Peer`] owns every piece of local state and is driven by one update
//! loop: relay packets are fed in through [`Peer::handle_relay_packet`],
//! time moves forward through [`Peer::tick`], and whatever has to go out is
//! collected with [`Peer::take_outbox`]. Nothing here touches a socket.

use crate::authority::AuthorityRegistry;
use crate::bots::BotRoster;
use crate::bus::{Envelope, HandlerRegistry, MessageBus, Outgoing};
use crate::controllable::Controllable;
use crate::coordinator::Coordinator;
use crate::entity::{Entity, World};
use crate::health::{DedupWindow, HealthRecord};
use crate::placement::{random_position, PlacementJob};
use crate::scheduler::{Continuation, Scheduler};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{
    ActorId, CoreError, EntityId, EntityIdGenerator, EntityKind, GameConfig, Packet, PeerId, Rpc,
    RpcKind, Target, Vec2,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound on messages handled per drain, so a burst cannot stall a tick.
const MAX_DRAIN_PER_TICK: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub damage_events_applied: u64,
    pub health_transitions: u64,
    pub bot_spawns_issued: u64,
    pub bot_despawns_issued: u64,
    pub splits: u64,
    pub stale_dropped: u64,
}

pub struct Peer {
    pub(crate) local: PeerId,
    name: String,
    pub(crate) config: GameConfig,
    pub(crate) now: Duration,

    pub(crate) bus: MessageBus,
    handlers: HandlerRegistry<Peer>,
    pub(crate) authority: AuthorityRegistry,
    pub(crate) coordinator: Coordinator,
    pub(crate) world: World,
    pub(crate) scheduler: Scheduler,
    pub(crate) roster: BotRoster,

    pub(crate) placements: BTreeMap<u64, PlacementJob>,
    pub(crate) next_job: u64,
    pub(crate) ids: EntityIdGenerator,
    pub(crate) rng: StdRng,

    pub(crate) damage_requests: u64,
    pub(crate) damage_seen: DedupWindow,
    pub(crate) stats: PeerStats,
    avatar: Option<EntityId>,
}

impl Peer {
    pub fn new(name: &str, config: GameConfig) -> Self {
        let local = PeerId::OFFLINE;
        let refill = config.body_refill_interval();
        Self {
            local,
            name: name.to_string(),
            config,
            now: Duration::ZERO,
            bus: MessageBus::new(local),
            handlers: Self::build_handlers(),
            authority: AuthorityRegistry::new(local),
            coordinator: Coordinator::new(refill),
            world: World::new(),
            scheduler: Scheduler::new(),
            roster: BotRoster::new(),
            placements: BTreeMap::new(),
            next_job: 0,
            ids: EntityIdGenerator::new(local),
            rng: StdRng::seed_from_u64(local.0 as u64),
            damage_requests: 0,
            damage_seen: DedupWindow::default(),
            stats: PeerStats::default(),
            avatar: None,
        }
    }

    fn build_handlers() -> HandlerRegistry<Peer> {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(RpcKind::SpawnEntity, Peer::on_spawn_entity)
            .register(RpcKind::DestroyEntity, Peer::on_destroy_entity)
            .register(RpcKind::TransferOwnership, Peer::on_transfer_ownership)
            .register(RpcKind::ApplyDamage, Peer::on_apply_damage)
            .register(RpcKind::SyncHealth, Peer::on_sync_health)
            .register(RpcKind::SplitIntoHalves, Peer::on_split)
            .register(RpcKind::SplitIntoQuarters, Peer::on_split)
            .register(RpcKind::ImpactBody, Peer::on_impact_body)
            .register(RpcKind::LaunchBody, Peer::on_launch_body)
            .register(RpcKind::AddBotToClients, Peer::on_add_bot)
            .register(RpcKind::RemoveBotFromClients, Peer::on_remove_bot)
            .register(RpcKind::UntrackBody, Peer::on_untrack_body);
        handlers
    }

    /// Drops all room state and takes on a new identity.
    pub(crate) fn reset_for_room(&mut self, local: PeerId) {
        self.local = local;
        self.bus.reset(local);
        self.authority.reset(local);
        self.coordinator.reset();
        self.world.clear();
        self.scheduler.clear();
        self.roster.clear();
        self.placements.clear();
        self.ids = EntityIdGenerator::new(local);
        self.rng = StdRng::seed_from_u64(local.0 as u64);
        self.damage_seen.clear();
        self.avatar = None;
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.world.get(id)
    }

    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.authority.owner_of(entity)
    }

    pub fn owns(&self, entity: EntityId) -> bool {
        self.authority.owns(entity)
    }

    pub fn health_of(&self, entity: EntityId) -> Option<u32> {
        self.world.get(entity)?.health.map(|h| h.current())
    }

    pub fn avatar(&self) -> Option<EntityId> {
        self.avatar
    }

    pub fn epoch(&self) -> u32 {
        self.coordinator.epoch()
    }

    pub fn pending_placements(&self) -> usize {
        self.placements.len()
    }

    pub fn tracked_bodies(&self) -> usize {
        self.coordinator.tracked_bodies()
    }

    /// Sends `rpc` to `target`, resolving the owner and master from local
    /// state.
    pub fn send(&mut self, target: Target, rpc: Rpc) -> Result<(), CoreError> {
        let owner = rpc.entity().and_then(|entity| self.authority.owner_of(entity));
        let master = self.coordinator.master();
        self.bus.send(target, rpc, owner, master)
    }

    /// Messages for the relay produced since the last call.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        self.bus.take_outbox()
    }

    /// Feeds one packet from the relay into the peer.
    pub fn handle_relay_packet(&mut self, packet: Packet) -> Result<(), CoreError> {
        match packet {
            Packet::Welcome {
                peer_id,
                master,
                epoch,
                peers,
            } => self.on_welcome(peer_id, master, epoch, &peers),
            Packet::Deliver { sender, rpc } => self.bus.receive(sender, rpc),
            Packet::PeerJoined { peer } => self.on_peer_joined(peer),
            Packet::PeerLeft { peer } => self.on_peer_left(peer),
            Packet::MasterChanged { master, epoch } => self.on_master_changed(master, epoch),
            Packet::Rejected { reason } => {
                return Err(CoreError::NetworkPartition { reason });
            }
            Packet::Heartbeat => {}
            other => debug!("Ignoring unexpected packet {:?}", other),
        }
        Ok(())
    }

    /// One step of the update loop at room time `now`.
    pub fn tick(&mut self, now: Duration) {
        let dt = now.saturating_sub(self.now);
        self.now = self.now.max(now);

        self.world.integrate(
            dt.as_secs_f32(),
            self.config.world_width,
            self.config.world_height,
        );
        self.drain_inbox();

        for continuation in self.scheduler.pop_due(self.now) {
            self.run_continuation(continuation);
        }
        self.run_master_duties(dt);

        // Loopback traffic produced above
        self.drain_inbox();
    }

    pub fn drain_inbox(&mut self) {
        let mut handled = 0;
        while handled < MAX_DRAIN_PER_TICK {
            let Some(envelope) = self.bus.pop_inbound() else {
                break;
            };
            self.dispatch(&envelope);
            handled += 1;
        }
        if self.bus.inbox_len() > 0 {
            debug!("{} messages left for the next tick", self.bus.inbox_len());
        }
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        let kind = envelope.rpc.kind();
        let Some(handler) = self.handlers.get(kind) else {
            warn!("No handler registered for {:?}", kind);
            return;
        };
        match handler(self, envelope) {
            Ok(()) => {}
            Err(CoreError::StaleReference { entity }) => {
                self.stats.stale_dropped += 1;
                debug!("Dropped {:?} from {} for stale {}", kind, envelope.sender, entity);
            }
            Err(e) => warn!("{:?} from {} failed: {}", kind, envelope.sender, e),
        }
    }

    fn run_continuation(&mut self, continuation: Continuation) {
        let result = match continuation {
            Continuation::CloseDamageWindow { entity, launch } => {
                self.on_close_damage_window(entity, launch);
                Ok(())
            }
            Continuation::FragmentTimeout { entity, tier } => self.on_fragment_timeout(entity, tier),
            Continuation::PlacementRetry { job } => {
                self.attempt_placement(job);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("Continuation failed: {}", e);
        }
    }

    /// Creates this peer's own combatant.
    pub fn spawn_avatar(&mut self) -> Result<EntityId, CoreError> {
        if let Some(existing) = self.avatar.filter(|id| self.world.contains(*id)) {
            return Ok(existing);
        }

        let radius = self.config.combatant_radius;
        let position = random_position(
            &mut self.rng,
            radius,
            self.config.world_width,
            self.config.world_height,
        );
        let id = self.ids.next_id();
        let mut avatar = Entity::new(
            id,
            EntityKind::Combatant {
                actor: ActorId::human(self.local),
            },
            position,
            radius,
        );
        avatar.health = Some(HealthRecord::new(self.config.player_max_health));

        self.create_owned(avatar)?;
        self.avatar = Some(id);
        Ok(id)
    }

    /// Creates a fragile drone owned by this peer.
    pub fn spawn_drone(&mut self, position: Vec2) -> Result<EntityId, CoreError> {
        let id = self.ids.next_id();
        let mut drone = Entity::new(id, EntityKind::Drone, position, self.config.combatant_radius * 0.5);
        drone.health = Some(HealthRecord::new(self.config.drone_max_health));
        self.create_owned(drone)?;
        Ok(id)
    }

    fn create_owned(&mut self, entity: Entity) -> Result<(), CoreError> {
        let id = entity.id;
        let snapshot = entity.snapshot(self.local, self.now);
        if !self.world.insert(entity) {
            return Err(CoreError::StaleReference { entity: id });
        }
        self.authority.register(id, self.local);
        info!("{} created {:?}", self.local, snapshot.kind);
        self.send(Target::All, Rpc::SpawnEntity { entity: snapshot })
    }

    /// Hands an owned entity to `new_owner` and tells everyone.
    pub fn transfer_ownership(&mut self, entity: EntityId, new_owner: PeerId) -> Result<(), CoreError> {
        if !self.world.contains(entity) {
            return Err(CoreError::StaleReference { entity });
        }
        self.authority.transfer(entity, new_owner)?;
        self.scheduler.cancel_entity(entity);
        info!("Transferring {} to {}", entity, new_owner);
        self.send(Target::All, Rpc::TransferOwnership { entity, new_owner })
    }

    /// Removes an owned entity everywhere.
    pub fn destroy_entity(&mut self, entity: EntityId) -> Result<(), CoreError> {
        match self.authority.owner_of(entity) {
            None => return Err(CoreError::StaleReference { entity }),
            Some(owner) if owner != self.local => {
                return Err(CoreError::UnauthorizedMutation { entity, owner });
            }
            Some(_) => {}
        }
        let Some(removed) = self.world.remove(entity) else {
            return Err(CoreError::StaleReference { entity });
        };
        self.authority.remove(entity);
        info!("Destroyed {}", entity);

        self.send(Target::Others, Rpc::DestroyEntity { entity })?;
        if removed.tracked {
            self.send(Target::MasterOnly, Rpc::UntrackBody { entity })?;
        }
        self.after_removed(&removed);
        Ok(())
    }

    /// Local cleanup shared by every removal path.
    pub(crate) fn after_removed(&mut self, removed: &Entity) {
        self.scheduler.cancel_entity(removed.id);
        if self.avatar == Some(removed.id) {
            self.avatar = None;
        }
        if let Some(controller) = self.controller_for(removed).filter(|c| c.is_bot()) {
            self.on_bot_entity_destroyed(controller.actor_id());
        }
    }

    /// Called when this peer becomes the owner of `entity` through a
    /// transfer, a migration or offline fallback.
    pub(crate) fn on_gained_authority(&mut self, entity: EntityId) {
        self.scheduler.cancel_entity(entity);
        if let Some(fragment) = self.world.get_mut(entity).and_then(|e| e.fragment.as_mut()) {
            fragment.split_pending = false;
        }
        self.arm_fragment_timer(entity);
    }

    fn on_spawn_entity(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::SpawnEntity { entity: ref snapshot } = envelope.rpc else {
            return Ok(());
        };
        let id = snapshot.id;
        if self.world.is_destroyed(id) {
            return Err(CoreError::StaleReference { entity: id });
        }
        if self.authority.owns(id) {
            return Ok(());
        }

        let mut replica = Entity::from_snapshot(snapshot, self.now);
        let known = self.world.get(id);
        // Health never goes back up on a replica
        if let (Some(cached), Some(incoming)) = (known.and_then(|e| e.health), replica.health.as_mut()) {
            if cached.current() < incoming.current() {
                *incoming = cached;
            }
        }
        let take_owner = known.is_none() || envelope.sender == snapshot.owner;

        self.world.upsert(replica);
        if take_owner {
            self.authority.register(id, snapshot.owner);
        }
        Ok(())
    }

    fn on_destroy_entity(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::DestroyEntity { entity } = envelope.rpc else {
            return Ok(());
        };
        if !self.world.contains(entity) {
            // Tombstone it anyway in case the spawn is still on its way
            self.world.remove(entity);
            return Err(CoreError::StaleReference { entity });
        }
        if self.authority.owns(entity) && envelope.sender != self.local {
            return Err(CoreError::UnauthorizedMutation {
                entity,
                owner: self.local,
            });
        }

        if let Some(removed) = self.world.remove(entity) {
            self.authority.remove(entity);
            self.after_removed(&removed);
        }
        Ok(())
    }

    fn on_transfer_ownership(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::TransferOwnership { entity, new_owner } = envelope.rpc else {
            return Ok(());
        };
        if !self.world.contains(entity) {
            return Err(CoreError::StaleReference { entity });
        }

        let was_mine = self.authority.owns(entity);
        self.authority.apply_transfer(entity, new_owner);
        if new_owner == self.local && !was_mine {
            info!("Gained authority over {}", entity);
            self.on_gained_authority(entity);
        }
        Ok(())
    }
}
