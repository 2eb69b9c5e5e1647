//! Bot lifecycle: the master keeps the room topped up to its capacity.
//!
//! Humans and bots share the capacity. Whenever the human count changes the
//! master spawns or despawns exactly the difference, counting placements
//! that are still searching for a position. Roster changes go out as
//! buffered messages so late joiners see the current bots.

use crate::bus::Envelope;
use crate::coordinator::desired_bot_count;
use crate::entity::Entity;
use crate::health::HealthRecord;
use crate::peer::Peer;
use crate::placement::PlacementKind;
use log::{debug, info, warn};
use shared::{ActorId, CoreError, EntityId, EntityKind, PeerId, Rpc, Target, Vec2};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotEntry {
    pub actor: ActorId,
    pub entity: EntityId,
    pub name: String,
}

/// Bots known to this peer, ordered newest first (most negative actor id).
/// Removed actors are remembered so a reordered announcement cannot bring
/// them back.
#[derive(Debug, Default)]
pub struct BotRoster {
    bots: BTreeMap<ActorId, BotEntry>,
    retired: BTreeSet<ActorId>,
}

impl BotRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: BotEntry) -> bool {
        if self.bots.contains_key(&entry.actor) || self.retired.contains(&entry.actor) {
            return false;
        }
        self.bots.insert(entry.actor, entry);
        true
    }

    pub fn remove(&mut self, actor: ActorId) -> Option<BotEntry> {
        self.retired.insert(actor);
        self.bots.remove(&actor)
    }

    pub fn is_retired(&self, actor: ActorId) -> bool {
        self.retired.contains(&actor)
    }

    pub fn get(&self, actor: ActorId) -> Option<&BotEntry> {
        self.bots.get(&actor)
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.bots.contains_key(&actor)
    }

    pub fn newest(&self) -> Option<ActorId> {
        self.bots.keys().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BotEntry> {
        self.bots.values()
    }

    pub fn actors(&self) -> Vec<ActorId> {
        self.bots.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.bots.clear();
        self.retired.clear();
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}

pub fn bot_name(actor: ActorId) -> String {
    format!("Bot {}", actor.0.unsigned_abs())
}

impl Peer {
    /// Spawns or despawns bots until the room holds `capacity` actors.
    pub fn reconcile_bots(&mut self) {
        if !self.is_master() {
            return;
        }

        let desired = desired_bot_count(self.config.bot_capacity, self.coordinator.human_count());
        let current = self.roster.len() + self.pending_bot_placements();

        if desired > current {
            info!("Spawning {} bots ({} -> {})", desired - current, current, desired);
            for _ in current..desired {
                self.spawn_bot();
            }
        } else if current > desired {
            info!("Despawning {} bots ({} -> {})", current - desired, current, desired);
            for _ in desired..current {
                self.despawn_newest_bot();
            }
        }
    }

    fn spawn_bot(&mut self) {
        let actor = self.coordinator.allocator.allocate();
        self.stats.bot_spawns_issued += 1;
        self.start_placement(PlacementKind::Bot {
            actor,
            name: bot_name(actor),
        });
    }

    fn despawn_newest_bot(&mut self) {
        // Bots still searching for a spot go first
        if let Some(actor) = self.cancel_newest_bot_placement() {
            debug!("Cancelled placement of {}", actor);
            self.stats.bot_despawns_issued += 1;
            return;
        }
        let Some(actor) = self.roster.newest() else {
            return;
        };
        self.stats.bot_despawns_issued += 1;
        self.remove_bot_locally(actor);
        if let Err(e) = self.send(Target::AllBuffered, Rpc::RemoveBotFromClients { actor }) {
            warn!("Failed to announce removal of {}: {}", actor, e);
        }
    }

    pub(crate) fn finalize_bot_spawn(&mut self, actor: ActorId, name: String, position: Vec2) -> Result<(), CoreError> {
        let entity = self.ids.next_id();
        self.insert_bot(actor, entity, name.clone(), position, self.local);
        info!("{} ({}) spawned as {}", name, actor, entity);

        self.send(
            Target::AllBuffered,
            Rpc::AddBotToClients {
                actor,
                entity,
                name,
                position,
            },
        )?;

        if self.config.distribute_bots {
            if let Some(peer) = self.least_loaded_human() {
                self.transfer_ownership(entity, peer)?;
            }
        }
        Ok(())
    }

    fn insert_bot(&mut self, actor: ActorId, entity: EntityId, name: String, position: Vec2, owner: PeerId) {
        self.coordinator.allocator.observe(actor);
        if self.world.is_destroyed(entity)
            || self.roster.contains(actor)
            || self.roster.is_retired(actor)
        {
            return;
        }

        let mut bot = Entity::new(
            entity,
            EntityKind::Combatant { actor },
            position,
            self.config.combatant_radius,
        );
        bot.health = Some(HealthRecord::new(self.config.bot_max_health));
        bot.room_object = true;

        self.roster.insert(BotEntry { actor, entity, name });
        if self.world.insert(bot) {
            self.authority.register(entity, owner);
        }
    }

    fn remove_bot_locally(&mut self, actor: ActorId) {
        let Some(entry) = self.roster.remove(actor) else {
            return;
        };
        if let Some(removed) = self.world.remove(entry.entity) {
            self.authority.remove(entry.entity);
            self.after_removed(&removed);
        }
        info!("{} ({}) removed", entry.name, actor);
    }

    /// The human peer owning the fewest bots, master excluded when others exist.
    fn least_loaded_human(&self) -> Option<PeerId> {
        let humans: Vec<PeerId> = self
            .coordinator
            .peers()
            .filter(|peer| *peer != self.local)
            .collect();
        humans.into_iter().min_by_key(|peer| {
            self.roster
                .iter()
                .filter(|bot| self.authority.owner_of(bot.entity) == Some(*peer))
                .count()
        })
    }

    /// Called when a bot's entity was destroyed (killed, not despawned). The
    /// master retires the actor id and reconciles, which spawns a
    /// replacement with a fresh id.
    pub(crate) fn on_bot_entity_destroyed(&mut self, actor: ActorId) {
        if !self.is_master() || !self.roster.contains(actor) {
            return;
        }
        self.roster.remove(actor);
        if let Err(e) = self.send(Target::AllBuffered, Rpc::RemoveBotFromClients { actor }) {
            warn!("Failed to announce removal of {}: {}", actor, e);
        }
        self.reconcile_bots();
    }

    pub(crate) fn on_add_bot(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::AddBotToClients {
            actor,
            entity,
            ref name,
            position,
        } = envelope.rpc
        else {
            return Ok(());
        };

        // Announcements from a departed master belong to the current one
        let owner = if self.coordinator.is_present(envelope.sender) {
            envelope.sender
        } else {
            self.coordinator.master().unwrap_or(envelope.sender)
        };
        self.insert_bot(actor, entity, name.clone(), position, owner);
        Ok(())
    }

    pub(crate) fn on_remove_bot(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::RemoveBotFromClients { actor } = envelope.rpc else {
            return Ok(());
        };
        self.coordinator.allocator.observe(actor);
        self.remove_bot_locally(actor);
        Ok(())
    }

    pub fn bots(&self) -> &BotRoster {
        &self.roster
    }
}
