use crate::bots::bot_name;
use crate::entity::Entity;
use crate::peer::Peer;
use shared::{ActorId, EntityId, EntityKind, HealthSnapshot, Vec2};

/// Anything that drives a combatant, human or bot.
pub trait Controllable {
    fn actor_id(&self) -> ActorId;
    fn entity_id(&self) -> EntityId;
    /// Whether this peer may mutate the controlled entity.
    fn is_local_authority(&self) -> bool;
    fn health(&self) -> Option<HealthSnapshot>;
    fn position(&self) -> Vec2;

    fn is_alive(&self) -> bool {
        self.health().map_or(true, |h| h.current > 0)
    }

    fn is_bot(&self) -> bool {
        self.actor_id().is_synthetic()
    }
}

#[derive(Debug, Clone)]
pub struct PlayerController {
    actor: ActorId,
    entity: EntityId,
    local_authority: bool,
    health: Option<HealthSnapshot>,
    position: Vec2,
}

impl Controllable for PlayerController {
    fn actor_id(&self) -> ActorId {
        self.actor
    }

    fn entity_id(&self) -> EntityId {
        self.entity
    }

    fn is_local_authority(&self) -> bool {
        self.local_authority
    }

    fn health(&self) -> Option<HealthSnapshot> {
        self.health
    }

    fn position(&self) -> Vec2 {
        self.position
    }
}

#[derive(Debug, Clone)]
pub struct BotController {
    actor: ActorId,
    entity: EntityId,
    name: String,
    local_authority: bool,
    health: Option<HealthSnapshot>,
    position: Vec2,
}

impl BotController {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Controllable for BotController {
    fn actor_id(&self) -> ActorId {
        self.actor
    }

    fn entity_id(&self) -> EntityId {
        self.entity
    }

    fn is_local_authority(&self) -> bool {
        self.local_authority
    }

    fn health(&self) -> Option<HealthSnapshot> {
        self.health
    }

    fn position(&self) -> Vec2 {
        self.position
    }
}

impl Peer {
    /// The controller driving `entity`, if it is a combatant.
    pub fn controller_for(&self, entity: &Entity) -> Option<Box<dyn Controllable>> {
        let EntityKind::Combatant { actor } = entity.kind else {
            return None;
        };
        let local_authority = self.authority.owns(entity.id);
        let health = entity.health.map(|h| h.snapshot());

        if actor.is_synthetic() {
            let name = self
                .roster
                .get(actor)
                .map(|bot| bot.name.clone())
                .unwrap_or_else(|| bot_name(actor));
            return Some(Box::new(BotController {
                actor,
                entity: entity.id,
                name,
                local_authority,
                health,
                position: entity.position,
            }));
        }

        Some(Box::new(PlayerController {
            actor,
            entity: entity.id,
            local_authority,
            health,
            position: entity.position,
        }))
    }

    pub fn controller(&self, entity: EntityId) -> Option<Box<dyn Controllable>> {
        self.world.get(entity).and_then(|e| self.controller_for(e))
    }

    /// Every combatant in the room, players first, then bots newest first.
    pub fn controllables(&self) -> Vec<Box<dyn Controllable>> {
        let mut players: Vec<Box<dyn Controllable>> = self
            .world
            .iter()
            .filter_map(|entity| self.controller_for(entity))
            .filter(|controller| !controller.is_bot())
            .collect();
        players.sort_by_key(|player| player.actor_id());

        let bots = self
            .roster
            .iter()
            .filter_map(|bot| self.controller(bot.entity));

        players.into_iter().chain(bots).collect()
    }
}
