use crate::destructible::FragmentState;
use crate::health::HealthRecord;
use shared::{EntityId, EntityKind, EntitySnapshot, PeerId, Vec2};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// Local replica of an entity. Ownership lives in the authority registry.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    pub health: Option<HealthRecord>,
    pub fragment: Option<FragmentState>,
    pub room_object: bool,
    pub tracked: bool,
}

impl Entity {
    pub fn new(id: EntityId, kind: EntityKind, position: Vec2, radius: f32) -> Self {
        Entity {
            id,
            kind,
            position,
            velocity: Vec2::ZERO,
            radius,
            health: None,
            fragment: None,
            room_object: false,
            tracked: false,
        }
    }

    pub fn from_snapshot(snapshot: &EntitySnapshot, now: Duration) -> Self {
        let fragment = match snapshot.kind {
            EntityKind::Body { tier } => {
                let age = Duration::from_millis(snapshot.tier_age_ms);
                Some(FragmentState::new(tier, now.saturating_sub(age)))
            }
            _ => None,
        };

        Entity {
            id: snapshot.id,
            kind: snapshot.kind,
            position: snapshot.position,
            velocity: snapshot.velocity,
            radius: snapshot.radius,
            health: snapshot
                .health
                .map(|h| HealthRecord::with_current(h.current, h.max)),
            fragment,
            room_object: snapshot.room_object,
            tracked: snapshot.tracked,
        }
    }

    pub fn snapshot(&self, owner: PeerId, now: Duration) -> EntitySnapshot {
        let kind = match (&self.kind, &self.fragment) {
            (EntityKind::Body { .. }, Some(fragment)) => EntityKind::Body {
                tier: fragment.tier,
            },
            (kind, _) => *kind,
        };

        EntitySnapshot {
            id: self.id,
            owner,
            kind,
            position: self.position,
            velocity: self.velocity,
            radius: self.radius,
            health: self.health.map(|h| h.snapshot()),
            room_object: self.room_object,
            tracked: self.tracked,
            tier_age_ms: self
                .fragment
                .as_ref()
                .map(|f| now.saturating_sub(f.tier_entered_at).as_millis() as u64)
                .unwrap_or(0),
        }
    }

    // Update entity position based on velocity and delta time
    pub fn update_position(&mut self, dt: f32, world_width: f32, world_height: f32) {
        self.position.x += self.velocity.x * dt;
        self.position.y += self.velocity.y * dt;

        // Bounce off the arena walls
        if self.position.x < self.radius || self.position.x > world_width - self.radius {
            self.velocity.x = -self.velocity.x;
        }
        if self.position.y < self.radius || self.position.y > world_height - self.radius {
            self.velocity.y = -self.velocity.y;
        }
        self.position.x = self.position.x.clamp(self.radius, (world_width - self.radius).max(self.radius));
        self.position.y = self.position.y.clamp(self.radius, (world_height - self.radius).max(self.radius));
    }
}

/// All entities this peer knows about, plus tombstones for destroyed ones.
///
/// Tombstones make removal final: a late or duplicated announcement for an
/// entity that was already destroyed cannot bring it back.
#[derive(Debug, Default)]
pub struct World {
    entities: HashMap<EntityId, Entity>,
    destroyed: HashSet<EntityId>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new entity. Returns false if it already exists or was destroyed.
    pub fn insert(&mut self, entity: Entity) -> bool {
        if self.destroyed.contains(&entity.id) || self.entities.contains_key(&entity.id) {
            return false;
        }
        self.entities.insert(entity.id, entity);
        true
    }

    /// Inserts or overwrites a replica. Destroyed entities stay destroyed.
    pub fn upsert(&mut self, entity: Entity) -> bool {
        if self.destroyed.contains(&entity.id) {
            return false;
        }
        self.entities.insert(entity.id, entity);
        true
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.destroyed.insert(id);
        self.entities.remove(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn is_destroyed(&self, id: EntityId) -> bool {
        self.destroyed.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn integrate(&mut self, dt: f32, world_width: f32, world_height: f32) {
        for entity in self.entities.values_mut() {
            entity.update_position(dt, world_width, world_height);
        }
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.destroyed.clear();
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::{ActorId, FragmentTier};

    fn combatant(id: u64) -> Entity {
        Entity::new(
            EntityId(id),
            EntityKind::Combatant { actor: ActorId(1) },
            Vec2::new(100.0, 100.0),
            16.0,
        )
    }

    #[test]
    fn test_removed_entities_cannot_return() {
        let mut world = World::new();
        assert!(world.insert(combatant(1)));
        assert!(!world.insert(combatant(1)));

        assert!(world.remove(EntityId(1)).is_some());
        assert!(world.is_destroyed(EntityId(1)));
        assert!(!world.insert(combatant(1)));
        assert!(!world.upsert(combatant(1)));
        assert!(world.is_empty());
    }

    #[test]
    fn test_update_position_bounces_off_walls() {
        let mut entity = combatant(1);
        entity.position = Vec2::new(20.0, 500.0);
        entity.velocity = Vec2::new(-100.0, 0.0);

        entity.update_position(0.1, 1000.0, 1000.0);

        assert_approx_eq!(entity.position.x, 16.0, 1e-4);
        assert!(entity.velocity.x > 0.0);
    }

    #[test]
    fn test_snapshot_preserves_tier_age() {
        let mut body = Entity::new(
            EntityId(3),
            EntityKind::Body {
                tier: FragmentTier::Half,
            },
            Vec2::new(300.0, 300.0),
            32.0,
        );
        body.fragment = Some(FragmentState::new(
            FragmentTier::Half,
            Duration::from_secs(10),
        ));
        body.room_object = true;

        let snapshot = body.snapshot(PeerId(1), Duration::from_secs(13));
        assert_eq!(snapshot.tier_age_ms, 3000);

        let replica = Entity::from_snapshot(&snapshot, Duration::from_secs(5));
        let fragment = replica.fragment.unwrap();
        assert_eq!(fragment.tier, FragmentTier::Half);
        assert_eq!(fragment.tier_entered_at, Duration::from_secs(2));
        assert!(replica.room_object);
    }
}
