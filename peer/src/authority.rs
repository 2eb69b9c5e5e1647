//! Entity ownership.
//!
//! Exactly one peer owns each entity. Only the owner mutates the entity's
//! canonical state; everybody else holds a read-only cache fed by inbound
//! replication.

use shared::{CoreError, EntityId, PeerId};
use std::collections::HashMap;

#[derive(Debug)]
pub struct AuthorityRegistry {
    local: PeerId,
    owners: HashMap<EntityId, PeerId>,
}

impl AuthorityRegistry {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            owners: HashMap::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn register(&mut self, entity: EntityId, owner: PeerId) {
        self.owners.insert(entity, owner);
    }

    pub fn remove(&mut self, entity: EntityId) -> Option<PeerId> {
        self.owners.remove(&entity)
    }

    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.owners.get(&entity).copied()
    }

    /// Whether the local peer is the authority for `entity`.
    pub fn owns(&self, entity: EntityId) -> bool {
        self.owner_of(entity) == Some(self.local)
    }

    /// Hands authority of a locally owned entity to `new_owner`.
    ///
    /// After this returns the local peer is read-only for the entity.
    pub fn transfer(&mut self, entity: EntityId, new_owner: PeerId) -> Result<(), CoreError> {
        match self.owners.get_mut(&entity) {
            None => Err(CoreError::StaleReference { entity }),
            Some(owner) if *owner != self.local => Err(CoreError::UnauthorizedMutation {
                entity,
                owner: *owner,
            }),
            Some(owner) => {
                *owner = new_owner;
                Ok(())
            }
        }
    }

    /// Applies a transfer announced by the previous owner. Returns false for
    /// unknown entities.
    pub fn apply_transfer(&mut self, entity: EntityId, new_owner: PeerId) -> bool {
        match self.owners.get_mut(&entity) {
            Some(owner) => {
                *owner = new_owner;
                true
            }
            None => false,
        }
    }

    /// Moves every entity of `from` accepted by `filter` to `to`.
    pub fn reassign(
        &mut self,
        from: PeerId,
        to: PeerId,
        filter: impl Fn(EntityId) -> bool,
    ) -> Vec<EntityId> {
        let mut moved = Vec::new();
        for (entity, owner) in self.owners.iter_mut() {
            if *owner == from && filter(*entity) {
                *owner = to;
                moved.push(*entity);
            }
        }
        moved.sort();
        moved
    }

    /// Makes the local peer owner of every known entity. Returns the ones
    /// that changed hands.
    pub fn claim_all(&mut self) -> Vec<EntityId> {
        let local = self.local;
        let mut claimed: Vec<EntityId> = self
            .owners
            .iter_mut()
            .filter(|(_, owner)| **owner != local)
            .map(|(entity, owner)| {
                *owner = local;
                *entity
            })
            .collect();
        claimed.sort();
        claimed
    }

    pub fn owned_by(&self, peer: PeerId) -> Vec<EntityId> {
        let mut owned: Vec<EntityId> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == peer)
            .map(|(entity, _)| *entity)
            .collect();
        owned.sort();
        owned
    }

    pub fn reset(&mut self, local: PeerId) {
        self.local = local;
        self.owners.clear();
    }
}
