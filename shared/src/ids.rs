//! Identifier types shared by every participant in a room.
//!
//! Human actors reuse their positive [`PeerId`] as actor number, while
//! synthetic actors (bots) live in the negative half of [`ActorId`]. The two
//! namespaces are disjoint by construction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identifier assigned by the relay on join, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Identity used while a peer runs without a relay connection.
    pub const OFFLINE: PeerId = PeerId(0);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Actor number: positive for humans, negative for bots, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub i32);

impl ActorId {
    pub fn human(peer: PeerId) -> Self {
        ActorId(peer.0.min(i32::MAX as u32) as i32)
    }

    pub fn is_synthetic(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "bot{}", self.0)
        } else {
            write!(f, "actor{}", self.0)
        }
    }
}

/// Room-unique entity identifier.
///
/// The upper 32 bits carry the creating peer, the lower 32 bits a sequence
/// local to that peer. Peer ids are never reissued within a room, so ids
/// minted this way cannot collide without any coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn compose(creator: PeerId, sequence: u32) -> Self {
        EntityId(((creator.0 as u64) << 32) | sequence as u64)
    }

    pub fn creator(self) -> PeerId {
        PeerId((self.0 >> 32) as u32)
    }

    pub fn sequence(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}:{}", self.creator().0, self.sequence())
    }
}

/// Mints entity ids for one creator. Sequences only ever increase.
#[derive(Debug, Clone)]
pub struct EntityIdGenerator {
    creator: PeerId,
    next_sequence: u32,
}

impl EntityIdGenerator {
    pub fn new(creator: PeerId) -> Self {
        Self {
            creator,
            next_sequence: 1,
        }
    }

    pub fn creator(&self) -> PeerId {
        self.creator
    }

    pub fn next_id(&mut self) -> EntityId {
        let id = EntityId::compose(self.creator, self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_packs_creator_and_sequence() {
        let id = EntityId::compose(PeerId(7), 42);
        assert_eq!(id.creator(), PeerId(7));
        assert_eq!(id.sequence(), 42);
        assert_eq!(id.to_string(), "e7:42");
    }

    #[test]
    fn test_generators_for_different_peers_never_collide() {
        let mut a = EntityIdGenerator::new(PeerId(1));
        let mut b = EntityIdGenerator::new(PeerId(2));

        let from_a: Vec<EntityId> = (0..100).map(|_| a.next_id()).collect();
        let from_b: Vec<EntityId> = (0..100).map(|_| b.next_id()).collect();

        for id in &from_a {
            assert!(!from_b.contains(id));
        }
        assert!(from_a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_human_actor_ids_are_positive() {
        let actor = ActorId::human(PeerId(3));
        assert_eq!(actor, ActorId(3));
        assert!(!actor.is_synthetic());
        assert!(ActorId(-1).is_synthetic());
        assert_eq!(ActorId(-4).to_string(), "bot-4");
    }
}
