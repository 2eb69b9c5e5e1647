//! Wire protocol between peers and the room relay.
//!
//! [`Packet`] is what travels in a UDP datagram. Game-level traffic is an
//! [`Rpc`] wrapped in `Packet::Send` (peer → relay) or `Packet::Deliver`
//! (relay → peer). The relay never looks inside an `Rpc` except to compact
//! its replay buffer.

use crate::ids::{ActorId, EntityId, PeerId};
use crate::Vec2;
use serde::{Deserialize, Serialize};

/// Logical recipients of a message, as seen by game code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// The current owner of the message's subject entity.
    Owner,
    /// Everyone except the sender.
    Others,
    /// Everyone including the sender.
    All,
    /// Everyone including the sender, replayed to peers that join later.
    AllBuffered,
    /// The elected master of the room.
    MasterOnly,
}

/// Recipients as resolved by the sender for the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    Peer(PeerId),
    Others,
    /// Like `Others`, and also appended to the room's replay log.
    AllBuffered,
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragmentTier {
    Whole,
    Half,
    Quarter,
    Gone,
}

impl FragmentTier {
    /// The tier reached by one split or impact. `Gone` is absorbing.
    pub fn next(self) -> FragmentTier {
        match self {
            FragmentTier::Whole => FragmentTier::Half,
            FragmentTier::Half => FragmentTier::Quarter,
            FragmentTier::Quarter | FragmentTier::Gone => FragmentTier::Gone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A player avatar or a bot. Takes percentage damage from fragments.
    Combatant { actor: ActorId },
    /// A fragile spawned unit. Killed outright by fragments.
    Drone,
    /// A destructible body at some fragment tier.
    Body { tier: FragmentTier },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub current: u32,
    pub max: u32,
}

/// Full description of an entity as announced by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub owner: PeerId,
    pub kind: EntityKind,
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    pub health: Option<HealthSnapshot>,
    /// Room objects survive their owner leaving; authority moves to the master.
    pub room_object: bool,
    /// Tracked in the master's body registry.
    pub tracked: bool,
    /// Milliseconds spent in the current fragment tier when this was sent.
    pub tier_age_ms: u64,
}

/// One child created by a split, fully specified by the splitting owner so
/// that every peer constructs identical children.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpawn {
    pub id: EntityId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DamageCause {
    Collision,
    Beam,
    Explosion,
}

/// Remote procedure calls exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rpc {
    SpawnEntity {
        entity: EntitySnapshot,
    },
    DestroyEntity {
        entity: EntityId,
    },
    TransferOwnership {
        entity: EntityId,
        new_owner: PeerId,
    },
    /// `origin` and `request` identify the request across forwarding hops so
    /// the owner can drop redelivered copies.
    ApplyDamage {
        target: EntityId,
        amount: u32,
        lethal: bool,
        source: Option<EntityId>,
        cause: DamageCause,
        origin: PeerId,
        request: u64,
        hops: u8,
    },
    /// `applied` carries the damage request this value came from, so replicas
    /// that later take over the entity still drop its redelivered copies.
    SyncHealth {
        entity: EntityId,
        health: u32,
        applied: Option<(PeerId, u64)>,
    },
    SplitIntoHalves {
        entity: EntityId,
        children: Vec<FragmentSpawn>,
    },
    SplitIntoQuarters {
        entity: EntityId,
        children: Vec<FragmentSpawn>,
    },
    ImpactBody {
        entity: EntityId,
    },
    LaunchBody {
        entity: EntityId,
    },
    AddBotToClients {
        actor: ActorId,
        entity: EntityId,
        name: String,
        position: Vec2,
    },
    RemoveBotFromClients {
        actor: ActorId,
    },
    UntrackBody {
        entity: EntityId,
    },
}

/// Discriminant of [`Rpc`], used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    SpawnEntity,
    DestroyEntity,
    TransferOwnership,
    ApplyDamage,
    SyncHealth,
    SplitIntoHalves,
    SplitIntoQuarters,
    ImpactBody,
    LaunchBody,
    AddBotToClients,
    RemoveBotFromClients,
    UntrackBody,
}

/// What an [`Rpc`] is about, for routing and replay compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Entity(EntityId),
    Actor(ActorId),
}

impl Rpc {
    pub fn kind(&self) -> RpcKind {
        match self {
            Rpc::SpawnEntity { .. } => RpcKind::SpawnEntity,
            Rpc::DestroyEntity { .. } => RpcKind::DestroyEntity,
            Rpc::TransferOwnership { .. } => RpcKind::TransferOwnership,
            Rpc::ApplyDamage { .. } => RpcKind::ApplyDamage,
            Rpc::SyncHealth { .. } => RpcKind::SyncHealth,
            Rpc::SplitIntoHalves { .. } => RpcKind::SplitIntoHalves,
            Rpc::SplitIntoQuarters { .. } => RpcKind::SplitIntoQuarters,
            Rpc::ImpactBody { .. } => RpcKind::ImpactBody,
            Rpc::LaunchBody { .. } => RpcKind::LaunchBody,
            Rpc::AddBotToClients { .. } => RpcKind::AddBotToClients,
            Rpc::RemoveBotFromClients { .. } => RpcKind::RemoveBotFromClients,
            Rpc::UntrackBody { .. } => RpcKind::UntrackBody,
        }
    }

    /// The entity whose owner receives a `Target::Owner` send.
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Rpc::SpawnEntity { entity } => Some(entity.id),
            Rpc::DestroyEntity { entity }
            | Rpc::TransferOwnership { entity, .. }
            | Rpc::SyncHealth { entity, .. }
            | Rpc::SplitIntoHalves { entity, .. }
            | Rpc::SplitIntoQuarters { entity, .. }
            | Rpc::ImpactBody { entity }
            | Rpc::LaunchBody { entity }
            | Rpc::UntrackBody { entity } => Some(*entity),
            Rpc::ApplyDamage { target, .. } => Some(*target),
            Rpc::AddBotToClients { entity, .. } => Some(*entity),
            Rpc::RemoveBotFromClients { .. } => None,
        }
    }

    /// Subjects this message describes. A bot announcement is about both its
    /// actor number and its entity.
    pub fn subjects(&self) -> Vec<Subject> {
        match self {
            Rpc::AddBotToClients { actor, entity, .. } => {
                vec![Subject::Actor(*actor), Subject::Entity(*entity)]
            }
            Rpc::RemoveBotFromClients { actor } => vec![Subject::Actor(*actor)],
            other => other.entity().map(Subject::Entity).into_iter().collect(),
        }
    }

    /// Messages after which nothing earlier about the same subject matters.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Rpc::DestroyEntity { .. } | Rpc::RemoveBotFromClients { .. }
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Join {
        client_version: u32,
        name: String,
    },
    Leave,
    Heartbeat,
    Send {
        route: Route,
        rpc: Rpc,
    },

    Welcome {
        peer_id: PeerId,
        master: PeerId,
        epoch: u32,
        peers: Vec<PeerId>,
    },
    Rejected {
        reason: String,
    },
    Deliver {
        sender: PeerId,
        rpc: Rpc,
    },
    PeerJoined {
        peer: PeerId,
    },
    PeerLeft {
        peer: PeerId,
    },
    MasterChanged {
        master: PeerId,
        epoch: u32,
    },
}
