//! Replicated health.
//!
//! The owner of an entity is the only peer that applies damage to it. Every
//! other peer forwards damage requests to the owner and keeps a cache that is
//! fed by the owner's `SyncHealth` broadcasts. Health only ever goes down and
//! zero is terminal.

use crate::bus::Envelope;
use crate::peer::Peer;
use log::{debug, info};
use shared::{CoreError, DamageCause, EntityId, HealthSnapshot, PeerId, Rpc, Target};
use std::collections::{HashSet, VecDeque};

/// Forwarded damage requests are passed on at most this many times.
pub const MAX_FORWARD_HOPS: u8 = 1;

const DEDUP_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthRecord {
    current: u32,
    max: u32,
}

/// Result of applying damage to a [`HealthRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Unchanged,
    Damaged { from: u32, to: u32 },
    Destroyed { from: u32 },
}

impl HealthRecord {
    pub fn new(max: u32) -> Self {
        Self { current: max, max }
    }

    pub fn with_current(current: u32, max: u32) -> Self {
        Self {
            current: current.min(max),
            max,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_destroyed(&self) -> bool {
        self.current == 0
    }

    pub fn apply_damage(&mut self, amount: u32) -> HealthChange {
        if self.is_destroyed() || amount == 0 {
            return HealthChange::Unchanged;
        }
        let from = self.current;
        self.current = self.current.saturating_sub(amount);
        if self.current == 0 {
            HealthChange::Destroyed { from }
        } else {
            HealthChange::Damaged {
                from,
                to: self.current,
            }
        }
    }

    pub fn kill(&mut self) -> HealthChange {
        if self.is_destroyed() {
            return HealthChange::Unchanged;
        }
        let from = self.current;
        self.current = 0;
        HealthChange::Destroyed { from }
    }

    /// Takes a value broadcast by the owner. Values above the cached one are
    /// refused, so reordered broadcasts cannot undo damage.
    pub fn accept_broadcast(&mut self, value: u32) -> bool {
        if value >= self.current {
            return false;
        }
        self.current = value;
        true
    }

    /// `percent` of max health, rounded down.
    pub fn percent_of_max(&self, percent: u32) -> u32 {
        (self.max as u64 * percent as u64 / 100) as u32
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            current: self.current,
            max: self.max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageEvent {
    pub source: Option<EntityId>,
    pub target: EntityId,
    pub amount: u32,
    pub cause: DamageCause,
}

impl DamageEvent {
    pub fn new(target: EntityId, amount: u32, cause: DamageCause) -> Self {
        Self {
            source: None,
            target,
            amount,
            cause,
        }
    }

    pub fn from_source(mut self, source: EntityId) -> Self {
        self.source = Some(source);
        self
    }
}

/// What happened to a damage request on this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    Applied(HealthChange),
    Forwarded,
    Ignored,
}

/// Remembers recently seen `(origin, request)` pairs.
#[derive(Debug, Default)]
pub struct DedupWindow {
    seen: HashSet<(PeerId, u64)>,
    order: VecDeque<(PeerId, u64)>,
}

impl DedupWindow {
    pub fn contains(&self, key: (PeerId, u64)) -> bool {
        self.seen.contains(&key)
    }

    /// Returns false if the key was already seen.
    pub fn insert(&mut self, key: (PeerId, u64)) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

impl Peer {
    /// Damages `target` by `amount`. Non-owners forward the request to the
    /// owner instead of touching their cache.
    pub fn take_damage(&mut self, target: EntityId, amount: u32) -> Result<DamageOutcome, CoreError> {
        self.deal_damage(DamageEvent::new(target, amount, DamageCause::Beam), false)
    }

    /// Sets the health of `target` to zero, through its owner.
    pub fn kill(&mut self, target: EntityId) -> Result<DamageOutcome, CoreError> {
        self.deal_damage(DamageEvent::new(target, 0, DamageCause::Explosion), true)
    }

    pub fn deal_damage(&mut self, event: DamageEvent, lethal: bool) -> Result<DamageOutcome, CoreError> {
        let Some(entity) = self.world.get(event.target) else {
            return Err(CoreError::StaleReference {
                entity: event.target,
            });
        };
        if entity.health.is_none() {
            return Ok(DamageOutcome::Ignored);
        }

        if self.authority.owns(event.target) {
            return self.apply_owned_damage(event.target, event.amount, lethal, None);
        }

        let request = self.next_damage_request();
        let rpc = Rpc::ApplyDamage {
            target: event.target,
            amount: event.amount,
            lethal,
            source: event.source,
            cause: event.cause,
            origin: self.local,
            request,
            hops: 0,
        };
        self.send(self.damage_target(event.target), rpc)?;
        Ok(DamageOutcome::Forwarded)
    }

    fn next_damage_request(&mut self) -> u64 {
        self.damage_requests += 1;
        self.damage_requests
    }

    // Entities whose owner has left go through the master until reassigned.
    fn damage_target(&self, entity: EntityId) -> Target {
        match self.authority.owner_of(entity) {
            Some(owner) if self.coordinator.is_present(owner) => Target::Owner,
            _ => Target::MasterOnly,
        }
    }

    fn apply_owned_damage(
        &mut self,
        target: EntityId,
        amount: u32,
        lethal: bool,
        applied: Option<(PeerId, u64)>,
    ) -> Result<DamageOutcome, CoreError> {
        let Some(health) = self
            .world
            .get_mut(target)
            .and_then(|entity| entity.health.as_mut())
        else {
            return Err(CoreError::StaleReference { entity: target });
        };

        if health.is_destroyed() {
            debug!("Ignoring damage to destroyed {}", target);
            return Ok(DamageOutcome::Ignored);
        }

        let change = if lethal {
            health.kill()
        } else {
            health.apply_damage(amount)
        };
        self.stats.damage_events_applied += 1;

        match change {
            HealthChange::Unchanged => {}
            HealthChange::Damaged { to, .. } => {
                self.stats.health_transitions += 1;
                self.send(
                    Target::All,
                    Rpc::SyncHealth {
                        entity: target,
                        health: to,
                        applied,
                    },
                )?;
            }
            HealthChange::Destroyed { from } => {
                self.stats.health_transitions += 1;
                info!("{} destroyed ({} -> 0)", target, from);
                self.send(
                    Target::All,
                    Rpc::SyncHealth {
                        entity: target,
                        health: 0,
                        applied,
                    },
                )?;
                self.destroy_entity(target)?;
            }
        }

        Ok(DamageOutcome::Applied(change))
    }

    pub(crate) fn on_apply_damage(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::ApplyDamage {
            target,
            amount,
            lethal,
            source,
            cause,
            origin,
            request,
            hops,
        } = envelope.rpc
        else {
            return Ok(());
        };

        if !self.world.contains(target) {
            return Err(CoreError::StaleReference { entity: target });
        }

        // Whoever applied a request, or heard its SyncHealth, drops later
        // copies even after the entity changed hands.
        if self.damage_seen.contains((origin, request)) {
            debug!("Duplicate damage request {}:{} for {}", origin, request, target);
            return Ok(());
        }

        if self.authority.owns(target) {
            self.damage_seen.insert((origin, request));
            self.apply_owned_damage(target, amount, lethal, Some((origin, request)))?;
            return Ok(());
        }

        if hops >= MAX_FORWARD_HOPS {
            debug!("Dropping damage for {} after {} hops", target, hops);
            return Ok(());
        }

        let rpc = Rpc::ApplyDamage {
            target,
            amount,
            lethal,
            source,
            cause,
            origin,
            request,
            hops: hops + 1,
        };
        self.send(self.damage_target(target), rpc)
    }

    pub(crate) fn on_sync_health(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::SyncHealth {
            entity,
            health,
            applied,
        } = envelope.rpc
        else {
            return Ok(());
        };

        if let Some(key) = applied {
            self.damage_seen.insert(key);
        }

        // The owner already holds the value it broadcast
        if self.authority.owns(entity) {
            return Ok(());
        }

        let Some(record) = self
            .world
            .get_mut(entity)
            .and_then(|entity| entity.health.as_mut())
        else {
            return Err(CoreError::StaleReference { entity });
        };

        if !record.accept_broadcast(health) {
            debug!("Ignoring stale health {} for {}", health, entity);
        }
        Ok(())
    }
}
