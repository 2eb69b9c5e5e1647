//! Cascading destructible bodies.
//!
//! A body goes Whole → two Halves → two Quarters per Half → Gone. Only the
//! owner decides transitions; it broadcasts the split with fully specified
//! children so every peer builds the same fragments. Each launch opens a
//! damage window during which every distinct target is hit at most once.

use crate::bus::Envelope;
use crate::controllable::Controllable;
use crate::entity::Entity;
use crate::health::DamageEvent;
use crate::peer::Peer;
use crate::scheduler::Continuation;
use log::{debug, info};
use shared::{
    CoreError, DamageCause, EntityId, EntityIdGenerator, EntityKind, FragmentSpawn, FragmentTier,
    Rpc, Target, Vec2,
};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DamageWindow {
    launch: u32,
    opened_at: Duration,
    closes_at: Duration,
}

/// Fragment bookkeeping carried by every body entity.
#[derive(Debug, Clone)]
pub struct FragmentState {
    pub tier: FragmentTier,
    pub tier_entered_at: Duration,
    /// Set by the owner once a split has been broadcast for this tier.
    pub split_pending: bool,
    window: Option<DamageWindow>,
    hit_targets: HashSet<EntityId>,
    launches: u32,
}

impl FragmentState {
    pub fn new(tier: FragmentTier, tier_entered_at: Duration) -> Self {
        Self {
            tier,
            tier_entered_at,
            split_pending: false,
            window: None,
            hit_targets: HashSet::new(),
            launches: 0,
        }
    }

    /// Opens a fresh damage window `[now, now + length)` and forgets every
    /// previous hit. Returns the launch number.
    pub fn launch(&mut self, now: Duration, length: Duration) -> u32 {
        self.launches += 1;
        self.hit_targets.clear();
        self.window = Some(DamageWindow {
            launch: self.launches,
            opened_at: now,
            closes_at: now + length,
        });
        self.launches
    }

    pub fn is_window_open(&self, now: Duration) -> bool {
        self.window
            .is_some_and(|window| now >= window.opened_at && now < window.closes_at)
    }

    /// Records a hit on `target`. False if the window is closed or the target
    /// was already hit during this launch.
    pub fn try_register_hit(&mut self, target: EntityId, now: Duration) -> bool {
        if !self.is_window_open(now) {
            return false;
        }
        self.hit_targets.insert(target)
    }

    /// Closes the window opened by `launch`. Later launches are unaffected.
    pub fn close_window(&mut self, launch: u32) -> bool {
        match self.window {
            Some(window) if window.launch == launch => {
                self.window = None;
                true
            }
            _ => false,
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches
    }

    pub fn hits(&self) -> usize {
        self.hit_targets.len()
    }
}

/// How a fragment hit affects a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitClass {
    /// Killed outright.
    Lethal,
    /// Loses this much health.
    Percent(u32),
    Immune,
}

/// Combatants take a share of their max health, drones die and anything
/// else shrugs the hit off.
pub fn hit_class(
    target: &Entity,
    controller: Option<&dyn Controllable>,
    damage_percent: u32,
) -> HitClass {
    let Some(health) = target.health.filter(|h| !h.is_destroyed()) else {
        return HitClass::Immune;
    };
    match controller {
        Some(controller) if controller.is_alive() => {
            HitClass::Percent(health.percent_of_max(damage_percent))
        }
        Some(_) => HitClass::Immune,
        None if target.kind == EntityKind::Drone => HitClass::Lethal,
        None => HitClass::Immune,
    }
}

/// Builds the two children of `parent` at the next tier.
pub fn split_children(parent: &Entity, ids: &mut EntityIdGenerator, speed: f32) -> Vec<FragmentSpawn> {
    let heading = if parent.velocity.length() > 0.0 {
        parent.velocity.normalized()
    } else {
        Vec2::new(1.0, 0.0)
    };
    let side = heading.perpendicular();
    let radius = parent.radius * 0.5;

    [1.0_f32, -1.0]
        .into_iter()
        .map(|sign| FragmentSpawn {
            id: ids.next_id(),
            position: parent.position + side * (radius * sign),
            velocity: parent.velocity + side * (speed * sign),
            radius,
        })
        .collect()
}

impl Peer {
    /// Creates a Whole body owned by this peer and announces it.
    pub fn spawn_body(&mut self, position: Vec2, velocity: Vec2, tracked: bool) -> Result<EntityId, CoreError> {
        let id = self.ids.next_id();
        let mut body = Entity::new(
            id,
            EntityKind::Body {
                tier: FragmentTier::Whole,
            },
            position,
            self.config.body_radius,
        );
        body.velocity = velocity;
        body.room_object = true;
        body.tracked = tracked;
        body.fragment = Some(FragmentState::new(FragmentTier::Whole, self.now));

        let snapshot = body.snapshot(self.local, self.now);
        self.world.insert(body);
        self.authority.register(id, self.local);
        self.arm_fragment_timer(id);
        if tracked && self.is_master() {
            self.coordinator.track_body(id);
        }

        info!("Spawned body {} at ({:.0}, {:.0})", id, position.x, position.y);
        self.send(Target::All, Rpc::SpawnEntity { entity: snapshot })?;
        Ok(id)
    }

    /// Reports an external impact on a body. Non-owners forward it.
    pub fn impact(&mut self, entity: EntityId) -> Result<(), CoreError> {
        if !self.world.contains(entity) {
            return Err(CoreError::StaleReference { entity });
        }
        if !self.authority.owns(entity) {
            return self.send(Target::Owner, Rpc::ImpactBody { entity });
        }
        self.advance(entity)
    }

    /// Moves an owned body one tier on: splits a Whole or Half, destroys a
    /// Quarter.
    pub(crate) fn advance(&mut self, entity: EntityId) -> Result<(), CoreError> {
        let Some(fragment) = self.world.get(entity).and_then(|e| e.fragment.as_ref()) else {
            return Err(CoreError::StaleReference { entity });
        };
        if fragment.split_pending {
            return Ok(());
        }

        match fragment.tier {
            FragmentTier::Whole | FragmentTier::Half => self.split(entity),
            FragmentTier::Quarter => self.destroy_entity(entity),
            FragmentTier::Gone => Ok(()),
        }
    }

    fn split(&mut self, entity: EntityId) -> Result<(), CoreError> {
        let speed = self.config.fragment_speed;
        let Some(parent) = self.world.get_mut(entity) else {
            return Err(CoreError::StaleReference { entity });
        };
        let Some(fragment) = parent.fragment.as_mut() else {
            return Ok(());
        };
        fragment.split_pending = true;
        let tier = fragment.tier;

        let children = split_children(parent, &mut self.ids, speed);
        let rpc = match tier {
            FragmentTier::Whole => Rpc::SplitIntoHalves { entity, children },
            _ => Rpc::SplitIntoQuarters { entity, children },
        };
        self.send(Target::All, rpc)
    }

    /// Opens a new damage window on an owned fragment.
    pub fn launch(&mut self, entity: EntityId) -> Result<(), CoreError> {
        match self.authority.owner_of(entity) {
            None => Err(CoreError::StaleReference { entity }),
            Some(owner) if owner != self.local => {
                Err(CoreError::UnauthorizedMutation { entity, owner })
            }
            Some(_) => self.send(Target::All, Rpc::LaunchBody { entity }),
        }
    }

    /// Collision input from whoever detects it. Only the fragment's owner
    /// evaluates hits; returns true if damage was dealt.
    pub fn on_collision(&mut self, fragment: EntityId, target: EntityId) -> Result<bool, CoreError> {
        if !self.world.contains(fragment) {
            return Err(CoreError::StaleReference { entity: fragment });
        }
        if !self.authority.owns(fragment) {
            return Ok(false);
        }
        let Some(target_entity) = self.world.get(target) else {
            return Err(CoreError::StaleReference { entity: target });
        };

        let controller = self.controller_for(target_entity);
        let class = hit_class(target_entity, controller.as_deref(), self.config.damage_percent);
        if class == HitClass::Immune {
            return Ok(false);
        }

        let now = self.now;
        let registered = self
            .world
            .get_mut(fragment)
            .and_then(|e| e.fragment.as_mut())
            .is_some_and(|state| state.try_register_hit(target, now));
        if !registered {
            return Ok(false);
        }

        let event = DamageEvent::new(target, 0, DamageCause::Collision).from_source(fragment);
        match class {
            HitClass::Lethal => self.deal_damage(event, true)?,
            HitClass::Percent(amount) => self.deal_damage(DamageEvent { amount, ..event }, false)?,
            HitClass::Immune => return Ok(false),
        };
        Ok(true)
    }

    /// Schedules the self-advance of an owned body at its current tier.
    pub(crate) fn arm_fragment_timer(&mut self, entity: EntityId) {
        let Some(fragment) = self.world.get(entity).and_then(|e| e.fragment.as_ref()) else {
            return;
        };
        let lifetime = match fragment.tier {
            FragmentTier::Whole => self.config.whole_lifetime(),
            FragmentTier::Half => self.config.half_lifetime(),
            FragmentTier::Quarter => self.config.quarter_lifetime(),
            FragmentTier::Gone => return,
        };
        let tier = fragment.tier;
        self.scheduler.schedule(
            fragment.tier_entered_at + lifetime,
            Continuation::FragmentTimeout { entity, tier },
        );
    }

    pub(crate) fn on_fragment_timeout(&mut self, entity: EntityId, tier: FragmentTier) -> Result<(), CoreError> {
        let current = self
            .world
            .get(entity)
            .and_then(|e| e.fragment.as_ref())
            .map(|f| f.tier);
        if current != Some(tier) || !self.authority.owns(entity) {
            return Ok(());
        }
        debug!("{} timed out at {:?}", entity, tier);
        self.advance(entity)
    }

    pub(crate) fn on_close_damage_window(&mut self, entity: EntityId, launch: u32) {
        if let Some(fragment) = self.world.get_mut(entity).and_then(|e| e.fragment.as_mut()) {
            fragment.close_window(launch);
        }
    }

    fn open_window(&mut self, entity: EntityId) {
        let (now, length) = (self.now, self.config.damage_window());
        let Some(fragment) = self.world.get_mut(entity).and_then(|e| e.fragment.as_mut()) else {
            return;
        };
        let launch = fragment.launch(now, length);
        if self.authority.owns(entity) {
            self.scheduler
                .schedule(now + length, Continuation::CloseDamageWindow { entity, launch });
        }
    }

    pub(crate) fn on_split(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let (entity, children, tier) = match &envelope.rpc {
            Rpc::SplitIntoHalves { entity, children } => (*entity, children, FragmentTier::Half),
            Rpc::SplitIntoQuarters { entity, children } => (*entity, children, FragmentTier::Quarter),
            _ => return Ok(()),
        };

        let Some(parent_tier) = self
            .world
            .get(entity)
            .and_then(|e| e.fragment.as_ref())
            .map(|f| f.tier)
        else {
            return Err(CoreError::StaleReference { entity });
        };
        if parent_tier.next() != tier {
            debug!("Ignoring {:?} split of {} at {:?}", tier, entity, parent_tier);
            return Ok(());
        }

        let owner = self.authority.owner_of(entity).unwrap_or(envelope.sender);
        let Some(parent) = self.world.remove(entity) else {
            return Err(CoreError::StaleReference { entity });
        };
        self.authority.remove(entity);
        self.scheduler.cancel_entity(entity);
        if owner == self.local && parent.tracked {
            self.send(Target::MasterOnly, Rpc::UntrackBody { entity })?;
        }

        for child in children {
            let mut fragment = Entity::new(child.id, EntityKind::Body { tier }, child.position, child.radius);
            fragment.velocity = child.velocity;
            fragment.room_object = true;
            fragment.fragment = Some(FragmentState::new(tier, self.now));
            if !self.world.insert(fragment) {
                continue;
            }
            self.authority.register(child.id, owner);
            self.open_window(child.id);
            if owner == self.local {
                self.arm_fragment_timer(child.id);
            }
        }

        self.stats.splits += 1;
        info!("{} split into {} {:?} fragments", entity, children.len(), tier);
        Ok(())
    }

    pub(crate) fn on_impact_body(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::ImpactBody { entity } = envelope.rpc else {
            return Ok(());
        };
        if !self.world.contains(entity) {
            return Err(CoreError::StaleReference { entity });
        }
        if !self.authority.owns(entity) {
            debug!("Impact on {} reached a non-owner", entity);
            return Ok(());
        }
        self.advance(entity)
    }

    pub(crate) fn on_launch_body(&mut self, envelope: &Envelope) -> Result<(), CoreError> {
        let Rpc::LaunchBody { entity } = envelope.rpc else {
            return Ok(());
        };
        if !self.world.contains(entity) {
            return Err(CoreError::StaleReference { entity });
        }
        self.open_window(entity);
        Ok(())
    }
}
