//! Whole-room scenarios run without sockets.
//!
//! A `Harness` wires a relay `Room` to a set of `Peer`s and moves messages
//! between them by hand, so every scenario is deterministic: time only moves
//! when a test advances it, and tests can duplicate or reorder traffic.

use peer::health::DamageOutcome;
use peer::{Controllable, Peer};
use proptest::prelude::*;
use relay::room::{JoinOutcome, Outbound, Room};
use shared::{
    ActorId, CoreError, DamageCause, EntityId, EntityKind, FragmentTier, GameConfig, Packet, PeerId,
    Route, Rpc, Vec2, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

const STEP: Duration = Duration::from_millis(100);

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// A room with no bots and no bodies, for scenarios that place their own.
fn quiet_config() -> GameConfig {
    GameConfig {
        bot_capacity: 0,
        target_bodies: 0,
        ..GameConfig::default()
    }
}

struct Harness {
    config: GameConfig,
    room: Room,
    peers: BTreeMap<PeerId, Peer>,
    now: Duration,
    next_port: u16,
}

impl Harness {
    fn new(config: GameConfig) -> Self {
        Self {
            config,
            room: Room::new(32),
            peers: BTreeMap::new(),
            now: Duration::ZERO,
            next_port: 40000,
        }
    }

    fn join(&mut self, name: &str) -> PeerId {
        let addr: SocketAddr = format!("127.0.0.1:{}", self.next_port).parse().unwrap();
        self.next_port += 1;

        match self.room.join(addr, name, PROTOCOL_VERSION) {
            JoinOutcome::Accepted { peer, outbound } => {
                self.peers.insert(peer, Peer::new(name, self.config.clone()));
                self.deliver(outbound);
                self.pump();
                peer
            }
            JoinOutcome::Rejected { reason } => panic!("{} was rejected: {}", name, reason),
        }
    }

    fn leave(&mut self, id: PeerId) {
        self.peers.remove(&id);
        let outbound = self.room.leave(id);
        self.deliver(outbound);
        self.pump();
    }

    /// Takes a peer out of the harness without telling the room.
    fn detach(&mut self, id: PeerId) -> Peer {
        self.peers.remove(&id).unwrap()
    }

    fn deliver(&mut self, outbound: Vec<Outbound>) {
        for Outbound { to, packet } in outbound {
            if let Some(peer) = self.peers.get_mut(&to) {
                peer.handle_relay_packet(packet).unwrap();
            }
        }
    }

    /// Routes whatever `id` has queued, `copies` times over.
    fn flush(&mut self, id: PeerId, copies: usize) {
        let outgoing = self.peer_mut(id).take_outbox();
        for message in outgoing {
            for _ in 0..copies {
                let outbound = self.room.route(id, message.route, message.rpc.clone());
                self.deliver(outbound);
            }
        }
    }

    /// Ticks every peer at the current time until nobody has anything to send.
    fn pump(&mut self) {
        for _ in 0..64 {
            let mut sent = false;
            let ids: Vec<PeerId> = self.peers.keys().copied().collect();
            for id in ids {
                let outgoing = {
                    let now = self.now;
                    let peer = self.peer_mut(id);
                    peer.tick(now);
                    peer.take_outbox()
                };
                for message in outgoing {
                    sent = true;
                    let outbound = self.room.route(id, message.route, message.rpc);
                    self.deliver(outbound);
                }
            }
            if !sent {
                return;
            }
        }
        panic!("room did not settle at {:?}", self.now);
    }

    fn advance(&mut self, by: Duration) {
        let end = self.now + by;
        while self.now < end {
            self.now = (self.now + STEP).min(end);
            self.pump();
        }
    }

    fn peer(&self, id: PeerId) -> &Peer {
        &self.peers[&id]
    }

    fn peer_mut(&mut self, id: PeerId) -> &mut Peer {
        self.peers.get_mut(&id).unwrap()
    }

    fn masters(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.is_master())
            .map(|(id, _)| *id)
            .collect()
    }
}

fn bodies(peer: &Peer, tier: FragmentTier) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = peer
        .world()
        .iter()
        .filter(|e| e.kind == EntityKind::Body { tier })
        .map(|e| e.id)
        .collect();
    ids.sort();
    ids
}

fn body_count(peer: &Peer) -> usize {
    peer.world()
        .iter()
        .filter(|e| matches!(e.kind, EntityKind::Body { .. }))
        .count()
}

/// BOT POPULATION TESTS
mod bot_tests {
    use super::*;

    /// Humans dropping from three to one spawns exactly the two missing bots
    #[test]
    fn test_human_departures_spawn_exact_difference() {
        let mut h = Harness::new(GameConfig::default());
        let a = h.join("alice");
        let b = h.join("bob");
        let c = h.join("carol");
        h.advance(secs(5));

        for id in [a, b, c] {
            assert_eq!(h.peer(id).bots().len(), 7, "roster of {}", id);
        }
        let before = h.peer(a).stats();

        h.leave(c);
        h.leave(b);
        h.advance(secs(5));

        let after = h.peer(a).stats();
        assert_eq!(h.peer(a).bots().len(), 9);
        assert_eq!(h.peer(a).pending_placements(), 0);
        assert_eq!(after.bot_spawns_issued - before.bot_spawns_issued, 2);
        assert_eq!(after.bot_despawns_issued, before.bot_despawns_issued);
    }

    /// A late joiner rebuilds the master's roster from the replay log
    #[test]
    fn test_late_joiner_sees_current_roster() {
        let mut h = Harness::new(GameConfig::default());
        let a = h.join("alice");
        h.advance(secs(5));
        let b = h.join("bob");
        h.advance(secs(2));
        let c = h.join("carol");
        h.advance(secs(5));

        let roster = h.peer(a).bots().actors();
        assert_eq!(roster.len(), 7);
        assert_eq!(h.peer(b).bots().actors(), roster);
        assert_eq!(h.peer(c).bots().actors(), roster);
        assert_eq!(h.peer(c).world().ids(), h.peer(a).world().ids());
    }

    /// Actor ids stay negative and unique, and a new master continues below
    /// every id it has seen
    #[test]
    fn test_actor_ids_survive_migration() {
        let mut h = Harness::new(GameConfig::default());
        let a = h.join("alice");
        h.advance(secs(5));
        assert_eq!(h.peer(a).bots().len(), 9);

        let b = h.join("bob");
        h.advance(secs(1));
        let old = h.peer(b).bots().actors();
        assert_eq!(old.len(), 8);
        assert!(!old.contains(&ActorId(-9)));

        h.leave(a);
        h.advance(secs(5));

        let now = h.peer(b).bots().actors();
        let fresh: Vec<ActorId> = now.iter().copied().filter(|actor| !old.contains(actor)).collect();
        assert_eq!(fresh, vec![ActorId(-10)]);
        assert!(now.iter().all(|actor| actor.is_synthetic()));
    }

    /// Every peer sees the same combatants, players first, with authority
    /// only where it owns them
    #[test]
    fn test_controllables_list_players_then_bots() {
        let config = GameConfig {
            target_bodies: 0,
            ..GameConfig::default()
        };
        let mut h = Harness::new(config);
        let a = h.join("alice");
        h.advance(secs(5));
        let b = h.join("bob");
        h.peer_mut(a).spawn_avatar().unwrap();
        h.peer_mut(b).spawn_avatar().unwrap();
        h.advance(secs(1));

        for id in [a, b] {
            let controllers = h.peer(id).controllables();
            assert_eq!(controllers.len(), 10);
            assert!(controllers[..2].iter().all(|c| !c.is_bot() && c.is_alive()));
            assert!(controllers[2..].iter().all(|c| c.is_bot()));

            let bots: Vec<ActorId> = controllers[2..].iter().map(|c| c.actor_id()).collect();
            assert_eq!(bots, h.peer(a).bots().actors());

            for controller in &controllers {
                let owner = h.peer(id).owner_of(controller.entity_id());
                assert_eq!(controller.is_local_authority(), owner == Some(id));
            }
        }
        assert!(h.peer(a).controllables()[2..].iter().all(|c| c.is_local_authority()));
    }

    /// A killed bot is replaced with a fresh id and handed to another human
    #[test]
    fn test_killed_bot_is_replaced_on_least_loaded_peer() {
        let config = GameConfig {
            bot_capacity: 4,
            distribute_bots: true,
            target_bodies: 0,
            ..GameConfig::default()
        };
        let mut h = Harness::new(config);
        let a = h.join("alice");
        h.advance(secs(5));
        let b = h.join("bob");
        h.advance(secs(1));
        assert_eq!(h.peer(a).bots().len(), 2);

        let victim = h.peer(a).bots().iter().next().unwrap().clone();
        h.peer_mut(a).kill(victim.entity).unwrap();
        h.pump();
        h.advance(secs(5));

        assert_eq!(h.peer(a).bots().len(), 2);
        assert!(!h.peer(b).bots().contains(victim.actor));
        let replacement = h.peer(a).bots().newest().unwrap();
        assert!(replacement < victim.actor);

        let entity = h.peer(a).bots().get(replacement).unwrap().entity;
        assert_eq!(h.peer(a).owner_of(entity), Some(b));
        assert_eq!(h.peer(b).owner_of(entity), Some(b));
    }
}

/// DESTRUCTIBLE BODY TESTS
mod fragment_tests {
    use super::*;

    fn split_one_body(h: &mut Harness, owner: PeerId) -> Vec<EntityId> {
        let body = h
            .peer_mut(owner)
            .spawn_body(Vec2::new(1000.0, 1000.0), Vec2::ZERO, false)
            .unwrap();
        h.pump();
        h.peer_mut(owner).impact(body).unwrap();
        h.pump();
        bodies(h.peer(owner), FragmentTier::Half)
    }

    /// A fragment hits another peer's combatant once per window
    #[test]
    fn test_fragment_hit_applies_percent_once() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let target = h.peer_mut(b).spawn_avatar().unwrap();
        h.pump();
        assert_eq!(h.peer(a).health_of(target), Some(100));

        let fragments = split_one_body(&mut h, a);
        assert_eq!(fragments.len(), 2);
        assert_eq!(bodies(h.peer(b), FragmentTier::Half), fragments);
        let fragment = fragments[0];

        assert!(h.peer_mut(a).on_collision(fragment, target).unwrap());
        h.pump();
        assert_eq!(h.peer(a).health_of(target), Some(80));
        assert_eq!(h.peer(b).health_of(target), Some(80));

        // Same window, same target
        assert!(!h.peer_mut(a).on_collision(fragment, target).unwrap());
        h.pump();
        assert_eq!(h.peer(b).health_of(target), Some(80));

        h.advance(Duration::from_millis(2100));
        assert!(!h.peer_mut(a).on_collision(fragment, target).unwrap());
        h.pump();
        assert_eq!(h.peer(b).health_of(target), Some(80));
        assert_eq!(h.peer(b).stats().damage_events_applied, 1);
    }

    fn window_open(peer: &Peer, body: EntityId) -> bool {
        let fragment = peer.entity(body).and_then(|e| e.fragment.as_ref()).unwrap();
        fragment.is_window_open(peer.now())
    }

    fn launches(peer: &Peer, body: EntityId) -> u32 {
        peer.entity(body)
            .and_then(|e| e.fragment.as_ref())
            .map_or(0, |f| f.launches())
    }

    /// A launched whole body hits a target once per launch, and the close of
    /// an earlier launch leaves the current window alone
    #[test]
    fn test_relaunch_rearms_hits() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let target = h.peer_mut(b).spawn_avatar().unwrap();
        let body = h
            .peer_mut(a)
            .spawn_body(Vec2::new(1000.0, 1000.0), Vec2::ZERO, false)
            .unwrap();
        h.pump();

        // Not launched yet
        assert!(!h.peer_mut(a).on_collision(body, target).unwrap());
        assert_eq!(
            h.peer_mut(b).launch(body),
            Err(CoreError::UnauthorizedMutation { entity: body, owner: a })
        );

        h.peer_mut(a).launch(body).unwrap();
        h.pump();
        for id in [a, b] {
            assert_eq!(launches(h.peer(id), body), 1);
            assert!(window_open(h.peer(id), body));
        }

        assert!(h.peer_mut(a).on_collision(body, target).unwrap());
        h.pump();
        assert!(!h.peer_mut(a).on_collision(body, target).unwrap());
        h.pump();
        assert_eq!(h.peer(b).health_of(target), Some(80));

        h.advance(secs(1));
        h.peer_mut(a).launch(body).unwrap();
        h.pump();
        assert_eq!(launches(h.peer(b), body), 2);

        // The first launch's close comes due at 2s and must not end the second
        h.advance(Duration::from_millis(1500));
        assert!(window_open(h.peer(a), body));
        assert!(window_open(h.peer(b), body));
        assert!(h.peer_mut(a).on_collision(body, target).unwrap());
        h.pump();
        assert_eq!(h.peer(a).health_of(target), Some(60));
        assert_eq!(h.peer(b).health_of(target), Some(60));

        h.advance(secs(1));
        assert!(!window_open(h.peer(a), body));
        assert!(!h.peer_mut(a).on_collision(body, target).unwrap());
        h.pump();
        assert_eq!(h.peer(b).health_of(target), Some(60));
        assert_eq!(bodies(h.peer(b), FragmentTier::Whole), vec![body]);
    }

    /// Non-owners never evaluate a fragment's collisions
    #[test]
    fn test_non_owner_collision_is_ignored() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let target = h.peer_mut(b).spawn_avatar().unwrap();
        h.pump();

        let fragments = split_one_body(&mut h, a);
        assert!(!h.peer_mut(b).on_collision(fragments[0], target).unwrap());
        h.pump();
        assert_eq!(h.peer(b).health_of(target), Some(100));
    }

    /// Drones die to any fragment hit, on every peer
    #[test]
    fn test_fragment_kills_drone() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let drone = h.peer_mut(b).spawn_drone(Vec2::new(300.0, 300.0)).unwrap();
        h.pump();

        let fragments = split_one_body(&mut h, a);
        assert!(h.peer_mut(a).on_collision(fragments[1], drone).unwrap());
        h.pump();

        assert!(!h.peer(a).world().contains(drone));
        assert!(!h.peer(b).world().contains(drone));
    }

    /// Untouched bodies time out tier by tier until nothing is left
    #[test]
    fn test_every_whole_body_reaches_gone() {
        let config = GameConfig {
            whole_lifetime_secs: 10.0,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let a = h.join("alice");
        let b = h.join("bob");

        h.peer_mut(a).spawn_body(Vec2::new(400.0, 400.0), Vec2::ZERO, false).unwrap();
        h.peer_mut(a).spawn_body(Vec2::new(1400.0, 1400.0), Vec2::new(5.0, 0.0), false).unwrap();
        h.pump();
        assert_eq!(body_count(h.peer(b)), 2);

        h.advance(secs(12));
        assert_eq!(bodies(h.peer(b), FragmentTier::Half).len(), 4);

        h.advance(secs(18));
        assert_eq!(body_count(h.peer(a)), 0);
        assert_eq!(body_count(h.peer(b)), 0);
        assert_eq!(h.peer(a).stats().splits, 6);
        assert_eq!(h.peer(b).stats().splits, 6);
    }

    /// Fragments of a departed master keep timing out on the new one
    #[test]
    fn test_fragments_time_out_after_migration() {
        let config = GameConfig {
            whole_lifetime_secs: 10.0,
            ..quiet_config()
        };
        let mut h = Harness::new(config);
        let a = h.join("alice");
        let b = h.join("bob");

        h.peer_mut(a).spawn_body(Vec2::new(400.0, 400.0), Vec2::ZERO, false).unwrap();
        h.pump();
        h.advance(secs(12));
        let halves = bodies(h.peer(b), FragmentTier::Half);
        assert_eq!(halves.len(), 2);

        h.leave(a);
        assert!(halves.iter().all(|id| h.peer(b).owns(*id)));

        h.advance(secs(20));
        assert_eq!(body_count(h.peer(b)), 0);
    }
}

/// MASTER MIGRATION TESTS
mod migration_tests {
    use super::*;

    /// Exactly one new master, one epoch, a reset refill timer and no orphans
    #[test]
    fn test_master_departure_elects_one_successor() {
        let mut h = Harness::new(GameConfig::default());
        let a = h.join("alice");
        let b = h.join("bob");
        let c = h.join("carol");
        let departed_avatar = h.peer_mut(a).spawn_avatar().unwrap();
        h.advance(secs(5));

        assert_eq!(h.masters(), vec![a]);
        assert!(h.peer(a).refill_elapsed() > Duration::ZERO);
        let epoch = h.peer(b).epoch();

        h.leave(a);

        assert_eq!(h.masters(), vec![b]);
        assert_eq!(h.room.master(), Some(b));
        for id in [b, c] {
            let peer = h.peer(id);
            assert_eq!(peer.master(), Ok(b));
            assert_eq!(peer.epoch(), epoch + 1);
            assert_eq!(peer.refill_elapsed(), Duration::ZERO);
            assert!(!peer.world().contains(departed_avatar));
        }

        h.advance(secs(5));
        for bot in h.peer(b).bots().iter() {
            assert_eq!(h.peer(b).owner_of(bot.entity), Some(b));
            assert_eq!(h.peer(c).owner_of(bot.entity), Some(b));
        }
        for entity in h.peer(c).world().iter().filter(|e| e.room_object) {
            assert_eq!(h.peer(c).owner_of(entity.id), Some(b));
        }
        assert_eq!(h.peer(b).bots().len(), 8);
    }

    /// The new master rebuilds the body registry from its replica
    #[test]
    fn test_new_master_rebuilds_body_registry() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let body = h
            .peer_mut(a)
            .spawn_body(Vec2::new(500.0, 500.0), Vec2::ZERO, true)
            .unwrap();
        h.pump();
        assert_eq!(h.peer(a).tracked_bodies(), 1);
        assert_eq!(h.peer(b).tracked_bodies(), 0);

        h.leave(a);
        assert!(h.peer(b).is_master());
        assert_eq!(h.peer(b).tracked_bodies(), 1);
        assert!(h.peer(b).owns(body));
    }

    /// Damage aimed at an orphan while no master is known waits for the election
    #[test]
    fn test_master_bound_damage_waits_for_election() {
        let config = GameConfig {
            target_bodies: 0,
            ..GameConfig::default()
        };
        let mut h = Harness::new(config);
        let a = h.join("alice");
        h.advance(secs(5));
        let b = h.join("bob");
        let c = h.join("carol");
        h.advance(secs(1));
        let bot = h.peer(c).bots().iter().next().unwrap().entity;
        assert_eq!(h.peer(c).owner_of(bot), Some(a));

        // Carol hears about the departure before the election
        h.peer_mut(c)
            .handle_relay_packet(Packet::PeerLeft { peer: a })
            .unwrap();
        assert!(h.peer(c).master().is_err());
        assert_eq!(
            h.peer_mut(c).take_damage(bot, 10).unwrap(),
            DamageOutcome::Forwarded
        );
        assert!(h.peer_mut(c).take_outbox().is_empty());

        h.leave(a);
        for id in [b, c] {
            assert_eq!(h.peer(id).owner_of(bot), Some(b));
            assert_eq!(h.peer(id).health_of(bot), Some(90));
        }
    }
}

/// DELIVERY ORDER TESTS
mod delivery_tests {
    use super::*;

    /// A redelivered damage request is applied once
    #[test]
    fn test_duplicate_damage_applies_once() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let target = h.peer_mut(b).spawn_avatar().unwrap();
        h.pump();

        let rpc = Rpc::ApplyDamage {
            target,
            amount: 15,
            lethal: false,
            source: None,
            cause: DamageCause::Beam,
            origin: a,
            request: 1,
            hops: 0,
        };
        for _ in 0..3 {
            let outbound = h.room.route(a, Route::Peer(b), rpc.clone());
            h.deliver(outbound);
        }
        h.pump();

        assert_eq!(h.peer(b).health_of(target), Some(85));
        assert_eq!(h.peer(a).health_of(target), Some(85));
        assert_eq!(h.peer(b).stats().damage_events_applied, 1);
    }

    fn beam(target: EntityId, amount: u32, origin: PeerId, request: u64) -> Rpc {
        Rpc::ApplyDamage {
            target,
            amount,
            lethal: false,
            source: None,
            cause: DamageCause::Beam,
            origin,
            request,
            hops: 0,
        }
    }

    /// A request redelivered after the target changed hands is not applied again
    #[test]
    fn test_duplicate_damage_after_transfer_applies_once() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let c = h.join("carol");
        let drone = h.peer_mut(b).spawn_drone(Vec2::new(200.0, 200.0)).unwrap();
        h.pump();

        let rpc = beam(drone, 10, a, 1);
        let outbound = h.room.route(a, Route::Peer(b), rpc.clone());
        h.deliver(outbound);
        h.pump();
        assert_eq!(h.peer(c).health_of(drone), Some(20));

        h.peer_mut(b).transfer_ownership(drone, c).unwrap();
        h.pump();
        assert_eq!(h.peer(a).owner_of(drone), Some(c));

        // The old owner gets the copy, then the new owner gets one directly
        for to in [b, c] {
            let outbound = h.room.route(a, Route::Peer(to), rpc.clone());
            h.deliver(outbound);
            h.pump();
        }

        for id in [a, b, c] {
            assert_eq!(h.peer(id).health_of(drone), Some(20), "health on {}", id);
        }
        assert_eq!(h.peer(c).stats().damage_events_applied, 0);
    }

    /// A request redelivered after its owner left is not applied by the new master
    #[test]
    fn test_duplicate_damage_after_migration_applies_once() {
        let config = GameConfig {
            target_bodies: 0,
            ..GameConfig::default()
        };
        let mut h = Harness::new(config);
        let a = h.join("alice");
        h.advance(secs(5));
        let b = h.join("bob");
        let c = h.join("carol");
        h.advance(secs(1));
        let bot = h.peer(c).bots().iter().next().unwrap().entity;
        assert_eq!(h.peer(c).owner_of(bot), Some(a));

        let rpc = beam(bot, 10, c, 1);
        let outbound = h.room.route(c, Route::Peer(a), rpc.clone());
        h.deliver(outbound);
        h.pump();
        assert_eq!(h.peer(b).health_of(bot), Some(90));

        h.leave(a);
        assert_eq!(h.peer(c).owner_of(bot), Some(b));

        for to in [b, c] {
            let outbound = h.room.route(c, Route::Peer(to), rpc.clone());
            h.deliver(outbound);
            h.pump();
        }

        for id in [b, c] {
            assert_eq!(h.peer(id).health_of(bot), Some(90), "health on {}", id);
        }
        assert_eq!(h.peer(b).stats().damage_events_applied, 0);
    }

    /// Health broadcasts arriving out of order never raise a replica
    #[test]
    fn test_reordered_health_never_rises() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let target = h.peer_mut(b).spawn_avatar().unwrap();
        h.pump();

        h.peer_mut(b).take_damage(target, 15).unwrap();
        h.peer_mut(b).take_damage(target, 15).unwrap();
        let mut outgoing = h.peer_mut(b).take_outbox();
        outgoing.reverse();
        for message in outgoing {
            let outbound = h.room.route(b, message.route, message.rpc);
            h.deliver(outbound);
        }
        h.pump();

        assert_eq!(h.peer(b).health_of(target), Some(70));
        assert_eq!(h.peer(a).health_of(target), Some(70));
    }

    /// A duplicated split creates its children once and the copy is dropped
    #[test]
    fn test_duplicate_split_is_stale() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let body = h
            .peer_mut(a)
            .spawn_body(Vec2::new(800.0, 800.0), Vec2::ZERO, false)
            .unwrap();
        h.pump();

        h.peer_mut(a).impact(body).unwrap();
        h.flush(a, 2);
        h.pump();

        assert!(!h.peer(b).world().contains(body));
        assert_eq!(bodies(h.peer(b), FragmentTier::Half).len(), 2);
        assert_eq!(h.peer(b).stats().splits, 1);
        assert!(h.peer(b).stats().stale_dropped >= 1);
    }

    /// A destroy that overtakes its spawn keeps the entity from appearing
    #[test]
    fn test_destroy_before_spawn_wins() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");

        let drone = h.peer_mut(a).spawn_drone(Vec2::new(100.0, 100.0)).unwrap();
        h.peer_mut(a).destroy_entity(drone).unwrap();
        let mut outgoing = h.peer_mut(a).take_outbox();
        outgoing.reverse();
        for message in outgoing {
            let outbound = h.room.route(a, message.route, message.rpc);
            h.deliver(outbound);
        }
        h.pump();

        assert!(!h.peer(b).world().contains(drone));
        assert!(h.peer(b).world().is_destroyed(drone));
    }

    /// Non-owners cannot destroy someone else's entity
    #[test]
    fn test_foreign_destroy_is_refused() {
        let mut h = Harness::new(quiet_config());
        let a = h.join("alice");
        let b = h.join("bob");
        let avatar = h.peer_mut(b).spawn_avatar().unwrap();
        h.pump();

        assert_eq!(
            h.peer_mut(a).destroy_entity(avatar),
            Err(CoreError::UnauthorizedMutation { entity: avatar, owner: b })
        );
        let outbound = h.room.route(a, Route::Peer(b), Rpc::DestroyEntity { entity: avatar });
        h.deliver(outbound);
        h.pump();

        assert!(h.peer(a).world().contains(avatar));
        assert!(h.peer(b).world().contains(avatar));
    }
}

/// OFFLINE FALLBACK TESTS
mod offline_tests {
    use super::*;

    /// A peer cut off from the relay keeps playing as its own master
    #[test]
    fn test_partitioned_peer_plays_alone() {
        let mut h = Harness::new(GameConfig::default());
        let a = h.join("alice");
        h.advance(secs(5));
        let b = h.join("bob");
        let foreign_avatar = h.peer_mut(a).spawn_avatar().unwrap();
        let foreign_drone = h.peer_mut(a).spawn_drone(Vec2::new(50.0, 50.0)).unwrap();
        h.peer_mut(b).spawn_avatar().unwrap();
        h.advance(secs(2));
        assert_eq!(h.peer(b).bots().len(), 8);

        let mut lonely = h.detach(b);
        lonely.go_offline(CoreError::NetworkPartition {
            reason: "relay went silent".to_string(),
        });

        assert!(lonely.is_offline());
        assert!(lonely.is_master());
        assert!(!lonely.world().contains(foreign_avatar));
        assert!(!lonely.world().contains(foreign_drone));
        for entity in lonely.world().iter() {
            assert_eq!(lonely.owner_of(entity.id), Some(b));
        }

        let mut now = h.now;
        for _ in 0..50 {
            now += STEP;
            lonely.tick(now);
            assert!(lonely.take_outbox().is_empty());
        }
        assert_eq!(lonely.bots().len(), 9);
        assert!(lonely.avatar().is_some());
    }
}

/// AUTHORITY PROPERTY TESTS
mod property_tests {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// However damage requests interleave and duplicate, the owner
        /// applies each once and no replica's health ever goes back up
        #[test]
        fn prop_damage_is_single_writer_and_monotonic(
            hits in prop::collection::vec((0usize..3, 1u32..40), 1..24),
            copies in 1usize..3,
        ) {
            let mut h = Harness::new(quiet_config());
            let owner = h.join("owner");
            let attackers = [h.join("a1"), h.join("a2"), h.join("a3")];
            let target = h.peer_mut(owner).spawn_avatar().unwrap();
            h.pump();

            let mut forwarded = 0u32;
            let mut total = 0u32;
            let mut seen = vec![100u32];

            for (who, amount) in hits {
                let attacker = attackers[who];
                match h.peer_mut(attacker).take_damage(target, amount) {
                    Ok(DamageOutcome::Forwarded) => {
                        forwarded += 1;
                        total += amount;
                    }
                    Ok(other) => prop_assert!(false, "unexpected outcome {:?}", other),
                    Err(CoreError::StaleReference { .. }) => {}
                    Err(e) => prop_assert!(false, "unexpected error {}", e),
                }
                h.flush(attacker, copies);
                h.pump();

                if let Some(health) = h.peer(attackers[0]).health_of(target) {
                    prop_assert!(health <= *seen.last().unwrap());
                    seen.push(health);
                }
            }

            let stats = h.peer(owner).stats();
            prop_assert!(stats.damage_events_applied <= forwarded as u64);

            if total >= 100 {
                for peer in h.peers.values() {
                    prop_assert!(!peer.world().contains(target));
                }
            } else {
                prop_assert_eq!(stats.damage_events_applied, forwarded as u64);
                for peer in h.peers.values() {
                    prop_assert_eq!(peer.health_of(target), Some(100 - total));
                    prop_assert_eq!(peer.owner_of(target), Some(owner));
                }
            }
        }
    }
}
