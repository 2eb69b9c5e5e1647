//! Room membership, master election and message routing for the relay
//!
//! This module is the relay's whole view of a room:
//! - Member lifecycle (join, leave, timeout) in join order
//! - Deterministic master election and migration
//! - Route resolution from a sender's `Route` to concrete recipients
//! - The `AllBuffered` replay log handed to late joiners
//!
//! The room holds no game state. It never interprets an `Rpc` beyond what
//! it needs to keep the replay log compact.

use log::{debug, info};
use shared::{Packet, PeerId, Route, Rpc, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A participant connected to the room
#[derive(Debug)]
pub struct Member {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub name: String,
    /// Position in the join order; the lowest remaining one is elected master
    pub join_seq: u64,
    /// Last time we received any packet from this member
    pub last_seen: Instant,
}

impl Member {
    pub fn new(id: PeerId, addr: SocketAddr, name: String, join_seq: u64) -> Self {
        Self {
            id,
            addr,
            name,
            join_seq,
            last_seen: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// A packet addressed to a member
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: PeerId,
    pub packet: Packet,
}

#[derive(Debug)]
pub enum JoinOutcome {
    Accepted {
        peer: PeerId,
        outbound: Vec<Outbound>,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone)]
struct BufferedRpc {
    sender: PeerId,
    rpc: Rpc,
}

/// Relay-side state of one room
pub struct Room {
    members: HashMap<PeerId, Member>,
    next_peer_id: u32,
    next_join_seq: u64,
    capacity: usize,
    master: Option<PeerId>,
    epoch: u32,
    buffer: Vec<BufferedRpc>,
}

impl Room {
    /// Creates an empty room. Peer ids start from 1 and are never reissued.
    pub fn new(capacity: usize) -> Self {
        Self {
            members: HashMap::new(),
            next_peer_id: 1,
            next_join_seq: 0,
            capacity,
            master: None,
            epoch: 0,
            buffer: Vec::new(),
        }
    }

    /// Admits a new member, electing it master if the room was empty.
    ///
    /// The joiner receives its welcome followed by the replay log in send
    /// order; everyone else hears about the new member.
    pub fn join(&mut self, addr: SocketAddr, name: &str, client_version: u32) -> JoinOutcome {
        if client_version != PROTOCOL_VERSION {
            return JoinOutcome::Rejected {
                reason: "Protocol version mismatch".to_string(),
            };
        }

        let mut outbound = Vec::new();

        // A member re-joining from the same address replaces its old session
        if let Some(existing) = self.find_by_addr(addr) {
            info!("Replacing existing member {} from {}", existing, addr);
            outbound.extend(self.leave(existing));
        }

        if self.members.len() >= self.capacity {
            return JoinOutcome::Rejected {
                reason: "Room full".to_string(),
            };
        }

        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        let join_seq = self.next_join_seq;
        self.next_join_seq += 1;

        info!("{} ({}) joined from {}", id, name, addr);
        self.members
            .insert(id, Member::new(id, addr, name.to_string(), join_seq));

        if self.master.is_none() {
            self.elect();
        }

        let master = self.master.unwrap_or(id);
        outbound.push(Outbound {
            to: id,
            packet: Packet::Welcome {
                peer_id: id,
                master,
                epoch: self.epoch,
                peers: self.members_in_join_order(),
            },
        });

        for entry in &self.buffer {
            outbound.push(Outbound {
                to: id,
                packet: Packet::Deliver {
                    sender: entry.sender,
                    rpc: entry.rpc.clone(),
                },
            });
        }

        for other in self.members.keys().filter(|other| **other != id) {
            outbound.push(Outbound {
                to: *other,
                packet: Packet::PeerJoined { peer: id },
            });
        }

        JoinOutcome::Accepted { peer: id, outbound }
    }

    /// Removes a member. If it was the master, a replacement is elected and
    /// announced before the departure so peers can hand its room objects
    /// straight to the new master.
    pub fn leave(&mut self, peer: PeerId) -> Vec<Outbound> {
        let Some(member) = self.members.remove(&peer) else {
            return Vec::new();
        };
        info!("{} ({}) left the room", member.id, member.name);

        let mut outbound = Vec::new();
        if self.master == Some(peer) {
            self.master = None;
            if let Some(new_master) = self.elect() {
                for id in self.members.keys() {
                    outbound.push(Outbound {
                        to: *id,
                        packet: Packet::MasterChanged {
                            master: new_master,
                            epoch: self.epoch,
                        },
                    });
                }
            }
        }

        for id in self.members.keys() {
            outbound.push(Outbound {
                to: *id,
                packet: Packet::PeerLeft { peer },
            });
        }

        if self.members.is_empty() {
            debug!("Room empty, clearing {} buffered messages", self.buffer.len());
            self.buffer.clear();
        }

        outbound
    }

    /// Picks the remaining member with the lowest join sequence
    fn elect(&mut self) -> Option<PeerId> {
        let elected = self
            .members
            .values()
            .min_by_key(|member| member.join_seq)
            .map(|member| member.id);

        if let Some(master) = elected {
            self.epoch += 1;
            self.master = Some(master);
            info!("{} elected master (epoch {})", master, self.epoch);
        }

        elected
    }

    /// Resolves a routed message from `sender` into deliveries.
    ///
    /// Messages from non-members are dropped. Terminal messages compact the
    /// replay log regardless of their route.
    pub fn route(&mut self, sender: PeerId, route: Route, rpc: Rpc) -> Vec<Outbound> {
        if !self.members.contains_key(&sender) {
            debug!("Dropping {:?} from unknown {}", rpc.kind(), sender);
            return Vec::new();
        }

        if rpc.is_terminal() {
            self.compact(&rpc);
        }

        let recipients: Vec<PeerId> = match route {
            Route::Peer(peer) => {
                if self.members.contains_key(&peer) {
                    vec![peer]
                } else {
                    Vec::new()
                }
            }
            Route::Others => self.others(sender),
            Route::AllBuffered => {
                // A buffered terminal stays as the subject's tombstone so late
                // joiners still learn which actor ids were retired
                self.buffer.push(BufferedRpc {
                    sender,
                    rpc: rpc.clone(),
                });
                self.others(sender)
            }
            Route::Master => self.master.into_iter().collect(),
        };

        recipients
            .into_iter()
            .map(|to| Outbound {
                to,
                packet: Packet::Deliver {
                    sender,
                    rpc: rpc.clone(),
                },
            })
            .collect()
    }

    /// Drops buffered messages made obsolete by a terminal message
    fn compact(&mut self, terminal: &Rpc) {
        let gone = terminal.subjects();
        let before = self.buffer.len();
        self.buffer.retain(|entry| {
            !entry
                .rpc
                .subjects()
                .iter()
                .any(|subject| gone.contains(subject))
        });
        let removed = before - self.buffer.len();
        if removed > 0 {
            debug!("Compacted {} buffered messages", removed);
        }
    }

    fn others(&self, sender: PeerId) -> Vec<PeerId> {
        self.members
            .keys()
            .filter(|id| **id != sender)
            .copied()
            .collect()
    }

    /// Records activity from a member
    pub fn touch(&mut self, peer: PeerId) {
        if let Some(member) = self.members.get_mut(&peer) {
            member.last_seen = Instant::now();
        }
    }

    /// Returns members silent for longer than `timeout`. They are not removed
    /// here; the caller runs [`Room::leave`] so departures are announced.
    pub fn timed_out(&self, timeout: Duration) -> Vec<PeerId> {
        self.members
            .values()
            .filter(|member| member.is_timed_out(timeout))
            .map(|member| member.id)
            .collect()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.members
            .values()
            .find(|member| member.addr == addr)
            .map(|member| member.id)
    }

    pub fn addr_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.members.get(&peer).map(|member| member.addr)
    }

    pub fn members_in_join_order(&self) -> Vec<PeerId> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|member| member.join_seq);
        members.into_iter().map(|member| member.id).collect()
    }

    pub fn master(&self) -> Option<PeerId> {
        self.master
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
