//! Message bus: per-peer inbox, outbox and handler registry.
//!
//! Game code addresses messages with a [`Target`]. The bus turns that into
//! a local delivery (the message loops back into this peer's own inbox),
//! a remote [`Route`] for the relay, or both. Inbound messages are queued
//! and only run when the update loop drains the inbox, so handlers never
//! interleave with other state mutation on the same peer.

use log::debug;
use shared::{CoreError, PeerId, Route, Rpc, RpcKind, Target};
use std::collections::{HashMap, VecDeque};

/// An inbound message with the peer that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: PeerId,
    pub rpc: Rpc,
}

/// A message waiting to be handed to the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub route: Route,
    pub rpc: Rpc,
}

/// Handler signature for one message kind.
pub type Handler<C> = fn(&mut C, &Envelope) -> Result<(), CoreError>;

/// Message handlers keyed by message kind.
pub struct HandlerRegistry<C> {
    handlers: HashMap<RpcKind, Handler<C>>,
}

impl<C> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: RpcKind, handler: Handler<C>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: RpcKind) -> Option<Handler<C>> {
        self.handlers.get(&kind).copied()
    }
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MessageBus {
    local: PeerId,
    offline: bool,
    inbox: VecDeque<Envelope>,
    outbox: Vec<Outgoing>,
    /// `MasterOnly` messages sent while no master was elected.
    deferred: Vec<Rpc>,
}

impl MessageBus {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            offline: false,
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// While offline nothing leaves the peer; local deliveries still happen.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
        if offline {
            self.outbox.clear();
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Sends `rpc` to `target`.
    ///
    /// `owner` is the current owner of the message's entity as known to the
    /// caller, `master` the elected master. An `Owner` send with no known
    /// owner is a stale reference. A `MasterOnly` send with no master is
    /// deferred until [`MessageBus::flush_deferred`].
    pub fn send(
        &mut self,
        target: Target,
        rpc: Rpc,
        owner: Option<PeerId>,
        master: Result<PeerId, CoreError>,
    ) -> Result<(), CoreError> {
        match target {
            Target::Owner => {
                let Some(owner) = owner else {
                    return Err(CoreError::StaleReference {
                        entity: rpc.entity().unwrap_or(shared::EntityId(0)),
                    });
                };
                self.deliver_to(owner, rpc);
            }
            Target::Others => self.push_remote(Route::Others, rpc),
            Target::All => {
                self.push_remote(Route::Others, rpc.clone());
                self.loopback(rpc);
            }
            Target::AllBuffered => {
                self.push_remote(Route::AllBuffered, rpc.clone());
                self.loopback(rpc);
            }
            Target::MasterOnly => match master {
                Ok(master) if master == self.local => self.loopback(rpc),
                Ok(_) => self.push_remote(Route::Master, rpc),
                Err(_) => {
                    debug!("No master elected, deferring {:?}", rpc.kind());
                    self.deferred.push(rpc);
                }
            },
        }
        Ok(())
    }

    /// Sends directly to one peer, looping back if it is this peer.
    pub fn deliver_to(&mut self, peer: PeerId, rpc: Rpc) {
        if peer == self.local {
            self.loopback(rpc);
        } else {
            self.push_remote(Route::Peer(peer), rpc);
        }
    }

    /// Re-sends deferred `MasterOnly` messages now that `master` is known.
    pub fn flush_deferred(&mut self, master: PeerId) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for rpc in deferred {
            if master == self.local {
                self.loopback(rpc);
            } else {
                self.push_remote(Route::Master, rpc);
            }
        }
        count
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn loopback(&mut self, rpc: Rpc) {
        self.inbox.push_back(Envelope {
            sender: self.local,
            rpc,
        });
    }

    fn push_remote(&mut self, route: Route, rpc: Rpc) {
        if self.offline {
            return;
        }
        self.outbox.push(Outgoing { route, rpc });
    }

    /// Queues a message that arrived from the network.
    pub fn receive(&mut self, sender: PeerId, rpc: Rpc) {
        self.inbox.push_back(Envelope { sender, rpc });
    }

    pub fn pop_inbound(&mut self) -> Option<Envelope> {
        self.inbox.pop_front()
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Drops every queued message, used when joining a fresh room.
    pub fn reset(&mut self, local: PeerId) {
        self.local = local;
        self.offline = false;
        self.inbox.clear();
        self.outbox.clear();
        self.deferred.clear();
    }
}
