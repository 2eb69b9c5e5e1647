//! # Arena Peer Library
//!
//! Everything a participant runs to take part in a peer-hosted room. There
//! is no game server: each entity has exactly one owning peer, and one peer
//! at a time holds the room-wide master role chosen by the relay.
//!
//! ## Module Organization
//!
//! ### Message Bus (`bus`)
//! Turns logical targets (owner, others, all, buffered, master) into local
//! deliveries or relay routes, and queues inbound messages for the update
//! loop. Handlers are looked up by message kind.
//!
//! ### Authority (`authority`)
//! Tracks who owns each entity and performs ownership transfers.
//!
//! ### Coordinator (`coordinator`)
//! Follows master elections, hands the room objects of departed peers to the
//! master, and runs master-only periodic work such as body refills.
//!
//! ### Health (`health`)
//! Owner-applied damage, forwarding of remote damage requests and
//! monotonic health replication.
//!
//! ### Destructibles (`destructible`)
//! The Whole → Half → Quarter → Gone fragment cascade with time-boxed,
//! once-per-target collision damage.
//!
//! ### Bots (`bots`, `placement`)
//! Master-driven bot balancing against the room capacity and the random
//! placement search behind every spawn.
//!
//! ### Runtime (`peer`, `scheduler`, `network`)
//! [`Peer`] ties the components together behind a single update loop;
//! the scheduler holds timed continuations; `network` is the UDP link to the
//! relay with bounded join retries and offline fallback.
//!
//! ## Usage Example
//!
//! ```rust
//! use peer::Peer;
//! use shared::{GameConfig, Packet, PeerId};
//! use std::time::Duration;
//!
//! let mut peer = Peer::new("alice", GameConfig::default());
//! peer.handle_relay_packet(Packet::Welcome {
//!     peer_id: PeerId(1),
//!     master: PeerId(1),
//!     epoch: 1,
//!     peers: vec![PeerId(1)],
//! })
//! .unwrap();
//! peer.spawn_avatar().unwrap();
//! peer.tick(Duration::from_millis(16));
//!
//! // Alone in the room, the master fills it with bots
//! assert_eq!(
//!     peer.stats().bot_spawns_issued as usize,
//!     GameConfig::default().bot_capacity - 1
//! );
//! for message in peer.take_outbox() {
//!     // hand each message to the relay
//!     let _ = message.route;
//! }
//! ```

pub mod authority;
pub mod bots;
pub mod bus;
pub mod controllable;
pub mod coordinator;
pub mod destructible;
pub mod entity;
pub mod health;
pub mod network;
pub mod peer;
pub mod placement;
pub mod scheduler;

pub use controllable::{BotController, Controllable, PlayerController};
pub use peer::{Peer, PeerStats};
