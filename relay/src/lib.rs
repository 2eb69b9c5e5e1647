//! # Room Relay Library
//!
//! The relay is the transport layer of a peer-hosted match. It holds no game
//! state and makes no game decisions: peers own their entities and the
//! elected master makes room-wide decisions. The relay only provides what a
//! group of peers cannot agree on cheaply by themselves.
//!
//! ## Responsibilities
//!
//! ### Membership
//! Peers join with a protocol version and a display name and receive a
//! [`shared::PeerId`] that is never reissued within the room. Silent peers
//! are timed out and announced as departed.
//!
//! ### Master Election
//! The member with the lowest join sequence is the master. When the master
//! leaves, the earliest remaining member is elected and a `MasterChanged`
//! packet carrying a strictly increasing epoch is sent to every member
//! before the departure itself.
//!
//! ### Routing
//! Peers address messages with a [`shared::Route`]: a single peer, everyone
//! else, everyone else with replay, or the master. The relay resolves the
//! route against current membership.
//!
//! ### Replay Log
//! `AllBuffered` messages are appended to a per-room log that is replayed to
//! late joiners right after their welcome. Terminal messages such as
//! `DestroyEntity` and `RemoveBotFromClients` remove everything earlier
//! about the same subject, so a late joiner reconstructs the current roster
//! instead of its history.
//!
//! ## Module Organization
//!
//! - `room`: membership, election, routing and the replay log, free of I/O
//! - `network`: the UDP loop, with receiver, sender and timeout tasks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay::network::Relay;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut relay = Relay::new("127.0.0.1:8080", 16, Duration::from_secs(5)).await?;
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod room;
