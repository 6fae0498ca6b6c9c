//! # Vicinity - Structured Overlay Routing Core
//!
//! Vicinity is the routing core of a structured peer-to-peer overlay:
//! every node owns a 512-bit address, keeps a small neighbour set chosen
//! by XOR distance, and forwards messages by successive approximation
//! toward their numerically closest node — or toward the *close group* of
//! a destination when a message is group-addressed.
//!
//! ## Architecture
//!
//! The crate uses the **actor pattern** for the stateful pieces: the
//! [`Node`] handle is cheap to clone and posts events into a private
//! event loop owning the join/recovery state machine, while the routing
//! table and the pending-response table are lock-guarded values whose
//! observer callbacks always run after the lock is released.
//!
//! The transport is an external collaborator: hosts supply any reliable
//! datagram layer by implementing the [`Transport`] trait, and the core
//! never opens a socket itself.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API, join/recovery state machine, host callbacks |
//! | `address` | 512-bit addresses and the XOR distance metric |
//! | `identity` | Ed25519 keypairs, node identities, validated peers |
//! | `table` | Bounded XOR-ordered neighbour set with close-group semantics |
//! | `timer` | Pending-response correlation with timeouts |
//! | `messages` | Wire envelope and routing payloads (bounded bincode) |
//! | `network` | Transport trait and the overlay-facing network facade |
//! | `dispatcher` | Next-hop selection, group fan-out, relay path |
//!
//! ## Quick start
//!
//! ```ignore
//! let node = NodeBuilder::new()
//!     .identity(NodeIdentity::from_keypair(Keypair::generate()))
//!     .handlers(EventHandlers::new().on_message(|msg, responder| {
//!         responder.respond(b"seen".to_vec());
//!     }))
//!     .build(transport)?;
//! node.join(bootstrap_endpoints);
//! ```

mod address;
mod dispatcher;
mod identity;
mod messages;
mod network;
mod node;
mod table;
mod timer;

pub use address::{bucket_index, distance_cmp, Address, ADDRESS_BYTES, BUCKET_COUNT};
pub use identity::{address_of_key, verify_ownership, Keypair, NodeIdentity, Peer};
pub use messages::{
    deserialize_bounded, deserialize_envelope, serialize_envelope, CandidateRecord, ConnectInfo,
    EndpointPair, Envelope, GroupQuery, GroupResult, Kind, MessageTag, MAX_DATA_SIZE,
};
pub use network::{
    BootstrapHandle, EndpointProbe, NatKind, Network, Transport, TransportEvents,
};
pub use node::{
    ConfigError, EventHandlers, JoinState, NetworkStatus, Node, NodeBuilder, Parameters,
    RandomNodeHelper, ReceivedMessage, Responder,
};
pub use table::{AddOutcome, RoutingTable, TableConfig};
pub use timer::{ResponseCallback, ResponseTimer};
