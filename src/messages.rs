//! # Wire Protocol Messages
//!
//! Serializable types for the overlay wire protocol. Everything is
//! bincode-encoded with size limits enforced on deserialization.
//!
//! ## Envelope
//!
//! Every message travels inside an [`Envelope`] carrying the routing
//! fields: destination, optional source, message id, hop budget,
//! replication factor and the relay fields used by anonymous and
//! partially-joined nodes.
//!
//! ## Message tags
//!
//! | Tag | Direction | Carried payload |
//! |-----|-----------|-----------------|
//! | `Join` / `JoinResponse` | routing | [`ConnectInfo`] hello exchange |
//! | `Connect` / `ForwardConnect` | routing | [`ConnectInfo`] handshake |
//! | `FindGroup` / `FindGroupResponse` | routing | [`GroupQuery`] / [`GroupResult`] |
//! | `GetData`, `PutData`, `Post`, … | node level | opaque host payload |
//!
//! The node-level tags are the vocabulary of the layer above; the routing
//! core forwards and delivers them without interpreting their payloads.

use std::net::SocketAddr;

use bincode::Options;
use ed25519_dalek::VerifyingKey;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::address::Address;

/// Maximum size of a single application payload (1 MiB).
pub const MAX_DATA_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_DATA_SIZE to allow for envelope overhead.
pub const MAX_WIRE_SIZE: u64 = (MAX_DATA_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// Always use this for deserialization of untrusted bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize a typed routing payload for embedding in an [`Envelope`].
pub fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn serialize_envelope(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(envelope)
}

pub fn deserialize_envelope(bytes: &[u8]) -> Result<Envelope, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Dense wire vocabulary of the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageTag {
    Join,
    JoinResponse,
    Connect,
    ForwardConnect,
    FindGroup,
    FindGroupResponse,
    GetData,
    GetDataResponse,
    PutData,
    PutDataResponse,
    Post,
}

impl MessageTag {
    /// True for overlay-internal messages, as opposed to host payloads.
    pub fn is_routing(self) -> bool {
        matches!(
            self,
            MessageTag::Join
                | MessageTag::JoinResponse
                | MessageTag::Connect
                | MessageTag::ForwardConnect
                | MessageTag::FindGroup
                | MessageTag::FindGroupResponse
        )
    }

    /// Tag carried by a response to a request with this tag.
    pub fn response_tag(self) -> MessageTag {
        match self {
            MessageTag::Join => MessageTag::JoinResponse,
            MessageTag::Connect | MessageTag::ForwardConnect => MessageTag::Connect,
            MessageTag::FindGroup => MessageTag::FindGroupResponse,
            MessageTag::GetData => MessageTag::GetDataResponse,
            MessageTag::PutData => MessageTag::PutDataResponse,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Request,
    Response,
}

/// The routed message envelope.
///
/// `source` is absent on messages from anonymous or partially-joined
/// nodes; such messages carry the relay fields instead, and responses to
/// them are routed by `relay_connection` rather than by address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: MessageTag,
    pub kind: Kind,
    pub source: Option<Address>,
    pub destination: Address,
    pub message_id: u32,
    /// Overlay-internal message, as opposed to a host payload.
    pub routing: bool,
    pub direct: bool,
    pub cacheable: bool,
    pub client_origin: bool,
    pub replication: u16,
    pub hops_to_live: u16,
    pub relay: Option<Address>,
    pub relay_connection: Option<Address>,
    pub group_claim: Option<Address>,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// A routing request skeleton; callers fill the relay fields when the
    /// sender is not yet routable.
    pub fn routing_request(
        tag: MessageTag,
        source: Option<Address>,
        destination: Address,
        message_id: u32,
        hops_to_live: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            tag,
            kind: Kind::Request,
            source,
            destination,
            message_id,
            routing: true,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live,
            relay: None,
            relay_connection: None,
            group_claim: None,
            payload,
        }
    }

    /// The response envelope for this request: source and destination
    /// swapped, relay fields preserved for the return path.
    pub fn response(&self, responder: Option<Address>, payload: Vec<u8>) -> Envelope {
        let destination = self.source.or(self.relay).unwrap_or(self.destination);
        Envelope {
            tag: self.tag.response_tag(),
            kind: Kind::Response,
            source: responder,
            destination,
            message_id: self.message_id,
            routing: self.routing,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: self.hops_to_live,
            relay: self.relay,
            relay_connection: self.relay_connection,
            group_claim: None,
            payload,
        }
    }

    /// True for messages from a sender without an overlay presence.
    pub fn is_relayed(&self) -> bool {
        self.source.is_none() && self.relay.is_some()
    }
}

/// A local/external endpoint pair as negotiated with the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    /// Both endpoints equal: a directly reachable node (zero-state peers).
    pub fn symmetric(addr: SocketAddr) -> Self {
        Self {
            local: addr,
            external: addr,
        }
    }
}

/// FindGroup request payload: who is closest to `target`?
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupQuery {
    pub target: Address,
    pub count: u16,
}

/// A candidate returned by a FindGroup query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub address: Address,
    pub public_key: VerifyingKey,
}

/// FindGroup response payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResult {
    pub target: Address,
    pub candidates: Vec<CandidateRecord>,
}

/// Identity material exchanged during Join and Connect handshakes.
///
/// `proof` is an ownership signature over (claimant, audience, nonce); the
/// audience is the envelope destination for Connect, absent for Join.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub claimant: Address,
    pub public_key: VerifyingKey,
    pub endpoints: EndpointPair,
    pub nonce: [u8; 16],
    pub proof: Vec<u8>,
}
