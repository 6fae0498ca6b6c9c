//! # Message Dispatcher
//!
//! The inbound and outbound pump of the overlay. Every wire message passes
//! through here exactly once per node:
//!
//! - **Receive**: parse (bounded), spend a hop, suppress duplicates, then
//!   correlate (responses), answer (routing requests) or deliver/forward
//!   (node-level traffic).
//! - **Send**: validate, pick replication, register the pending-response
//!   task, then route — via the bootstrap relay while the node has no
//!   overlay presence, greedily toward the destination otherwise.
//! - **Group fan-out**: a group-addressed message reaching a node within
//!   range of its destination is replicated to the close group and
//!   processed locally; replicas carry `replication = 1` so members
//!   deliver without re-replicating.
//! - **Admission**: FindGroup responses feed a Connect handshake that
//!   proves identity ownership before a candidate touches the routing
//!   table.
//!
//! Malformed envelopes are dropped with a warning and never propagate.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::Signature;
use lru::LruCache;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::identity::{address_of_key, verify_ownership, NodeIdentity, Peer};
use crate::messages::{
    deserialize_bounded, deserialize_envelope, serialize_envelope, serialize_payload,
    CandidateRecord, ConnectInfo, Envelope, GroupQuery, GroupResult, Kind, MessageTag,
};
use crate::network::{Network, Transport};
use crate::node::{
    EventHandlers, NetworkStatus, Parameters, RandomNodeHelper, ReceivedMessage, Responder,
};
use crate::table::{AddOutcome, RoutingTable};
use crate::timer::{ResponseCallback, ResponseTimer};

/// Bound on the duplicate-suppression cache.
const SEEN_CACHE_CAPACITY: usize = 4096;

/// How long an initiated Connect handshake blocks re-initiation towards
/// the same candidate.
const CONNECT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

type SeenKey = (Address, u32, MessageTag);

struct DispatcherInner<T: Transport> {
    identity: Arc<NodeIdentity>,
    client_mode: bool,
    params: Parameters,
    table: Arc<RoutingTable>,
    timer: ResponseTimer,
    network: Network<T>,
    handlers: Arc<EventHandlers>,
    random_nodes: Arc<RandomNodeHelper>,
    seen: Mutex<LruCache<SeenKey, ()>>,
    pending_connects: Mutex<HashSet<Address>>,
    running: Arc<AtomicBool>,
    /// Set once the relay session is gone; session-terminal statuses are
    /// reported exactly once and further relayed sends refuse quietly.
    session_ended: AtomicBool,
}

pub(crate) struct Dispatcher<T: Transport> {
    inner: Arc<DispatcherInner<T>>,
}

impl<T: Transport> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Dispatcher<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<NodeIdentity>,
        client_mode: bool,
        params: Parameters,
        table: Arc<RoutingTable>,
        timer: ResponseTimer,
        network: Network<T>,
        handlers: Arc<EventHandlers>,
        random_nodes: Arc<RandomNodeHelper>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                identity,
                client_mode,
                params,
                table,
                timer,
                network,
                handlers,
                random_nodes,
                seen: Mutex::new(LruCache::new(
                    NonZeroUsize::new(SEEN_CACHE_CAPACITY).expect("cache capacity is non-zero"),
                )),
                pending_connects: Mutex::new(HashSet::new()),
                running,
                session_ended: AtomicBool::new(false),
            }),
        }
    }

    fn own_address(&self) -> Address {
        self.inner.identity.address()
    }

    pub fn timer(&self) -> &ResponseTimer {
        &self.inner.timer
    }

    pub(crate) fn notify_status(&self, status: NetworkStatus) {
        if let Some(cb) = &self.inner.handlers.on_network_status {
            cb(status);
        }
    }

    /// Mark the relay session terminal, reporting `status` only on the
    /// first call.
    pub(crate) fn end_session(&self, status: NetworkStatus) {
        if !self.inner.session_ended.swap(true, Ordering::SeqCst) {
            self.notify_status(status);
        }
    }

    /// A successful (re-)bootstrap revives the relay session.
    pub(crate) fn reset_session(&self) {
        self.inner.session_ended.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Send contract
    // ------------------------------------------------------------------

    /// Route one application payload toward `destination`.
    ///
    /// Input errors (zero destination, empty or oversized payload) are
    /// reported as an empty response list to the callback, never as a
    /// panic or error return.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        destination: Address,
        group_claim: Option<Address>,
        payload: Vec<u8>,
        callback: Option<ResponseCallback>,
        timeout: Duration,
        direct: bool,
        cacheable: bool,
    ) {
        if destination.is_zero() {
            warn!("invalid destination, aborted send");
            if let Some(cb) = callback {
                cb(Vec::new());
            }
            return;
        }
        if payload.is_empty() || payload.len() > self.inner.params.max_data_size {
            warn!(size = payload.len(), "payload size not allowed");
            if let Some(cb) = callback {
                cb(Vec::new());
            }
            return;
        }

        let replication = if direct {
            1
        } else {
            self.inner.params.close_group_size as u16
        };
        let message_id = match callback {
            Some(cb) => self
                .inner
                .timer
                .add_task(timeout, cb, replication as usize),
            None => self.inner.timer.next_message_id(),
        };

        let own = self.own_address();
        let mut envelope = Envelope {
            tag: MessageTag::Post,
            kind: Kind::Request,
            source: None,
            destination,
            message_id,
            routing: false,
            direct,
            cacheable,
            client_origin: self.inner.client_mode,
            replication,
            hops_to_live: self.inner.params.hops_to_live,
            relay: None,
            relay_connection: None,
            group_claim,
            payload,
        };

        // Anonymous or partially-joined: everything goes via the relay.
        if self.inner.identity.is_ephemeral() || self.inner.table.is_empty() {
            if self.inner.session_ended.load(Ordering::SeqCst) {
                trace!("send refused, relay session ended");
                self.inner.timer.cancel_task(message_id);
                return;
            }
            envelope.relay = Some(own);
            envelope.relay_connection = self.inner.network.this_node_relay_connection_id();
            let sent = match self.inner.network.bootstrap_connection_id() {
                Some(conn) => self
                    .inner
                    .network
                    .send_to_direct(&envelope, &conn)
                    .await
                    .is_ok(),
                None => false,
            };
            if !sent {
                self.inner.timer.cancel_task(message_id);
                let status = if self.inner.identity.is_ephemeral() {
                    warn!("anonymous session ended, send not allowed anymore");
                    NetworkStatus::AnonymousSessionEnded
                } else {
                    warn!("partial join session ended, send not allowed anymore");
                    NetworkStatus::PartialJoinSessionEnded
                };
                self.end_session(status);
            }
            return;
        }

        envelope.source = Some(own);
        if destination == own {
            if self.inner.client_mode {
                // A client's own address is served by its close group.
                trace!("client sending to own address via the network");
                if let Err(e) = self.inner.network.send_to_closest(&envelope).await {
                    debug!(error = %e, "self-addressed client send failed");
                }
            } else {
                trace!("delivering self-addressed send locally");
                self.dispatch_request(envelope).await;
            }
            return;
        }
        self.dispatch_request(envelope).await;
    }

    // ------------------------------------------------------------------
    // Receive contract
    // ------------------------------------------------------------------

    pub async fn handle_wire(&self, bytes: Vec<u8>) {
        match deserialize_envelope(&bytes) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => warn!(error = %e, len = bytes.len(), "dropping unparseable message"),
        }
    }

    pub async fn handle_envelope(&self, mut envelope: Envelope) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        if envelope.hops_to_live == 0 {
            warn!(
                destination = %envelope.destination,
                "hop budget exhausted, dropping message"
            );
            return;
        }
        envelope.hops_to_live -= 1;

        match envelope.kind {
            Kind::Response => self.handle_response(envelope).await,
            Kind::Request => self.handle_request(envelope).await,
        }
    }

    async fn handle_request(&self, envelope: Envelope) {
        let origin = envelope.source.or(envelope.relay).unwrap_or(Address::ZERO);
        if !origin.is_zero() {
            let key = (origin, envelope.message_id, envelope.tag);
            let duplicate = self
                .inner
                .seen
                .lock()
                .expect("seen cache lock poisoned")
                .put(key, ())
                .is_some();
            if duplicate {
                trace!(message_id = envelope.message_id, "duplicate request suppressed");
                return;
            }
        }

        // Full-node sources feed the random-node pool.
        if let Some(source) = envelope.source {
            if !envelope.client_origin {
                self.inner.random_nodes.add(source);
            }
        }

        if envelope.routing {
            match envelope.tag {
                MessageTag::FindGroup => self.handle_find_group(envelope).await,
                MessageTag::Connect | MessageTag::ForwardConnect => {
                    self.handle_connect_request(envelope).await
                }
                MessageTag::Join => self.handle_join(envelope).await,
                other => warn!(?other, "routing request with unexpected tag"),
            }
            return;
        }
        self.dispatch_request(envelope).await;
    }

    /// Deliver, replicate or forward a node-level request.
    async fn dispatch_request(&self, envelope: Envelope) {
        let own = self.own_address();
        if envelope.destination == own {
            self.deliver_local(envelope);
            return;
        }

        if !envelope.direct {
            let group_size = self.inner.params.close_group_size;
            if self
                .inner
                .table
                .is_in_range(&envelope.destination, group_size)
            {
                if envelope.replication > 1 {
                    self.replicate_to_group(&envelope).await;
                }
                self.deliver_local(envelope);
                return;
            }
        }

        self.forward(envelope).await;
    }

    /// One copy to each of the `close_group_size - 1` nearest entries;
    /// replicas are marked `replication = 1` so they terminate there.
    async fn replicate_to_group(&self, envelope: &Envelope) {
        let mut replica = envelope.clone();
        replica.replication = 1;
        let members = self.inner.table.closest_nodes(
            &envelope.destination,
            self.inner.params.close_group_size - 1,
        );
        debug!(
            destination = %envelope.destination,
            copies = members.len(),
            "group fan-out"
        );
        for member in members {
            if let Err(e) = self
                .inner
                .network
                .send_to_direct(&replica, &member.connection_id)
                .await
            {
                debug!(peer = %member.address, error = %e, "fan-out copy failed");
            }
        }
    }

    /// Greedy forwarding: hand the envelope to the nearest entry if that
    /// improves on our own distance, otherwise deliver here — this node is
    /// the closest it knows of.
    async fn forward(&self, mut envelope: Envelope) {
        match self.inner.network.next_hop(&envelope.destination) {
            Some(next) => {
                // The final hop of a Connect is an explicit handoff.
                if envelope.tag == MessageTag::Connect && next.address == envelope.destination {
                    envelope.tag = MessageTag::ForwardConnect;
                }
                if let Err(e) = self
                    .inner
                    .network
                    .send_to_direct(&envelope, &next.connection_id)
                    .await
                {
                    debug!(next = %next.address, error = %e, "forward failed");
                }
            }
            None => {
                if envelope.routing {
                    trace!(
                        destination = %envelope.destination,
                        "no closer peer for routing message, dropping"
                    );
                    return;
                }
                self.deliver_local(envelope);
            }
        }
    }

    fn deliver_local(&self, envelope: Envelope) {
        let Some(on_message) = &self.inner.handlers.on_message else {
            trace!("no message handler registered, dropping delivery");
            return;
        };
        let received = ReceivedMessage {
            source: envelope.source,
            destination: envelope.destination,
            group_claim: envelope.group_claim,
            tag: envelope.tag,
            client_origin: envelope.client_origin,
            payload: envelope.payload.clone(),
        };
        let dispatcher = self.clone();
        let own = self.own_address();
        let responder = Responder::new(move |payload: Vec<u8>| {
            let response = envelope.response(Some(own), payload);
            tokio::spawn(async move {
                dispatcher.route_response_out(response).await;
            });
        });
        on_message(received, responder);
    }

    async fn handle_response(&self, envelope: Envelope) {
        if envelope.destination == self.own_address() {
            if envelope.routing {
                match envelope.tag {
                    MessageTag::FindGroupResponse => self.handle_group_result(envelope).await,
                    MessageTag::Connect => self.handle_connect_response(envelope).await,
                    MessageTag::JoinResponse => self.handle_join_response(envelope).await,
                    other => trace!(?other, "routing response with unexpected tag"),
                }
            } else {
                self.inner
                    .timer
                    .on_response(envelope.message_id, envelope.payload);
            }
            return;
        }
        self.route_response_out(envelope).await;
    }

    /// Route a response toward its destination. A relay-marked response is
    /// first tried over the named relay connection — the common case where
    /// this node is the bootstrap peer holding it — before falling back to
    /// greedy forwarding.
    async fn route_response_out(&self, envelope: Envelope) {
        if envelope.destination == self.own_address() {
            // Self-addressed response, e.g. a host reply to a self-send.
            if !envelope.routing {
                self.inner
                    .timer
                    .on_response(envelope.message_id, envelope.payload);
            }
            return;
        }
        if let Some(relay_connection) = envelope.relay_connection {
            match serialize_envelope(&envelope) {
                Ok(bytes) => {
                    if self
                        .inner
                        .network
                        .transport()
                        .send(&relay_connection, bytes)
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    trace!("relay connection not held here, forwarding by address");
                }
                Err(e) => {
                    warn!(error = %e, "failed to serialise response");
                    return;
                }
            }
        }
        match self.inner.network.next_hop(&envelope.destination) {
            Some(next) => {
                if let Err(e) = self
                    .inner
                    .network
                    .send_to_direct(&envelope, &next.connection_id)
                    .await
                {
                    debug!(next = %next.address, error = %e, "response forward failed");
                }
            }
            None => trace!(
                destination = %envelope.destination,
                "unroutable response dropped"
            ),
        }
    }

    // ------------------------------------------------------------------
    // FindGroup
    // ------------------------------------------------------------------

    async fn handle_find_group(&self, envelope: Envelope) {
        let query: GroupQuery = match deserialize_bounded(&envelope.payload) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "malformed FindGroup query");
                return;
            }
        };

        // Relayed queries are answered by the relay itself; routable ones
        // travel until a node in range of the target picks them up.
        let in_range = self
            .inner
            .table
            .is_in_range(&query.target, self.inner.params.close_group_size);
        if !envelope.is_relayed() && !in_range {
            if self.inner.network.next_hop(&query.target).is_some() {
                self.forward(envelope).await;
                return;
            }
        }

        let count = (query.count as usize)
            .clamp(1, self.inner.params.max_routing_table_size);
        // The requester learns nothing from finding itself.
        let origin = envelope.source.or(envelope.relay);
        let candidates: Vec<CandidateRecord> = self
            .inner
            .table
            .closest_nodes(&query.target, count + 1)
            .into_iter()
            .filter(|p| Some(p.address) != origin)
            .take(count)
            .map(|p| CandidateRecord {
                address: p.address,
                public_key: p.public_key,
            })
            .collect();
        debug!(
            target = %query.target,
            returned = candidates.len(),
            "answering FindGroup"
        );
        let result = GroupResult {
            target: query.target,
            candidates,
        };
        let payload = match serialize_payload(&result) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise FindGroup result");
                return;
            }
        };
        let response = envelope.response(Some(self.own_address()), payload);
        self.route_response_out(response).await;
    }

    /// The admission loop: initiate an identity-validation handshake with
    /// every candidate not already known.
    async fn handle_group_result(&self, envelope: Envelope) {
        let result: GroupResult = match deserialize_bounded(&envelope.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed FindGroup result");
                return;
            }
        };
        trace!(candidates = result.candidates.len(), "FindGroup result");
        for candidate in result.candidates {
            let address = candidate.address;
            if address == self.own_address() || self.inner.table.contains(&address) {
                continue;
            }
            if !self.begin_connect(address) {
                continue;
            }
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.initiate_connect(&candidate).await {
                    debug!(candidate = %address, error = %e, "connect initiation failed");
                }
                tokio::time::sleep(CONNECT_PENDING_TIMEOUT).await;
                dispatcher.end_connect(&address);
            });
        }
    }

    fn begin_connect(&self, address: Address) -> bool {
        self.inner
            .pending_connects
            .lock()
            .expect("pending connects lock poisoned")
            .insert(address)
    }

    fn end_connect(&self, address: &Address) {
        self.inner
            .pending_connects
            .lock()
            .expect("pending connects lock poisoned")
            .remove(address);
    }

    // ------------------------------------------------------------------
    // Connect handshake
    // ------------------------------------------------------------------

    async fn initiate_connect(&self, candidate: &CandidateRecord) -> Result<()> {
        let own = self.own_address();
        let probe = self
            .inner
            .network
            .get_available_endpoint(&candidate.address, None)
            .await
            .context("endpoint negotiation failed")?;

        let info = self.own_connect_info(probe.ours, Some(&candidate.address));
        let mut envelope = Envelope::routing_request(
            MessageTag::Connect,
            None,
            candidate.address,
            self.inner.timer.next_message_id(),
            self.inner.params.hops_to_live,
            serialize_payload(&info)?,
        );

        if self.inner.table.is_empty() {
            envelope.relay = Some(own);
            envelope.relay_connection = self.inner.network.this_node_relay_connection_id();
            let bootstrap = self
                .inner
                .network
                .bootstrap_connection_id()
                .ok_or_else(|| anyhow!("no bootstrap relay for connect"))?;
            self.inner.network.send_to_direct(&envelope, &bootstrap).await
        } else {
            envelope.source = Some(own);
            self.inner.network.send_to_closest(&envelope).await
        }
    }

    pub(crate) fn own_connect_info(
        &self,
        endpoints: crate::messages::EndpointPair,
        audience: Option<&Address>,
    ) -> ConnectInfo {
        let own = self.own_address();
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let proof = self
            .inner
            .identity
            .keypair()
            .prove_ownership(&own, audience, &nonce);
        ConnectInfo {
            claimant: own,
            public_key: self.inner.identity.public_key(),
            endpoints,
            nonce,
            proof: proof.to_bytes().to_vec(),
        }
    }

    /// Identity validation: the ownership proof must verify, and the
    /// claimed key must either derive the claimed address or be confirmed
    /// by the host's key-lookup handler.
    fn validate_identity(&self, info: &ConnectInfo, audience: Option<&Address>) -> bool {
        let Ok(signature) = Signature::from_slice(&info.proof) else {
            return false;
        };
        if !verify_ownership(
            &info.public_key,
            &info.claimant,
            audience,
            &info.nonce,
            &signature,
        ) {
            return false;
        }
        match &self.inner.handlers.on_request_public_key {
            Some(lookup) => match lookup(&info.claimant) {
                Some(expected) => expected == info.public_key,
                None => false,
            },
            None => address_of_key(&info.public_key) == info.claimant,
        }
    }

    async fn handle_connect_request(&self, envelope: Envelope) {
        if envelope.destination != self.own_address() {
            self.forward(envelope).await;
            return;
        }
        let info: ConnectInfo = match deserialize_bounded(&envelope.payload) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "malformed connect payload");
                return;
            }
        };
        if envelope.client_origin {
            debug!(claimant = %info.claimant, "ignoring connect from client node");
            return;
        }
        let own = self.own_address();
        if !self.validate_identity(&info, Some(&own)) {
            warn!(claimant = %info.claimant, "connect with invalid identity proof");
            return;
        }

        let probe = match self
            .inner
            .network
            .get_available_endpoint(&info.claimant, Some(&info.endpoints))
            .await
        {
            Ok(p) => p,
            Err(e) => {
                debug!(claimant = %info.claimant, error = %e, "endpoint negotiation failed");
                return;
            }
        };
        match self
            .inner
            .network
            .add(&info.claimant, &info.endpoints, info.nonce.to_vec())
            .await
        {
            Ok(connection) => {
                self.admit_validated(Peer::new(info.claimant, info.public_key, connection))
                    .await;
            }
            Err(e) => {
                debug!(claimant = %info.claimant, error = %e, "transport attach failed");
                return;
            }
        }

        let reply = self.own_connect_info(probe.ours, Some(&info.claimant));
        let payload = match serialize_payload(&reply) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise connect reply");
                return;
            }
        };
        let response = envelope.response(Some(own), payload);
        self.route_response_out(response).await;
    }

    async fn handle_connect_response(&self, envelope: Envelope) {
        let info: ConnectInfo = match deserialize_bounded(&envelope.payload) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "malformed connect response");
                return;
            }
        };
        self.end_connect(&info.claimant);
        if self.inner.table.contains(&info.claimant) {
            return;
        }
        let own = self.own_address();
        if !self.validate_identity(&info, Some(&own)) {
            warn!(claimant = %info.claimant, "connect response with invalid identity proof");
            return;
        }
        if self
            .inner
            .network
            .get_available_endpoint(&info.claimant, Some(&info.endpoints))
            .await
            .is_err()
        {
            return;
        }
        match self
            .inner
            .network
            .add(&info.claimant, &info.endpoints, info.nonce.to_vec())
            .await
        {
            Ok(connection) => {
                self.admit_validated(Peer::new(info.claimant, info.public_key, connection))
                    .await;
            }
            Err(e) => debug!(claimant = %info.claimant, error = %e, "transport attach failed"),
        }
    }

    /// Admit a validated peer, releasing the transport connection if the
    /// table turns it away.
    async fn admit_validated(&self, peer: Peer) {
        let address = peer.address;
        let connection = peer.connection_id;
        match self.inner.table.add(peer) {
            AddOutcome::Added => {
                info!(peer = %address, size = self.inner.table.len(), "peer admitted");
            }
            AddOutcome::Replaced(evicted) => {
                // The eviction observer releases the evicted connection.
                info!(peer = %address, evicted = %evicted.address, "peer replaced close-group entry");
            }
            AddOutcome::Rejected => {
                trace!(peer = %address, "admission rejected");
                if !self.inner.table.contains(&address)
                    && self.inner.network.bootstrap_connection_id() != Some(connection)
                {
                    self.inner.network.remove(&connection).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Join hello
    // ------------------------------------------------------------------

    /// A hello from a freshly attached node, received over our own side of
    /// its bootstrap connection.
    async fn handle_join(&self, envelope: Envelope) {
        let info: ConnectInfo = match deserialize_bounded(&envelope.payload) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "malformed join payload");
                return;
            }
        };
        if !self.validate_identity(&info, None) {
            warn!(claimant = %info.claimant, "join with invalid identity proof");
            return;
        }

        if !envelope.client_origin {
            match self
                .inner
                .network
                .add(&info.claimant, &info.endpoints, info.nonce.to_vec())
                .await
            {
                Ok(connection) => {
                    self.admit_validated(Peer::new(info.claimant, info.public_key, connection))
                        .await;
                }
                Err(e) => debug!(claimant = %info.claimant, error = %e, "join attach failed"),
            }
        }

        let probe = match self
            .inner
            .network
            .get_available_endpoint(&info.claimant, Some(&info.endpoints))
            .await
        {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "endpoint negotiation failed for join reply");
                return;
            }
        };
        let reply = self.own_connect_info(probe.ours, None);
        let payload = match serialize_payload(&reply) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise join reply");
                return;
            }
        };
        let response = envelope.response(Some(self.own_address()), payload);
        self.route_response_out(response).await;
    }

    async fn handle_join_response(&self, envelope: Envelope) {
        let info: ConnectInfo = match deserialize_bounded(&envelope.payload) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "malformed join response");
                return;
            }
        };
        if self.inner.table.contains(&info.claimant) {
            return;
        }
        if !self.validate_identity(&info, None) {
            warn!(claimant = %info.claimant, "join response with invalid identity proof");
            return;
        }
        match self
            .inner
            .network
            .add(&info.claimant, &info.endpoints, b"join".to_vec())
            .await
        {
            Ok(connection) => {
                self.admit_validated(Peer::new(info.claimant, info.public_key, connection))
                    .await;
            }
            Err(e) => debug!(claimant = %info.claimant, error = %e, "join attach failed"),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("own", &self.own_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::EndpointPair;
    use crate::network::{BootstrapHandle, EndpointProbe, NatKind, TransportEvents};
    use crate::table::TableConfig;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    fn addr(byte: u8) -> Address {
        let mut bytes = [0u8; crate::address::ADDRESS_BYTES];
        bytes[0] = byte;
        Address::from_bytes(bytes)
    }

    /// Transport stub that records sends and can be told to fail.
    #[derive(Default)]
    struct StubTransport {
        sent: StdMutex<Vec<(Address, Vec<u8>)>>,
        fail_sends: StdMutex<bool>,
    }

    impl StubTransport {
        fn sent_envelopes(&self) -> Vec<(Address, Envelope)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(conn, bytes)| (*conn, deserialize_envelope(bytes).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for Arc<StubTransport> {
        async fn bootstrap(
            &self,
            _endpoints: &[SocketAddr],
            _events: TransportEvents,
            _local: Option<SocketAddr>,
        ) -> Result<BootstrapHandle> {
            Ok(BootstrapHandle {
                connection_id: addr(0xB0),
                relay_connection_id: addr(0xB1),
                endpoint: "127.0.0.1:1".parse().unwrap(),
            })
        }

        async fn get_available_endpoint(
            &self,
            _peer: &Address,
            _peer_endpoints: Option<&EndpointPair>,
        ) -> Result<EndpointProbe> {
            Ok(EndpointProbe {
                ours: EndpointPair::symmetric("127.0.0.1:1".parse().unwrap()),
                nat: NatKind::Direct,
                already_connected: false,
            })
        }

        async fn add(
            &self,
            peer: &Address,
            _peer_endpoints: &EndpointPair,
            _validation_token: Vec<u8>,
        ) -> Result<Address> {
            Ok(*peer)
        }

        async fn remove(&self, _connection_id: &Address) {}

        async fn send(&self, connection_id: &Address, bytes: Vec<u8>) -> Result<()> {
            if *self.fail_sends.lock().unwrap() {
                return Err(anyhow!("injected send failure"));
            }
            self.sent.lock().unwrap().push((*connection_id, bytes));
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher<Arc<StubTransport>>,
        table: Arc<RoutingTable>,
        transport: Arc<StubTransport>,
        network: Network<Arc<StubTransport>>,
        status: Arc<StdMutex<Vec<NetworkStatus>>>,
        delivered: Arc<StdMutex<Vec<ReceivedMessage>>>,
    }

    fn fixture_with(own: Address, identity: NodeIdentity, client_mode: bool) -> Fixture {
        let params = Parameters::default();
        let table = Arc::new(RoutingTable::new(
            own,
            TableConfig {
                max_size: params.max_routing_table_size,
                close_group_size: 4,
                bucket_limit: 1,
            },
        ));
        let transport = Arc::new(StubTransport::default());
        let network = Network::new(transport.clone(), table.clone());

        let status = Arc::new(StdMutex::new(Vec::new()));
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let status_sink = status.clone();
        let delivered_sink = delivered.clone();
        let handlers = Arc::new(
            EventHandlers::new()
                .on_network_status(move |s| status_sink.lock().unwrap().push(s))
                .on_message(move |msg, _responder| {
                    delivered_sink.lock().unwrap().push(msg);
                }),
        );

        let mut params = params;
        params.close_group_size = 4;
        let dispatcher = Dispatcher::new(
            Arc::new(identity),
            client_mode,
            params,
            table.clone(),
            ResponseTimer::new(),
            network.clone(),
            handlers,
            Arc::new(RandomNodeHelper::new()),
            Arc::new(AtomicBool::new(true)),
        );
        Fixture {
            dispatcher,
            table,
            transport,
            network,
            status,
            delivered,
        }
    }

    fn fixture(own: Address) -> Fixture {
        let identity = NodeIdentity::with_address(own, Keypair::generate());
        fixture_with(own, identity, false)
    }

    fn add_peer(table: &RoutingTable, byte: u8) -> Peer {
        let peer = Peer::new(addr(byte), Keypair::generate().public_key(), addr(byte));
        assert!(table.add(peer.clone()).is_admitted());
        peer
    }

    async fn bootstrap(fixture: &Fixture) {
        let (msg_tx, _a) = mpsc::unbounded_channel();
        let (lost_tx, _b) = mpsc::unbounded_channel();
        fixture
            .network
            .bootstrap(
                &["127.0.0.1:1".parse().unwrap()],
                TransportEvents {
                    messages: msg_tx,
                    connection_lost: lost_tx,
                },
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_destination_yields_empty_callback_and_no_wire_traffic() {
        let fx = fixture(addr(0x01));
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.dispatcher
            .send(
                Address::ZERO,
                None,
                b"hello".to_vec(),
                Some(Box::new(move |r| {
                    let _ = tx.send(r);
                })),
                Duration::from_secs(1),
                true,
                false,
            )
            .await;
        assert!(rx.recv().await.unwrap().is_empty());
        assert!(fx.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_and_empty_payloads_rejected() {
        let fx = fixture(addr(0x01));
        for payload in [Vec::new(), vec![0u8; crate::messages::MAX_DATA_SIZE + 1]] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            fx.dispatcher
                .send(
                    addr(0x50),
                    None,
                    payload,
                    Some(Box::new(move |r| {
                        let _ = tx.send(r);
                    })),
                    Duration::from_secs(1),
                    true,
                    false,
                )
                .await;
            assert!(rx.recv().await.unwrap().is_empty());
        }
        assert!(fx.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_join_send_goes_via_relay_with_relay_fields() {
        let fx = fixture(addr(0x01));
        bootstrap(&fx).await;

        fx.dispatcher
            .send(
                addr(0x50),
                None,
                b"hello".to_vec(),
                None,
                Duration::from_secs(1),
                true,
                false,
            )
            .await;

        let sent = fx.transport.sent_envelopes();
        assert_eq!(sent.len(), 1);
        let (conn, env) = &sent[0];
        assert_eq!(*conn, addr(0xB0));
        assert_eq!(env.source, None);
        assert_eq!(env.relay, Some(addr(0x01)));
        assert_eq!(env.relay_connection, Some(addr(0xB1)));
        assert_eq!(env.replication, 1);
    }

    #[tokio::test]
    async fn anonymous_send_failure_surfaces_session_end() {
        let own = addr(0x01);
        let fx = fixture_with(own, NodeIdentity::ephemeral(), false);
        bootstrap(&fx).await;
        *fx.transport.fail_sends.lock().unwrap() = true;

        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.dispatcher
            .send(
                addr(0x50),
                None,
                b"hello".to_vec(),
                Some(Box::new(move |r| {
                    let _ = tx.send(r);
                })),
                Duration::from_secs(1),
                true,
                false,
            )
            .await;

        // The pending task is cancelled with an empty result...
        assert!(rx.recv().await.unwrap().is_empty());
        // ...and the session-terminal status is surfaced.
        assert_eq!(
            *fx.status.lock().unwrap(),
            vec![NetworkStatus::AnonymousSessionEnded]
        );
    }

    #[tokio::test]
    async fn partial_join_send_failure_surfaces_partial_session_end() {
        let fx = fixture(addr(0x01));
        // No bootstrap connection at all.
        fx.dispatcher
            .send(
                addr(0x50),
                None,
                b"hello".to_vec(),
                None,
                Duration::from_secs(1),
                true,
                false,
            )
            .await;
        assert_eq!(
            *fx.status.lock().unwrap(),
            vec![NetworkStatus::PartialJoinSessionEnded]
        );
    }

    #[tokio::test]
    async fn joined_send_routes_to_nearest_entry() {
        let fx = fixture(addr(0x01));
        add_peer(&fx.table, 0x10);
        let near = add_peer(&fx.table, 0x4F);

        fx.dispatcher
            .send(
                addr(0x4E),
                None,
                b"hello".to_vec(),
                None,
                Duration::from_secs(1),
                true,
                false,
            )
            .await;

        let sent = fx.transport.sent_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, near.connection_id);
        assert_eq!(sent[0].1.source, Some(addr(0x01)));
    }

    #[tokio::test]
    async fn group_send_fans_out_when_in_range() {
        let own = addr(0x01);
        let fx = fixture(own);
        // Close group of 4 around the destination; we are in range.
        for byte in [0x11u8, 0x12, 0x13] {
            add_peer(&fx.table, byte);
        }

        fx.dispatcher
            .send(
                addr(0x10),
                None,
                b"group".to_vec(),
                None,
                Duration::from_secs(1),
                false,
                false,
            )
            .await;

        let sent = fx.transport.sent_envelopes();
        assert_eq!(sent.len(), 3, "one copy per other group member");
        for (_, env) in &sent {
            assert_eq!(env.replication, 1);
            assert!(!env.direct);
        }
        // And one local delivery.
        assert_eq!(fx.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_replica_is_delivered_not_reforwarded() {
        let own = addr(0x11);
        let fx = fixture(own);
        add_peer(&fx.table, 0x12);
        add_peer(&fx.table, 0x13);

        let mut replica = Envelope {
            tag: MessageTag::Post,
            kind: Kind::Request,
            source: Some(addr(0x01)),
            destination: addr(0x10),
            message_id: 7,
            routing: false,
            direct: false,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: 50,
            relay: None,
            relay_connection: None,
            group_claim: None,
            payload: b"copy".to_vec(),
        };
        replica.replication = 1;
        fx.dispatcher.handle_envelope(replica).await;

        assert_eq!(fx.delivered.lock().unwrap().len(), 1);
        assert!(fx.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hop_budget_exhaustion_drops() {
        let fx = fixture(addr(0x01));
        let mut env = Envelope::routing_request(
            MessageTag::FindGroup,
            Some(addr(0x02)),
            addr(0x01),
            9,
            50,
            Vec::new(),
        );
        env.routing = false;
        env.hops_to_live = 0;
        fx.dispatcher.handle_envelope(env).await;
        assert!(fx.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_requests_are_suppressed() {
        let fx = fixture(addr(0x01));
        let env = Envelope {
            tag: MessageTag::Post,
            kind: Kind::Request,
            source: Some(addr(0x02)),
            destination: addr(0x01),
            message_id: 5,
            routing: false,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: 50,
            relay: None,
            relay_connection: None,
            group_claim: None,
            payload: b"once".to_vec(),
        };
        fx.dispatcher.handle_envelope(env.clone()).await;
        fx.dispatcher.handle_envelope(env).await;
        assert_eq!(fx.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_wire_bytes_dropped_silently() {
        let fx = fixture(addr(0x01));
        fx.dispatcher.handle_wire(vec![0xFF, 0xFE, 0xFD]).await;
        assert!(fx.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_group_is_answered_with_closest_candidates() {
        let own = addr(0x01);
        let fx = fixture(own);
        for byte in [0x10u8, 0x20, 0x30] {
            add_peer(&fx.table, byte);
        }

        let query = GroupQuery {
            target: addr(0x10),
            count: 2,
        };
        let mut request = Envelope::routing_request(
            MessageTag::FindGroup,
            Some(addr(0x20)),
            own,
            11,
            50,
            serialize_payload(&query).unwrap(),
        );
        request.destination = addr(0x10);
        fx.dispatcher.handle_envelope(request).await;

        let sent = fx.transport.sent_envelopes();
        assert_eq!(sent.len(), 1);
        let (_, response) = &sent[0];
        assert_eq!(response.tag, MessageTag::FindGroupResponse);
        assert_eq!(response.kind, Kind::Response);
        assert_eq!(response.destination, addr(0x20));
        let result: GroupResult = deserialize_bounded(&response.payload).unwrap();
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(result.candidates[0].address, addr(0x10));
    }

    #[tokio::test]
    async fn relayed_find_group_answered_by_relay_over_named_connection() {
        let own = addr(0x01);
        let fx = fixture(own);
        add_peer(&fx.table, 0x10);

        let joiner = addr(0x77);
        let query = GroupQuery {
            target: joiner,
            count: 1,
        };
        let mut request = Envelope::routing_request(
            MessageTag::FindGroup,
            None,
            joiner,
            12,
            50,
            serialize_payload(&query).unwrap(),
        );
        request.relay = Some(joiner);
        request.relay_connection = Some(addr(0xCC));
        fx.dispatcher.handle_envelope(request).await;

        let sent = fx.transport.sent_envelopes();
        assert_eq!(sent.len(), 1);
        // Response went straight over the relay connection.
        assert_eq!(sent[0].0, addr(0xCC));
        assert_eq!(sent[0].1.destination, joiner);
    }

    #[tokio::test]
    async fn connect_request_with_valid_proof_admits_peer() {
        let own = addr(0x01);
        let fx = fixture(own);
        add_peer(&fx.table, 0x60);

        let candidate_keys = Keypair::generate();
        let claimant = candidate_keys.derived_address();
        let nonce = [9u8; 16];
        let info = ConnectInfo {
            claimant,
            public_key: candidate_keys.public_key(),
            endpoints: EndpointPair::symmetric("127.0.0.1:2".parse().unwrap()),
            nonce,
            proof: candidate_keys
                .prove_ownership(&claimant, Some(&own), &nonce)
                .to_bytes()
                .to_vec(),
        };
        let request = Envelope::routing_request(
            MessageTag::Connect,
            Some(claimant),
            own,
            13,
            50,
            serialize_payload(&info).unwrap(),
        );
        fx.dispatcher.handle_envelope(request).await;

        assert!(fx.table.contains(&claimant));
        // A connect response with our own info went back.
        let sent = fx.transport.sent_envelopes();
        assert!(sent
            .iter()
            .any(|(_, e)| e.tag == MessageTag::Connect && e.kind == Kind::Response));
    }

    #[tokio::test]
    async fn connect_request_with_bad_proof_is_ignored() {
        let own = addr(0x01);
        let fx = fixture(own);

        let candidate_keys = Keypair::generate();
        let claimant = candidate_keys.derived_address();
        let info = ConnectInfo {
            claimant,
            public_key: candidate_keys.public_key(),
            endpoints: EndpointPair::symmetric("127.0.0.1:2".parse().unwrap()),
            nonce: [9u8; 16],
            proof: vec![0u8; 64],
        };
        let request = Envelope::routing_request(
            MessageTag::Connect,
            Some(claimant),
            own,
            14,
            50,
            serialize_payload(&info).unwrap(),
        );
        fx.dispatcher.handle_envelope(request).await;

        assert!(!fx.table.contains(&claimant));
        assert!(fx.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_with_mismatched_address_rejected_without_host_lookup() {
        let own = addr(0x01);
        let fx = fixture(own);

        let candidate_keys = Keypair::generate();
        let claimant = addr(0x99); // not derived from the key
        let nonce = [9u8; 16];
        let info = ConnectInfo {
            claimant,
            public_key: candidate_keys.public_key(),
            endpoints: EndpointPair::symmetric("127.0.0.1:2".parse().unwrap()),
            nonce,
            proof: candidate_keys
                .prove_ownership(&claimant, Some(&own), &nonce)
                .to_bytes()
                .to_vec(),
        };
        let request = Envelope::routing_request(
            MessageTag::Connect,
            Some(claimant),
            own,
            15,
            50,
            serialize_payload(&info).unwrap(),
        );
        fx.dispatcher.handle_envelope(request).await;
        assert!(!fx.table.contains(&claimant));
    }

    #[tokio::test]
    async fn response_correlates_with_pending_task() {
        let own = addr(0x01);
        let fx = fixture(own);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = fx.dispatcher.timer().add_task(
            Duration::from_secs(5),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
            1,
        );

        let response = Envelope {
            tag: MessageTag::Post,
            kind: Kind::Response,
            source: Some(addr(0x30)),
            destination: own,
            message_id: id,
            routing: false,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: 50,
            relay: None,
            relay_connection: None,
            group_claim: None,
            payload: b"answer".to_vec(),
        };
        fx.dispatcher.handle_envelope(response).await;

        let responses = rx.recv().await.unwrap();
        assert_eq!(responses, vec![b"answer".to_vec()]);
        assert_eq!(fx.dispatcher.timer().pending_count(), 0);
    }

    #[tokio::test]
    async fn in_transit_relay_response_routed_over_named_connection() {
        let own = addr(0x01);
        let fx = fixture(own);

        let response = Envelope {
            tag: MessageTag::Post,
            kind: Kind::Response,
            source: Some(addr(0x30)),
            destination: addr(0x77), // not us
            message_id: 21,
            routing: false,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: 50,
            relay: Some(addr(0x77)),
            relay_connection: Some(addr(0xCC)),
            group_claim: None,
            payload: b"answer".to_vec(),
        };
        fx.dispatcher.handle_envelope(response).await;

        let sent = fx.transport.sent_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(0xCC));
    }

    #[tokio::test]
    async fn host_responder_reaches_the_requester() {
        let own = addr(0x01);
        // A fixture whose message handler echoes the payload back.
        let params = Parameters::default();
        let table = Arc::new(RoutingTable::new(own, TableConfig::default()));
        let transport = Arc::new(StubTransport::default());
        let network = Network::new(transport.clone(), table.clone());
        let handlers = Arc::new(EventHandlers::new().on_message(|msg, responder| {
            let mut echoed = msg.payload.clone();
            echoed.extend_from_slice(b"-ack");
            responder.respond(echoed);
        }));
        let identity = NodeIdentity::with_address(own, Keypair::generate());
        let dispatcher = Dispatcher::new(
            Arc::new(identity),
            false,
            params,
            table.clone(),
            ResponseTimer::new(),
            network,
            handlers,
            Arc::new(RandomNodeHelper::new()),
            Arc::new(AtomicBool::new(true)),
        );
        let requester = add_peer(&table, 0x40);

        let request = Envelope {
            tag: MessageTag::GetData,
            kind: Kind::Request,
            source: Some(requester.address),
            destination: own,
            message_id: 33,
            routing: false,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: 50,
            relay: None,
            relay_connection: None,
            group_claim: None,
            payload: b"ping".to_vec(),
        };
        dispatcher.handle_envelope(request).await;
        // The responder spawns; give it a turn.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = transport.sent_envelopes();
        assert_eq!(sent.len(), 1);
        let (conn, env) = &sent[0];
        assert_eq!(*conn, requester.connection_id);
        assert_eq!(env.tag, MessageTag::GetDataResponse);
        assert_eq!(env.kind, Kind::Response);
        assert_eq!(env.destination, requester.address);
        assert_eq!(env.message_id, 33);
        assert_eq!(env.payload, b"ping-ack".to_vec());
    }
}
