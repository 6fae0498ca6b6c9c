//! Shared test harness: an in-memory wire connecting every node in a
//! test, plus node fixtures with fast timers.
//!
//! The wire models the reliable-UDP transport contract: registered
//! listeners, per-connection handles (address-shaped, distinct from node
//! addresses for bootstrap attachments) and connection-lost signalling.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use tokio::time::Duration;

use vicinity::{
    Address, BootstrapHandle, EndpointPair, EndpointProbe, EventHandlers, Keypair, NatKind,
    NetworkStatus, Node, NodeBuilder, NodeIdentity, Parameters, Peer, ReceivedMessage, Transport,
    TransportEvents,
};

#[derive(Default)]
struct WireState {
    listeners: HashMap<SocketAddr, Address>,
    endpoints: HashMap<Address, SocketAddr>,
    events: HashMap<Address, TransportEvents>,
    /// (owner label, connection handle) -> target label.
    routes: HashMap<(Address, Address), Address>,
}

/// The shared in-memory network all test transports attach to.
#[derive(Default)]
pub struct Wire {
    state: Mutex<WireState>,
}

/// Opt-in log output for debugging test runs: `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl Wire {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, label: Address, endpoint: SocketAddr) -> MemoryTransport {
        let mut state = self.state.lock().unwrap();
        state.listeners.insert(endpoint, label);
        state.endpoints.insert(label, endpoint);
        MemoryTransport {
            label,
            endpoint,
            wire: self.clone(),
        }
    }

    /// Cut every connection between `a` and `b`, signalling loss to both
    /// sides.
    pub fn disconnect(&self, a: Address, b: Address) {
        let (a_handles, b_handles, a_events, b_events) = {
            let mut state = self.state.lock().unwrap();
            let a_handles: Vec<Address> = state
                .routes
                .iter()
                .filter(|((owner, _), target)| *owner == a && **target == b)
                .map(|((_, handle), _)| *handle)
                .collect();
            let b_handles: Vec<Address> = state
                .routes
                .iter()
                .filter(|((owner, _), target)| *owner == b && **target == a)
                .map(|((_, handle), _)| *handle)
                .collect();
            for handle in &a_handles {
                state.routes.remove(&(a, *handle));
            }
            for handle in &b_handles {
                state.routes.remove(&(b, *handle));
            }
            (
                a_handles,
                b_handles,
                state.events.get(&a).cloned(),
                state.events.get(&b).cloned(),
            )
        };
        if let Some(events) = a_events {
            for handle in a_handles {
                let _ = events.connection_lost.send(handle);
            }
        }
        if let Some(events) = b_events {
            for handle in b_handles {
                let _ = events.connection_lost.send(handle);
            }
        }
    }
}

/// One node's attachment to the wire.
pub struct MemoryTransport {
    label: Address,
    endpoint: SocketAddr,
    wire: Arc<Wire>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        events: TransportEvents,
        _local: Option<SocketAddr>,
    ) -> Result<BootstrapHandle> {
        let mut state = self.wire.state.lock().unwrap();
        let target = endpoints
            .iter()
            .find_map(|ep| state.listeners.get(ep).copied())
            .filter(|t| *t != self.label)
            .ok_or_else(|| anyhow!("no bootstrap endpoint reachable"))?;
        state.events.insert(self.label, events);

        let ours_on_peer = Address::random();
        state.routes.insert((self.label, target), target);
        state.routes.insert((target, ours_on_peer), self.label);
        let endpoint = state.endpoints[&target];
        Ok(BootstrapHandle {
            connection_id: target,
            relay_connection_id: ours_on_peer,
            endpoint,
        })
    }

    async fn get_available_endpoint(
        &self,
        peer: &Address,
        _peer_endpoints: Option<&EndpointPair>,
    ) -> Result<EndpointProbe> {
        let state = self.wire.state.lock().unwrap();
        Ok(EndpointProbe {
            ours: EndpointPair::symmetric(self.endpoint),
            nat: NatKind::Direct,
            already_connected: state.routes.contains_key(&(self.label, *peer)),
        })
    }

    async fn add(
        &self,
        peer: &Address,
        _peer_endpoints: &EndpointPair,
        _validation_token: Vec<u8>,
    ) -> Result<Address> {
        let mut state = self.wire.state.lock().unwrap();
        if !state.endpoints.contains_key(peer) {
            return Err(anyhow!("unknown peer"));
        }
        state.routes.insert((self.label, *peer), *peer);
        Ok(*peer)
    }

    async fn remove(&self, connection_id: &Address) {
        let (reverse, events) = {
            let mut state = self.wire.state.lock().unwrap();
            let Some(target) = state.routes.remove(&(self.label, *connection_id)) else {
                return;
            };
            let reverse: Vec<Address> = state
                .routes
                .iter()
                .filter(|((owner, _), t)| *owner == target && **t == self.label)
                .map(|((_, handle), _)| *handle)
                .collect();
            for handle in &reverse {
                state.routes.remove(&(target, *handle));
            }
            (reverse, state.events.get(&target).cloned())
        };
        if let Some(events) = events {
            for handle in reverse {
                let _ = events.connection_lost.send(handle);
            }
        }
    }

    async fn send(&self, connection_id: &Address, bytes: Vec<u8>) -> Result<()> {
        let events = {
            let state = self.wire.state.lock().unwrap();
            let target = state
                .routes
                .get(&(self.label, *connection_id))
                .copied()
                .ok_or_else(|| anyhow!("no such connection"))?;
            state
                .events
                .get(&target)
                .cloned()
                .ok_or_else(|| anyhow!("peer not listening"))?
        };
        events
            .messages
            .send(bytes)
            .map_err(|_| anyhow!("peer gone"))
    }
}

/// Timers shrunk for tests; structural parameters as noted per test.
pub fn fast_params(close_group_size: usize) -> Parameters {
    Parameters {
        close_group_size,
        find_close_node_interval: Duration::from_millis(100),
        find_node_interval: Duration::from_millis(200),
        recovery_time_lag: Duration::from_millis(100),
        re_bootstrap_time_lag: Duration::from_millis(300),
        ..Parameters::default()
    }
}

pub struct TestNode {
    pub node: Node<MemoryTransport>,
    /// The transport label on the wire (equals `address` for full nodes).
    pub label: Address,
    pub address: Address,
    pub public_key: VerifyingKey,
    pub endpoint: SocketAddr,
    pub deliveries: Arc<Mutex<Vec<ReceivedMessage>>>,
    pub statuses: Arc<Mutex<Vec<NetworkStatus>>>,
}

impl TestNode {
    pub fn peer_record(&self) -> Peer {
        Peer::new(self.address, self.public_key, self.address)
    }

    pub fn delivered_payloads(&self) -> Vec<Vec<u8>> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn saw_status(&self, wanted: NetworkStatus) -> bool {
        self.statuses.lock().unwrap().contains(&wanted)
    }
}

/// Build a full node whose message handler records deliveries and
/// acknowledges every request.
pub fn build_node(wire: &Arc<Wire>, index: u8, params: Parameters) -> TestNode {
    let keypair = Keypair::generate();
    let public_key = keypair.public_key();
    let identity = NodeIdentity::from_keypair(keypair);
    let address = identity.address();
    let endpoint: SocketAddr = format!("10.0.0.{index}:9000").parse().unwrap();
    let transport = wire.register(address, endpoint);

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let delivered = deliveries.clone();
    let status_sink = statuses.clone();
    let handlers = EventHandlers::new()
        .on_message(move |msg, responder| {
            delivered.lock().unwrap().push(msg);
            responder.respond(b"ack".to_vec());
        })
        .on_network_status(move |status| {
            status_sink.lock().unwrap().push(status);
        });

    let node = NodeBuilder::new()
        .identity(identity)
        .parameters(params)
        .handlers(handlers)
        .build(transport)
        .expect("node builds");
    TestNode {
        node,
        label: address,
        address,
        public_key,
        endpoint,
        deliveries,
        statuses,
    }
}

/// Build an anonymous node; its address is only known after build.
pub fn build_anonymous(wire: &Arc<Wire>, index: u8, params: Parameters) -> TestNode {
    let endpoint: SocketAddr = format!("10.0.0.{index}:9000").parse().unwrap();
    let label = Address::random();
    let transport = wire.register(label, endpoint);

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let status_sink = statuses.clone();
    let handlers = EventHandlers::new().on_network_status(move |status| {
        status_sink.lock().unwrap().push(status);
    });

    let node = NodeBuilder::new()
        .anonymous(true)
        .parameters(params)
        .handlers(handlers)
        .build(transport)
        .expect("anonymous node builds");
    let address = node.address();
    let public_key = Keypair::generate().public_key(); // unused placeholder
    TestNode {
        node,
        label,
        address,
        public_key,
        endpoint,
        deliveries,
        statuses,
    }
}

/// Two-node overlay genesis via mutual zero-state joins.
pub async fn genesis_pair(wire: &Arc<Wire>, params: Parameters) -> (TestNode, TestNode) {
    let a = build_node(wire, 1, params);
    let b = build_node(wire, 2, params);
    let (ra, rb) = tokio::join!(
        a.node
            .zero_state_join(a.endpoint, b.endpoint, b.peer_record()),
        b.node
            .zero_state_join(b.endpoint, a.endpoint, a.peer_record()),
    );
    ra.expect("genesis join a");
    rb.expect("genesis join b");
    (a, b)
}

/// Poll until `predicate` holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
