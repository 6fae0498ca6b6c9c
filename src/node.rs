//! # High-Level Node API
//!
//! A [`Node`] ties the routing table, dispatcher, pending-response timer
//! and network facade together and drives the join/recovery state
//! machine:
//!
//! ```text
//! Unstarted ──join──► Bootstrapping ──attach──► (anonymous? Relaying
//!                                               : FindingClose)
//! FindingClose ──table non-empty──► Steady
//! FindingClose ──too many failures──► ReBootstrapWait ──► Bootstrapping
//! Steady ──close peer lost / table below threshold──► ToppingUp ──► Steady
//! Steady ──table empty──► ReBootstrapWait
//! Relaying ──bootstrap lost──► AnonymousEnded
//! any ──shutdown──► Stopped
//! ```
//!
//! ## Actor architecture
//!
//! The public [`Node`] handle is cheap to clone and posts events into a
//! private actor owning the state machine. Transport callbacks, timer
//! expiries and API commands all arrive over the same channel, so state
//! transitions are totally ordered. Timers are spawned sleeps that post
//! tick events stamped with a generation counter; bumping the counter
//! cancels every tick already in flight.
//!
//! ## Host callbacks
//!
//! Hosts observe the overlay through the optional [`EventHandlers`]:
//! message delivery, public-key resolution for explicitly-addressed
//! identities, network status, close-group changes and newly learned
//! bootstrap endpoints. Absent handlers disable the notification.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use ed25519_dalek::VerifyingKey;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::dispatcher::Dispatcher;
use crate::identity::{NodeIdentity, Peer};
use crate::messages::{
    serialize_payload, EndpointPair, Envelope, GroupQuery, MessageTag, MAX_DATA_SIZE,
};
use crate::network::{BootstrapHandle, Network, Transport, TransportEvents};
use crate::table::{RoutingTable, TableConfig};
use crate::timer::{ResponseCallback, ResponseTimer};

/// Bound on the random-node pool fed from inbound traffic.
const MAX_TRACKED_RANDOM_NODES: usize = 100;

/// Tunable parameters. All of them are constructor inputs; there is no
/// global state.
#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    pub max_routing_table_size: usize,
    pub close_group_size: usize,
    pub bucket_limit: usize,
    /// Below this size the periodic recovery pass requests more nodes.
    pub routing_table_size_threshold: usize,
    pub find_close_node_interval: Duration,
    pub find_node_interval: Duration,
    pub recovery_time_lag: Duration,
    pub re_bootstrap_time_lag: Duration,
    pub max_find_close_node_failures: u32,
    pub hops_to_live: u16,
    pub max_data_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        let max_routing_table_size = 64;
        Self {
            max_routing_table_size,
            close_group_size: 8,
            bucket_limit: 1,
            routing_table_size_threshold: max_routing_table_size * 3 / 4,
            find_close_node_interval: Duration::from_secs(5),
            find_node_interval: Duration::from_secs(60),
            recovery_time_lag: Duration::from_secs(1),
            re_bootstrap_time_lag: Duration::from_secs(10),
            max_find_close_node_failures: 3,
            hops_to_live: 50,
            max_data_size: MAX_DATA_SIZE,
        }
    }
}

impl Parameters {
    pub(crate) fn table_config(&self) -> TableConfig {
        TableConfig {
            max_size: self.max_routing_table_size,
            close_group_size: self.close_group_size,
            bucket_limit: self.bucket_limit,
        }
    }
}

/// Status reported to the host through `on_network_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Success,
    NetworkShuttingDown,
    NotJoined,
    AnonymousSessionEnded,
    PartialJoinSessionEnded,
    /// Current routing-table size after a change.
    TableSize(usize),
}

impl NetworkStatus {
    /// Numeric form: zero for success, negative for errors, positive for
    /// the routing-table size.
    pub fn code(&self) -> i32 {
        match self {
            NetworkStatus::Success => 0,
            NetworkStatus::NetworkShuttingDown => -1,
            NetworkStatus::NotJoined => -2,
            NetworkStatus::AnonymousSessionEnded => -3,
            NetworkStatus::PartialJoinSessionEnded => -4,
            NetworkStatus::TableSize(n) => *n as i32,
        }
    }
}

/// An application message handed to the host.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub source: Option<Address>,
    pub destination: Address,
    pub group_claim: Option<Address>,
    pub tag: MessageTag,
    pub client_origin: bool,
    pub payload: Vec<u8>,
}

/// One-shot reply handle for a delivered request. Dropping it without
/// responding is allowed; the requester's pending task then times out.
pub struct Responder {
    reply: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
}

impl Responder {
    pub(crate) fn new(f: impl FnOnce(Vec<u8>) + Send + 'static) -> Self {
        Self {
            reply: Some(Box::new(f)),
        }
    }

    pub fn respond(mut self, payload: Vec<u8>) {
        if let Some(reply) = self.reply.take() {
            reply(payload);
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("pending", &self.reply.is_some())
            .finish()
    }
}

type MessageHandler = Box<dyn Fn(ReceivedMessage, Responder) + Send + Sync>;
type KeyLookupHandler = Box<dyn Fn(&Address) -> Option<VerifyingKey> + Send + Sync>;
type StatusHandler = Box<dyn Fn(NetworkStatus) + Send + Sync>;
type CloseGroupHandler = Box<dyn Fn(&[Peer]) + Send + Sync>;
type EndpointHandler = Box<dyn Fn(SocketAddr) + Send + Sync>;

/// Host-supplied callbacks. Every handler is optional; absence disables
/// the notification.
#[derive(Default)]
pub struct EventHandlers {
    pub(crate) on_message: Option<MessageHandler>,
    pub(crate) on_request_public_key: Option<KeyLookupHandler>,
    pub(crate) on_network_status: Option<StatusHandler>,
    pub(crate) on_close_group_changed: Option<CloseGroupHandler>,
    pub(crate) on_new_bootstrap_endpoint: Option<EndpointHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, f: impl Fn(ReceivedMessage, Responder) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Resolver for public keys of explicitly-addressed identities.
    pub fn on_request_public_key(
        mut self,
        f: impl Fn(&Address) -> Option<VerifyingKey> + Send + Sync + 'static,
    ) -> Self {
        self.on_request_public_key = Some(Box::new(f));
        self
    }

    pub fn on_network_status(mut self, f: impl Fn(NetworkStatus) + Send + Sync + 'static) -> Self {
        self.on_network_status = Some(Box::new(f));
        self
    }

    pub fn on_close_group_changed(mut self, f: impl Fn(&[Peer]) + Send + Sync + 'static) -> Self {
        self.on_close_group_changed = Some(Box::new(f));
        self
    }

    pub fn on_new_bootstrap_endpoint(
        mut self,
        f: impl Fn(SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        self.on_new_bootstrap_endpoint = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_request_public_key", &self.on_request_public_key.is_some())
            .field("on_network_status", &self.on_network_status.is_some())
            .finish()
    }
}

/// Bounded pool of recently seen full-node sources, for picking a random
/// connected node.
pub struct RandomNodeHelper {
    ids: Mutex<Vec<Address>>,
}

impl Default for RandomNodeHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomNodeHelper {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, address: Address) {
        let mut ids = self.ids.lock().expect("random pool lock poisoned");
        if ids.contains(&address) {
            return;
        }
        if ids.len() >= MAX_TRACKED_RANDOM_NODES {
            ids.remove(0);
        }
        ids.push(address);
    }

    pub fn remove(&self, address: &Address) {
        let mut ids = self.ids.lock().expect("random pool lock poisoned");
        ids.retain(|a| a != address);
    }

    pub fn choose(&self) -> Option<Address> {
        let ids = self.ids.lock().expect("random pool lock poisoned");
        if ids.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..ids.len());
        Some(ids[index])
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("random pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The join/recovery state machine's current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Unstarted,
    Bootstrapping,
    /// Anonymous node attached to its relay.
    Relaying,
    FindingClose,
    Steady,
    ToppingUp,
    ReBootstrapWait,
    /// Terminal: the anonymous session's relay is gone.
    AnonymousEnded,
    Failed,
    Stopped,
}

/// Construction-time configuration errors. Everything else surfaces
/// through the network-status handler at runtime.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A non-anonymous node cannot be created without an identity.
    MissingIdentity,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingIdentity => {
                write!(f, "full nodes cannot be created without an identity")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

enum Command {
    Join(Vec<SocketAddr>),
    ZeroStateJoin {
        local: SocketAddr,
        peer_endpoint: SocketAddr,
        peer: Peer,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    Command(Command),
    Inbound(Vec<u8>),
    ConnectionLost(Address),
    TableSize(usize),
    SetupTick { generation: u64, attempts: u32 },
    RecoveryTick { generation: u64, ignore_size: bool },
    ReBootstrapTick { generation: u64 },
}

pub struct NodeBuilder {
    identity: Option<NodeIdentity>,
    client_mode: bool,
    anonymous: bool,
    parameters: Parameters,
    handlers: EventHandlers,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            identity: None,
            client_mode: false,
            anonymous: false,
            parameters: Parameters::default(),
            handlers: EventHandlers::default(),
        }
    }

    pub fn identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Client nodes keep a routing table but are not listed by others.
    pub fn client_mode(mut self, client: bool) -> Self {
        self.client_mode = client;
        self
    }

    /// Anonymous nodes get an ephemeral identity and may only send via
    /// their bootstrap relay.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Assemble the node and start its event loop. Must be called within
    /// a tokio runtime.
    pub fn build<T: Transport>(self, transport: T) -> Result<Node<T>, ConfigError> {
        let identity = if self.anonymous {
            let identity = NodeIdentity::ephemeral();
            info!(address = %identity.address(), "anonymous node identity");
            Arc::new(identity)
        } else {
            Arc::new(self.identity.ok_or(ConfigError::MissingIdentity)?)
        };

        let params = self.parameters;
        let table = Arc::new(RoutingTable::new(identity.address(), params.table_config()));
        let network = Network::new(transport, table.clone());
        let timer = ResponseTimer::new();
        let running = Arc::new(AtomicBool::new(true));
        let random_nodes = Arc::new(RandomNodeHelper::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut handlers = self.handlers;
        if let Some(f) = handlers.on_new_bootstrap_endpoint.take() {
            network.set_new_bootstrap_endpoint_handler(f);
        }
        let handlers = Arc::new(handlers);

        // Table observers: host notification plus actor events. These run
        // after the table lock is released; mutating work is posted.
        {
            let h = handlers.clone();
            let tx = events_tx.clone();
            table.set_status_observer(move |size| {
                if let Some(cb) = &h.on_network_status {
                    cb(NetworkStatus::TableSize(size));
                }
                let _ = tx.send(Event::TableSize(size));
            });

            let h = handlers.clone();
            table.set_close_group_observer(move |group| {
                if let Some(cb) = &h.on_close_group_changed {
                    cb(group);
                }
            });

            let net = network.clone();
            table.set_remove_observer(move |peer, _internal_only| {
                let net = net.clone();
                let connection = peer.connection_id;
                tokio::spawn(async move {
                    net.remove(&connection).await;
                });
            });
        }

        let dispatcher = Dispatcher::new(
            identity.clone(),
            self.client_mode,
            params,
            table.clone(),
            timer.clone(),
            network.clone(),
            handlers,
            random_nodes.clone(),
            running.clone(),
        );

        let state = Arc::new(Mutex::new(JoinState::Unstarted));
        let actor = NodeActor {
            identity: identity.clone(),
            client_mode: self.client_mode,
            params,
            table: table.clone(),
            timer: timer.clone(),
            network,
            dispatcher: dispatcher.clone(),
            random_nodes: random_nodes.clone(),
            events_rx,
            events_tx: events_tx.clone(),
            state: state.clone(),
            configured_endpoints: Vec::new(),
            setup_generation: 0,
            recovery_generation: 0,
            rebootstrap_generation: 0,
            running: running.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Node {
            identity,
            client_mode: self.client_mode,
            events_tx,
            table,
            dispatcher,
            random_nodes,
            running,
            state,
        })
    }
}

/// Public handle to a running overlay node.
pub struct Node<T: Transport> {
    identity: Arc<NodeIdentity>,
    client_mode: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    table: Arc<RoutingTable>,
    dispatcher: Dispatcher<T>,
    random_nodes: Arc<RandomNodeHelper>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<JoinState>>,
}

impl<T: Transport> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            client_mode: self.client_mode,
            events_tx: self.events_tx.clone(),
            table: self.table.clone(),
            dispatcher: self.dispatcher.clone(),
            random_nodes: self.random_nodes.clone(),
            running: self.running.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Transport> Node<T> {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn is_client(&self) -> bool {
        self.client_mode
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity.is_ephemeral()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn join_state(&self) -> JoinState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    pub fn close_group(&self) -> Vec<Peer> {
        self.table.close_group()
    }

    pub fn confirm_group_members(&self, a: &Address, b: &Address) -> bool {
        self.table.confirm_group_members(a, b)
    }

    /// A random recently seen full node, if any.
    pub fn random_connected_node(&self) -> Option<Address> {
        self.random_nodes.choose()
    }

    /// Join the overlay through the given bootstrap endpoints. Progress
    /// is reported through the network-status handler.
    pub fn join(&self, endpoints: Vec<SocketAddr>) {
        let _ = self
            .events_tx
            .send(Event::Command(Command::Join(endpoints)));
    }

    /// Two-node network genesis: attach directly to a known peer at a
    /// fixed endpoint and admit each other. Rejected for client-mode and
    /// anonymous nodes.
    pub async fn zero_state_join(
        &self,
        local: SocketAddr,
        peer_endpoint: SocketAddr,
        peer: Peer,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.events_tx
            .send(Event::Command(Command::ZeroStateJoin {
                local,
                peer_endpoint,
                peer,
                reply,
            }))
            .map_err(|_| anyhow!("node stopped"))?;
        response.await.map_err(|_| anyhow!("node stopped"))?
    }

    /// Route `payload` toward `destination`; `direct` limits delivery to
    /// the single closest node, otherwise the destination's close group
    /// receives one copy each. The callback, when supplied, fires exactly
    /// once with 0..=replication responses.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        destination: Address,
        group_claim: Option<Address>,
        payload: Vec<u8>,
        callback: Option<ResponseCallback>,
        timeout: Duration,
        direct: bool,
        cacheable: bool,
    ) {
        if !self.is_running() {
            trace!("send after shutdown");
            if let Some(cb) = callback {
                cb(Vec::new());
            }
            self.dispatcher
                .notify_status(NetworkStatus::NetworkShuttingDown);
            return;
        }
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .send(
                    destination,
                    group_claim,
                    payload,
                    callback,
                    timeout,
                    direct,
                    cacheable,
                )
                .await;
        });
    }

    /// Stop the node: pending tasks are flushed, timers cancelled and the
    /// event loop drained.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .events_tx
            .send(Event::Command(Command::Shutdown(reply)))
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

impl<T: Transport> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address())
            .field("state", &self.join_state())
            .field("table_size", &self.table_size())
            .finish()
    }
}

// ----------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------

struct NodeActor<T: Transport> {
    identity: Arc<NodeIdentity>,
    client_mode: bool,
    params: Parameters,
    table: Arc<RoutingTable>,
    timer: ResponseTimer,
    network: Network<T>,
    dispatcher: Dispatcher<T>,
    random_nodes: Arc<RandomNodeHelper>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    state: Arc<Mutex<JoinState>>,
    configured_endpoints: Vec<SocketAddr>,
    setup_generation: u64,
    recovery_generation: u64,
    rebootstrap_generation: u64,
    running: Arc<AtomicBool>,
}

impl<T: Transport> NodeActor<T> {
    fn state(&self) -> JoinState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: JoinState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            match event {
                Event::Command(Command::Shutdown(reply)) => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Event::Command(Command::Join(endpoints)) => {
                    self.handle_join_command(endpoints).await;
                }
                Event::Command(Command::ZeroStateJoin {
                    local,
                    peer_endpoint,
                    peer,
                    reply,
                }) => {
                    let result = self.zero_state_join(local, peer_endpoint, peer).await;
                    let _ = reply.send(result);
                }
                Event::Inbound(bytes) => {
                    self.dispatcher.handle_wire(bytes).await;
                }
                Event::ConnectionLost(connection) => {
                    self.handle_connection_lost(connection).await;
                }
                Event::TableSize(size) => {
                    self.handle_table_size(size);
                }
                Event::SetupTick {
                    generation,
                    attempts,
                } => {
                    if generation == self.setup_generation
                        && self.state() == JoinState::FindingClose
                    {
                        self.find_closest_node(attempts).await;
                    }
                }
                Event::RecoveryTick {
                    generation,
                    ignore_size,
                } => {
                    self.handle_recovery_tick(generation, ignore_size).await;
                }
                Event::ReBootstrapTick { generation } => {
                    self.handle_rebootstrap_tick(generation).await;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        info!(address = %self.identity.address(), "shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.setup_generation += 1;
        self.recovery_generation += 1;
        self.rebootstrap_generation += 1;
        self.timer.cancel_all();
        self.set_state(JoinState::Stopped);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn transport_events(&self) -> TransportEvents {
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<Address>();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(bytes) = msg_rx.recv().await {
                if events.send(Event::Inbound(bytes)).is_err() {
                    break;
                }
            }
        });
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(connection) = lost_rx.recv().await {
                if events.send(Event::ConnectionLost(connection)).is_err() {
                    break;
                }
            }
        });
        TransportEvents {
            messages: msg_tx,
            connection_lost: lost_tx,
        }
    }

    fn arm_setup(&mut self, attempts: u32) {
        self.setup_generation += 1;
        let generation = self.setup_generation;
        let delay = self.params.find_close_node_interval;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::SetupTick {
                generation,
                attempts,
            });
        });
    }

    fn arm_recovery(&mut self, delay: Duration, ignore_size: bool) {
        self.recovery_generation += 1;
        let generation = self.recovery_generation;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RecoveryTick {
                generation,
                ignore_size,
            });
        });
    }

    fn schedule_re_bootstrap(&mut self) {
        if self.state() == JoinState::ReBootstrapWait {
            return;
        }
        warn!("scheduling re-bootstrap");
        self.set_state(JoinState::ReBootstrapWait);
        self.setup_generation += 1;
        self.recovery_generation += 1;
        self.rebootstrap_generation += 1;
        let generation = self.rebootstrap_generation;
        let delay = self.params.re_bootstrap_time_lag;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::ReBootstrapTick { generation });
        });
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    async fn handle_join_command(&mut self, endpoints: Vec<SocketAddr>) {
        if endpoints.is_empty() {
            warn!("join requested with no bootstrap endpoints");
            self.set_state(JoinState::Failed);
            self.dispatcher.notify_status(NetworkStatus::NotJoined);
            return;
        }
        self.configured_endpoints = endpoints;

        // Joining with a stale neighbour set: drop everything first.
        if !self.table.is_empty() {
            debug!(size = self.table.len(), "dropping stale neighbours before join");
            for peer in self.table.drain() {
                self.network.remove(&peer.connection_id).await;
                self.random_nodes.remove(&peer.address);
            }
        }
        self.do_join().await;
    }

    async fn do_join(&mut self) {
        self.set_state(JoinState::Bootstrapping);
        self.setup_generation += 1;
        self.recovery_generation += 1;

        let events = self.transport_events();
        let endpoints = self.configured_endpoints.clone();
        match self.network.bootstrap(&endpoints, events, None).await {
            Err(e) => {
                warn!(error = %e, "bootstrap failed");
                self.set_state(JoinState::Failed);
                self.dispatcher.notify_status(NetworkStatus::NotJoined);
            }
            Ok(handle) => {
                info!(
                    connection = %handle.connection_id,
                    relay = %handle.relay_connection_id,
                    "bootstrapped"
                );
                self.dispatcher.reset_session();
                if self.identity.is_ephemeral() {
                    self.set_state(JoinState::Relaying);
                    self.dispatcher.notify_status(NetworkStatus::Success);
                } else {
                    self.set_state(JoinState::FindingClose);
                    self.send_join_hello(&handle).await;
                    self.find_closest_node(0).await;
                    self.dispatcher.notify_status(NetworkStatus::Success);
                }
            }
        }
    }

    /// Announce ourselves to the bootstrap peer so both sides can admit
    /// each other after identity validation.
    async fn send_join_hello(&self, handle: &BootstrapHandle) {
        let endpoints = match self
            .network
            .get_available_endpoint(&handle.connection_id, None)
            .await
        {
            Ok(probe) => probe.ours,
            Err(_) => EndpointPair::symmetric(SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                0,
            )),
        };
        let info = self.dispatcher.own_connect_info(endpoints, None);
        let payload = match serialize_payload(&info) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise join hello");
                return;
            }
        };
        let mut envelope = Envelope::routing_request(
            MessageTag::Join,
            None,
            self.identity.address(),
            self.timer.next_message_id(),
            self.params.hops_to_live,
            payload,
        );
        envelope.client_origin = self.client_mode;
        envelope.relay = Some(self.identity.address());
        envelope.relay_connection = Some(handle.relay_connection_id);
        match self
            .network
            .send_to_direct(&envelope, &handle.connection_id)
            .await
        {
            Ok(()) => trace!("join hello sent"),
            Err(e) => warn!(error = %e, "failed to send join hello"),
        }
    }

    /// The setup loop: ask the bootstrap peer for the single node closest
    /// to us, repeating every `find_close_node_interval` until the table
    /// gains its first entry or the failure budget runs out.
    async fn find_closest_node(&mut self, attempts: u32) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if attempts > 0 {
            if !self.table.is_empty() {
                debug!("setup loop done, scheduling recovery loop");
                self.set_state(JoinState::Steady);
                let interval = self.params.find_node_interval;
                self.arm_recovery(interval, false);
                return;
            }
            if attempts >= self.params.max_find_close_node_failures {
                warn!(attempts, "failed to get closest node, re-bootstrapping");
                self.schedule_re_bootstrap();
                return;
            }
        }

        let Some(bootstrap) = self.network.bootstrap_connection_id() else {
            self.schedule_re_bootstrap();
            return;
        };
        let own = self.identity.address();
        let query = GroupQuery {
            target: own,
            count: 1,
        };
        let payload = match serialize_payload(&query) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise FindGroup query");
                return;
            }
        };
        let mut envelope = Envelope::routing_request(
            MessageTag::FindGroup,
            None,
            own,
            self.timer.next_message_id(),
            self.params.hops_to_live,
            payload,
        );
        envelope.client_origin = self.client_mode;
        envelope.relay = Some(own);
        envelope.relay_connection = self.network.this_node_relay_connection_id();
        match self.network.send_to_direct(&envelope, &bootstrap).await {
            Ok(()) => info!(attempt = attempts + 1, "sent FindGroup to bootstrap"),
            Err(e) => warn!(error = %e, "failed to send FindGroup to bootstrap"),
        }
        self.arm_setup(attempts + 1);
    }

    async fn zero_state_join(
        &mut self,
        local: SocketAddr,
        peer_endpoint: SocketAddr,
        peer: Peer,
    ) -> Result<()> {
        if self.client_mode {
            return Err(anyhow!("no client nodes allowed in zero state network"));
        }
        if self.identity.is_ephemeral() {
            return Err(anyhow!("zero-state join not allowed for anonymous nodes"));
        }
        if peer.address.is_zero() {
            return Err(anyhow!("zero peer address"));
        }

        self.set_state(JoinState::Bootstrapping);
        let events = self.transport_events();
        let handle = match self
            .network
            .bootstrap(&[peer_endpoint], events, Some(local))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "zero-state bootstrap failed");
                self.set_state(JoinState::Failed);
                self.dispatcher.notify_status(NetworkStatus::NotJoined);
                return Err(e);
            }
        };
        if handle.connection_id != peer.address {
            debug!(
                connection = %handle.connection_id,
                expected = %peer.address,
                "zero-state bootstrap attached under a transport-assigned id"
            );
        }

        let endpoints = EndpointPair::symmetric(peer_endpoint);
        let probe = self
            .network
            .get_available_endpoint(&peer.address, Some(&endpoints))
            .await?;
        if !probe.already_connected {
            debug!("expected an existing connection to the zero-state peer");
        }
        let connection = self
            .network
            .add(&peer.address, &endpoints, b"zero-state".to_vec())
            .await?;

        let admitted = self
            .table
            .add(Peer::new(peer.address, peer.public_key, connection));
        if admitted.is_admitted() {
            info!(
                peer = %peer.address,
                size = self.table.len(),
                "joined zero state network"
            );
            self.set_state(JoinState::Steady);
            let interval = self.params.find_node_interval;
            self.arm_recovery(interval, false);
            self.dispatcher.notify_status(NetworkStatus::Success);
            Ok(())
        } else {
            self.set_state(JoinState::Failed);
            self.dispatcher.notify_status(NetworkStatus::NotJoined);
            Err(anyhow!("zero-state peer rejected by routing table"))
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn handle_table_size(&mut self, size: usize) {
        match self.state() {
            JoinState::FindingClose if size > 0 => {
                info!(size, "first routing entry admitted, terminating setup loop");
                self.setup_generation += 1;
                self.set_state(JoinState::Steady);
                let interval = self.params.find_node_interval;
                self.arm_recovery(interval, false);
            }
            JoinState::Steady | JoinState::ToppingUp if size == 0 => {
                warn!("routing table empty");
                self.schedule_re_bootstrap();
            }
            _ => {}
        }
    }

    /// Periodic (and loss-triggered) top-up: ask the closest node for
    /// more neighbours while the table is below its threshold.
    async fn handle_recovery_tick(&mut self, generation: u64, ignore_size: bool) {
        if generation != self.recovery_generation {
            return;
        }
        if !matches!(self.state(), JoinState::Steady | JoinState::ToppingUp) {
            return;
        }
        if self.table.is_empty() {
            self.schedule_re_bootstrap();
            return;
        }

        let size = self.table.len();
        if ignore_size || size < self.params.routing_table_size_threshold {
            self.set_state(JoinState::ToppingUp);
            let count = if ignore_size && size > self.params.routing_table_size_threshold {
                self.params.close_group_size as u16
            } else {
                self.params.max_routing_table_size as u16
            };
            debug!(size, count, "sending FindGroup for routing table top-up");

            let own = self.identity.address();
            let query = GroupQuery { target: own, count };
            match serialize_payload(&query) {
                Ok(payload) => {
                    let mut envelope = Envelope::routing_request(
                        MessageTag::FindGroup,
                        Some(own),
                        own,
                        self.timer.next_message_id(),
                        self.params.hops_to_live,
                        payload,
                    );
                    envelope.client_origin = self.client_mode;
                    if let Err(e) = self.network.send_to_closest(&envelope).await {
                        debug!(error = %e, "top-up FindGroup failed");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialise top-up query"),
            }
            self.set_state(JoinState::Steady);
        }
        let interval = self.params.find_node_interval;
        self.arm_recovery(interval, false);
    }

    // ------------------------------------------------------------------
    // Connection loss
    // ------------------------------------------------------------------

    async fn handle_connection_lost(&mut self, connection: Address) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        debug!(connection = %connection, "connection lost");

        let was_close = self
            .table
            .get_by_connection(&connection)
            .map(|p| {
                self.table
                    .is_in_range(&p.address, self.params.close_group_size)
            })
            .unwrap_or(false);
        let dropped = self.table.drop_peer(&connection);
        let mut resend = was_close && dropped.is_some();

        match &dropped {
            Some(peer) => {
                warn!(peer = %peer.address, "lost connection to routing node");
                self.random_nodes.remove(&peer.address);
            }
            None => {
                if self.network.bootstrap_connection_id() == Some(connection) {
                    warn!("lost bootstrap connection");
                    self.network.clear_bootstrap_connection_info();
                    if self.identity.is_ephemeral() {
                        warn!("anonymous session ended, send not allowed anymore");
                        self.dispatcher
                            .end_session(NetworkStatus::AnonymousSessionEnded);
                        self.timer.cancel_all();
                        self.set_state(JoinState::AnonymousEnded);
                        return;
                    }
                    if self.table.is_empty() {
                        resend = true;
                    }
                } else {
                    trace!(connection = %connection, "unknown or internal connection lost");
                }
            }
        }

        if resend {
            debug!("close peer lost, scheduling top-up");
            let lag = self.params.recovery_time_lag;
            self.arm_recovery(lag, true);
        }
    }

    async fn handle_rebootstrap_tick(&mut self, generation: u64) {
        if generation != self.rebootstrap_generation {
            return;
        }
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if self.state() != JoinState::ReBootstrapWait {
            return;
        }
        info!("re-bootstrapping");
        self.do_join().await;
    }
}
