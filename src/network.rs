//! # Network Facade
//!
//! The routing core never talks to sockets. It drives an abstract
//! [`Transport`] — the reliable UDP layer supplied by the host — through a
//! [`Network`] facade that adds the overlay-level concerns: bootstrap
//! connection bookkeeping, relay handles for not-yet-routable nodes, and
//! next-hop selection against the routing table.
//!
//! Transport completions are modelled as async results; inbound traffic
//! and connection losses arrive over the channel senders handed to
//! [`Transport::bootstrap`], which the transport must keep for the life of
//! the session.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::Address;
use crate::identity::Peer;
use crate::messages::{serialize_envelope, EndpointPair, Envelope};
use crate::table::RoutingTable;

/// NAT classification reported by the transport during endpoint
/// negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatKind {
    Unknown,
    Direct,
    Cone,
    Symmetric,
}

/// Result of an endpoint negotiation with the transport.
#[derive(Clone, Copy, Debug)]
pub struct EndpointProbe {
    /// Our endpoints, as usable by the remote peer.
    pub ours: EndpointPair,
    pub nat: NatKind,
    /// The transport already holds a connection to this peer (expected
    /// during zero-state joins, where attachment precedes negotiation).
    pub already_connected: bool,
}

/// Handles returned by a successful bootstrap attach.
#[derive(Clone, Copy, Debug)]
pub struct BootstrapHandle {
    /// Connection id of the bootstrap peer.
    pub connection_id: Address,
    /// Our own handle as seen by the bootstrap peer; carried as
    /// `relay_connection` in envelopes sent before we are routable.
    pub relay_connection_id: Address,
    /// The endpoint that accepted the attach.
    pub endpoint: SocketAddr,
}

/// Channel ends through which the transport delivers events.
///
/// Every inbound datagram and every lost connection is posted here; the
/// owning node's event loop drains the paired receivers.
#[derive(Clone)]
pub struct TransportEvents {
    pub messages: mpsc::UnboundedSender<Vec<u8>>,
    pub connection_lost: mpsc::UnboundedSender<Address>,
}

/// The transport contract required by the routing core.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Attach to the first reachable endpoint of `endpoints`. Events for
    /// the whole session flow through `events`. `local` pins the local
    /// endpoint (zero-state joins).
    async fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        events: TransportEvents,
        local: Option<SocketAddr>,
    ) -> Result<BootstrapHandle>;

    /// Negotiate endpoints for a prospective connection to `peer`.
    async fn get_available_endpoint(
        &self,
        peer: &Address,
        peer_endpoints: Option<&EndpointPair>,
    ) -> Result<EndpointProbe>;

    /// Establish a validated connection; returns its connection id.
    async fn add(
        &self,
        peer: &Address,
        peer_endpoints: &EndpointPair,
        validation_token: Vec<u8>,
    ) -> Result<Address>;

    /// Drop a connection. Does not raise a connection-lost event.
    async fn remove(&self, connection_id: &Address);

    /// Send one framed message over an established connection.
    async fn send(&self, connection_id: &Address, bytes: Vec<u8>) -> Result<()>;
}

#[derive(Default)]
struct BootstrapInfo {
    connection_id: Option<Address>,
    relay_connection_id: Option<Address>,
}

type EndpointHandler = Box<dyn Fn(SocketAddr) + Send + Sync>;

struct NetworkInner<T: Transport> {
    transport: T,
    table: Arc<RoutingTable>,
    bootstrap: Mutex<BootstrapInfo>,
    on_new_bootstrap_endpoint: Mutex<Option<EndpointHandler>>,
}

/// Cheap-to-clone facade over the transport plus routing-table-driven
/// next-hop selection.
pub struct Network<T: Transport> {
    inner: Arc<NetworkInner<T>>,
}

impl<T: Transport> Clone for Network<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Network<T> {
    pub fn new(transport: T, table: Arc<RoutingTable>) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                transport,
                table,
                bootstrap: Mutex::new(BootstrapInfo::default()),
                on_new_bootstrap_endpoint: Mutex::new(None),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    // ------------------------------------------------------------------
    // Bootstrap connection bookkeeping
    // ------------------------------------------------------------------

    /// Attach to one of `endpoints` and record the resulting handles.
    /// A previously recorded bootstrap connection is dropped first.
    pub async fn bootstrap(
        &self,
        endpoints: &[SocketAddr],
        events: TransportEvents,
        local: Option<SocketAddr>,
    ) -> Result<BootstrapHandle> {
        if let Some(stale) = self.bootstrap_connection_id() {
            debug!(connection = %stale, "removing stale bootstrap connection");
            self.inner.transport.remove(&stale).await;
            self.clear_bootstrap_connection_info();
        }

        let handle = self
            .inner
            .transport
            .bootstrap(endpoints, events, local)
            .await?;
        {
            let mut info = self.inner.bootstrap.lock().expect("bootstrap lock poisoned");
            info.connection_id = Some(handle.connection_id);
            info.relay_connection_id = Some(handle.relay_connection_id);
        }
        if let Some(handler) = self
            .inner
            .on_new_bootstrap_endpoint
            .lock()
            .expect("handler lock poisoned")
            .as_ref()
        {
            handler(handle.endpoint);
        }
        Ok(handle)
    }

    pub fn bootstrap_connection_id(&self) -> Option<Address> {
        self.inner
            .bootstrap
            .lock()
            .expect("bootstrap lock poisoned")
            .connection_id
    }

    pub fn this_node_relay_connection_id(&self) -> Option<Address> {
        self.inner
            .bootstrap
            .lock()
            .expect("bootstrap lock poisoned")
            .relay_connection_id
    }

    pub fn clear_bootstrap_connection_info(&self) {
        let mut info = self.inner.bootstrap.lock().expect("bootstrap lock poisoned");
        info.connection_id = None;
        info.relay_connection_id = None;
    }

    /// Register the host handler invoked when a bootstrap attach lands on
    /// a (possibly new) endpoint worth persisting.
    pub fn set_new_bootstrap_endpoint_handler(
        &self,
        f: impl Fn(SocketAddr) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .on_new_bootstrap_endpoint
            .lock()
            .expect("handler lock poisoned") = Some(Box::new(f));
    }

    // ------------------------------------------------------------------
    // Transport passthrough
    // ------------------------------------------------------------------

    pub async fn get_available_endpoint(
        &self,
        peer: &Address,
        peer_endpoints: Option<&EndpointPair>,
    ) -> Result<EndpointProbe> {
        self.inner
            .transport
            .get_available_endpoint(peer, peer_endpoints)
            .await
    }

    pub async fn add(
        &self,
        peer: &Address,
        peer_endpoints: &EndpointPair,
        validation_token: Vec<u8>,
    ) -> Result<Address> {
        self.inner
            .transport
            .add(peer, peer_endpoints, validation_token)
            .await
    }

    pub async fn remove(&self, connection_id: &Address) {
        self.inner.transport.remove(connection_id).await;
    }

    // ------------------------------------------------------------------
    // Envelope sends
    // ------------------------------------------------------------------

    /// Send an envelope over one specific connection.
    pub async fn send_to_direct(&self, envelope: &Envelope, connection_id: &Address) -> Result<()> {
        let bytes = serialize_envelope(envelope)?;
        self.inner.transport.send(connection_id, bytes).await
    }

    /// Send an envelope to the routing-table peer nearest its
    /// destination. With an empty table, a relay-marked envelope falls
    /// back to the bootstrap connection.
    pub async fn send_to_closest(&self, envelope: &Envelope) -> Result<()> {
        if let Some(next) = self.inner.table.closest_node(&envelope.destination) {
            return self.send_to_direct(envelope, &next.connection_id).await;
        }
        if envelope.relay_connection.is_some() {
            if let Some(bootstrap) = self.bootstrap_connection_id() {
                return self.send_to_direct(envelope, &bootstrap).await;
            }
        }
        warn!(
            destination = %envelope.destination,
            "no route: routing table empty and no bootstrap relay"
        );
        Err(anyhow!("no route to {}", envelope.destination))
    }

    /// Next hop for a forwarded envelope: the nearest table entry, but
    /// only if it improves on our own distance. `None` means this node is
    /// the closest it knows.
    pub fn next_hop(&self, destination: &Address) -> Option<Peer> {
        let next = self.inner.table.closest_node(destination)?;
        if next.address == *destination
            || next.address.closer_to(&self.inner.table.own_address(), destination)
        {
            Some(next)
        } else {
            None
        }
    }
}

impl<T: Transport> std::fmt::Debug for Network<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("bootstrap", &self.bootstrap_connection_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ADDRESS_BYTES;
    use crate::identity::Keypair;
    use crate::messages::{Kind, MessageTag};
    use crate::table::TableConfig;
    use std::sync::Mutex as StdMutex;

    fn addr(byte: u8) -> Address {
        let mut bytes = [0u8; ADDRESS_BYTES];
        bytes[0] = byte;
        Address::from_bytes(bytes)
    }

    /// Transport stub recording every call.
    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<(Address, Vec<u8>)>>,
        removed: StdMutex<Vec<Address>>,
        bootstrap_result: StdMutex<Option<BootstrapHandle>>,
    }

    #[async_trait]
    impl Transport for Arc<RecordingTransport> {
        async fn bootstrap(
            &self,
            endpoints: &[SocketAddr],
            _events: TransportEvents,
            _local: Option<SocketAddr>,
        ) -> Result<BootstrapHandle> {
            self.bootstrap_result
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow!("no endpoint of {} reachable", endpoints.len()))
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

        async fn remove(&self, connection_id: &Address) {
            self.removed.lock().unwrap().push(*connection_id);
        }

        async fn send(&self, connection_id: &Address, bytes: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap().push((*connection_id, bytes));
            Ok(())
        }
    }

    fn test_envelope(destination: Address) -> Envelope {
        Envelope {
            tag: MessageTag::Post,
            kind: Kind::Request,
            source: Some(addr(0x01)),
            destination,
            message_id: 1,
            routing: false,
            direct: true,
            cacheable: false,
            client_origin: false,
            replication: 1,
            hops_to_live: 50,
            relay: None,
            relay_connection: None,
            group_claim: None,
            payload: b"x".to_vec(),
        }
    }

    fn events() -> TransportEvents {
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        TransportEvents {
            messages: msg_tx,
            connection_lost: lost_tx,
        }
    }

    fn network_with_table(own: Address) -> (Network<Arc<RecordingTransport>>, Arc<RoutingTable>, Arc<RecordingTransport>) {
        let table = Arc::new(RoutingTable::new(own, TableConfig::default()));
        let transport = Arc::new(RecordingTransport::default());
        let network = Network::new(transport.clone(), table.clone());
        (network, table, transport)
    }

    fn add_peer(table: &RoutingTable, byte: u8) -> Peer {
        let peer = Peer::new(addr(byte), Keypair::generate().public_key(), addr(byte));
        assert!(table.add(peer.clone()).is_admitted());
        peer
    }

    #[tokio::test]
    async fn bootstrap_records_handles_and_fires_endpoint_handler() {
        let (network, _table, transport) = network_with_table(addr(0x01));
        let endpoint: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        *transport.bootstrap_result.lock().unwrap() = Some(BootstrapHandle {
            connection_id: addr(0xB0),
            relay_connection_id: addr(0xB1),
            endpoint,
        });

        let observed = Arc::new(StdMutex::new(None));
        let sink = observed.clone();
        network.set_new_bootstrap_endpoint_handler(move |ep| {
            *sink.lock().unwrap() = Some(ep);
        });

        let handle = network.bootstrap(&[endpoint], events(), None).await.unwrap();
        assert_eq!(handle.connection_id, addr(0xB0));
        assert_eq!(network.bootstrap_connection_id(), Some(addr(0xB0)));
        assert_eq!(network.this_node_relay_connection_id(), Some(addr(0xB1)));
        assert_eq!(*observed.lock().unwrap(), Some(endpoint));

        network.clear_bootstrap_connection_info();
        assert_eq!(network.bootstrap_connection_id(), None);
        assert_eq!(network.this_node_relay_connection_id(), None);
    }

    #[tokio::test]
    async fn rebootstrap_drops_the_previous_connection() {
        let (network, _table, transport) = network_with_table(addr(0x01));
        let endpoint: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        *transport.bootstrap_result.lock().unwrap() = Some(BootstrapHandle {
            connection_id: addr(0xB0),
            relay_connection_id: addr(0xB1),
            endpoint,
        });
        network.bootstrap(&[endpoint], events(), None).await.unwrap();

        *transport.bootstrap_result.lock().unwrap() = Some(BootstrapHandle {
            connection_id: addr(0xC0),
            relay_connection_id: addr(0xC1),
            endpoint,
        });
        network.bootstrap(&[endpoint], events(), None).await.unwrap();

        assert_eq!(*transport.removed.lock().unwrap(), vec![addr(0xB0)]);
        assert_eq!(network.bootstrap_connection_id(), Some(addr(0xC0)));
    }

    #[tokio::test]
    async fn send_to_closest_picks_nearest_table_entry() {
        let (network, table, transport) = network_with_table(addr(0x01));
        add_peer(&table, 0x10);
        let near = add_peer(&table, 0x7F);

        let envelope = test_envelope(addr(0x7E));
        network.send_to_closest(&envelope).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, near.connection_id);
    }

    #[tokio::test]
    async fn send_to_closest_falls_back_to_bootstrap_for_relayed() {
        let (network, _table, transport) = network_with_table(addr(0x01));
        let endpoint: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        *transport.bootstrap_result.lock().unwrap() = Some(BootstrapHandle {
            connection_id: addr(0xB0),
            relay_connection_id: addr(0xB1),
            endpoint,
        });
        network.bootstrap(&[endpoint], events(), None).await.unwrap();

        let mut envelope = test_envelope(addr(0x50));
        envelope.source = None;
        envelope.relay = Some(addr(0x01));
        envelope.relay_connection = Some(addr(0xB1));
        network.send_to_closest(&envelope).await.unwrap();

        assert_eq!(transport.sent.lock().unwrap()[0].0, addr(0xB0));
    }

    #[tokio::test]
    async fn send_to_closest_errors_without_route() {
        let (network, _table, _transport) = network_with_table(addr(0x01));
        let envelope = test_envelope(addr(0x50));
        assert!(network.send_to_closest(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn next_hop_requires_progress() {
        let (network, table, _transport) = network_with_table(addr(0x01));
        let far = add_peer(&table, 0xF0);

        // Destination nearer to us than to any entry: no next hop.
        assert!(network.next_hop(&addr(0x02)).is_none());
        // Destination in the entry's half of the space: forwardable.
        assert_eq!(network.next_hop(&addr(0xF1)).unwrap().address, far.address);
        // Destination equal to an entry: direct hit.
        assert_eq!(network.next_hop(&addr(0xF0)).unwrap().address, far.address);
    }
}
