//! # XOR-Metric Routing Table
//!
//! A bounded neighbour set ordered by XOR distance from the owning node,
//! with close-group semantics:
//!
//! - The `close_group_size` entries nearest to self form the **close
//!   group**; membership is recomputed from the current table state.
//! - Beyond the close group, at most `bucket_limit` entries may occupy
//!   each bucket index (leading-bit match with self).
//! - Total size never exceeds `max_size`; the entry for self is never
//!   present; addresses and connection ids are unique.
//!
//! Admission rejections are expected steady-state outcomes, not errors,
//! and re-adding a present identity is a no-op.
//!
//! ## Observers
//!
//! Mutations fire registered observers (`on_remove`,
//! `on_close_group_changed`, `on_network_status`) strictly **after** the
//! table's lock has been released. Observer callbacks may query the table
//! but must not mutate it from the same call stack; mutating work must be
//! posted as a new task.

use std::sync::Mutex;

use tracing::{debug, trace};

use crate::address::{bucket_index, distance_cmp, Address};
use crate::identity::Peer;

/// Structural parameters of the table.
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    pub max_size: usize,
    pub close_group_size: usize,
    pub bucket_limit: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_size: 64,
            close_group_size: 8,
            bucket_limit: 1,
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum AddOutcome {
    Added,
    /// Admitted, evicting the returned entry to preserve the invariants.
    Replaced(Peer),
    Rejected,
}

impl AddOutcome {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, AddOutcome::Rejected)
    }
}

type RemoveObserver = Box<dyn Fn(&Peer, bool) + Send + Sync>;
type CloseGroupObserver = Box<dyn Fn(&[Peer]) + Send + Sync>;
type StatusObserver = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Observers {
    on_remove: Mutex<Option<RemoveObserver>>,
    on_close_group_changed: Mutex<Option<CloseGroupObserver>>,
    on_network_status: Mutex<Option<StatusObserver>>,
}

/// Deferred observer invocations, computed under the lock and fired after
/// it is released.
#[derive(Default)]
struct Notifications {
    removed: Option<(Peer, bool)>,
    close_group: Option<Vec<Peer>>,
    status: Option<usize>,
}

pub struct RoutingTable {
    own_address: Address,
    config: TableConfig,
    inner: Mutex<Vec<Peer>>,
    observers: Observers,
}

impl RoutingTable {
    pub fn new(own_address: Address, config: TableConfig) -> Self {
        Self {
            own_address,
            config,
            inner: Mutex::new(Vec::new()),
            observers: Observers::default(),
        }
    }

    pub fn own_address(&self) -> Address {
        self.own_address
    }

    pub fn config(&self) -> TableConfig {
        self.config
    }

    // ------------------------------------------------------------------
    // Observer registration
    // ------------------------------------------------------------------

    /// Called when the table itself evicts an entry. The flag mirrors the
    /// transport contract: `true` means only the connection should be
    /// dropped, with no recovery action.
    pub fn set_remove_observer(&self, f: impl Fn(&Peer, bool) + Send + Sync + 'static) {
        *self.observers.on_remove.lock().expect("observer lock poisoned") = Some(Box::new(f));
    }

    pub fn set_close_group_observer(&self, f: impl Fn(&[Peer]) + Send + Sync + 'static) {
        *self
            .observers
            .on_close_group_changed
            .lock()
            .expect("observer lock poisoned") = Some(Box::new(f));
    }

    pub fn set_status_observer(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        *self
            .observers
            .on_network_status
            .lock()
            .expect("observer lock poisoned") = Some(Box::new(f));
    }

    fn fire(&self, notifications: Notifications) {
        if let Some((peer, internal_only)) = notifications.removed {
            if let Some(cb) = self
                .observers
                .on_remove
                .lock()
                .expect("observer lock poisoned")
                .as_ref()
            {
                cb(&peer, internal_only);
            }
        }
        if let Some(group) = notifications.close_group {
            if let Some(cb) = self
                .observers
                .on_close_group_changed
                .lock()
                .expect("observer lock poisoned")
                .as_ref()
            {
                cb(&group);
            }
        }
        if let Some(size) = notifications.status {
            if let Some(cb) = self
                .observers
                .on_network_status
                .lock()
                .expect("observer lock poisoned")
                .as_ref()
            {
                cb(size);
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Attempt to admit a validated peer.
    ///
    /// Admission policy, in order:
    /// 1. reject self, the zero address, and duplicates (by address or
    ///    connection id) — duplicates make re-adds idempotent;
    /// 2. admit unconditionally while the table is smaller than the close
    ///    group;
    /// 3. a peer falling inside the current close group is admitted; the
    ///    displaced (previously farthest) group member is evicted when its
    ///    bucket holds other entries, or when capacity demands it — the
    ///    sole representative of a bucket is kept while room remains;
    /// 4. otherwise the peer is admitted into its bucket if the bucket's
    ///    occupancy beyond the close group is under `bucket_limit` and the
    ///    table is not full.
    pub fn add(&self, peer: Peer) -> AddOutcome {
        if peer.address == self.own_address || peer.address.is_zero() {
            return AddOutcome::Rejected;
        }

        let mut notifications = Notifications::default();
        let outcome = {
            let mut peers = self.inner.lock().expect("routing table lock poisoned");
            if peers
                .iter()
                .any(|p| p.address == peer.address || p.connection_id == peer.connection_id)
            {
                return AddOutcome::Rejected;
            }

            let group_before = close_group_of(&peers, &self.own_address, self.config.close_group_size);
            let outcome = self.admit(&mut peers, peer);

            if outcome.is_admitted() {
                let group_after =
                    close_group_of(&peers, &self.own_address, self.config.close_group_size);
                if group_addresses(&group_after) != group_addresses(&group_before) {
                    notifications.close_group = Some(group_after);
                }
                notifications.status = Some(peers.len());
                if let AddOutcome::Replaced(ref evicted) = outcome {
                    notifications.removed = Some((evicted.clone(), true));
                }
            }
            outcome
        };

        if outcome.is_admitted() {
            trace!(size = notifications.status, "routing table admission");
        }
        self.fire(notifications);
        outcome
    }

    fn admit(&self, peers: &mut Vec<Peer>, peer: Peer) -> AddOutcome {
        let TableConfig {
            max_size,
            close_group_size,
            bucket_limit,
        } = self.config;

        if peers.len() < close_group_size {
            peers.push(peer);
            return AddOutcome::Added;
        }

        let group = close_group_of(peers, &self.own_address, close_group_size);
        let farthest = group.last().cloned();
        let within_group = match &farthest {
            Some(f) => peer.address.closer_to(&f.address, &self.own_address),
            None => true,
        };

        if within_group {
            let displaced = farthest.expect("close group non-empty when table non-empty");
            let displaced_bucket = bucket_index(&self.own_address, &displaced.address);
            let bucket_shared = peers.iter().any(|p| {
                p.address != displaced.address
                    && bucket_index(&self.own_address, &p.address) == displaced_bucket
            });
            let over_capacity = peers.len() + 1 > max_size;

            peers.push(peer);
            if bucket_shared || over_capacity {
                let pos = peers
                    .iter()
                    .position(|p| p.address == displaced.address)
                    .expect("displaced entry present");
                let evicted = peers.remove(pos);
                debug!(evicted = %evicted.address, "close group eviction");
                return AddOutcome::Replaced(evicted);
            }
            return AddOutcome::Added;
        }

        if peers.len() >= max_size {
            return AddOutcome::Rejected;
        }

        let bucket = bucket_index(&self.own_address, &peer.address);
        let group_addrs = group_addresses(&group);
        let occupancy = peers
            .iter()
            .filter(|p| !group_addrs.contains(&p.address))
            .filter(|p| bucket_index(&self.own_address, &p.address) == bucket)
            .count();
        if occupancy < bucket_limit {
            peers.push(peer);
            AddOutcome::Added
        } else {
            AddOutcome::Rejected
        }
    }

    /// Remove an entry by address or connection id; returns it if present.
    pub fn drop_peer(&self, key: &Address) -> Option<Peer> {
        let mut notifications = Notifications::default();
        let dropped = {
            let mut peers = self.inner.lock().expect("routing table lock poisoned");
            let pos = peers
                .iter()
                .position(|p| &p.address == key || &p.connection_id == key)?;
            let group_before = close_group_of(&peers, &self.own_address, self.config.close_group_size);
            let dropped = peers.remove(pos);
            let group_after =
                close_group_of(&peers, &self.own_address, self.config.close_group_size);
            if group_addresses(&group_after) != group_addresses(&group_before) {
                notifications.close_group = Some(group_after);
            }
            notifications.status = Some(peers.len());
            Some(dropped)
        }?;

        debug!(peer = %dropped.address, "dropped from routing table");
        self.fire(notifications);
        Some(dropped)
    }

    /// Update the mutable rank of an entry.
    pub fn set_rank(&self, address: &Address, rank: i32) -> bool {
        let mut peers = self.inner.lock().expect("routing table lock poisoned");
        match peers.iter_mut().find(|p| &p.address == address) {
            Some(peer) => {
                peer.rank = rank;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.inner.lock().expect("routing table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.inner
            .lock()
            .expect("routing table lock poisoned")
            .iter()
            .any(|p| &p.address == address)
    }

    pub fn get(&self, address: &Address) -> Option<Peer> {
        self.inner
            .lock()
            .expect("routing table lock poisoned")
            .iter()
            .find(|p| &p.address == address)
            .cloned()
    }

    pub fn get_by_connection(&self, connection_id: &Address) -> Option<Peer> {
        self.inner
            .lock()
            .expect("routing table lock poisoned")
            .iter()
            .find(|p| &p.connection_id == connection_id)
            .cloned()
    }

    /// The single entry nearest to `target`.
    pub fn closest_node(&self, target: &Address) -> Option<Peer> {
        let peers = self.inner.lock().expect("routing table lock poisoned");
        peers
            .iter()
            .min_by(|a, b| cmp_towards(a, b, target))
            .cloned()
    }

    /// Up to `n` entries sorted ascending by distance to `target`.
    pub fn closest_nodes(&self, target: &Address, n: usize) -> Vec<Peer> {
        let peers = self.inner.lock().expect("routing table lock poisoned");
        let mut sorted: Vec<Peer> = peers.clone();
        sorted.sort_by(|a, b| cmp_towards(a, b, target));
        sorted.truncate(n);
        sorted
    }

    /// The current close group: the entries nearest to self.
    pub fn close_group(&self) -> Vec<Peer> {
        let peers = self.inner.lock().expect("routing table lock poisoned");
        close_group_of(&peers, &self.own_address, self.config.close_group_size)
    }

    /// True iff fewer than `n` entries lie strictly closer to `target`
    /// than this node does.
    pub fn is_in_range(&self, target: &Address, n: usize) -> bool {
        let peers = self.inner.lock().expect("routing table lock poisoned");
        let own_distance = self.own_address.xor_distance(target);
        let closer = peers
            .iter()
            .filter(|p| {
                distance_cmp(&p.address.xor_distance(target), &own_distance)
                    == std::cmp::Ordering::Less
            })
            .count();
        closer < n
    }

    /// True iff `a` and `b` both appear in this node's estimate of
    /// either's close group (self counts as a group candidate).
    pub fn confirm_group_members(&self, a: &Address, b: &Address) -> bool {
        let peers = self.inner.lock().expect("routing table lock poisoned");
        let estimate = |target: &Address| -> Vec<Address> {
            let mut addrs: Vec<Address> = peers.iter().map(|p| p.address).collect();
            addrs.push(self.own_address);
            addrs.sort_by(|x, y| {
                distance_cmp(&x.xor_distance(target), &y.xor_distance(target))
                    .then_with(|| x.cmp(y))
            });
            addrs.truncate(self.config.close_group_size);
            addrs
        };
        let group_of_a = estimate(a);
        if group_of_a.contains(a) && group_of_a.contains(b) {
            return true;
        }
        let group_of_b = estimate(b);
        group_of_b.contains(a) && group_of_b.contains(b)
    }

    /// Drain the table, returning all entries. Used when re-joining with a
    /// stale neighbour set.
    pub fn drain(&self) -> Vec<Peer> {
        let drained = {
            let mut peers = self.inner.lock().expect("routing table lock poisoned");
            std::mem::take(&mut *peers)
        };
        if !drained.is_empty() {
            self.fire(Notifications {
                removed: None,
                close_group: Some(Vec::new()),
                status: Some(0),
            });
        }
        drained
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("own_address", &self.own_address)
            .field("len", &self.len())
            .finish()
    }
}

/// Total order on peers by distance to `target`, address as tiebreak.
/// Distances from a fixed target are injective, so the tiebreak only
/// guards determinism.
fn cmp_towards(a: &Peer, b: &Peer, target: &Address) -> std::cmp::Ordering {
    distance_cmp(&a.address.xor_distance(target), &b.address.xor_distance(target))
        .then_with(|| a.address.cmp(&b.address))
}

fn close_group_of(peers: &[Peer], own: &Address, n: usize) -> Vec<Peer> {
    let mut sorted: Vec<Peer> = peers.to_vec();
    sorted.sort_by(|a, b| cmp_towards(a, b, own));
    sorted.truncate(n);
    sorted
}

fn group_addresses(group: &[Peer]) -> Vec<Address> {
    group.iter().map(|p| p.address).collect()
}
