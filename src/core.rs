//! Core DHT logic: a transport-agnostic Kademlia node.
//!
//! This module contains the fundamental building blocks of the DHT:
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], SHA-1 derivation
//! - **Distance Metrics**: [`xor_distance`] and the ordered [`Distance`]
//! - **Routing**: [`KBucket`] ranges that split around the local id, [`RoutingTable`]
//! - **Lookups**: the per-lookup [`Shortlist`] and the round-based iterative procedures
//! - **Node State Machine**: [`DhtNode`] and its shareable [`Node`] handle

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use ethereum_types::U256;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::error::ParseIdError;
use crate::storage::{RepublishReport, Republisher, Storage, StorageSnapshot};

// ============================================================================
// Identifiers
// ============================================================================

/// Width of an identifier in bytes.
pub const ID_BYTES: usize = 20;

/// Width of the full identifier space in bits.
pub const ID_BITS: usize = ID_BYTES * 8;

/// A 160-bit identifier for DHT nodes, stored big-endian.
///
/// Byte-wise ordering equals numeric ordering, so the derived `Ord` can be
/// used directly for bucket range comparisons.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; ID_BYTES]);

/// Keys share the identifier space with nodes.
pub type Key = NodeId;

impl NodeId {
    /// Derive an identifier by hashing arbitrary input with SHA-1.
    pub fn from_hashed(data: impl AsRef<[u8]>) -> Self {
        let digest = Sha1::digest(data.as_ref());
        let mut out = [0u8; ID_BYTES];
        out.copy_from_slice(&digest);
        NodeId(out)
    }

    /// Clear every bit above `id_bits`, so the id lies in `[0, 2^id_bits)`.
    pub fn masked(mut self, id_bits: usize) -> Self {
        let clear = ID_BITS.saturating_sub(id_bits);
        for bit in 0..clear {
            self.0[bit / 8] &= !(0x80u8 >> (bit % 8));
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        xor_distance(self, other)
    }

    /// Short form for logs, e.g. `ab12cd34…ef90a1b2`.
    pub fn short_hex(&self) -> String {
        format!(
            "{}…{}",
            hex::encode(&self.0[..4]),
            hex::encode(&self.0[ID_BYTES - 4..])
        )
    }

    fn to_u256(self) -> U256 {
        U256::from_big_endian(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short_hex())
    }
}

impl FromStr for NodeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.len() != ID_BYTES * 2 {
            return Err(ParseIdError::Length {
                expected: ID_BYTES * 2,
                got: digits.len(),
            });
        }
        let mut out = [0u8; ID_BYTES];
        hex::decode_to_slice(digits, &mut out)?;
        Ok(NodeId(out))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// XOR distance between two identifiers, ordered as an unsigned integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);
    pub const MAX: Distance = Distance([0xffu8; ID_BYTES]);
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Compute the XOR distance between two node IDs.
///
/// # Properties
/// - `xor_distance(a, a) == Distance::ZERO`
/// - `xor_distance(a, b) == xor_distance(b, a)`
/// - distinct ids are at distinct distances from any fixed target
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_BYTES];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    Distance(out)
}

// ============================================================================
// Contacts
// ============================================================================

/// Another DHT node: its identifier and where to reach it.
///
/// Identity is the id alone; a contact seen again under a new address
/// replaces the stored one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "nodeId")]
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl Contact {
    pub fn new(id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self { id, ip, port }
    }

    /// Build a contact whose id is the hash of its `ip:port` form.
    pub fn from_address(addr: SocketAddr, id_bits: usize) -> Self {
        Self {
            id: NodeId::from_hashed(addr.to_string()).masked(id_bits),
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short_hex(), self.socket_addr())
    }
}

// ============================================================================
// K-Buckets
// ============================================================================

/// A capacity-bounded bucket covering the half-open id range `[from, to)`.
///
/// Bounds are 256-bit so the exclusive upper end of the keyspace, `2^160`,
/// is representable. Contacts are kept oldest first, most recently seen last.
#[derive(Debug, Clone)]
pub struct KBucket {
    range_from: U256,
    range_to: U256,
    capacity: usize,
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new(range_from: U256, range_to: U256, capacity: usize) -> Self {
        Self {
            range_from,
            range_to,
            capacity,
            contacts: Vec::with_capacity(capacity),
        }
    }

    pub fn range_from(&self) -> U256 {
        self.range_from
    }

    pub fn range_to(&self) -> U256 {
        self.range_to
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Add or refresh a contact.
    ///
    /// - a known id moves to the most-recently-seen end, taking the new address
    /// - an unknown id is appended while there is room
    /// - returns `false` when the bucket is full
    pub fn add(&mut self, contact: Contact) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return true;
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push(contact);
            true
        } else {
            false
        }
    }

    /// Half-open membership test.
    pub fn in_range(&self, id: &NodeId) -> bool {
        let value = id.to_u256();
        self.range_from <= value && value < self.range_to
    }

    /// A bucket narrower than two ids cannot be halved.
    fn can_split(&self) -> bool {
        self.range_to - self.range_from >= U256::from(2u64)
    }

    /// Halve the range at its midpoint and redistribute the contacts,
    /// preserving their recency order.
    pub fn split(self) -> (KBucket, KBucket) {
        let midpoint = (self.range_from + self.range_to) / U256::from(2u64);
        let mut left = KBucket::new(self.range_from, midpoint, self.capacity);
        let mut right = KBucket::new(midpoint, self.range_to, self.capacity);
        for contact in self.contacts {
            if left.in_range(&contact.id) {
                left.add(contact);
            } else {
                right.add(contact);
            }
        }
        (left, right)
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// What happened to a contact offered to the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted or refreshed.
    Added,
    /// The contact is the local node.
    RejectedSelf,
    /// Its bucket is full and does not cover the local node.
    Dropped,
    /// The id lies outside the configured keyspace.
    OutOfRange,
}

/// Kademlia routing table made of contiguous, ascending [`KBucket`]s.
///
/// It starts as one bucket spanning the keyspace. Only the bucket covering
/// the local id is ever split, so resolution grows around "self".
#[derive(Debug)]
pub struct RoutingTable {
    /// This node's ID.
    self_id: NodeId,
    /// Maximum contacts per bucket.
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a routing table over the full 160-bit keyspace.
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self::with_id_bits(self_id, k, ID_BITS)
    }

    /// Create a routing table over `[0, 2^id_bits)`.
    pub fn with_id_bits(self_id: NodeId, k: usize, id_bits: usize) -> Self {
        let keyspace_end = U256::one() << id_bits.min(ID_BITS);
        Self {
            self_id,
            k,
            buckets: vec![KBucket::new(U256::zero(), keyspace_end, k)],
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// First bucket, in ascending order, whose upper bound exceeds `id`.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let value = id.to_u256();
        self.buckets.iter().position(|b| value < b.range_to)
    }

    /// Offer a contact to the table.
    ///
    /// A full bucket covering the local id is split and the insert retried;
    /// any other full bucket drops the newcomer.
    pub fn add_contact(&mut self, contact: Contact) -> Admission {
        if contact.id == self.self_id {
            warn!("refusing to add self to routing table");
            return Admission::RejectedSelf;
        }

        loop {
            let Some(idx) = self.bucket_index(&contact.id) else {
                warn!(peer = %contact.id, "contact outside keyspace");
                return Admission::OutOfRange;
            };

            if self.buckets[idx].add(contact.clone()) {
                return Admission::Added;
            }

            let bucket = &self.buckets[idx];
            if !bucket.in_range(&self.self_id) || !bucket.can_split() {
                debug!(peer = %contact.id, "bucket full, contact dropped");
                return Admission::Dropped;
            }

            let (left, right) = self.buckets.remove(idx).split();
            self.buckets.insert(idx, right);
            self.buckets.insert(idx, left);
            debug!(buckets = self.buckets.len(), "split bucket covering self");
        }
    }

    /// Up to `count` contacts sorted by ascending XOR distance to `target`.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all = self.all_contacts();
        all.sort_by_key(|c| xor_distance(&c.id, target));
        all.truncate(count);
        all
    }

    /// The `k` closest contacts to `target`.
    pub fn closest(&self, target: &NodeId) -> Vec<Contact> {
        self.find_closest(target, self.k)
    }

    /// Every contact, in bucket order.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Shortlist
// ============================================================================

#[derive(Debug, Clone)]
struct ShortlistEntry {
    contact: Contact,
    distance: Distance,
    queried: bool,
}

/// Scratch state of one iterative lookup.
///
/// Tracks every candidate seen so far, its distance to the target (computed
/// once on insertion) and whether it has been queried. The local node is
/// never a member.
#[derive(Debug)]
pub struct Shortlist {
    target: NodeId,
    self_id: NodeId,
    nodes: std::collections::HashMap<NodeId, ShortlistEntry>,
}

impl Shortlist {
    pub fn new(target: NodeId, self_id: NodeId) -> Self {
        Self {
            target,
            self_id,
            nodes: std::collections::HashMap::new(),
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Insert a candidate. Returns `true` only if it was not known before.
    pub fn add(&mut self, contact: Contact) -> bool {
        if contact.id == self.self_id {
            debug!(lookup = %self.target, "ignoring self as lookup candidate");
            return false;
        }
        if self.nodes.contains_key(&contact.id) {
            return false;
        }
        let distance = xor_distance(&contact.id, &self.target);
        self.nodes.insert(
            contact.id,
            ShortlistEntry {
                contact,
                distance,
                queried: false,
            },
        );
        true
    }

    /// Insert many candidates. Returns `true` if at least one was new.
    pub fn add_many(&mut self, contacts: impl IntoIterator<Item = Contact>) -> bool {
        let mut any_new = false;
        for contact in contacts {
            any_new |= self.add(contact);
        }
        any_new
    }

    /// Up to `count` unqueried candidates, nearest first.
    pub fn nodes_to_query(&self, count: usize) -> Vec<Contact> {
        self.sorted()
            .into_iter()
            .filter(|entry| !entry.queried)
            .take(count)
            .map(|entry| entry.contact.clone())
            .collect()
    }

    /// Flag a candidate as queried. Unknown contacts are ignored.
    pub fn mark_as_queried(&mut self, contact: &Contact) {
        if let Some(entry) = self.nodes.get_mut(&contact.id) {
            entry.queried = true;
        }
    }

    /// The `count` nearest members, queried or not.
    pub fn final_results(&self, count: usize) -> Vec<Contact> {
        self.sorted()
            .into_iter()
            .take(count)
            .map(|entry| entry.contact.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn sorted(&self) -> Vec<&ShortlistEntry> {
        let mut entries: Vec<&ShortlistEntry> = self.nodes.values().collect();
        entries.sort_by_key(|entry| entry.distance);
        entries
    }
}

// ============================================================================
// Network Trait
// ============================================================================

/// Reply to a FIND_VALUE RPC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResult {
    /// The peer holds the value.
    Found(String),
    /// The peer does not; these are its closest contacts to the key.
    Nodes(Vec<Contact>),
}

/// Network abstraction for DHT RPC operations.
///
/// This trait abstracts the transport layer, allowing the core DHT logic to work
/// with different network implementations (e.g., TCP, mock for testing).
/// Timeouts are applied by the caller, not the implementation.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Send a PING RPC. Returns the responder's own contact.
    async fn ping(&self, to: &Contact) -> Result<Contact>;

    /// Send a STORE RPC. Returns the peer's acknowledgement.
    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<bool>;

    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Send a FIND_VALUE RPC to retrieve a value or get closer contacts.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResult>;
}

// ============================================================================
// DHT Node
// ============================================================================

/// Result of an iterative value lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueLookup {
    Found(String),
    /// Not found; the closest contacts the lookup converged on.
    NotFound(Vec<Contact>),
}

impl ValueLookup {
    pub fn value(&self) -> Option<&str> {
        match self {
            ValueLookup::Found(value) => Some(value),
            ValueLookup::NotFound(_) => None,
        }
    }

    pub fn into_value(self) -> Option<String> {
        match self {
            ValueLookup::Found(value) => Some(value),
            ValueLookup::NotFound(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum LookupKind {
    Node,
    Value,
}

enum RoundReply {
    Contacts(Vec<Contact>),
    Value(String),
}

/// Republishes originals through the owning node without keeping it alive.
struct NodeRepublisher<N: DhtNetwork> {
    node: Weak<DhtNode<N>>,
}

#[async_trait]
impl<N: DhtNetwork> Republisher for NodeRepublisher<N> {
    async fn republish(&self, key: Key, value: String) -> Result<()> {
        let node = self
            .node
            .upgrade()
            .ok_or_else(|| anyhow!("node has shut down"))?;
        let (targets, stored) = node.replicate(key, value).await;
        if targets > 0 && stored == 0 {
            bail!("none of {targets} closest nodes accepted the value");
        }
        Ok(())
    }
}

/// Kademlia node: one routing table, one store, one transport.
///
/// A `DhtNode` owns a routing table, a TTL-bound store, and the
/// [`DhtNetwork`] transport used to send RPCs to other peers. The type is
/// generic over the network layer so tests can use an in-memory mock while
/// production uses [`crate::net::TcpNetwork`].
///
/// # Key Methods
///
/// * [`observe_contact`](Self::observe_contact) - Admit a peer into the routing table
/// * [`iterative_find_node`](Self::iterative_find_node) - Locate the k closest nodes to an id
/// * [`iterative_find_value`](Self::iterative_find_value) - Locate a value
/// * [`iterative_store`](Self::iterative_store) - Publish a value
/// * [`bootstrap`](Self::bootstrap) - Join through a known peer
/// * `handle_*` - Answer inbound RPCs
pub struct DhtNode<N: DhtNetwork> {
    /// This node's unique identifier.
    pub id: NodeId,
    /// Contact info for this node.
    pub self_contact: Contact,
    config: DhtConfig,
    routing: Mutex<RoutingTable>,
    storage: Arc<Storage>,
    network: Arc<N>,
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a node. Storage maintenance is not started yet.
    ///
    /// A configuration that fails [`DhtConfig::validate`] is logged and
    /// [`clamped`](DhtConfig::clamped) rather than rejected.
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Arc<Self> {
        if let Err(err) = config.validate() {
            warn!("invalid configuration, clamping: {err}");
        }
        let config = config.clamped();
        Arc::new_cyclic(|weak: &Weak<DhtNode<N>>| {
            let republisher = Arc::new(NodeRepublisher { node: weak.clone() });
            let storage = Storage::new(
                config.replica_ttl(),
                config.republish_interval(),
                republisher,
            );
            Self {
                id: self_contact.id,
                routing: Mutex::new(RoutingTable::with_id_bits(
                    self_contact.id,
                    config.k,
                    config.id_bits,
                )),
                self_contact,
                storage: Arc::new(storage),
                network: Arc::new(network),
                config,
            }
        })
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Start background storage maintenance.
    pub async fn start(&self) {
        self.storage.start().await;
    }

    /// Stop background storage maintenance; it will not fire after this returns.
    pub async fn shutdown(&self) {
        self.storage.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.storage.is_running().await
    }

    /// Admit a contact into the routing table.
    pub async fn observe_contact(&self, contact: Contact) -> Admission {
        let mut rt = self.routing.lock().await;
        rt.add_contact(contact)
    }

    /// Handle an incoming PING RPC. Returns our own contact.
    pub async fn handle_ping(&self, from: &Contact) -> Contact {
        self.observe_contact(from.clone()).await;
        debug!(peer = %from.id, "ping");
        self.self_contact.clone()
    }

    /// Handle an incoming STORE RPC by caching a replica.
    pub async fn handle_store_request(&self, from: &Contact, key: Key, value: String) -> bool {
        self.observe_contact(from.clone()).await;
        debug!(peer = %from.id, key = %key, "store");
        self.storage.set_replica(key, value).await;
        true
    }

    /// Handle an incoming FIND_NODE RPC request.
    ///
    /// Returns the k closest contacts to the target ID from our routing table.
    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.observe_contact(from.clone()).await;
        debug!(peer = %from.id, lookup = %target, "find_node");
        let rt = self.routing.lock().await;
        rt.closest(&target)
    }

    /// Handle an incoming FIND_VALUE RPC request.
    ///
    /// If we hold a live replica, returns it. Otherwise, returns the k closest
    /// contacts to the key for the requester to continue the lookup.
    pub async fn handle_find_value_request(&self, from: &Contact, key: Key) -> FindValueResult {
        self.observe_contact(from.clone()).await;
        debug!(peer = %from.id, key = %key, "find_value");
        if let Some(value) = self.storage.get(&key).await {
            return FindValueResult::Found(value);
        }
        let rt = self.routing.lock().await;
        FindValueResult::Nodes(rt.closest(&key))
    }

    /// Run one outbound RPC under the configured timeout.
    ///
    /// Failure and timeout are logged and yield `None`.
    async fn timed<T, F>(&self, to: &Contact, rpc: &'static str, request: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.config.rpc_timeout(), request).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(err)) => {
                debug!(peer = %to.id, addr = %to.socket_addr(), rpc, "rpc failed: {err:#}");
                None
            }
            Err(_) => {
                debug!(peer = %to.id, addr = %to.socket_addr(), rpc, "rpc timed out");
                None
            }
        }
    }

    /// Like [`timed`](Self::timed), refreshing the peer in the routing table on success.
    async fn call<T, F>(&self, to: &Contact, rpc: &'static str, request: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let reply = self.timed(to, rpc, request).await?;
        self.observe_contact(to.clone()).await;
        Some(reply)
    }

    /// Ping a contact. Returns the contact it reports for itself.
    ///
    /// The responder is admitted under the identity it reports, which may
    /// differ from the one we guessed for its address.
    pub async fn ping(&self, to: &Contact) -> Option<Contact> {
        let reported = self.timed(to, "ping", self.network.ping(to)).await?;
        self.observe_contact(reported.clone()).await;
        Some(reported)
    }

    async fn query(&self, to: &Contact, target: NodeId, kind: LookupKind) -> Option<RoundReply> {
        match kind {
            LookupKind::Node => self
                .call(to, "find_node", self.network.find_node(to, target))
                .await
                .map(RoundReply::Contacts),
            LookupKind::Value => self
                .call(to, "find_value", self.network.find_value(to, target))
                .await
                .map(|reply| match reply {
                    FindValueResult::Found(value) => RoundReply::Value(value),
                    FindValueResult::Nodes(nodes) => RoundReply::Contacts(nodes),
                }),
        }
    }

    /// The round-based lookup shared by FIND_NODE and FIND_VALUE.
    ///
    /// Each round queries up to `alpha` of the nearest unqueried candidates
    /// concurrently and waits for all of them. The lookup ends when no
    /// candidate is left, when a round discovers nothing new, when the round
    /// cap is hit, or (value lookups only) as soon as a peer returns the value.
    async fn lookup(&self, target: NodeId, kind: LookupKind) -> ValueLookup {
        let k = self.config.k;
        let mut shortlist = Shortlist::new(target, self.id);
        {
            let rt = self.routing.lock().await;
            shortlist.add_many(rt.find_closest(&target, k));
        }

        for round in 1..=self.config.max_lookup_rounds {
            let candidates = shortlist.nodes_to_query(self.config.alpha);
            if candidates.is_empty() {
                debug!(lookup = %target, round, "lookup exhausted candidates");
                break;
            }
            for contact in &candidates {
                shortlist.mark_as_queried(contact);
            }

            let mut in_flight: FuturesUnordered<_> = candidates
                .iter()
                .map(|contact| self.query(contact, target, kind))
                .collect();

            let mut discovered = false;
            while let Some(reply) = in_flight.next().await {
                match reply {
                    Some(RoundReply::Value(value)) => {
                        debug!(lookup = %target, round, "value found");
                        return ValueLookup::Found(value);
                    }
                    Some(RoundReply::Contacts(contacts)) => {
                        discovered |= shortlist.add_many(contacts);
                    }
                    None => {}
                }
            }

            if !discovered {
                debug!(lookup = %target, round, "lookup converged");
                break;
            }
        }

        ValueLookup::NotFound(shortlist.final_results(k))
    }

    /// Perform an iterative FIND_NODE lookup for the target ID.
    ///
    /// Returns up to k contacts, nearest first. Unresponsive peers are skipped.
    pub async fn iterative_find_node(&self, target: NodeId) -> Vec<Contact> {
        match self.lookup(target, LookupKind::Node).await {
            ValueLookup::NotFound(closest) => closest,
            // FIND_NODE replies never carry a value.
            ValueLookup::Found(_) => Vec::new(),
        }
    }

    /// Perform an iterative FIND_VALUE lookup for the key.
    pub async fn iterative_find_value(&self, key: Key) -> ValueLookup {
        self.lookup(key, LookupKind::Value).await
    }

    /// Send the value to the k closest nodes to its key, concurrently.
    ///
    /// Returns how many targets were found and how many acknowledged.
    /// Individual failures are ignored.
    async fn replicate(&self, key: Key, value: String) -> (usize, usize) {
        let closest = self.iterative_find_node(key).await;
        if closest.is_empty() {
            debug!(key = %key, "no nodes to replicate to");
            return (0, 0);
        }

        let acks = join_all(closest.iter().map(|contact| {
            self.call(
                contact,
                "store",
                self.network.store(contact, key, value.clone()),
            )
        }))
        .await;
        let stored = acks.into_iter().filter(|ack| *ack == Some(true)).count();
        debug!(key = %key, targets = closest.len(), stored, "replicated value");
        (closest.len(), stored)
    }

    /// Publish a value: keep it as an original locally, then store it on
    /// the k closest nodes. Returns how many peers acknowledged.
    pub async fn iterative_store(&self, key: Key, value: String) -> usize {
        self.storage.set_original(key, value.clone()).await;
        let (_, stored) = self.replicate(key, value).await;
        info!(key = %key, stored, "published value");
        stored
    }

    /// Join the network through a known peer.
    ///
    /// The peer is admitted directly, then a lookup for our own id fills the
    /// routing table and announces us to the nodes around us. Returns the
    /// result of that self-lookup.
    pub async fn bootstrap(&self, contact: Contact) -> Vec<Contact> {
        if contact.id == self.id {
            warn!("refusing to bootstrap against self");
            return Vec::new();
        }
        info!(peer = %contact, "bootstrapping");
        self.observe_contact(contact).await;
        let found = self.iterative_find_node(self.id).await;
        let known = self.routing.lock().await.len();
        info!(found = found.len(), known, "bootstrap complete");
        found
    }

    /// Bootstrap through a peer known only by address.
    ///
    /// The peer is pinged first to learn its real id; if it does not answer,
    /// the id is derived from the address.
    pub async fn bootstrap_address(&self, addr: SocketAddr) -> Vec<Contact> {
        let guess = Contact::from_address(addr, self.config.id_bits);
        let seed = self.ping(&guess).await.unwrap_or(guess);
        self.bootstrap(seed).await
    }

    /// Read a value from the local replica store only.
    pub async fn local_value(&self, key: &Key) -> Option<String> {
        self.storage.get(key).await
    }

    /// Read a value locally, falling back to an iterative network lookup.
    pub async fn get(&self, key: Key) -> Option<String> {
        if let Some(value) = self.local_value(&key).await {
            return Some(value);
        }
        self.iterative_find_value(key).await.into_value()
    }

    /// Every contact in the routing table.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.routing.lock().await.all_contacts()
    }

    /// Copy of the original and replica stores.
    pub async fn storage_snapshot(&self) -> StorageSnapshot {
        self.storage.snapshot().await
    }

    /// Republish every original right now.
    pub async fn force_republish(&self) -> RepublishReport {
        self.storage.force_republish().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node (Public API)
// ─────────────────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to a [`DhtNode`].
///
/// This is what the RPC server, the shell and tests hold on to.
///
/// # Example
///
/// ```ignore
/// let node = Node::new(self_contact, network, DhtConfig::default());
/// node.start().await;
/// node.bootstrap(seed_contact).await;
/// let closest = node.iterative_find_node(target_id).await;
/// ```
pub struct Node<N: DhtNetwork> {
    inner: Arc<DhtNode<N>>,
}

impl<N: DhtNetwork> Clone for Node<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtNetwork> Node<N> {
    /// Create a new node with the given contact, transport and configuration.
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Self {
        Self {
            inner: DhtNode::new(self_contact, network, config),
        }
    }

    /// Get this node's contact information.
    pub fn contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    /// Get this node's unique identifier.
    pub fn node_id(&self) -> NodeId {
        self.inner.id
    }

    pub fn config(&self) -> &DhtConfig {
        self.inner.config()
    }

    /// Hash a user-facing key string into the keyspace.
    pub fn derive_key(&self, raw: &str) -> Key {
        NodeId::from_hashed(raw).masked(self.inner.config.id_bits)
    }

    pub async fn start(&self) {
        self.inner.start().await;
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub async fn is_running(&self) -> bool {
        self.inner.is_running().await
    }

    /// Observe a contact and update the routing table.
    pub async fn observe_contact(&self, contact: Contact) -> Admission {
        self.inner.observe_contact(contact).await
    }

    pub async fn handle_ping(&self, from: &Contact) -> Contact {
        self.inner.handle_ping(from).await
    }

    pub async fn handle_store_request(&self, from: &Contact, key: Key, value: String) -> bool {
        self.inner.handle_store_request(from, key, value).await
    }

    pub async fn handle_find_node_request(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.inner.handle_find_node_request(from, target).await
    }

    pub async fn handle_find_value_request(&self, from: &Contact, key: Key) -> FindValueResult {
        self.inner.handle_find_value_request(from, key).await
    }

    pub async fn ping(&self, to: &Contact) -> Option<Contact> {
        self.inner.ping(to).await
    }

    /// Perform an iterative lookup to find the k closest nodes to a target.
    pub async fn iterative_find_node(&self, target: NodeId) -> Vec<Contact> {
        self.inner.iterative_find_node(target).await
    }

    pub async fn iterative_find_value(&self, key: Key) -> ValueLookup {
        self.inner.iterative_find_value(key).await
    }

    pub async fn iterative_store(&self, key: Key, value: String) -> usize {
        self.inner.iterative_store(key, value).await
    }

    pub async fn bootstrap(&self, contact: Contact) -> Vec<Contact> {
        self.inner.bootstrap(contact).await
    }

    pub async fn bootstrap_address(&self, addr: SocketAddr) -> Vec<Contact> {
        self.inner.bootstrap_address(addr).await
    }

    pub async fn local_value(&self, key: &Key) -> Option<String> {
        self.inner.local_value(key).await
    }

    pub async fn get(&self, key: Key) -> Option<String> {
        self.inner.get(key).await
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.inner.contacts().await
    }

    pub async fn storage_snapshot(&self) -> StorageSnapshot {
        self.inner.storage_snapshot().await
    }

    pub async fn force_republish(&self) -> RepublishReport {
        self.inner.force_republish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut id = [0u8; ID_BYTES];
        id[0] = byte;
        NodeId(id)
    }

    fn contact(id: NodeId, port: u16) -> Contact {
        Contact::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn contact_byte(byte: u8) -> Contact {
        contact(id_with_first_byte(byte), 4000 + byte as u16)
    }

    fn full_range_bucket(capacity: usize) -> KBucket {
        KBucket::new(U256::zero(), U256::one() << ID_BITS, capacity)
    }

    fn ids(contacts: &[Contact]) -> Vec<u8> {
        contacts.iter().map(|c| c.id.0[0]).collect()
    }

    fn assert_table_invariants(table: &RoutingTable) {
        let buckets = table.buckets();
        assert_eq!(buckets.first().unwrap().range_from(), U256::zero());
        assert_eq!(buckets.last().unwrap().range_to(), U256::one() << ID_BITS);
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].range_to(), pair[1].range_from(), "ranges are contiguous");
        }
        let covering_self = buckets.iter().filter(|b| b.in_range(&table.self_id())).count();
        assert_eq!(covering_self, 1);
        for bucket in buckets {
            assert!(bucket.len() <= table.k());
            for c in bucket.contacts() {
                assert!(bucket.in_range(&c.id));
                assert_ne!(c.id, table.self_id());
            }
        }
    }

    #[test]
    fn xor_distance_of_complementary_ids_is_all_ones() {
        let a: NodeId = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap();
        let b: NodeId = "5555555555555555555555555555555555555555".parse().unwrap();
        assert_eq!(xor_distance(&a, &b), Distance::MAX);
        assert_eq!(xor_distance(&a, &a), Distance::ZERO);
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
    }

    #[test]
    fn distance_orders_numerically() {
        let mut smaller = [0u8; ID_BYTES];
        smaller[1] = 1;
        let mut larger = [0u8; ID_BYTES];
        larger[0] = 1;
        assert!(Distance(smaller) < Distance(larger));
    }

    #[test]
    fn node_id_text_round_trip_and_validation() {
        let id = NodeId::from_hashed("self");
        let text = id.to_string();
        assert_eq!(text.len(), 40);
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
        assert_eq!(format!("0x{text}").parse::<NodeId>().unwrap(), id);
        assert_eq!(
            "abcd".parse::<NodeId>(),
            Err(ParseIdError::Length {
                expected: 40,
                got: 4
            })
        );
        assert!(matches!(
            "zz".repeat(20).parse::<NodeId>(),
            Err(ParseIdError::Hex(_))
        ));
    }

    #[test]
    fn from_hashed_is_deterministic_sha1() {
        let id = NodeId::from_hashed("127.0.0.1:4000");
        assert_eq!(id, NodeId::from_hashed("127.0.0.1:4000"));
        assert_ne!(id, NodeId::from_hashed("127.0.0.1:4001"));
        // SHA-1("abc")
        assert_eq!(
            NodeId::from_hashed("abc").to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn masked_ids_fit_the_keyspace() {
        let id = NodeId([0xff; ID_BYTES]).masked(12);
        assert_eq!(id.0[0], 0);
        assert_eq!(id.0[ID_BYTES - 2], 0x0f);
        assert_eq!(id.0[ID_BYTES - 1], 0xff);
        assert!(id.0[..ID_BYTES - 2].iter().all(|b| *b == 0));
        assert_eq!(NodeId([0xff; ID_BYTES]).masked(ID_BITS), NodeId([0xff; ID_BYTES]));
    }

    #[test]
    fn contact_from_address_hashes_ip_and_port() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let c = Contact::from_address(addr, ID_BITS);
        assert_eq!(c.id, NodeId::from_hashed("127.0.0.1:4000"));
        assert_eq!(c.socket_addr(), addr);
    }

    #[test]
    fn contact_serializes_with_hex_node_id() {
        let c = contact_byte(0x01);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["nodeId"], serde_json::json!(c.id.to_string()));
        assert_eq!(json["ip"], "127.0.0.1");
        assert_eq!(json["port"], 4001);
    }

    #[test]
    fn bucket_refreshes_and_rejects_when_full() {
        let mut bucket = full_range_bucket(2);
        let a = contact_byte(0xA0);
        let b = contact_byte(0xB0);
        let c = contact_byte(0xC0);

        assert!(bucket.add(a.clone()));
        assert!(bucket.add(b.clone()));
        assert_eq!(ids(bucket.contacts()), vec![0xA0, 0xB0]);

        assert!(bucket.add(a.clone()));
        assert_eq!(ids(bucket.contacts()), vec![0xB0, 0xA0]);

        assert!(!bucket.add(c));
        assert_eq!(ids(bucket.contacts()), vec![0xB0, 0xA0]);
    }

    #[test]
    fn bucket_refresh_takes_latest_address() {
        let mut bucket = full_range_bucket(2);
        bucket.add(contact(id_with_first_byte(0x10), 5000));
        bucket.add(contact(id_with_first_byte(0x10), 6000));
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.contacts()[0].port, 6000);
    }

    #[test]
    fn bucket_split_redistributes_by_range() {
        let mut bucket = full_range_bucket(4);
        for byte in [0x10, 0x90, 0x20, 0xF0] {
            bucket.add(contact_byte(byte));
        }
        let (left, right) = bucket.split();
        assert_eq!(left.range_to(), U256::one() << (ID_BITS - 1));
        assert_eq!(left.range_to(), right.range_from());
        assert_eq!(ids(left.contacts()), vec![0x10, 0x20]);
        assert_eq!(ids(right.contacts()), vec![0x90, 0xF0]);
        assert!(left.in_range(&id_with_first_byte(0x7F)));
        assert!(!left.in_range(&id_with_first_byte(0x80)));
        assert!(right.in_range(&id_with_first_byte(0x80)));
    }

    #[test]
    fn routing_table_never_stores_self_or_duplicates() {
        let self_id = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(self_id, 4);
        assert_eq!(table.add_contact(contact(self_id, 1)), Admission::RejectedSelf);
        assert!(table.is_empty());

        let peer = contact_byte(0x42);
        assert_eq!(table.add_contact(peer.clone()), Admission::Added);
        assert_eq!(table.add_contact(peer), Admission::Added);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn routing_table_splits_only_the_bucket_covering_self() {
        let self_id = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(self_id, 2);

        table.add_contact(contact_byte(0x80));
        table.add_contact(contact_byte(0xC0));
        assert_eq!(table.buckets().len(), 1);

        // Full bucket covers self: split, then the low half takes 0x10.
        assert_eq!(table.add_contact(contact_byte(0x10)), Admission::Added);
        assert_eq!(table.buckets().len(), 2);

        // Upper half is full and does not cover self: dropped without a split.
        assert_eq!(table.add_contact(contact_byte(0xA0)), Admission::Dropped);
        assert_eq!(table.buckets().len(), 2);
        assert_eq!(table.len(), 3);
        assert_table_invariants(&table);
    }

    #[test]
    fn routing_table_keeps_invariants_under_many_inserts() {
        let self_id = NodeId::from_hashed("self");
        let mut table = RoutingTable::new(self_id, 3);
        for i in 0..500 {
            table.add_contact(contact(NodeId::from_hashed(format!("peer-{i}")), 1000 + i));
            assert_table_invariants(&table);
        }
        assert!(table.buckets().len() > 1);
    }

    #[test]
    fn find_closest_is_sorted_and_bounded() {
        let self_id = NodeId::from_hashed("self");
        let k = 5;
        let mut table = RoutingTable::new(self_id, k);
        for i in 0..10 {
            table.add_contact(contact(NodeId::from_hashed(format!("contact{i}")), 2000 + i));
        }
        let target = NodeId::from_hashed("target");

        let closest = table.find_closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(xor_distance(&pair[0].id, &target) < xor_distance(&pair[1].id, &target));
        }

        assert_eq!(table.closest(&target).len(), k);
        assert_eq!(table.find_closest(&target, 1_000).len(), table.len());
    }

    #[test]
    fn routing_table_respects_narrow_keyspace() {
        let self_id = NodeId::from_hashed("self").masked(8);
        let mut table = RoutingTable::with_id_bits(self_id, 2, 8);
        let outside = contact(id_with_first_byte(0x01), 1);
        assert_eq!(table.add_contact(outside), Admission::OutOfRange);

        let mut inside = self_id.0;
        inside[ID_BYTES - 1] ^= 0x01;
        assert_eq!(table.add_contact(contact(NodeId(inside), 2)), Admission::Added);
    }

    #[test]
    fn shortlist_selects_nearest_unqueried() {
        let target = id_with_first_byte(0x00);
        let self_id = id_with_first_byte(0xFF);
        let mut shortlist = Shortlist::new(target, self_id);
        let near = contact_byte(0x10);
        let mid = contact_byte(0x20);
        let far = contact_byte(0x30);
        assert!(shortlist.add_many(vec![far.clone(), near.clone(), mid.clone()]));

        let first = shortlist.nodes_to_query(2);
        assert_eq!(first, vec![near.clone(), mid.clone()]);
        for c in &first {
            shortlist.mark_as_queried(c);
        }
        assert_eq!(shortlist.nodes_to_query(2), vec![far.clone()]);

        shortlist.mark_as_queried(&far);
        shortlist.mark_as_queried(&contact_byte(0x77));
        assert!(shortlist.nodes_to_query(2).is_empty());
        assert_eq!(shortlist.final_results(10), vec![near, mid, far]);
    }

    #[test]
    fn shortlist_rejects_self_and_duplicates() {
        let target = id_with_first_byte(0x00);
        let self_contact = contact_byte(0x01);
        let mut shortlist = Shortlist::new(target, self_contact.id);

        assert!(!shortlist.add(self_contact));
        let peer = contact_byte(0x02);
        assert!(shortlist.add(peer.clone()));
        assert!(!shortlist.add(peer.clone()));
        assert!(!shortlist.add_many(vec![peer]));
        assert_eq!(shortlist.len(), 1);
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn shortlist_logs_self_reference() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let self_contact = contact_byte(0x01);
        let mut shortlist = Shortlist::new(id_with_first_byte(0x00), self_contact.id);
        tracing::subscriber::with_default(subscriber, || {
            assert!(!shortlist.add(self_contact.clone()));
            assert!(shortlist.add(contact_byte(0x02)));
        });

        let logs = capture.text();
        assert_eq!(logs.matches("ignoring self as lookup candidate").count(), 1);
        assert_eq!(shortlist.len(), 1);
    }

    #[test]
    fn shortlist_final_results_sorted_regardless_of_insertion_order() {
        let target = NodeId::from_hashed("target");
        let mut shortlist = Shortlist::new(target, NodeId::from_hashed("self"));
        for i in (0..30).rev() {
            shortlist.add(contact(NodeId::from_hashed(format!("n{i}")), 3000 + i));
        }
        let results = shortlist.final_results(8);
        assert_eq!(results.len(), 8);
        for pair in results.windows(2) {
            assert!(xor_distance(&pair[0].id, &target) < xor_distance(&pair[1].id, &target));
        }
    }
}
