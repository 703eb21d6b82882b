#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};

use kademlia_node::{Contact, DhtConfig, DhtNetwork, FindValueResult, Key, Node, NodeId};

/// In-memory transport: RPCs are routed straight into the target's handlers.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    stores: Arc<Mutex<Vec<(Contact, Key, String)>>>,
    pings: Arc<Mutex<Vec<NodeId>>>,
    find_nodes: Arc<Mutex<Vec<(NodeId, Instant)>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            stores: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
            find_nodes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub async fn store_calls(&self) -> Vec<(Contact, Key, String)> {
        let stores = self.stores.lock().await;
        stores.clone()
    }

    pub async fn clear_store_calls(&self) {
        self.stores.lock().await.clear();
    }

    pub async fn ping_calls(&self) -> Vec<NodeId> {
        let calls = self.pings.lock().await;
        calls.clone()
    }

    /// Every FIND_NODE sent, with the instant it was dispatched.
    pub async fn find_node_calls(&self) -> Vec<(NodeId, Instant)> {
        let calls = self.find_nodes.lock().await;
        calls.clone()
    }

    async fn peer(&self, to: &Contact) -> Result<Node<TestNetwork>> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        self.registry
            .get(&to.id)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, Node<TestNetwork>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Node<TestNetwork>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.contact().id, node.clone());
    }

    pub async fn unregister(&self, id: &NodeId) {
        self.peers.write().await.remove(id);
    }

    pub async fn get(&self, id: &NodeId) -> Option<Node<TestNetwork>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn ping(&self, to: &Contact) -> Result<Contact> {
        {
            let mut calls = self.pings.lock().await;
            calls.push(to.id);
        }
        let peer = self.peer(to).await?;
        Ok(peer.handle_ping(&self.self_contact).await)
    }

    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<bool> {
        {
            let mut stores = self.stores.lock().await;
            stores.push((to.clone(), key, value.clone()));
        }
        let peer = self.peer(to).await?;
        Ok(peer
            .handle_store_request(&self.self_contact, key, value)
            .await)
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        {
            let mut calls = self.find_nodes.lock().await;
            calls.push((to.id, Instant::now()));
        }
        let peer = self.peer(to).await?;
        Ok(peer
            .handle_find_node_request(&self.self_contact, target)
            .await)
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResult> {
        let peer = self.peer(to).await?;
        Ok(peer
            .handle_find_value_request(&self.self_contact, key)
            .await)
    }
}

impl TestNetwork {
    async fn should_fail(&self, node: &NodeId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = {
            let latencies = self.latencies.lock().await;
            latencies.get(node).copied()
        };
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }
}

pub struct TestNode {
    pub node: Node<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize, alpha: usize) -> Self {
        let config = DhtConfig {
            k,
            alpha,
            ..DhtConfig::default()
        };
        Self::with_config(registry, index, config).await
    }

    pub async fn with_config(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::with_contact(registry, make_contact(index), config).await
    }

    pub async fn with_contact(
        registry: Arc<NetworkRegistry>,
        contact: Contact,
        config: DhtConfig,
    ) -> Self {
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let node = Node::new(contact, network.clone(), config);
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.contact()
    }

    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }
}

/// An id whose first four bytes are `index`, big-endian.
pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 20];
    id[..4].copy_from_slice(&index.to_be_bytes());
    NodeId(id)
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(
        make_node_id(index),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        (index % 60_000) as u16 + 1024,
    )
}
