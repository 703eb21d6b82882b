//! # Kademlia node
//!
//! This crate implements a peer of a Kademlia distributed hash table: a
//! 160-bit XOR keyspace, a routing table whose buckets split dynamically
//! around the local id, round-based iterative lookups and a key/value store
//! whose replicas expire unless they are periodically republished.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the transport-agnostic Kademlia logic, including identifiers,
//!   the routing table, the lookup shortlist and the [`DhtNode`] state machine.
//! - [`storage`]: original and replica maps plus the republish/expiry task.
//! - [`config`]: the [`DhtConfig`] tunables and their JSON form.
//! - [`net`]: a TCP based [`DhtNetwork`] implementation.
//! - [`protocol`]: the JSON serialisable wire messages exchanged between peers.
//! - [`framing`]: helpers for length-prefixed frames.
//! - [`server`]: the accept loop answering inbound RPCs.
//! - [`shell`]: the line-oriented administrative shell used by the binary.
//!
//! ## Getting started
//!
//! Bind a listener, derive the local [`Contact`] from the bound address,
//! build a [`Node`] on a [`TcpNetwork`] and serve it:
//!
//! ```no_run
//! use anyhow::Result;
//! use kademlia_node::{Contact, DhtConfig, Node, RpcServer, TcpNetwork};
//! use tokio::net::TcpListener;
//!
//! # async fn launch() -> Result<()> {
//! let config = DhtConfig::default();
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let contact = Contact::from_address(listener.local_addr()?, config.id_bits);
//!
//! let node = Node::new(contact.clone(), TcpNetwork::new(contact), config);
//! let server = RpcServer::spawn(node.clone(), listener)?;
//! node.start().await;
//!
//! node.bootstrap_address("127.0.0.1:4000".parse()?).await;
//! let key = node.derive_key("greeting");
//! node.iterative_store(key, "hello".to_string()).await;
//! # server.shutdown().await;
//! # node.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together behind a small
//! command line and an interactive shell.

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod net;
pub mod protocol;
pub mod server;
pub mod shell;
pub mod storage;

pub use config::DhtConfig;
pub use crate::core::{
    xor_distance, Admission, Contact, DhtNetwork, DhtNode, Distance, FindValueResult, KBucket,
    Key, Node, NodeId, RoutingTable, Shortlist, ValueLookup, ID_BITS, ID_BYTES,
};
pub use error::{ConfigError, ParseIdError, ProtocolError, ShellParseError};
pub use net::TcpNetwork;
pub use server::{handle_connection, RpcServer};
pub use shell::{Shell, ShellCommand};
pub use storage::{RepublishReport, Republisher, Storage, StorageSnapshot};
