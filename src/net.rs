//! Network implementation over plain TCP.
//!
//! This module provides the [`TcpNetwork`] implementation of the [`DhtNetwork`] trait.
//!
//! # Protocol
//!
//! Each RPC opens a fresh connection to the contact's `ip:port`, writes one
//! [`Rpc`] frame, reads one [`Response`] frame and closes. Frames are JSON
//! behind a `u32` little-endian length (see [`crate::framing`]). Timeouts are
//! applied by the caller in [`crate::core`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::core::{Contact, DhtNetwork, FindValueResult, Key, NodeId};
use crate::error::ProtocolError;
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Response, Rpc, RpcKind};

/// Network implementation using one TCP connection per request.
#[derive(Clone, Debug)]
pub struct TcpNetwork {
    /// Contact info for the local node (included in all RPC requests).
    pub self_contact: Contact,
}

impl TcpNetwork {
    pub fn new(self_contact: Contact) -> Self {
        Self { self_contact }
    }

    /// Send one request to `to` and wait for its single reply.
    async fn exchange(&self, to: &Contact, kind: RpcKind) -> Result<Response> {
        let addr = to.socket_addr();
        let rpc_name = kind.name();
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr} for {rpc_name}"))?;

        let request = Rpc {
            from: self.self_contact.clone(),
            kind,
        };
        let bytes = serde_json::to_vec(&request)?;
        write_frame(&mut stream, &bytes).await?;

        let reply = read_frame(&mut stream)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;
        let response: Response = serde_json::from_slice(&reply)
            .with_context(|| format!("decoding {rpc_name} reply from {addr}"))?;
        Ok(response)
    }
}

#[async_trait]
impl DhtNetwork for TcpNetwork {
    /// Send a PING RPC to check if a node is responsive.
    async fn ping(&self, to: &Contact) -> Result<Contact> {
        Ok(self.exchange(to, RpcKind::Ping).await?.into_pong()?)
    }

    /// Send a STORE RPC to store a key-value pair on a node.
    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<bool> {
        Ok(self
            .exchange(to, RpcKind::Store { key, value })
            .await?
            .into_stored()?)
    }

    /// Send a FIND_NODE RPC to find contacts near a target ID.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        Ok(self
            .exchange(to, RpcKind::FindNode { target })
            .await?
            .into_nodes()?)
    }

    /// Send a FIND_VALUE RPC to retrieve a value or get closer contacts.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueResult> {
        Ok(self
            .exchange(to, RpcKind::FindValue { key })
            .await?
            .into_find_value()?)
    }
}
