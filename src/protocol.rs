//! DHT protocol message definitions.
//!
//! Every exchange is one [`Rpc`] request answered by one [`Response`]. Both are
//! JSON documents carried in length-prefixed frames (see [`crate::framing`]).
//! Requests always name their sender so the receiver can admit it into its
//! routing table.

use serde::{Deserialize, Serialize};

use crate::core::{Contact, FindValueResult, Key, NodeId};
use crate::error::ProtocolError;

/// A request envelope: who is asking, and what.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpc {
    /// The sender's contact information.
    pub from: Contact,
    #[serde(flatten)]
    pub kind: RpcKind,
}

/// The four Kademlia requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcKind {
    /// Liveness check. Answered with [`Response::Pong`].
    Ping,
    /// Cache a replica. Answered with [`Response::Stored`].
    Store { key: Key, value: String },
    /// Closest contacts to `target`. Answered with [`Response::Nodes`].
    FindNode { target: NodeId },
    /// A value, or the closest contacts to its key. Answered with [`Response::Value`].
    FindValue { key: Key },
}

impl RpcKind {
    pub fn name(&self) -> &'static str {
        match self {
            RpcKind::Ping => "ping",
            RpcKind::Store { .. } => "store",
            RpcKind::FindNode { .. } => "find_node",
            RpcKind::FindValue { .. } => "find_value",
        }
    }
}

/// A reply to an [`Rpc`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong {
        contact: Contact,
    },
    Stored {
        ok: bool,
    },
    Nodes {
        nodes: Vec<Contact>,
    },
    Value {
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        nodes: Vec<Contact>,
    },
    /// The request could not be decoded or served.
    Error {
        message: String,
    },
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Pong { .. } => "pong",
            Response::Stored { .. } => "stored",
            Response::Nodes { .. } => "nodes",
            Response::Value { .. } => "value",
            Response::Error { .. } => "error",
        }
    }

    /// Turn a remote error into [`ProtocolError::Remote`], pass everything else through.
    fn check(self) -> Result<Self, ProtocolError> {
        match self {
            Response::Error { message } => Err(ProtocolError::Remote { message }),
            other => Ok(other),
        }
    }

    pub fn into_pong(self) -> Result<Contact, ProtocolError> {
        match self.check()? {
            Response::Pong { contact } => Ok(contact),
            other => Err(unexpected("ping", &other)),
        }
    }

    pub fn into_stored(self) -> Result<bool, ProtocolError> {
        match self.check()? {
            Response::Stored { ok } => Ok(ok),
            other => Err(unexpected("store", &other)),
        }
    }

    pub fn into_nodes(self) -> Result<Vec<Contact>, ProtocolError> {
        match self.check()? {
            Response::Nodes { nodes } => Ok(nodes),
            other => Err(unexpected("find_node", &other)),
        }
    }

    pub fn into_find_value(self) -> Result<FindValueResult, ProtocolError> {
        match self.check()? {
            Response::Value {
                found: true,
                value: Some(value),
                ..
            } => Ok(FindValueResult::Found(value)),
            Response::Value { found: true, .. } => Err(ProtocolError::Remote {
                message: "value reported found but missing".to_string(),
            }),
            Response::Value { nodes, .. } => Ok(FindValueResult::Nodes(nodes)),
            other => Err(unexpected("find_value", &other)),
        }
    }
}

impl From<FindValueResult> for Response {
    fn from(result: FindValueResult) -> Self {
        match result {
            FindValueResult::Found(value) => Response::Value {
                found: true,
                value: Some(value),
                nodes: Vec::new(),
            },
            FindValueResult::Nodes(nodes) => Response::Value {
                found: false,
                value: None,
                nodes,
            },
        }
    }
}

fn unexpected(expected: &'static str, got: &Response) -> ProtocolError {
    ProtocolError::UnexpectedResponse {
        expected,
        got: got.name(),
    }
}
