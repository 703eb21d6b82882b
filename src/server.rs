//! Inbound side of the TCP transport.
//!
//! [`RpcServer`] accepts connections and hands each one to
//! [`handle_connection`], which serves exactly one request/response exchange.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::core::{DhtNetwork, Node};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Response, Rpc, RpcKind};

/// Serve a single request on an accepted stream.
///
/// Reading the request is bounded by the node's RPC timeout. A request that
/// does not decode is answered with [`Response::Error`] rather than dropped,
/// and never reaches the node.
pub async fn handle_connection<N, S>(node: Node<N>, mut stream: S) -> Result<()>
where
    N: DhtNetwork,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read = timeout(node.config().rpc_timeout(), read_frame(&mut stream)).await;
    let bytes = match read {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            debug!("peer did not send a request in time");
            return Ok(());
        }
    };

    let response = match serde_json::from_slice::<Rpc>(&bytes) {
        Ok(rpc) => dispatch(&node, rpc).await,
        Err(err) => {
            warn!("malformed request: {err}");
            Response::Error {
                message: format!("malformed request: {err}"),
            }
        }
    };

    let reply_bytes = serde_json::to_vec(&response)?;
    write_frame(&mut stream, &reply_bytes).await?;
    Ok(())
}

/// Route a decoded request to the matching node handler.
pub async fn dispatch<N: DhtNetwork>(node: &Node<N>, rpc: Rpc) -> Response {
    let Rpc { from, kind } = rpc;
    match kind {
        RpcKind::Ping => Response::Pong {
            contact: node.handle_ping(&from).await,
        },
        RpcKind::Store { key, value } => Response::Stored {
            ok: node.handle_store_request(&from, key, value).await,
        },
        RpcKind::FindNode { target } => Response::Nodes {
            nodes: node.handle_find_node_request(&from, target).await,
        },
        RpcKind::FindValue { key } => node.handle_find_value_request(&from, key).await.into(),
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before the next `accept` after `failures` consecutive errors.
///
/// Doubles from [`ACCEPT_BACKOFF_MIN`] up to [`ACCEPT_BACKOFF_MAX`].
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Accept loop serving a [`Node`] over TCP.
pub struct RpcServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    /// Start accepting on an already bound listener.
    pub fn spawn<N: DhtNetwork>(node: Node<N>, listener: TcpListener) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_backoff(failures);
                        warn!(failures, retry_ms = delay.as_millis() as u64, "accept failed: {err}");
                        sleep(delay).await;
                        continue;
                    }
                };
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(node, stream).await {
                        debug!(%peer, "connection error: {err:#}");
                    }
                });
            }
        });
        info!(addr = %local_addr, "rpc server listening");
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. In-flight exchanges finish on their own.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        info!(addr = %self.local_addr, "rpc server stopped");
    }
}
