//! Kademlia DHT node binary.
//!
//! Binds a TCP listener, joins the network through any `--bootstrap` peers and
//! then either runs the administrative shell on stdin or serves until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! kademlia-node --bind 127.0.0.1:4000
//! kademlia-node --bind 127.0.0.1:4001 --bootstrap 127.0.0.1:4000
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{self, BufReader};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use kademlia_node::{Contact, DhtConfig, Node, NodeId, RpcServer, Shell, TcpNetwork};

#[derive(Parser, Debug)]
#[command(name = "kademlia-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on; port 0 picks a free port.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Raw string hashed into the node id, instead of the bound address.
    #[arg(long)]
    id: Option<String>,

    /// Peers to join through.
    #[arg(short = 'B', long = "bootstrap", value_name = "IP:PORT")]
    bootstrap: Vec<SocketAddr>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bucket capacity and replication factor.
    #[arg(short)]
    k: Option<usize>,

    /// Lookup fan-out per round.
    #[arg(long)]
    alpha: Option<usize>,

    /// Replica lifetime in milliseconds.
    #[arg(long = "ttl-ms")]
    ttl_ms: Option<u64>,

    /// Republish period in milliseconds.
    #[arg(long = "republish-ms")]
    republish_ms: Option<u64>,

    /// Serve until Ctrl-C instead of reading commands from stdin.
    #[arg(long)]
    no_shell: bool,
}

impl Args {
    fn load_config(&self) -> Result<DhtConfig> {
        let mut config = match &self.config {
            Some(path) => DhtConfig::from_file(path)?,
            None => DhtConfig::default(),
        };
        if let Some(k) = self.k {
            config.k = k;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(ttl_ms) = self.ttl_ms {
            config.replica_ttl_ms = ttl_ms;
        }
        if let Some(republish_ms) = self.republish_ms {
            config.republish_interval_ms = republish_ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    let local_addr = listener.local_addr()?;

    let self_contact = match &args.id {
        Some(raw) => Contact::new(
            NodeId::from_hashed(raw).masked(config.id_bits),
            local_addr.ip(),
            local_addr.port(),
        ),
        None => Contact::from_address(local_addr, config.id_bits),
    };
    info!(id = %self_contact.id, addr = %local_addr, "node identity");

    let node = Node::new(
        self_contact.clone(),
        TcpNetwork::new(self_contact),
        config,
    );
    let server = RpcServer::spawn(node.clone(), listener)?;
    node.start().await;

    for peer in &args.bootstrap {
        let found = node.bootstrap_address(*peer).await;
        info!(peer = %peer, found = found.len(), "bootstrap finished");
    }

    if args.no_shell {
        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal, exiting gracefully");
        server.shutdown().await;
        node.shutdown().await;
        return Ok(());
    }

    let mut shell = Shell::new(node, Some(server));
    shell.run(BufReader::new(io::stdin()), io::stdout()).await
}
