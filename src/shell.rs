//! Line-oriented administrative shell.
//!
//! Commands are parsed with [`ShellCommand::from_str`] and executed against a
//! [`Node`] by [`Shell`]. Results are printed as pretty JSON.

use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{Contact, DhtNetwork, Node};
use crate::error::ShellParseError;
use crate::server::RpcServer;

pub const HELP: &str = "\
commands:
  start                     start listening and storage maintenance
  stop                      stop listening and storage maintenance
  store <key> <value...>    publish a value under the hash of <key>
  get <key>                 read a value, locally first then from the network
  bootstrap <ip:port>       join the network through a known peer
  ping <ip:port>            ping a peer
  contacts                  list routing table contacts
  storage [key]             dump local storage, or one replica
  republish                 republish own values now
  help                      show this text
  exit | quit               leave the shell";

/// One parsed shell line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Start,
    Stop,
    Store { key: String, value: String },
    Get { key: String },
    Bootstrap(SocketAddr),
    Ping(SocketAddr),
    Contacts,
    Storage { key: Option<String> },
    Republish,
    Help,
    Exit,
}

fn parse_addr(raw: Option<&str>, usage: &'static str) -> Result<SocketAddr, ShellParseError> {
    let raw = raw.ok_or(ShellParseError::Usage(usage))?;
    raw.parse()
        .map_err(|_| ShellParseError::Address(raw.to_string()))
}

impl FromStr for ShellCommand {
    type Err = ShellParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or(ShellParseError::Empty)?;
        let parsed = match command {
            "start" => ShellCommand::Start,
            "stop" => ShellCommand::Stop,
            "store" => {
                const USAGE: &str = "store <key> <value...>";
                let key = words.next().ok_or(ShellParseError::Usage(USAGE))?;
                let value = words.collect::<Vec<_>>().join(" ");
                if value.is_empty() {
                    return Err(ShellParseError::Usage(USAGE));
                }
                ShellCommand::Store {
                    key: key.to_string(),
                    value,
                }
            }
            "get" => ShellCommand::Get {
                key: words
                    .next()
                    .ok_or(ShellParseError::Usage("get <key>"))?
                    .to_string(),
            },
            "bootstrap" => ShellCommand::Bootstrap(parse_addr(words.next(), "bootstrap <ip:port>")?),
            "ping" => ShellCommand::Ping(parse_addr(words.next(), "ping <ip:port>")?),
            "contacts" => ShellCommand::Contacts,
            "storage" => ShellCommand::Storage {
                key: words.next().map(str::to_string),
            },
            "republish" => ShellCommand::Republish,
            "help" => ShellCommand::Help,
            "exit" | "quit" => ShellCommand::Exit,
            other => return Err(ShellParseError::Unknown(other.to_string())),
        };
        Ok(parsed)
    }
}

/// What the read loop should do after a command.
#[derive(Debug)]
pub enum Outcome {
    Print(Value),
    Text(&'static str),
    Exit,
}

/// Executes shell commands against one node.
pub struct Shell<N: DhtNetwork> {
    node: Node<N>,
    server: Option<RpcServer>,
}

impl<N: DhtNetwork> Shell<N> {
    /// `server` is the listener already serving `node`, if any.
    pub fn new(node: Node<N>, server: Option<RpcServer>) -> Self {
        Self { node, server }
    }

    pub fn is_listening(&self) -> bool {
        self.server.is_some()
    }

    pub async fn execute(&mut self, command: ShellCommand) -> Result<Outcome> {
        let node = self.node.clone();
        let output = match command {
            ShellCommand::Start => {
                if self.server.is_none() {
                    let addr = node.contact().socket_addr();
                    let listener = TcpListener::bind(addr)
                        .await
                        .with_context(|| format!("binding {addr}"))?;
                    self.server = Some(RpcServer::spawn(node.clone(), listener)?);
                }
                node.start().await;
                json!({ "listening": true, "contact": node.contact() })
            }
            ShellCommand::Stop => {
                if let Some(server) = self.server.take() {
                    server.shutdown().await;
                }
                node.shutdown().await;
                json!({ "listening": false })
            }
            ShellCommand::Store { key, value } => {
                let hashed = node.derive_key(&key);
                let stored = node.iterative_store(hashed, value).await;
                json!({ "key": hashed, "storedOn": stored })
            }
            ShellCommand::Get { key } => {
                let hashed = node.derive_key(&key);
                match node.local_value(&hashed).await {
                    Some(value) => json!({ "key": hashed, "value": value, "local": true }),
                    None => {
                        let value = node.iterative_find_value(hashed).await.into_value();
                        json!({ "key": hashed, "value": value, "local": false })
                    }
                }
            }
            ShellCommand::Bootstrap(addr) => {
                let found = node.bootstrap_address(addr).await;
                json!({ "found": found, "contacts": node.contacts().await.len() })
            }
            ShellCommand::Ping(addr) => {
                let target = Contact::from_address(addr, node.config().id_bits);
                match node.ping(&target).await {
                    Some(contact) => json!({ "alive": true, "contact": contact }),
                    None => json!({ "alive": false }),
                }
            }
            ShellCommand::Contacts => json!(node.contacts().await),
            ShellCommand::Storage { key: None } => serde_json::to_value(node.storage_snapshot().await)?,
            ShellCommand::Storage { key: Some(key) } => {
                let hashed = node.derive_key(&key);
                json!({ "key": hashed, "value": node.local_value(&hashed).await })
            }
            ShellCommand::Republish => serde_json::to_value(node.force_republish().await)?,
            ShellCommand::Help => return Ok(Outcome::Text(HELP)),
            ShellCommand::Exit => return Ok(Outcome::Exit),
        };
        Ok(Outcome::Print(output))
    }

    /// Read commands line by line until `exit` or end of input.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command = match line.parse::<ShellCommand>() {
                Ok(command) => command,
                Err(err) => {
                    output.write_all(format!("error: {err}\n").as_bytes()).await?;
                    continue;
                }
            };
            let text = match self.execute(command).await {
                Ok(Outcome::Print(value)) => serde_json::to_string_pretty(&value)?,
                Ok(Outcome::Text(text)) => text.to_string(),
                Ok(Outcome::Exit) => break,
                Err(err) => {
                    warn!("command failed: {err:#}");
                    format!("error: {err:#}")
                }
            };
            output.write_all(text.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        self.close().await;
        Ok(())
    }

    /// Stop the listener and storage maintenance.
    pub async fn close(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        self.node.shutdown().await;
        info!("shell closed");
    }
}
