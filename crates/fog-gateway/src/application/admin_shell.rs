//! Interactive admin shell.
//!
//! Reads one command per line:
//!
//! ```text
//! insert node     {"device_id":"bb","platform_address":"10.0.0.5:2000",...}
//! insert platform {"address":"10.0.0.5:2000","interface_type":"lorawan"}
//! insert link     {"provider_device_id":"bb","requester_device_id":"aa"}
//! delete node 3
//! get platforms
//! help
//! exit
//! ```
//!
//! Node and platform changes are submitted to the control loop as admin
//! commands, exactly as if a remote platform had sent them, so adapters
//! follow platform changes.  Links and all reads go straight to the store.

use std::io;
use std::sync::Arc;

use fog_core::protocol::{AdminCommand, EntityType};
use fog_core::{DeviceId, LinkId, LinkSpec, NodeId, NodeSpec, PlatformId, PlatformSpec, Store, StoreError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::control_loop::{ControlError, ControlHandle};

const PROMPT: &[u8] = b"fog> ";

const HELP: &str = "\
commands:
  insert {node|platform|link} <json>
  delete {node|platform|link} <id>
  get    {nodes|platforms|links}
  help
  exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Node,
    Platform,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Insert(Entity, String),
    Delete(Entity, u64),
    Get(Entity),
    Help,
    Exit,
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("unknown command {0:?}, type `help`")]
    UnknownCommand(String),

    #[error("unknown entity {0:?}, expected node, platform or link")]
    UnknownEntity(String),

    #[error("missing {0}")]
    MissingArgument(&'static str),

    #[error("invalid id {0:?}")]
    InvalidId(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device {0} is not a known node")]
    UnknownDevice(DeviceId),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parses one input line.  Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<ShellCommand>, ShellError> {
    let (verb, rest) = split_word(line.trim());
    let command = match verb.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "help" | "?" => ShellCommand::Help,
        "exit" | "quit" => ShellCommand::Exit,
        "get" => {
            let (entity, _) = split_word(rest);
            ShellCommand::Get(parse_entity(entity)?)
        }
        "insert" => {
            let (entity, body) = split_word(rest);
            let entity = parse_entity(entity)?;
            if body.is_empty() {
                return Err(ShellError::MissingArgument("JSON body"));
            }
            ShellCommand::Insert(entity, body.to_string())
        }
        "delete" => {
            let (entity, id) = split_word(rest);
            let entity = parse_entity(entity)?;
            let (id, _) = split_word(id);
            if id.is_empty() {
                return Err(ShellError::MissingArgument("id"));
            }
            let id = id.parse().map_err(|_| ShellError::InvalidId(id.to_string()))?;
            ShellCommand::Delete(entity, id)
        }
        other => return Err(ShellError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

fn split_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn parse_entity(word: &str) -> Result<Entity, ShellError> {
    match word.to_ascii_lowercase().as_str() {
        "node" | "nodes" => Ok(Entity::Node),
        "platform" | "platforms" => Ok(Entity::Platform),
        "link" | "links" => Ok(Entity::Link),
        "" => Err(ShellError::MissingArgument("entity")),
        other => Err(ShellError::UnknownEntity(other.to_string())),
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

pub struct AdminShell {
    control: ControlHandle,
    store: Arc<dyn Store>,
}

impl AdminShell {
    pub fn new(control: ControlHandle, store: Arc<dyn Store>) -> Self {
        Self { control, store }
    }

    /// Runs one command and returns the text to show the operator.
    pub async fn execute(&self, command: ShellCommand) -> Result<String, ShellError> {
        match command {
            ShellCommand::Help => Ok(HELP.to_string()),
            ShellCommand::Exit => Ok("bye".to_string()),
            ShellCommand::Get(entity) => self.list(entity),
            ShellCommand::Insert(Entity::Node, body) => {
                let spec: NodeSpec = serde_json::from_str(&body)?;
                self.submit(AdminCommand::with_json(true, EntityType::Node, &spec)?)
                    .await?;
                Ok(format!("node {} inserted", spec.device_id))
            }
            ShellCommand::Insert(Entity::Platform, body) => {
                let spec: PlatformSpec = serde_json::from_str(&body)?;
                self.submit(AdminCommand::with_json(true, EntityType::Platform, &spec)?)
                    .await?;
                Ok(format!("platform {} inserted", spec.address))
            }
            ShellCommand::Insert(Entity::Link, body) => {
                let spec: LinkSpec = serde_json::from_str(&body)?;
                let provider = self.node_by_device(&spec.provider_device_id)?;
                let requester = self.node_by_device(&spec.requester_device_id)?;
                let id = self.store.insert_link(provider.id, requester.id)?;
                info!("link {id} inserted from the shell");
                Ok(format!("link {id} inserted"))
            }
            ShellCommand::Delete(Entity::Node, id) => {
                let node = self.store.get_node(NodeId(id))?;
                let platform = self.store.get_platform(node.platform_id)?;
                let spec = NodeSpec {
                    device_id: node.device_id,
                    platform_address: platform.address,
                    platform_type: platform.interface_type,
                    interface_type: node.interface_type,
                    is_provider: node.is_provider,
                };
                self.submit(AdminCommand::with_json(false, EntityType::Node, &spec)?)
                    .await?;
                Ok(format!("node {id} deleted"))
            }
            ShellCommand::Delete(Entity::Platform, id) => {
                let platform = self.store.get_platform(PlatformId(id))?;
                let spec = PlatformSpec::from(&platform);
                self.submit(AdminCommand::with_json(false, EntityType::Platform, &spec)?)
                    .await?;
                Ok(format!("platform {id} deleted"))
            }
            ShellCommand::Delete(Entity::Link, id) => {
                self.store.delete_link(LinkId(id))?;
                info!("link {id} deleted from the shell");
                Ok(format!("link {id} deleted"))
            }
        }
    }

    async fn submit(&self, command: AdminCommand) -> Result<(), ShellError> {
        Ok(self.control.submit(command).await?)
    }

    fn node_by_device(&self, device: &DeviceId) -> Result<fog_core::Node, ShellError> {
        self.store
            .find_node(device)?
            .ok_or_else(|| ShellError::UnknownDevice(device.clone()))
    }

    fn list(&self, entity: Entity) -> Result<String, ShellError> {
        let text = match entity {
            Entity::Node => serde_json::to_string_pretty(&self.store.get_nodes()?)?,
            Entity::Platform => serde_json::to_string_pretty(&self.store.get_platforms()?)?,
            Entity::Link => serde_json::to_string_pretty(&self.store.get_links()?)?,
        };
        Ok(text)
    }
}

/// Serves the shell on `input`/`output` until EOF, `exit`, or `shutdown`.
///
/// `exit` cancels `shutdown`, stopping the whole gateway.  EOF only ends the
/// shell, so a gateway started without a terminal keeps running.
pub async fn run_shell<R, W>(
    shell: &AdminShell,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(PROMPT).await?;
    output.flush().await?;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let reply = match parse(&line) {
            Ok(None) => None,
            Ok(Some(ShellCommand::Exit)) => {
                output.write_all(b"bye\n").await?;
                output.flush().await?;
                info!("exit requested from the admin shell");
                shutdown.cancel();
                break;
            }
            Ok(Some(command)) => Some(match shell.execute(command).await {
                Ok(text) => text,
                Err(e) => format!("error: {e}"),
            }),
            Err(e) => Some(format!("error: {e}")),
        };
        if let Some(reply) = reply {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        output.write_all(PROMPT).await?;
        output.flush().await?;
    }
    Ok(())
}
