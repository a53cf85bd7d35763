//! The gateway's control loop.
//!
//! A single task that owns the [`InterfaceManager`] and services two queues
//! one item at a time:
//!
//! - **admin commands** submitted through a [`ControlHandle`] (by the
//!   acceptor or the admin shell), each answered on its own oneshot channel;
//! - **device messages** pushed by adapters, which are routed to the adapter
//!   serving the linked peer.
//!
//! Routing failures are logged and the loop moves on; nothing a single
//! message or command does can stop it.  Cancelling the shutdown token makes
//! the loop refuse queued commands, stop every adapter, and return.

use std::sync::Arc;
use std::time::Duration;

use fog_core::protocol::{AdminCommand, EntityType};
use fog_core::{
    DeviceId, DeviceMessage, InterfaceType, NewNode, NodeSpec, PlatformId, PlatformSpec, Store,
    StoreError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::interfaces::{AdapterError, InterfaceError, InterfaceManager};

// ── Command channel ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid command body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("{0:?} records cannot be changed by admin command")]
    UnsupportedEntity(EntityType),

    #[error("platform {address} ({interface_type}) is not known")]
    UnknownPlatform {
        address: String,
        interface_type: InterfaceType,
    },

    #[error("device {0} is not a known node")]
    UnknownDevice(DeviceId),

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("command not answered within {0:?}")]
    Timeout(Duration),
}

/// One queued admin command and where to send its verdict.
pub struct ControlRequest {
    pub command: AdminCommand,
    pub reply: oneshot::Sender<Result<(), ControlError>>,
}

/// Cloneable submitter for the control loop's command queue.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
    timeout: Duration,
}

impl ControlHandle {
    /// Queues `command` and waits for the loop's verdict, at most `timeout`
    /// for queueing and execution together.
    pub async fn submit(&self, command: AdminCommand) -> Result<(), ControlError> {
        let (reply, answer) = oneshot::channel();
        let exchange = async {
            if self.tx.send(ControlRequest { command, reply }).await.is_err() {
                return Err(ControlError::ShuttingDown);
            }
            answer.await.unwrap_or(Err(ControlError::ShuttingDown))
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout(self.timeout)),
        }
    }
}

pub fn control_channel(
    capacity: usize,
    timeout: Duration,
) -> (ControlHandle, mpsc::Receiver<ControlRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ControlHandle { tx, timeout }, rx)
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("origin {0} is not a known node")]
    UnknownOrigin(DeviceId),

    #[error("device {0} has no link")]
    NotLinked(DeviceId),

    #[error("no running adapter for platform {platform}")]
    NoAdapter { platform: PlatformId },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

// ── Loop ──────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    interfaces: InterfaceManager,
    store: Arc<dyn Store>,
    commands: mpsc::Receiver<ControlRequest>,
    inbound: mpsc::Receiver<DeviceMessage>,
    shutdown: CancellationToken,
}

impl ControlLoop {
    pub fn new(
        interfaces: InterfaceManager,
        store: Arc<dyn Store>,
        commands: mpsc::Receiver<ControlRequest>,
        inbound: mpsc::Receiver<DeviceMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            interfaces,
            store,
            commands,
            inbound,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("control loop running with {} interface(s)", self.interfaces.len());
        for platform in self.interfaces.active() {
            debug!("serving {} platform {}", platform.interface_type, platform.address);
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(request) = self.commands.recv() => {
                    let result = self.execute(&request.command);
                    if let Err(e) = &result {
                        warn!("admin command failed: {e}");
                    }
                    let _ = request.reply.send(result);
                }
                Some(msg) = self.inbound.recv() => {
                    if let Err(e) = self.route(msg).await {
                        warn!("device message dropped: {e}");
                    }
                }
                else => break,
            }
        }

        self.commands.close();
        while let Ok(request) = self.commands.try_recv() {
            let _ = request.reply.send(Err(ControlError::ShuttingDown));
        }
        self.interfaces.shutdown().await;
        info!("control loop stopped");
    }

    /// Applies one admin command.
    fn execute(&mut self, command: &AdminCommand) -> Result<(), ControlError> {
        match command.entity {
            EntityType::Platform => {
                let spec: PlatformSpec = serde_json::from_slice(&command.data)?;
                if command.insert {
                    let outcome = self.interfaces.register(&spec)?;
                    info!("platform {} ({}): {:?}", spec.address, spec.interface_type, outcome);
                } else {
                    self.interfaces.deregister(&spec)?;
                    info!("platform {} ({}) removed", spec.address, spec.interface_type);
                }
            }
            EntityType::Node => {
                let spec: NodeSpec = serde_json::from_slice(&command.data)?;
                if command.insert {
                    let platform = self
                        .store
                        .find_platform(&spec.platform_address, spec.platform_type)?
                        .ok_or_else(|| ControlError::UnknownPlatform {
                            address: spec.platform_address.clone(),
                            interface_type: spec.platform_type,
                        })?;
                    let node = self.store.insert_node(NewNode {
                        device_id: spec.device_id,
                        platform_id: platform.id,
                        is_provider: spec.is_provider,
                        interface_type: spec.interface_type,
                    })?;
                    info!("node {} added on {}", node.device_id, platform.address);
                } else {
                    let node = self
                        .store
                        .find_node(&spec.device_id)?
                        .ok_or_else(|| ControlError::UnknownDevice(spec.device_id.clone()))?;
                    self.store.delete_node(node.id)?;
                    info!("node {} removed", node.device_id);
                }
            }
            EntityType::Link => return Err(ControlError::UnsupportedEntity(EntityType::Link)),
        }
        Ok(())
    }

    /// origin device → node → link → peer node → peer platform's adapter.
    async fn route(&self, mut msg: DeviceMessage) -> Result<(), RouteError> {
        let origin = self
            .store
            .find_node(&msg.origin)?
            .ok_or_else(|| RouteError::UnknownOrigin(msg.origin.clone()))?;
        let peer_id = self
            .store
            .find_link_for_node(origin.id)?
            .and_then(|link| link.peer_of(origin.id))
            .ok_or_else(|| RouteError::NotLinked(origin.device_id.clone()))?;
        let peer = self.store.get_node(peer_id)?;
        let adapter = self
            .interfaces
            .adapter_for(peer.platform_id)
            .ok_or(RouteError::NoAdapter {
                platform: peer.platform_id,
            })?;

        msg.destination = peer.device_id;
        adapter.send(&msg).await?;
        debug!(
            "routed {} bytes {} -> {} over {}",
            msg.payload.len(),
            msg.origin,
            msg.destination,
            adapter.interface_type()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::interfaces::{AdapterFactory, DeviceAdapter};
    use async_trait::async_trait;
    use fog_core::{MemoryStore, Platform};

    // ── Test doubles ──────────────────────────────────────────────────────────

    /// Forwards every sent message, tagged with the adapter's platform
    /// address, to the test.
    struct ForwardingAdapter {
        platform: Platform,
        sent: mpsc::UnboundedSender<(String, DeviceMessage)>,
    }

    #[async_trait]
    impl DeviceAdapter for ForwardingAdapter {
        fn interface_type(&self) -> InterfaceType {
            self.platform.interface_type
        }

        async fn run(
            &self,
            cancel: CancellationToken,
            _inbound: mpsc::Sender<DeviceMessage>,
        ) -> Result<(), AdapterError> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn send(&self, msg: &DeviceMessage) -> Result<(), AdapterError> {
            let _ = self.sent.send((self.platform.address.clone(), msg.clone()));
            Ok(())
        }

        async fn close(&self) {}
    }

    struct ForwardingFactory {
        sent: mpsc::UnboundedSender<(String, DeviceMessage)>,
    }

    impl AdapterFactory for ForwardingFactory {
        fn create(&self, platform: &Platform) -> Result<Arc<dyn DeviceAdapter>, AdapterError> {
            Ok(Arc::new(ForwardingAdapter {
                platform: platform.clone(),
                sent: self.sent.clone(),
            }))
        }
    }

    struct Harness {
        control: ControlHandle,
        inbound: mpsc::Sender<DeviceMessage>,
        sent: mpsc::UnboundedReceiver<(String, DeviceMessage)>,
        store: Arc<MemoryStore>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    const LORA: &str = "lora.example:1700";
    const MESH: &str = "[::1]:5683";

    fn seeded_store() -> MemoryStore {
        MemoryStore::seeded(
            &[
                PlatformSpec {
                    address: LORA.into(),
                    interface_type: InterfaceType::Lorawan,
                },
                PlatformSpec {
                    address: MESH.into(),
                    interface_type: InterfaceType::Sixlowpan,
                },
            ],
            &[
                NodeSpec {
                    device_id: DeviceId::new("BB"),
                    platform_address: LORA.into(),
                    platform_type: InterfaceType::Lorawan,
                    interface_type: InterfaceType::Lorawan,
                    is_provider: true,
                },
                NodeSpec {
                    device_id: DeviceId::new("AA"),
                    platform_address: MESH.into(),
                    platform_type: InterfaceType::Sixlowpan,
                    interface_type: InterfaceType::Lorawan,
                    is_provider: false,
                },
            ],
        )
        .unwrap()
    }

    fn start(store: MemoryStore) -> Harness {
        let store = Arc::new(store);
        let shutdown = CancellationToken::new();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let mut interfaces = InterfaceManager::new(
            Arc::new(ForwardingFactory { sent: sent_tx }),
            store.clone(),
            inbound_tx.clone(),
            shutdown.clone(),
        );
        interfaces.start_known().unwrap();
        let (control, commands) = control_channel(4, Duration::from_secs(2));
        let task = tokio::spawn(
            ControlLoop::new(interfaces, store.clone(), commands, inbound_rx, shutdown.clone()).run(),
        );
        Harness {
            control,
            inbound: inbound_tx,
            sent,
            store,
            shutdown,
            task,
        }
    }

    fn link_aa_to_bb(store: &MemoryStore) {
        let a = store.find_node(&DeviceId::new("AA")).unwrap().unwrap();
        let b = store.find_node(&DeviceId::new("BB")).unwrap().unwrap();
        store.insert_link(b.id, a.id).unwrap();
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_message_from_requester_reaches_provider_adapter() {
        // Arrange
        let store = seeded_store();
        link_aa_to_bb(&store);
        let mut h = start(store);

        // Act
        h.inbound
            .send(DeviceMessage::received(
                InterfaceType::Sixlowpan,
                DeviceId::new("AA"),
                b"temp=21".to_vec(),
            ))
            .await
            .unwrap();

        // Assert
        let (address, msg) = h.sent.recv().await.unwrap();
        assert_eq!(address, LORA);
        assert_eq!(msg.destination, DeviceId::new("BB"));
        assert_eq!(msg.payload, b"temp=21");
        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unroutable_message_does_not_stop_the_loop() {
        // Arrange: no link yet, so the first message is dropped.
        let store = seeded_store();
        let mut h = start(store);
        h.inbound
            .send(DeviceMessage::received(InterfaceType::Lorawan, DeviceId::new("BB"), vec![1]))
            .await
            .unwrap();
        h.inbound
            .send(DeviceMessage::received(InterfaceType::Lorawan, DeviceId::new("ZZ"), vec![2]))
            .await
            .unwrap();

        let early = tokio::time::timeout(Duration::from_millis(100), h.sent.recv()).await;

        // Act
        link_aa_to_bb(&h.store);
        h.inbound
            .send(DeviceMessage::received(InterfaceType::Lorawan, DeviceId::new("BB"), vec![3]))
            .await
            .unwrap();

        // Assert: only the message sent after linking is delivered.
        assert!(early.is_err());
        let (address, msg) = h.sent.recv().await.unwrap();
        assert_eq!(address, MESH);
        assert_eq!(msg.destination, DeviceId::new("AA"));
        assert_eq!(msg.payload, vec![3]);
        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    // ── Admin commands ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_platform_then_node_insert_via_commands() {
        let h = start(MemoryStore::new());
        let platform = PlatformSpec {
            address: LORA.into(),
            interface_type: InterfaceType::Lorawan,
        };
        let node = NodeSpec {
            device_id: DeviceId::new("BB"),
            platform_address: LORA.into(),
            platform_type: InterfaceType::Lorawan,
            interface_type: InterfaceType::Lorawan,
            is_provider: true,
        };

        h.control
            .submit(AdminCommand::with_json(true, EntityType::Platform, &platform).unwrap())
            .await
            .unwrap();
        h.control
            .submit(AdminCommand::with_json(true, EntityType::Node, &node).unwrap())
            .await
            .unwrap();

        assert_eq!(h.store.get_platforms().unwrap().len(), 1);
        let stored = h.store.find_node(&DeviceId::new("BB")).unwrap().unwrap();
        assert!(stored.is_provider);
        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_node_insert_for_unknown_platform_fails() {
        let h = start(MemoryStore::new());
        let node = NodeSpec {
            device_id: DeviceId::new("CC"),
            platform_address: "nowhere:1".into(),
            platform_type: InterfaceType::Lorawan,
            interface_type: InterfaceType::Lorawan,
            is_provider: false,
        };

        let result = h
            .control
            .submit(AdminCommand::with_json(true, EntityType::Node, &node).unwrap())
            .await;

        assert!(matches!(result, Err(ControlError::UnknownPlatform { .. })));
        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_node_delete_removes_record() {
        let h = start(seeded_store());
        let node = NodeSpec {
            device_id: DeviceId::new("AA"),
            platform_address: MESH.into(),
            platform_type: InterfaceType::Sixlowpan,
            interface_type: InterfaceType::Lorawan,
            is_provider: false,
        };

        h.control
            .submit(AdminCommand::with_json(false, EntityType::Node, &node).unwrap())
            .await
            .unwrap();

        assert!(h.store.find_node(&DeviceId::new("AA")).unwrap().is_none());
        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_link_commands_and_bad_json_are_refused() {
        let h = start(MemoryStore::new());

        let link = h
            .control
            .submit(AdminCommand {
                insert: true,
                entity: EntityType::Link,
                data: b"{}".to_vec(),
            })
            .await;
        let garbage = h
            .control
            .submit(AdminCommand {
                insert: true,
                entity: EntityType::Platform,
                data: b"not json".to_vec(),
            })
            .await;

        assert!(matches!(link, Err(ControlError::UnsupportedEntity(EntityType::Link))));
        assert!(matches!(garbage, Err(ControlError::InvalidBody(_))));
        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_reports_shutting_down() {
        let h = start(MemoryStore::new());
        h.shutdown.cancel();
        h.task.await.unwrap();

        let result = h
            .control
            .submit(AdminCommand {
                insert: false,
                entity: EntityType::Platform,
                data: Vec::new(),
            })
            .await;

        assert!(matches!(result, Err(ControlError::ShuttingDown)));
    }
}
