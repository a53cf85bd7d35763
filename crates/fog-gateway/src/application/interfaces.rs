//! Interface lifecycle management.
//!
//! An *interface* is one running device-network adapter (LoRaWAN bridge,
//! 6LoWPAN border router, ...) bound to the platform that serves that access
//! network.  The [`InterfaceManager`] is owned by the control loop and is the
//! only place adapters are started, replaced, or stopped.
//!
//! # Ownership (for beginners)
//!
//! Nothing here is behind a lock.  The manager lives inside the control loop
//! task and every change arrives as a queued admin command, so there is only
//! ever one writer.  Adapters run in their own tasks and talk back only
//! through the shared inbound queue.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fog_core::{DeviceMessage, InterfaceType, Platform, PlatformId, PlatformSpec, Store, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for each adapter task to finish.
const ADAPTER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ── Adapter seam ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid destination {destination}: {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("adapter is not running")]
    NotRunning,

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Ingress/egress worker for one access network.
///
/// `run` receives device traffic and pushes it onto `inbound` until `cancel`
/// fires; `send` delivers one message to a device on this network.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn interface_type(&self) -> InterfaceType;

    async fn run(
        &self,
        cancel: CancellationToken,
        inbound: mpsc::Sender<DeviceMessage>,
    ) -> Result<(), AdapterError>;

    async fn send(&self, msg: &DeviceMessage) -> Result<(), AdapterError>;

    async fn close(&self);
}

/// Builds the adapter for a platform.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, platform: &Platform) -> Result<Arc<dyn DeviceAdapter>, AdapterError>;
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No adapter was running for this interface type; one was started.
    Started,
    /// The same platform was already registered.
    Unchanged,
    /// The platform moved to a new address; the old adapter was replaced.
    Replaced,
}

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("platform {address} ({interface_type}) is not registered")]
    NotRegistered {
        address: String,
        interface_type: InterfaceType,
    },
}

struct InterfaceHandle {
    platform: Platform,
    adapter: Arc<dyn DeviceAdapter>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct InterfaceManager {
    handles: HashMap<InterfaceType, InterfaceHandle>,
    factory: Arc<dyn AdapterFactory>,
    store: Arc<dyn Store>,
    inbound: mpsc::Sender<DeviceMessage>,
    root: CancellationToken,
}

impl InterfaceManager {
    /// Adapter tokens are children of `root`, so cancelling it stops every
    /// adapter even if `shutdown` is never called.
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        store: Arc<dyn Store>,
        inbound: mpsc::Sender<DeviceMessage>,
        root: CancellationToken,
    ) -> Self {
        Self {
            handles: HashMap::new(),
            factory,
            store,
            inbound,
            root,
        }
    }

    /// Starts an adapter for every persisted platform.  Platforms whose
    /// adapter cannot be built are logged and skipped.  Returns how many
    /// adapters are running afterwards.
    pub fn start_known(&mut self) -> Result<usize, InterfaceError> {
        for platform in self.store.get_platforms()? {
            if let Some(active) = self.handles.get(&platform.interface_type) {
                warn!(
                    "skipping platform {}: {} is already served by {}",
                    platform.address, platform.interface_type, active.platform.address
                );
                continue;
            }
            match self.factory.create(&platform) {
                Ok(adapter) => self.spawn(platform, adapter, None),
                Err(e) => error!(
                    "cannot start {} adapter for {}: {e}",
                    platform.interface_type, platform.address
                ),
            }
        }
        Ok(self.handles.len())
    }

    pub fn register(&mut self, spec: &PlatformSpec) -> Result<RegisterOutcome, InterfaceError> {
        if let Some(active) = self.handles.get(&spec.interface_type) {
            if active.platform.address == spec.address {
                debug!("platform {} ({}) already registered", spec.address, spec.interface_type);
                return Ok(RegisterOutcome::Unchanged);
            }
            return self.replace(spec);
        }

        let (platform, inserted) = match self.store.find_platform(&spec.address, spec.interface_type)? {
            Some(platform) => (platform, false),
            None => (self.store.insert_platform(spec)?, true),
        };
        let adapter = match self.factory.create(&platform) {
            Ok(adapter) => adapter,
            Err(e) => {
                if inserted {
                    if let Err(rollback) = self.store.delete_platform(platform.id) {
                        warn!("could not roll back platform {}: {rollback}", platform.address);
                    }
                }
                return Err(e.into());
            }
        };
        self.spawn(platform, adapter, None);
        Ok(RegisterOutcome::Started)
    }

    /// Moves the active platform of `spec.interface_type` to `spec.address`.
    /// The replacement adapter starts only after the old one has stopped.
    fn replace(&mut self, spec: &PlatformSpec) -> Result<RegisterOutcome, InterfaceError> {
        let Some(active) = self.handles.get(&spec.interface_type) else {
            return Err(InterfaceError::NotRegistered {
                address: spec.address.clone(),
                interface_type: spec.interface_type,
            });
        };
        let mut platform = active.platform.clone();
        platform.address = spec.address.clone();

        let adapter = self.factory.create(&platform)?;
        self.store.update_platform(&platform)?;

        if let Some(old) = self.handles.remove(&spec.interface_type) {
            info!(
                "platform {} moved from {} to {}",
                platform.interface_type, old.platform.address, platform.address
            );
            old.cancel.cancel();
            self.spawn(platform, adapter, Some(old.task));
        }
        Ok(RegisterOutcome::Replaced)
    }

    /// Removes the platform record and stops its adapter.
    ///
    /// The record is deleted first: if the store refuses (the platform still
    /// owns nodes) the adapter keeps running.
    pub fn deregister(&mut self, spec: &PlatformSpec) -> Result<(), InterfaceError> {
        let record = self.store.find_platform(&spec.address, spec.interface_type)?;
        let active = self
            .handles
            .get(&spec.interface_type)
            .is_some_and(|h| h.platform.address == spec.address);

        if record.is_none() && !active {
            return Err(InterfaceError::NotRegistered {
                address: spec.address.clone(),
                interface_type: spec.interface_type,
            });
        }
        if let Some(platform) = record {
            self.store.delete_platform(platform.id)?;
        }
        if active {
            if let Some(handle) = self.handles.remove(&spec.interface_type) {
                handle.cancel.cancel();
                info!("interface {} on {} stopped", spec.interface_type, spec.address);
            }
        }
        Ok(())
    }

    pub fn adapter_for(&self, platform: PlatformId) -> Option<Arc<dyn DeviceAdapter>> {
        self.handles
            .values()
            .find(|h| h.platform.id == platform)
            .map(|h| Arc::clone(&h.adapter))
    }

    /// Platforms that currently have a running adapter.
    pub fn active(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.handles.values().map(|h| h.platform.clone()).collect();
        platforms.sort_by_key(|p| p.id);
        platforms
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels every adapter and waits (bounded) for each task to finish.
    pub async fn shutdown(&mut self) {
        let handles: Vec<InterfaceHandle> = self.handles.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if tokio::time::timeout(ADAPTER_STOP_TIMEOUT, handle.task).await.is_err() {
                warn!(
                    "{} adapter on {} did not stop within {:?}",
                    handle.platform.interface_type, handle.platform.address, ADAPTER_STOP_TIMEOUT
                );
            }
        }
        info!("all interfaces stopped");
    }

    fn spawn(
        &mut self,
        platform: Platform,
        adapter: Arc<dyn DeviceAdapter>,
        predecessor: Option<JoinHandle<()>>,
    ) {
        let cancel = self.root.child_token();
        let task = tokio::spawn(run_adapter(
            platform.clone(),
            Arc::clone(&adapter),
            predecessor,
            cancel.clone(),
            self.inbound.clone(),
        ));
        info!("interface {} started for {}", platform.interface_type, platform.address);
        self.handles.insert(
            platform.interface_type,
            InterfaceHandle {
                platform,
                adapter,
                cancel,
                task,
            },
        );
    }
}

async fn run_adapter(
    platform: Platform,
    adapter: Arc<dyn DeviceAdapter>,
    predecessor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    inbound: mpsc::Sender<DeviceMessage>,
) {
    if let Some(old) = predecessor {
        let _ = old.await;
    }
    match adapter.run(cancel, inbound).await {
        Ok(()) => debug!("{} adapter on {} returned", platform.interface_type, platform.address),
        Err(e) => error!(
            "{} adapter on {} failed: {e}",
            platform.interface_type, platform.address
        ),
    }
    adapter.close().await;
}
