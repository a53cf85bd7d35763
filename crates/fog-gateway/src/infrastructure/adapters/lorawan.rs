//! LoRaWAN network-server bridge.
//!
//! The LoRaWAN network server owns the radio side.  The gateway plays the
//! application server:
//!
//! - **uplink**: the network server connects to `uplink_bind` and streams one
//!   JSON object per line, `{"dev_eui": "<hex>", "data": "<hex>"}`;
//! - **downlink**: for each outgoing message the gateway connects to
//!   `network_server` and writes one line
//!   `{"dev_eui", "fport", "confirmed", "data"}`.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fog_core::domain::device_id::hex_bytes;
use fog_core::{DeviceId, DeviceMessage, InterfaceType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::interfaces::{AdapterError, DeviceAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LorawanOptions {
    /// Where the network server delivers uplinks.
    #[serde(default = "default_uplink_bind")]
    pub uplink_bind: SocketAddr,
    /// `host:port` of the network server's downlink endpoint.
    #[serde(default = "default_network_server")]
    pub network_server: String,
    #[serde(default = "default_downlink_fport")]
    pub downlink_fport: u8,
    /// Request acknowledgement from the device for downlinks.
    #[serde(default = "default_true")]
    pub confirmed: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_uplink_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8001))
}
fn default_network_server() -> String {
    "192.168.2.104:8000".to_string()
}
fn default_downlink_fport() -> u8 {
    255
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for LorawanOptions {
    fn default() -> Self {
        Self {
            uplink_bind: default_uplink_bind(),
            network_server: default_network_server(),
            downlink_fport: default_downlink_fport(),
            confirmed: default_true(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Uplink {
    dev_eui: DeviceId,
    #[serde(with = "hex_bytes")]
    data: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct Downlink {
    dev_eui: DeviceId,
    fport: u8,
    confirmed: bool,
    #[serde(with = "hex_bytes")]
    data: Vec<u8>,
}

pub struct LorawanAdapter {
    options: LorawanOptions,
    bound: Mutex<Option<SocketAddr>>,
}

impl LorawanAdapter {
    pub fn new(options: LorawanOptions) -> Self {
        Self {
            options,
            bound: Mutex::new(None),
        }
    }

    /// Address of the uplink listener while `run` is active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().ok().and_then(|guard| *guard)
    }

    fn set_bound(&self, addr: Option<SocketAddr>) {
        if let Ok(mut guard) = self.bound.lock() {
            *guard = addr;
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.options.connect_timeout_secs)
    }
}

#[async_trait]
impl DeviceAdapter for LorawanAdapter {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Lorawan
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        inbound: mpsc::Sender<DeviceMessage>,
    ) -> Result<(), AdapterError> {
        let listener = TcpListener::bind(self.options.uplink_bind).await?;
        let addr = listener.local_addr()?;
        info!("LoRaWAN uplink listener on {addr}");
        self.set_bound(Some(addr));

        let mut feeds = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("network server connected from {peer}");
                        feeds.spawn(read_uplinks(stream, peer, inbound.clone(), cancel.clone()));
                    }
                    Err(e) => warn!("uplink accept failed: {e}"),
                },
                Some(_) = feeds.join_next(), if !feeds.is_empty() => {}
            }
        }
        feeds.shutdown().await;
        self.set_bound(None);
        Ok(())
    }

    async fn send(&self, msg: &DeviceMessage) -> Result<(), AdapterError> {
        let frame = Downlink {
            dev_eui: msg.destination.clone(),
            fport: self.options.downlink_fport,
            confirmed: self.options.confirmed,
            data: msg.payload.clone(),
        };
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');

        let limit = self.connect_timeout();
        let mut stream = timeout(limit, TcpStream::connect(&self.options.network_server))
            .await
            .map_err(|_| AdapterError::Timeout(limit))??;
        timeout(limit, stream.write_all(&line))
            .await
            .map_err(|_| AdapterError::Timeout(limit))??;
        stream.shutdown().await?;
        debug!(
            "LoRaWAN downlink of {} bytes to {} via {}",
            msg.payload.len(),
            msg.destination,
            self.options.network_server
        );
        Ok(())
    }

    async fn close(&self) {
        self.set_bound(None);
        debug!("LoRaWAN adapter closed");
    }
}

async fn read_uplinks(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<DeviceMessage>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<Uplink>(&line) {
                Ok(uplink) => {
                    let msg = DeviceMessage::received(InterfaceType::Lorawan, uplink.dev_eui, uplink.data);
                    let queued = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = inbound.send(msg) => r,
                    };
                    if queued.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("malformed uplink from {peer}: {e}"),
            },
            Ok(None) => {
                debug!("network server {peer} disconnected");
                return;
            }
            Err(e) => {
                warn!("uplink read from {peer} failed: {e}");
                return;
            }
        }
    }
}
