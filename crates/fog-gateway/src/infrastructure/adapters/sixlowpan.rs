//! 6LoWPAN border-router adapter.
//!
//! Mesh devices reach the gateway over UDP (IPv6 in production, through the
//! border router).  A device is identified by its socket address, so the
//! `origin` of an uplink is the sender's `ip:port` as text and a downlink's
//! `destination` is parsed back into one.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fog_core::{DeviceId, DeviceMessage, InterfaceType};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::interfaces::{AdapterError, DeviceAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SixlowpanOptions {
    /// UDP address the border-router socket binds to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Largest datagram accepted; longer ones are truncated by the OS.
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 5683))
}
fn default_max_datagram() -> usize {
    1280
}

impl Default for SixlowpanOptions {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_datagram: default_max_datagram(),
        }
    }
}

pub struct SixlowpanAdapter {
    options: SixlowpanOptions,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl SixlowpanAdapter {
    pub fn new(options: SixlowpanOptions) -> Self {
        Self {
            options,
            socket: Mutex::new(None),
        }
    }

    /// Address the socket is bound to while `run` is active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_socket()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_socket(&self, socket: Option<Arc<UdpSocket>>) {
        if let Ok(mut guard) = self.socket.lock() {
            *guard = socket;
        }
    }
}

#[async_trait]
impl DeviceAdapter for SixlowpanAdapter {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Sixlowpan
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        inbound: mpsc::Sender<DeviceMessage>,
    ) -> Result<(), AdapterError> {
        let socket = Arc::new(UdpSocket::bind(self.options.bind).await?);
        info!("6LoWPAN adapter listening on {}", socket.local_addr()?);
        self.set_socket(Some(Arc::clone(&socket)));

        let mut buf = vec![0u8; self.options.max_datagram];
        let result = loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                r = socket.recv_from(&mut buf) => r,
            };
            match received {
                Ok((len, from)) => {
                    debug!("6LoWPAN datagram of {len} bytes from {from}");
                    let msg = DeviceMessage::received(
                        InterfaceType::Sixlowpan,
                        DeviceId::new(from.to_string()),
                        buf[..len].to_vec(),
                    );
                    // A full queue must not hide cancellation.
                    let queued = tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        r = inbound.send(msg) => r,
                    };
                    if queued.is_err() {
                        break Ok(());
                    }
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; they do not affect the socket.
                    warn!("6LoWPAN receive error: {e}");
                }
            }
        };
        self.set_socket(None);
        result
    }

    async fn send(&self, msg: &DeviceMessage) -> Result<(), AdapterError> {
        let socket = self.current_socket().ok_or(AdapterError::NotRunning)?;
        let text = std::str::from_utf8(msg.destination.as_bytes()).map_err(|e| {
            AdapterError::InvalidDestination {
                destination: msg.destination.to_string(),
                reason: e.to_string(),
            }
        })?;
        let target: SocketAddr = text.parse().map_err(|e: std::net::AddrParseError| {
            AdapterError::InvalidDestination {
                destination: text.to_string(),
                reason: e.to_string(),
            }
        })?;
        socket.send_to(&msg.payload, target).await?;
        debug!("6LoWPAN sent {} bytes to {target}", msg.payload.len());
        Ok(())
    }

    async fn close(&self) {
        self.set_socket(None);
        debug!("6LoWPAN adapter closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_options() -> SixlowpanOptions {
        SixlowpanOptions {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    async fn wait_for_bind(adapter: &SixlowpanAdapter) -> SocketAddr {
        for _ in 0..100 {
            if let Some(addr) = adapter.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("adapter never bound");
    }

    #[test]
    fn test_default_bind_is_ipv6_loopback_coap_port() {
        assert_eq!(SixlowpanOptions::default().bind.to_string(), "[::1]:5683");
    }

    #[tokio::test]
    async fn test_send_before_run_is_not_running() {
        let adapter = SixlowpanAdapter::new(loopback_options());
        let msg = DeviceMessage::received(InterfaceType::Sixlowpan, DeviceId::new("x"), vec![1]);

        assert!(matches!(adapter.send(&msg).await, Err(AdapterError::NotRunning)));
    }

    #[tokio::test]
    async fn test_uplink_and_downlink_over_udp() {
        // Arrange
        let adapter = Arc::new(SixlowpanAdapter::new(loopback_options()));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            async move { adapter.run(cancel, tx).await }
        });
        let gateway = wait_for_bind(&adapter).await;
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        // Act: uplink
        device.send_to(b"hello", gateway).await.unwrap();
        let uplink = rx.recv().await.unwrap();

        // Act: downlink back to the device
        let mut reply = DeviceMessage::received(InterfaceType::Lorawan, DeviceId::new("BB"), b"ack".to_vec());
        reply.destination = uplink.origin.clone();
        adapter.send(&reply).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = device.recv_from(&mut buf).await.unwrap();

        // Assert
        assert_eq!(uplink.origin, DeviceId::new(device_addr.to_string()));
        assert_eq!(uplink.payload, b"hello");
        assert_eq!(&buf[..len], b"ack");

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(adapter.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_destination_that_is_not_an_address_is_rejected() {
        let adapter = Arc::new(SixlowpanAdapter::new(loopback_options()));
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            async move { adapter.run(cancel, tx).await }
        });
        wait_for_bind(&adapter).await;
        let mut msg = DeviceMessage::received(InterfaceType::Sixlowpan, DeviceId::new("x"), vec![1]);
        msg.destination = DeviceId::new(vec![0xAA, 0xBB]);

        let result = adapter.send(&msg).await;

        assert!(matches!(result, Err(AdapterError::InvalidDestination { .. })));
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_inbound_queue_is_full_stops_adapter() {
        // Arrange: a one-slot queue nobody drains
        let adapter = Arc::new(SixlowpanAdapter::new(loopback_options()));
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let task = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            let cancel = cancel.clone();
            async move { adapter.run(cancel, tx).await }
        });
        let gateway = wait_for_bind(&adapter).await;
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(b"one", gateway).await.unwrap();
        device.send_to(b"two", gateway).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Act
        cancel.cancel();

        // Assert
        let stopped = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(stopped.expect("adapter stops on cancel").unwrap().is_ok());
        assert!(adapter.local_addr().is_none());
    }
}
