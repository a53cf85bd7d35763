//! Helpers shared by the gateway integration tests: in-memory platform
//! peers, a dialer that hands out pre-made pipes, and a seeded store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fog_core::protocol::{EntityType, FogMessage};
use fog_core::{DeviceId, InterfaceType, MemoryStore, NodeSpec, PlatformSpec, Store};
use fog_gateway::application::control_loop::{control_channel, ControlError, ControlHandle};
use fog_gateway::infrastructure::network::acceptor::AcceptorContext;
use fog_gateway::infrastructure::network::framed::{write_message, FrameReader};
use fog_gateway::infrastructure::network::session::{BoxedStream, Dialer, SessionContext};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

pub const REQUESTER_PLATFORM: &str = "requester.example:2000";
pub const PROVIDER_PLATFORM: &str = "provider.example:2000";

/// How long a test waits for one frame before failing.
pub const FRAME_WAIT: Duration = Duration::from_secs(2);

// ── Store ─────────────────────────────────────────────────────────────────────

/// Requester `AA` on a 6LoWPAN platform asking for LoRaWAN service, and (if
/// `with_provider`) provider `BB` on a LoRaWAN platform.
pub fn seeded_store(with_provider: bool) -> Arc<MemoryStore> {
    let mut nodes = vec![NodeSpec {
        device_id: DeviceId::new("AA"),
        platform_address: REQUESTER_PLATFORM.into(),
        platform_type: InterfaceType::Sixlowpan,
        interface_type: InterfaceType::Lorawan,
        is_provider: false,
    }];
    if with_provider {
        nodes.push(NodeSpec {
            device_id: DeviceId::new("BB"),
            platform_address: PROVIDER_PLATFORM.into(),
            platform_type: InterfaceType::Lorawan,
            interface_type: InterfaceType::Lorawan,
            is_provider: true,
        });
    }
    let platforms = [
        PlatformSpec {
            address: REQUESTER_PLATFORM.into(),
            interface_type: InterfaceType::Sixlowpan,
        },
        PlatformSpec {
            address: PROVIDER_PLATFORM.into(),
            interface_type: InterfaceType::Lorawan,
        },
    ];
    Arc::new(MemoryStore::seeded(&platforms, &nodes).expect("seed"))
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// Hands out queued in-memory streams and remembers every address dialled.
/// Once the queue is empty, dials fail with `ConnectionRefused`.
#[derive(Default)]
pub struct PipeDialer {
    streams: Mutex<VecDeque<DuplexStream>>,
    dialed: Mutex<Vec<String>>,
}

impl PipeDialer {
    pub fn with(streams: Vec<DuplexStream>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams.into()),
            dialed: Mutex::new(Vec::new()),
        })
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, address: &str) -> io::Result<BoxedStream> {
        self.dialed.lock().unwrap().push(address.to_string());
        match self.streams.lock().unwrap().pop_front() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")),
        }
    }
}

// ── Control ───────────────────────────────────────────────────────────────────

/// A control handle whose commands are answered by a stub: platform
/// commands succeed, everything else is refused as unsupported.
pub fn stub_control() -> ControlHandle {
    let (handle, mut commands) = control_channel(4, Duration::from_secs(1));
    tokio::spawn(async move {
        while let Some(request) = commands.recv().await {
            let verdict = match request.command.entity {
                EntityType::Platform => Ok(()),
                other => Err(ControlError::UnsupportedEntity(other)),
            };
            let _ = request.reply.send(verdict);
        }
    });
    handle
}

pub fn acceptor_context(
    store: Arc<dyn Store>,
    dialer: Arc<dyn Dialer>,
    session_timeout: Duration,
    shutdown: CancellationToken,
) -> Arc<AcceptorContext> {
    Arc::new(AcceptorContext {
        control: stub_control(),
        session: SessionContext {
            store,
            dialer,
            timeout: session_timeout,
            shutdown,
        },
        handshake_timeout: Duration::from_millis(200),
    })
}

// ── Peers ─────────────────────────────────────────────────────────────────────

/// The far end of a connection, as a platform would see it.
pub struct Peer<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Peer<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half),
            writer,
        }
    }

    pub async fn send(&mut self, msg: FogMessage) {
        write_message(&mut self.writer, &msg).await.expect("peer write");
    }

    /// Next frame, failing the test on EOF, error, or silence.
    pub async fn expect(&mut self) -> FogMessage {
        tokio::time::timeout(FRAME_WAIT, self.reader.next_message())
            .await
            .expect("frame within FRAME_WAIT")
            .expect("readable frame")
            .expect("frame before EOF")
    }

    /// Asserts the gateway closed this connection without sending more.
    pub async fn expect_closed(&mut self) {
        let next = tokio::time::timeout(FRAME_WAIT, self.reader.next_message())
            .await
            .expect("close within FRAME_WAIT");
        assert!(matches!(next, Ok(None)), "expected EOF, got {next:?}");
    }
}
